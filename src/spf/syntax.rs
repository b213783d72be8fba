//-
// Copyright (c) 2023, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

//! The lexical syntax for SPF TXT records.
//! RFC 7208 § 4.6.1, § 12
//!
//! Lexing only splits the record into qualified terms. Values are kept as raw
//! text; the evaluator is responsible for interpreting them (macro expansion,
//! CIDR suffixes, IP literals), since most of them cannot be validated before
//! the evaluation context is known.

use std::fmt;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mechanism {
    /// The `v=spf1` pseudo-term at the start of the record.
    Version,
    All,
    A,
    Ip4,
    Ip6,
    Mx,
    Ptr,
    Include,
    Exists,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Modifier {
    Redirect,
    Explanation,
}

/// What a term is. Each term is exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Mechanism(Mechanism),
    Modifier(Modifier),
    /// The term could not be lexed. The `value` of the term holds the whole
    /// offending word.
    Error(Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Term<'a> {
    pub qualifier: Qualifier,
    pub kind: Kind,
    pub value: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("unknown mechanism or modifier")]
    UnknownTerm,
    #[error("wrong delimiter for {0}")]
    WrongDelimiter(&'static str),
    #[error("missing argument for {0}")]
    MissingArgument(&'static str),
    #[error("unused argument for {0}")]
    UnusedArgument(&'static str),
    #[error("qualifier on modifier {0}")]
    QualifiedModifier(&'static str),
}

impl Qualifier {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Pass),
            '-' => Some(Self::Fail),
            '~' => Some(Self::SoftFail),
            '?' => Some(Self::Neutral),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Pass => '+',
            Self::Fail => '-',
            Self::SoftFail => '~',
            Self::Neutral => '?',
        }
    }
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Self::Version => "v",
            Self::All => "all",
            Self::A => "a",
            Self::Ip4 => "ip4",
            Self::Ip6 => "ip6",
            Self::Mx => "mx",
            Self::Ptr => "ptr",
            Self::Include => "include",
            Self::Exists => "exists",
        }
    }
}

impl Modifier {
    pub fn name(self) -> &'static str {
        match self {
            Self::Redirect => "redirect",
            Self::Explanation => "exp",
        }
    }
}

impl Kind {
    fn from_name(name: &str) -> Option<Self> {
        use self::Mechanism as Me;

        const MECHANISMS: &[Mechanism] = &[
            Me::Version,
            Me::All,
            Me::A,
            Me::Ip4,
            Me::Ip6,
            Me::Mx,
            Me::Ptr,
            Me::Include,
            Me::Exists,
        ];
        const MODIFIERS: &[Modifier] =
            &[Modifier::Redirect, Modifier::Explanation];

        MECHANISMS
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
            .copied()
            .map(Self::Mechanism)
            .or_else(|| {
                MODIFIERS
                    .iter()
                    .find(|m| m.name().eq_ignore_ascii_case(name))
                    .copied()
                    .map(Self::Modifier)
            })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Mechanism(m) => m.name(),
            Self::Modifier(m) => m.name(),
            Self::Error(_) => "error",
        }
    }

    /// The delimiter between name and value this kind requires.
    fn delimiter(self) -> char {
        match self {
            Self::Mechanism(Mechanism::Version) | Self::Modifier(_) => '=',
            _ => ':',
        }
    }
}

impl fmt::Display for Term<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Error(_) => write!(f, "{}", self.value),
            Kind::Modifier(_) | Kind::Mechanism(Mechanism::Version) => {
                write!(f, "{}={}", self.kind.name(), self.value)
            },
            Kind::Mechanism(m) => {
                if Qualifier::Pass != self.qualifier {
                    write!(f, "{}", self.qualifier.as_char())?;
                }
                write!(f, "{}", m.name())?;
                if self.value.is_empty() || self.value.starts_with('/') {
                    write!(f, "{}", self.value)
                } else {
                    write!(f, ":{}", self.value)
                }
            },
        }
    }
}

fn is_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n')
}

/// Scans the next term of `input` at or after byte offset `cursor`.
///
/// Returns the term along with the cursor to pass to the next call, or `None`
/// if only whitespace remains.
pub fn next_term(input: &str, cursor: usize) -> Option<(Term<'_>, usize)> {
    let rest = input.get(cursor..)?;
    let start = cursor + rest.find(|c| !is_whitespace(c))?;
    let end = input[start..]
        .find(is_whitespace)
        .map_or(input.len(), |len| start + len);
    Some((scan_word(&input[start..end]), end))
}

/// A restartable iterator over the terms of an SPF record.
#[derive(Clone, Debug)]
pub struct Terms<'a> {
    input: &'a str,
    cursor: usize,
}

impl<'a> Terms<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, cursor: 0 }
    }
}

impl<'a> Iterator for Terms<'a> {
    type Item = Term<'a>;

    fn next(&mut self) -> Option<Term<'a>> {
        let (term, cursor) = next_term(self.input, self.cursor)?;
        self.cursor = cursor;
        Some(term)
    }
}

/// Splits `record` into its terms.
pub fn lex(record: &str) -> Vec<Term<'_>> {
    Terms::new(record).collect()
}

/// Scans a single non-empty, whitespace-free word.
fn scan_word(word: &str) -> Term<'_> {
    let explicit_qualifier = word.chars().next().and_then(Qualifier::from_char);
    let body = if explicit_qualifier.is_some() {
        &word[1..]
    } else {
        word
    };
    let qualifier = explicit_qualifier.unwrap_or(Qualifier::Pass);
    let error = |e| Term {
        qualifier,
        kind: Kind::Error(e),
        value: word,
    };

    let (kind, value) = match body.find(|c| c == ':' || c == '=') {
        Some(delim) => {
            let (name, value) = (&body[..delim], &body[delim + 1..]);
            let Some(kind) = Kind::from_name(name) else {
                return error(Error::UnknownTerm);
            };

            if body[delim..].chars().next() != Some(kind.delimiter()) {
                return error(Error::WrongDelimiter(kind.name()));
            }

            if value.is_empty() {
                return error(Error::MissingArgument(kind.name()));
            }

            if Kind::Mechanism(Mechanism::All) == kind {
                return error(Error::UnusedArgument("all"));
            }

            (kind, value)
        },

        None => {
            // The a and mx mechanisms can take a CIDR without any domain.
            let (name, cidr) = body
                .find('/')
                .map_or((body, ""), |slash| body.split_at(slash));
            let Some(kind) = Kind::from_name(name) else {
                return error(Error::UnknownTerm);
            };

            match kind {
                Kind::Mechanism(Mechanism::A | Mechanism::Mx) => {},
                Kind::Mechanism(m @ (Mechanism::All | Mechanism::Ptr)) => {
                    if !cidr.is_empty() {
                        return error(Error::UnusedArgument(m.name()));
                    }
                },
                _ => return error(Error::MissingArgument(kind.name())),
            }

            (kind, cidr)
        },
    };

    if kind.delimiter() == '=' && explicit_qualifier.is_some() {
        return error(Error::QualifiedModifier(kind.name()));
    }

    Term {
        qualifier,
        kind,
        value,
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn term_lex() {
        use super::{Mechanism as Me, Modifier as Mo, Qualifier as Q};

        fn term(qualifier: Qualifier, kind: Kind, value: &str) -> Term<'_> {
            Term {
                qualifier,
                kind,
                value,
            }
        }

        fn mech(qualifier: Qualifier, m: Me, value: &str) -> Term<'_> {
            term(qualifier, Kind::Mechanism(m), value)
        }

        fn err(e: Error, value: &str) -> Term<'_> {
            term(Q::Pass, Kind::Error(e), value)
        }

        fn one(word: &str) -> Term<'_> {
            let terms = lex(word);
            assert_eq!(1, terms.len(), "{word:?} => {terms:?}");
            terms[0]
        }

        assert_eq!(mech(Q::Pass, Me::Version, "spf1"), one("v=spf1"));
        assert_eq!(mech(Q::Pass, Me::Version, "spf2"), one("V=spf2"));
        assert_eq!(
            term(Q::Pass, Kind::Modifier(Mo::Redirect), "foo.bar"),
            one("redirect=foo.bar"),
        );
        assert_eq!(
            term(Q::Pass, Kind::Modifier(Mo::Redirect), "foo.bar"),
            one("REDIRECT=foo.bar"),
        );
        assert_eq!(
            term(Q::Pass, Kind::Modifier(Mo::Explanation), "%{d}.exp"),
            one("exp=%{d}.exp"),
        );
        assert_eq!(
            err(Error::WrongDelimiter("redirect"), "redirect:foo.bar"),
            one("redirect:foo.bar"),
        );
        assert_eq!(
            err(Error::MissingArgument("redirect"), "redirect"),
            one("redirect"),
        );
        assert_eq!(
            err(Error::MissingArgument("exp"), "exp="),
            one("exp="),
        );
        assert_eq!(
            Term {
                qualifier: Q::Fail,
                kind: Kind::Error(Error::QualifiedModifier("redirect")),
                value: "-redirect=foo.bar",
            },
            one("-redirect=foo.bar"),
        );

        assert_eq!(mech(Q::Pass, Me::All, ""), one("all"));
        assert_eq!(mech(Q::Pass, Me::All, ""), one("+all"));
        assert_eq!(mech(Q::Fail, Me::All, ""), one("-aLl"));
        assert_eq!(mech(Q::Neutral, Me::All, ""), one("?ALL"));
        assert_eq!(mech(Q::SoftFail, Me::All, ""), one("~all"));
        assert_eq!(
            err(Error::UnusedArgument("all"), "all:foo.bar"),
            one("all:foo.bar"),
        );
        assert_eq!(
            err(Error::UnusedArgument("all"), "all/8"),
            one("all/8"),
        );

        assert_eq!(
            mech(Q::Pass, Me::Include, "foo.bar"),
            one("include:foo.bar"),
        );
        assert_eq!(
            mech(Q::Fail, Me::Include, "_spf.%{d}"),
            one("-INCLUDE:_spf.%{d}"),
        );
        assert_eq!(
            err(Error::MissingArgument("include"), "include"),
            one("include"),
        );
        assert_eq!(
            err(Error::MissingArgument("include"), "include:"),
            one("include:"),
        );
        assert_eq!(
            err(Error::WrongDelimiter("include"), "include=foo.bar"),
            one("include=foo.bar"),
        );

        assert_eq!(mech(Q::Pass, Me::A, ""), one("a"));
        assert_eq!(mech(Q::Fail, Me::A, "foo.bar"), one("-A:foo.bar"));
        assert_eq!(mech(Q::Pass, Me::A, "foo/24//64"), one("a:foo/24//64"));
        assert_eq!(mech(Q::Pass, Me::A, "/24"), one("a/24"));
        assert_eq!(mech(Q::Pass, Me::A, "/24//64"), one("A/24//64"));
        assert_eq!(mech(Q::Pass, Me::Mx, ""), one("mx"));
        assert_eq!(mech(Q::Neutral, Me::Mx, "foo.bar"), one("?MX:foo.bar"));
        assert_eq!(mech(Q::Pass, Me::Mx, "/32/128"), one("mx/32/128"));

        assert_eq!(mech(Q::Pass, Me::Ptr, ""), one("ptr"));
        assert_eq!(mech(Q::Fail, Me::Ptr, "foo.bar"), one("-PTR:foo.bar"));

        assert_eq!(
            mech(Q::Pass, Me::Ip4, "192.168.10.199"),
            one("ip4:192.168.10.199"),
        );
        assert_eq!(
            mech(Q::Pass, Me::Ip4, "192.168.10.199/8"),
            one("IP4:192.168.10.199/8"),
        );
        assert_eq!(err(Error::MissingArgument("ip4"), "ip4"), one("ip4"));
        assert_eq!(
            err(Error::MissingArgument("ip4"), "ip4/8"),
            one("ip4/8"),
        );
        assert_eq!(
            mech(Q::Pass, Me::Ip6, "dead::c0de:beef/128"),
            one("ip6:dead::c0de:beef/128"),
        );
        assert_eq!(err(Error::MissingArgument("ip6"), "ip6"), one("ip6"));

        assert_eq!(
            mech(Q::SoftFail, Me::Exists, "%{i}.foo"),
            one("~EXISTS:%{i}.foo"),
        );
        assert_eq!(
            err(Error::MissingArgument("exists"), "exists"),
            one("exists"),
        );

        assert_eq!(err(Error::UnknownTerm, "foo"), one("foo"));
        assert_eq!(err(Error::UnknownTerm, "foo=bar"), one("foo=bar"));
        assert_eq!(err(Error::UnknownTerm, "*all"), one("*all"));
        assert_eq!(err(Error::UnknownTerm, "spf1"), one("spf1"));
    }

    #[test]
    fn lex_record() {
        let terms =
            lex("v=spf1  ip4:203.0.113.0/24\t-include:a.example\n~all ");
        assert_eq!(4, terms.len());
        assert_eq!(Kind::Mechanism(Mechanism::Version), terms[0].kind);
        assert_eq!("203.0.113.0/24", terms[1].value);
        assert_eq!(Qualifier::Fail, terms[2].qualifier);
        assert_eq!(Kind::Mechanism(Mechanism::Include), terms[2].kind);
        assert_eq!(Qualifier::SoftFail, terms[3].qualifier);

        assert_eq!(Vec::<Term<'_>>::new(), lex(""));
        assert_eq!(Vec::<Term<'_>>::new(), lex(" \t\n "));
    }

    #[test]
    fn terms_are_restartable() {
        let record = "v=spf1 a mx -all";
        let mut terms = Terms::new(record);
        terms.next();
        let rest = terms.clone();
        assert_eq!(3, terms.count());
        assert_eq!(3, rest.count());

        let (first, cursor) = next_term(record, 0).unwrap();
        assert_eq!(Kind::Mechanism(Mechanism::Version), first.kind);
        let (second, cursor) = next_term(record, cursor).unwrap();
        assert_eq!(Kind::Mechanism(Mechanism::A), second.kind);
        assert_eq!(
            Kind::Mechanism(Mechanism::Mx),
            next_term(record, cursor).unwrap().0.kind,
        );
        assert!(next_term(record, record.len()).is_none());
    }

    #[test]
    fn term_display() {
        let rendered = lex("v=spf1 -ip4:1.2.3.4/8 a/24 mx redirect=x.com bogus")
            .into_iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            vec![
                "v=spf1",
                "-ip4:1.2.3.4/8",
                "a/24",
                "mx",
                "redirect=x.com",
                "bogus",
            ],
            rendered,
        );
    }

    proptest! {
        #[test]
        fn one_term_per_word(record in "[ \\t\\na-z0-9:=/.%{}+~?-]{0,64}") {
            let words = record
                .split(is_whitespace)
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>();
            let terms = lex(&record);
            prop_assert_eq!(words.len(), terms.len());
            for (word, term) in words.into_iter().zip(terms) {
                if let Kind::Error(_) = term.kind {
                    prop_assert_eq!(word, term.value);
                } else {
                    prop_assert!(word.ends_with(term.value));
                }
            }
        }
    }
}
