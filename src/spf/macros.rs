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

//! The SPF macro language.
//! RFC 7208 § 7

use std::borrow::Cow;
use std::net::IpAddr;

use chrono::prelude::*;
use itertools::Itertools;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("'%' at end of macro string")]
    TrailingPercent,
    #[error("invalid escape '%{0}'")]
    UnknownEscape(char),
    #[error("unterminated macro")]
    Unterminated,
    #[error("empty macro")]
    EmptyMacro,
    #[error("unknown macro letter '{0}'")]
    UnknownMacro(char),
    #[error("macro '{0}' only allowed in explanations")]
    ExplanationOnly(char),
    #[error("invalid number of parts in macro")]
    InvalidInteger,
    #[error("unknown macro transformer '{0}'")]
    UnknownTransformer(char),
}

/// The values macros expand to.
#[derive(Clone, Debug)]
pub struct Context<'a> {
    /// The full sender identity. May be empty or lack a local part.
    pub sender: &'a str,
    /// The domain currently being evaluated.
    pub domain: &'a str,
    pub ip: IpAddr,
    /// The name of this host, for `%{r}`.
    pub receiver_host: &'a str,
    /// The time for `%{t}`.
    pub now: DateTime<Utc>,
}

impl<'a> Context<'a> {
    /// Splits the sender into local part and domain, filling in `postmaster`
    /// and the evaluated domain where either is missing.
    fn sender_parts(&self) -> (&'a str, &'a str) {
        const POSTMASTER: &str = "postmaster";

        match self.sender.rfind('@') {
            None if self.sender.is_empty() => (POSTMASTER, self.domain),
            None => (self.sender, self.domain),
            Some(at) => {
                let (local, domain) =
                    (&self.sender[..at], &self.sender[at + 1..]);
                (
                    if local.is_empty() { POSTMASTER } else { local },
                    if domain.is_empty() { self.domain } else { domain },
                )
            },
        }
    }
}

/// Expands the macros in a `domain-spec`.
pub fn expand(ctx: &Context<'_>, raw: &str) -> Result<String, Error> {
    expand_impl(ctx, raw, false)
}

/// Expands the macros in explanation text, where `%{c}`, `%{r}`, and `%{t}`
/// are also permitted.
pub fn expand_explanation(
    ctx: &Context<'_>,
    raw: &str,
) -> Result<String, Error> {
    expand_impl(ctx, raw, true)
}

#[derive(Clone, Copy)]
enum State {
    Text,
    Percent,
    /// Inside `%{...}`, which started at the given byte offset.
    Body(usize),
}

fn expand_impl(
    ctx: &Context<'_>,
    raw: &str,
    in_exp: bool,
) -> Result<String, Error> {
    let mut out = String::with_capacity(raw.len());
    let mut state = State::Text;

    for (ix, ch) in raw.char_indices() {
        state = match (state, ch) {
            (State::Text, '%') => State::Percent,
            (State::Text, ch) => {
                out.push(ch);
                State::Text
            },

            (State::Percent, '%') => {
                out.push('%');
                State::Text
            },
            (State::Percent, '_') => {
                out.push(' ');
                State::Text
            },
            (State::Percent, '-') => {
                out.push_str("%20");
                State::Text
            },
            (State::Percent, '{') => State::Body(ix + 1),
            (State::Percent, ch) => return Err(Error::UnknownEscape(ch)),

            (State::Body(start), '}') => {
                expand_one(ctx, &raw[start..ix], in_exp, &mut out)?;
                State::Text
            },
            (state @ State::Body(_), _) => state,
        };
    }

    match state {
        State::Text => Ok(out),
        State::Percent => Err(Error::TrailingPercent),
        State::Body(_) => Err(Error::Unterminated),
    }
}

/// Expands the body of a single `%{...}` into `out`.
fn expand_one(
    ctx: &Context<'_>,
    body: &str,
    in_exp: bool,
    out: &mut String,
) -> Result<(), Error> {
    let mut chars = body.chars();
    let letter = chars.next().ok_or(Error::EmptyMacro)?;
    let rest = chars.as_str();

    let digits_len = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let (digits, rest) = rest.split_at(digits_len);
    let keep_parts = if digits.is_empty() {
        None
    } else {
        match digits.parse::<usize>() {
            Ok(0) | Err(_) => return Err(Error::InvalidInteger),
            Ok(n) => Some(n),
        }
    };

    let (reverse, delimiters) = match rest.strip_prefix(['r', 'R']) {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    if let Some(ch) = delimiters
        .chars()
        .find(|&ch| !matches!(ch, '.' | '-' | '+' | ',' | '/' | '_' | '='))
    {
        return Err(Error::UnknownTransformer(ch));
    }

    let value = basic_expansion(ctx, letter, in_exp)?;

    if keep_parts.is_none() && !reverse && delimiters.is_empty() {
        out.push_str(&value);
        return Ok(());
    }

    let effective_delimiters = if delimiters.is_empty() {
        "."
    } else {
        delimiters
    };
    let is_delimiter = |c: char| effective_delimiters.contains(c);
    let keep_parts = keep_parts.unwrap_or(usize::MAX);

    // Splitting is naïve: adjacent delimiters and delimiters at either end
    // produce empty parts.
    let parts = if reverse {
        value.rsplit(is_delimiter).collect::<Vec<_>>()
    } else {
        value.split(is_delimiter).collect::<Vec<_>>()
    };
    out.push_str(
        &parts[parts.len().saturating_sub(keep_parts)..]
            .iter()
            .join("."),
    );
    Ok(())
}

fn basic_expansion<'a>(
    ctx: &Context<'a>,
    letter: char,
    in_exp: bool,
) -> Result<Cow<'a, str>, Error> {
    let letter = letter.to_ascii_lowercase();
    if matches!(letter, 'c' | 'r' | 't') && !in_exp {
        return Err(Error::ExplanationOnly(letter));
    }

    let expansion = match letter {
        's' => {
            if ctx.sender.is_empty() {
                Cow::Owned(format!("postmaster@{}", ctx.domain))
            } else {
                Cow::Borrowed(ctx.sender)
            }
        },
        'l' => Cow::Borrowed(ctx.sender_parts().0),
        'o' => Cow::Borrowed(ctx.sender_parts().1),
        'd' | 'h' => Cow::Borrowed(ctx.domain),
        'i' => Cow::Owned(dotted_ip(ctx.ip)),
        // Validated PTR names are never looked up.
        'p' => Cow::Borrowed(""),
        'v' => Cow::Borrowed(match ctx.ip {
            IpAddr::V4(_) => "in-addr",
            IpAddr::V6(_) => "ip6",
        }),
        'c' => Cow::Owned(ctx.ip.to_string()),
        'r' => Cow::Borrowed(ctx.receiver_host),
        't' => Cow::Owned(ctx.now.timestamp().to_string()),
        c => return Err(Error::UnknownMacro(c)),
    };

    Ok(expansion)
}

/// Formats `ip` for `%{i}`: a dotted quad for IPv4, or 32 dot-separated
/// nibbles for IPv6.
fn dotted_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => ip
            .octets()
            .into_iter()
            .flat_map(|octet| [octet >> 4, octet & 0xF])
            .map(|nibble| format!("{nibble:x}"))
            .join("."),
    }
}
