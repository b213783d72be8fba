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

//! The DNS operations SPF evaluation needs.
//!
//! Rather than exposing raw record lookups, the `Resolver` trait is expressed
//! in terms of the questions the evaluator asks ("does any address of this
//! name satisfy this predicate?"). This lets implementations run the
//! underlying queries concurrently and stop as soon as the answer is known.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;

pub mod hickory;
pub mod limited;
#[cfg(test)]
pub mod testing;

pub use self::hickory::HickoryResolver;
pub use self::limited::LimitedResolver;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DnsError {
    /// The server answered NXDOMAIN.
    #[error("domain not found")]
    NotFound,
    /// The lookup budget of the current evaluation is spent.
    #[error("DNS lookup limit exceeded")]
    LimitExceeded,
    /// The query failed for a reason that may go away if retried.
    #[error("temporary DNS failure: {0}")]
    Temporary(String),
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
}

/// A predicate over resolved addresses.
///
/// An error aborts the lookup that invoked the matcher.
pub type IpMatcher<'a> =
    dyn Fn(IpAddr) -> Result<bool, DnsError> + Send + Sync + 'a;

pub trait Resolver: Send + Sync {
    /// Returns the TXT records of `name`, each with its character-strings
    /// concatenated. NXDOMAIN yields an empty list.
    fn lookup_txt<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DnsError>>;

    /// Like `lookup_txt`, but NXDOMAIN yields `DnsError::NotFound`.
    fn lookup_txt_strict<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DnsError>>;

    /// Returns whether `name` has at least one A record.
    fn exists<'a>(&'a self, name: &'a str)
        -> BoxFuture<'a, Result<bool, DnsError>>;

    /// Returns whether any A or AAAA record of `name` satisfies `matcher`.
    fn match_ip<'a>(
        &'a self,
        name: &'a str,
        matcher: &'a IpMatcher<'a>,
    ) -> BoxFuture<'a, Result<bool, DnsError>>;

    /// Returns whether any address of any MX exchange of `name` satisfies
    /// `matcher`.
    fn match_mx<'a>(
        &'a self,
        name: &'a str,
        matcher: &'a IpMatcher<'a>,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        self.match_mx_bounded(name, usize::MAX, matcher)
    }

    /// Like `match_mx`, but if `name` has more than `max_exchanges` MX
    /// records, fails with `DnsError::LimitExceeded` before looking up any
    /// exchange's addresses.
    fn match_mx_bounded<'a>(
        &'a self,
        name: &'a str,
        max_exchanges: usize,
        matcher: &'a IpMatcher<'a>,
    ) -> BoxFuture<'a, Result<bool, DnsError>>;
}

macro_rules! forward_resolver {
    ($($target:tt)*) => {
        impl<R: Resolver + ?Sized> Resolver for $($target)* {
            fn lookup_txt<'a>(
                &'a self,
                name: &'a str,
            ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
                (**self).lookup_txt(name)
            }

            fn lookup_txt_strict<'a>(
                &'a self,
                name: &'a str,
            ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
                (**self).lookup_txt_strict(name)
            }

            fn exists<'a>(
                &'a self,
                name: &'a str,
            ) -> BoxFuture<'a, Result<bool, DnsError>> {
                (**self).exists(name)
            }

            fn match_ip<'a>(
                &'a self,
                name: &'a str,
                matcher: &'a IpMatcher<'a>,
            ) -> BoxFuture<'a, Result<bool, DnsError>> {
                (**self).match_ip(name, matcher)
            }

            fn match_mx<'a>(
                &'a self,
                name: &'a str,
                matcher: &'a IpMatcher<'a>,
            ) -> BoxFuture<'a, Result<bool, DnsError>> {
                (**self).match_mx(name, matcher)
            }

            fn match_mx_bounded<'a>(
                &'a self,
                name: &'a str,
                max_exchanges: usize,
                matcher: &'a IpMatcher<'a>,
            ) -> BoxFuture<'a, Result<bool, DnsError>> {
                (**self).match_mx_bounded(name, max_exchanges, matcher)
            }
        }
    };
}

forward_resolver!(&R);
forward_resolver!(Arc<R>);

/// Runs `lookups` concurrently until one yields `Ok(true)` or an error, and
/// returns that. Lookups still in flight at that point are dropped.
///
/// Returns `Ok(false)` once every lookup has come back without a match.
pub async fn first_match<F>(
    lookups: impl IntoIterator<Item = F>,
) -> Result<bool, DnsError>
where
    F: Future<Output = Result<bool, DnsError>>,
{
    let mut lookups = lookups.into_iter().collect::<FuturesUnordered<_>>();
    while let Some(matched) = lookups.next().await {
        if matched? {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Like `first_match`, but over address lookups, each answer of which is fed
/// through `matcher` as soon as it arrives.
pub async fn first_matching_address<F>(
    lookups: impl IntoIterator<Item = F>,
    matcher: &IpMatcher<'_>,
) -> Result<bool, DnsError>
where
    F: Future<Output = Result<Vec<IpAddr>, DnsError>>,
{
    first_match(lookups.into_iter().map(move |lookup| {
        lookup.map(move |addrs| -> Result<bool, DnsError> {
            for addr in addrs? {
                if matcher(addr)? {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }))
    .await
}

/// Returns whether `name` looks like a domain name that can be queried.
///
/// RFC 1035, RFC 3696: at most 255 octets, every label 1 to 63 octets of
/// letters, digits, hyphens, and underscores, no label starting or ending with
/// a hyphen, and at least one letter somewhere in the name. A single trailing
/// dot is permitted.
pub fn is_domain_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }

    let name = name.strip_suffix('.').unwrap_or(name);
    let mut has_letter = false;
    for label in name.split('.') {
        if label.is_empty()
            || label.len() > 63
            || label.starts_with('-')
            || label.ends_with('-')
        {
            return false;
        }

        for b in label.bytes() {
            match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => has_letter = true,
                b'0'..=b'9' | b'-' => {},
                _ => return false,
            }
        }
    }

    has_letter
}

/// Appends the root label to `name` if it is not already fully qualified.
pub fn to_fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_owned()
    } else {
        format!("{name}.")
    }
}
