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

//! An in-memory `Resolver` for tests.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::{self, BoxFuture, FutureExt};

use super::{DnsError, IpMatcher, Resolver};

/// The configured answer for one record type of one name.
#[derive(Clone, Debug)]
pub enum Entry<T> {
    Ok(Vec<T>),
    /// Answer NXDOMAIN.
    NotFound,
    /// Fail with a temporary error.
    Error,
}

/// A fixed DNS zone.
///
/// Names that were never added answer NXDOMAIN. Names that were added but
/// lack a particular record type answer with no records.
#[derive(Debug, Default)]
pub struct StaticResolver {
    pub a: HashMap<String, Entry<Ipv4Addr>>,
    pub aaaa: HashMap<String, Entry<Ipv6Addr>>,
    pub mx: HashMap<String, Entry<String>>,
    pub txt: HashMap<String, Entry<String>>,
    names: HashSet<String>,
    queries: AtomicU32,
}

/// Normalises `name` for use as a zone key.
pub fn key(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

/// Builds a `StaticResolver`.
///
/// ```ignore
/// zone! {
///     "example.com" => {
///         txt: ["v=spf1 mx -all"],
///         mx: ["mail.example.com"],
///     },
///     "mail.example.com" => {
///         a: ["192.0.2.1"],
///         aaaa: Error,
///     },
/// }
/// ```
#[macro_export]
macro_rules! zone {
    ($($domain:expr => {
        $($field:ident : $value:tt,)*
    },)*) => {{
        #[allow(unused_mut)]
        let mut zone = $crate::dns::testing::StaticResolver::default();
        $(
            zone.add_name($domain);
            $(
                $crate::zone!(@$field, zone, $domain, $value);
            )*
        )*
        zone
    }};

    (@$field:ident, $zone:ident, $domain:expr, NotFound) => {
        $zone.$field.insert(
            $crate::dns::testing::key($domain),
            $crate::dns::testing::Entry::NotFound,
        );
    };
    (@$field:ident, $zone:ident, $domain:expr, Error) => {
        $zone.$field.insert(
            $crate::dns::testing::key($domain),
            $crate::dns::testing::Entry::Error,
        );
    };
    (@$field:ident, $zone:ident, $domain:expr, [$($value:expr),* $(,)?]) => {
        $zone.$field.insert(
            $crate::dns::testing::key($domain),
            $crate::dns::testing::Entry::Ok(vec![$($value.parse().unwrap()),*]),
        );
    };
}

impl StaticResolver {
    pub fn add_name(&mut self, name: &str) {
        self.names.insert(key(name));
    }

    /// Returns the number of `Resolver` operations invoked so far.
    pub fn queries(&self) -> u32 {
        self.queries.load(Ordering::Relaxed)
    }

    fn count(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    fn get<T: Clone>(
        &self,
        map: &HashMap<String, Entry<T>>,
        name: &str,
        strict: bool,
    ) -> Result<Vec<T>, DnsError> {
        let key = key(name);
        let nxdomain = || {
            if strict {
                Err(DnsError::NotFound)
            } else {
                Ok(Vec::new())
            }
        };

        match map.get(&key) {
            Some(Entry::Ok(v)) => Ok(v.clone()),
            Some(Entry::NotFound) => nxdomain(),
            Some(Entry::Error) => {
                Err(DnsError::Temporary(format!("SERVFAIL for {key}")))
            },
            None if self.names.contains(&key) => Ok(Vec::new()),
            None => nxdomain(),
        }
    }

    async fn match_ip_impl(
        &self,
        name: &str,
        matcher: &IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        let v4 = self
            .get(&self.a, name, false)
            .map(|v| v.into_iter().map(IpAddr::V4).collect::<Vec<_>>());
        let v6 = self
            .get(&self.aaaa, name, false)
            .map(|v| v.into_iter().map(IpAddr::V6).collect::<Vec<_>>());

        super::first_matching_address(
            [future::ready(v4), future::ready(v6)],
            matcher,
        )
        .await
    }
}

impl Resolver for StaticResolver {
    fn lookup_txt<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
        self.count();
        future::ready(self.get(&self.txt, name, false)).boxed()
    }

    fn lookup_txt_strict<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
        self.count();
        future::ready(self.get(&self.txt, name, true)).boxed()
    }

    fn exists<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        self.count();
        future::ready(self.get(&self.a, name, false).map(|v| !v.is_empty()))
            .boxed()
    }

    fn match_ip<'a>(
        &'a self,
        name: &'a str,
        matcher: &'a IpMatcher<'a>,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        self.count();
        self.match_ip_impl(name, matcher).boxed()
    }

    fn match_mx_bounded<'a>(
        &'a self,
        name: &'a str,
        max_exchanges: usize,
        matcher: &'a IpMatcher<'a>,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        self.count();
        async move {
            let exchanges = self.get(&self.mx, name, false)?;
            if exchanges.len() > max_exchanges {
                return Err(DnsError::LimitExceeded);
            }

            super::first_match(
                exchanges
                    .iter()
                    .map(|exchange| self.match_ip_impl(exchange, matcher)),
            )
            .await
        }
        .boxed()
    }
}
