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

use std::net::IpAddr;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use hickory_resolver::config::{
    NameServerConfigGroup, ResolverConfig, ResolverOpts,
};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::{Name, TokioAsyncResolver};
use log::warn;

use super::{DnsError, IpMatcher, Resolver};
use crate::support::system_config::DnsConfig;

/// A `Resolver` which queries DNS directly through hickory.
///
/// Address lookups for one name (A and AAAA), and for all the exchanges of an
/// MX record, are issued concurrently on the calling task. The first match or
/// hard failure ends the operation and drops the remaining queries.
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn new(inner: TokioAsyncResolver) -> Self {
        Self { inner }
    }

    /// Builds a resolver from `config`, falling back to the system resolver
    /// configuration if no name servers are given.
    ///
    /// Answer caching is disabled so that separate evaluations never observe
    /// each other's results.
    pub fn from_config(config: &DnsConfig) -> Result<Self, ResolveError> {
        let (resolver_config, mut opts) = if config.nameservers.is_empty() {
            hickory_resolver::system_conf::read_system_conf()?
        } else {
            let mut group = NameServerConfigGroup::new();
            for ns in &config.nameservers {
                group.merge(NameServerConfigGroup::from_ips_clear(
                    &[ns.ip()],
                    ns.port(),
                    true,
                ));
            }
            (
                ResolverConfig::from_parts(None, vec![], group),
                ResolverOpts::default(),
            )
        };

        opts.timeout = Duration::from_secs(config.timeout_secs);
        opts.attempts = config.attempts;
        opts.cache_size = 0;

        Ok(Self::new(TokioAsyncResolver::tokio(resolver_config, opts)))
    }

    async fn txt(
        &self,
        name: &str,
        strict: bool,
    ) -> Result<Vec<String>, DnsError> {
        let name = parse_name(name)?;
        let lookup = self.inner.txt_lookup(name).await.map(|r| {
            r.iter()
                .map(|parts| {
                    let len = parts.iter().map(|p| p.len()).sum();
                    let mut combined = Vec::with_capacity(len);
                    for part in parts.iter() {
                        combined.extend_from_slice(part);
                    }

                    match String::from_utf8(combined) {
                        Ok(s) => s,
                        Err(e) => {
                            String::from_utf8_lossy(e.as_bytes()).into_owned()
                        },
                    }
                })
                .collect::<Vec<_>>()
        });

        records(lookup, strict)
    }

    async fn match_ip_impl(
        &self,
        name: &str,
        matcher: &IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        let name = parse_name(name)?;

        let v4_name = name.clone();
        let v4 = async move {
            records(
                self.inner.ipv4_lookup(v4_name).await.map(|r| {
                    r.iter().map(|a| IpAddr::V4(a.0)).collect::<Vec<_>>()
                }),
                false,
            )
        }
        .boxed();
        let v6 = async move {
            records(
                self.inner.ipv6_lookup(name).await.map(|r| {
                    r.iter().map(|a| IpAddr::V6(a.0)).collect::<Vec<_>>()
                }),
                false,
            )
        }
        .boxed();

        super::first_matching_address([v4, v6], matcher).await
    }

    async fn match_mx_impl(
        &self,
        name: &str,
        max_exchanges: usize,
        matcher: &IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        let parsed = parse_name(name)?;
        let exchanges = records(
            self.inner.mx_lookup(parsed).await.map(|r| {
                r.iter()
                    .map(|mx| mx.exchange().to_ascii())
                    .collect::<Vec<_>>()
            }),
            false,
        )?;

        if exchanges.len() > max_exchanges {
            warn!(
                "{} has {} MX records; refusing to look up more than {}",
                name,
                exchanges.len(),
                max_exchanges,
            );
            return Err(DnsError::LimitExceeded);
        }

        super::first_match(
            exchanges
                .iter()
                .map(|exchange| self.match_ip_impl(exchange, matcher)),
        )
        .await
    }
}

impl Resolver for HickoryResolver {
    fn lookup_txt<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
        self.txt(name, false).boxed()
    }

    fn lookup_txt_strict<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
        self.txt(name, true).boxed()
    }

    fn exists<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        async move {
            let name = parse_name(name)?;
            let addrs = records(
                self.inner
                    .ipv4_lookup(name)
                    .await
                    .map(|r| r.iter().map(|a| a.0).collect::<Vec<_>>()),
                false,
            )?;
            Ok(!addrs.is_empty())
        }
        .boxed()
    }

    fn match_ip<'a>(
        &'a self,
        name: &'a str,
        matcher: &'a IpMatcher<'a>,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        self.match_ip_impl(name, matcher).boxed()
    }

    fn match_mx_bounded<'a>(
        &'a self,
        name: &'a str,
        max_exchanges: usize,
        matcher: &'a IpMatcher<'a>,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        self.match_mx_impl(name, max_exchanges, matcher).boxed()
    }
}

fn parse_name(name: &str) -> Result<Name, DnsError> {
    let mut parsed = Name::from_ascii(name)
        .map_err(|_| DnsError::InvalidName(name.to_owned()))?;
    parsed.set_fqdn(true);
    Ok(parsed)
}

/// Converts the result of a lookup.
///
/// A response with no records is an empty answer, except that NXDOMAIN is
/// `DnsError::NotFound` if `strict`. All other failures are temporary.
fn records<T>(
    r: Result<Vec<T>, ResolveError>,
    strict: bool,
) -> Result<Vec<T>, DnsError> {
    match r {
        Ok(v) => Ok(v),
        Err(e) => match *e.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                if strict && ResponseCode::NXDomain == response_code {
                    Err(DnsError::NotFound)
                } else {
                    Ok(Vec::new())
                }
            },
            _ => {
                warn!("DNS lookup failed: {e}");
                Err(DnsError::Temporary(e.to_string()))
            },
        },
    }
}
