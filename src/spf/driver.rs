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
use std::sync::Arc;

use chrono::prelude::*;
use log::info;

use super::eval::{self, Environment, Outcome};
use crate::dns::{HickoryResolver, LimitedResolver, Resolver};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SpfConfig;

/// Runs SPF checks against a shared resolver.
///
/// The resolver itself is shared between checks, but every call to
/// `check_host` gets its own lookup budget.
pub struct Checker<R = HickoryResolver> {
    resolver: Arc<R>,
    config: SpfConfig,
    log_prefix: LogPrefix,
}

impl Checker<HickoryResolver> {
    /// Sets up a checker which queries DNS as described by `config`.
    pub fn new(config: SpfConfig) -> Result<Self, Error> {
        let resolver = HickoryResolver::from_config(&config.dns)?;
        Ok(Self::with_resolver(resolver, config))
    }
}

impl<R: Resolver> Checker<R> {
    pub fn with_resolver(resolver: R, config: SpfConfig) -> Self {
        Self {
            resolver: Arc::new(resolver),
            config,
            log_prefix: LogPrefix::new("spf".to_owned()),
        }
    }

    /// Replaces the prefix used for log messages.
    ///
    /// Embedders can use this to tie SPF logs to the session which requested
    /// the check.
    pub fn set_log_prefix(&mut self, log_prefix: LogPrefix) {
        self.log_prefix = log_prefix;
    }

    pub fn config(&self) -> &SpfConfig {
        &self.config
    }

    /// Evaluates the SPF policy of `domain` for mail from `sender` arriving
    /// from `ip`, under the limits in the configuration.
    pub async fn check_host(
        &self,
        ip: IpAddr,
        domain: &str,
        sender: &str,
    ) -> Outcome {
        let resolver = LimitedResolver::new(
            Arc::clone(&self.resolver),
            self.config.lookup_limit,
            self.config.mx_address_limit,
        );

        let log_prefix = self.log_prefix.deep_clone();
        log_prefix.set_sender(sender.to_owned());
        let env = Environment {
            receiver_host: self.config.receiver_host().to_owned(),
            now: Utc::now(),
            log_prefix,
        };

        let outcome =
            eval::check_host_with(&resolver, &env, ip, domain, sender).await;

        let prefix = env.log_prefix.deep_clone();
        prefix.set_client(ip.to_canonical());
        prefix.set_domain(domain.to_owned());
        match outcome.reason {
            Some(ref reason) => info!(
                "{} SPF {} ({}); {} lookups to spare",
                prefix,
                outcome.result,
                reason,
                resolver.remaining(),
            ),
            None => info!(
                "{} SPF {}; {} lookups to spare",
                prefix,
                outcome.result,
                resolver.remaining(),
            ),
        }

        outcome
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dns::testing::{Entry, StaticResolver};
    use crate::dns::DnsError;
    use crate::spf::eval::{Error as SpfError, SpfResult};
    use crate::zone;

    fn chain(depth: usize) -> StaticResolver {
        let mut records = Vec::new();
        for i in 0..depth {
            records.push((
                format!("d{i}.example"),
                format!("v=spf1 include:d{}.example -all", i + 1),
            ));
        }
        records
            .push((format!("d{depth}.example"), "v=spf1 +all".to_owned()));

        let mut zone = StaticResolver::default();
        for (name, record) in records {
            zone.add_name(&name);
            zone.txt.insert(name, Entry::Ok(vec![record]));
        }
        zone
    }

    #[tokio::test]
    async fn budget_per_check() {
        crate::init_test_log();

        let config = SpfConfig {
            lookup_limit: 3,
            ..SpfConfig::default()
        };
        let checker = Checker::with_resolver(chain(2), config);
        let ip = "192.0.2.1".parse().unwrap();

        // Three lookups each time; the budget does not carry over between
        // checks.
        for _ in 0..3 {
            assert_eq!(
                SpfResult::Pass,
                checker.check_host(ip, "d0.example", "").await.result,
            );
        }

        let outcome = checker.check_host(ip, "d1.example", "").await;
        assert_eq!(SpfResult::Pass, outcome.result);
        assert_eq!(11, checker.resolver.queries());

        let checker = Checker::with_resolver(
            chain(3),
            SpfConfig {
                lookup_limit: 3,
                ..SpfConfig::default()
            },
        );
        let outcome = checker.check_host(ip, "d0.example", "").await;
        assert_eq!(SpfResult::PermError, outcome.result);
        assert_eq!(
            Some(SpfError::Included {
                domain: "d1.example".to_owned(),
                result: SpfResult::PermError,
            }),
            outcome.reason,
        );
    }

    #[tokio::test]
    async fn receiver_host_in_explanation() {
        crate::init_test_log();

        let zone = zone! {
            "example.com" => {
                txt: ["v=spf1 -all exp=why.example.com"],
            },
            "why.example.com" => {
                txt: ["rejected by %{r} for %{s}"],
            },
        };

        let checker = Checker::with_resolver(
            zone,
            SpfConfig {
                receiver_host: "mx.example.net".to_owned(),
                ..SpfConfig::default()
            },
        );
        let outcome = checker
            .check_host(
                "2001:db8::1".parse().unwrap(),
                "example.com",
                "joe@example.com",
            )
            .await;
        assert_eq!(SpfResult::Fail, outcome.result);
        assert_eq!(
            Some("rejected by mx.example.net for joe@example.com"),
            outcome.explanation.as_deref(),
        );

        let checker = Checker::with_resolver(
            zone! {
                "example.com" => {
                    txt: ["v=spf1 -all exp=why.example.com"],
                },
                "why.example.com" => {
                    txt: ["rejected by %{r}"],
                },
            },
            SpfConfig::default(),
        );
        let outcome = checker
            .check_host("192.0.2.1".parse().unwrap(), "example.com", "")
            .await;
        assert_eq!(
            Some("rejected by unknown"),
            outcome.explanation.as_deref(),
        );
    }

    #[tokio::test]
    async fn mx_address_limit_from_config() {
        crate::init_test_log();

        let zone = || {
            zone! {
                "example.com" => {
                    txt: ["v=spf1 mx -all"],
                    mx: ["mx.example.com"],
                },
                "mx.example.com" => {
                    a: ["192.0.2.10", "192.0.2.11", "192.0.2.12"],
                },
            }
        };
        let ip = "198.51.100.1".parse().unwrap();

        let checker = Checker::with_resolver(
            zone(),
            SpfConfig {
                mx_address_limit: 2,
                ..SpfConfig::default()
            },
        );
        let outcome = checker.check_host(ip, "example.com", "").await;
        assert_eq!(SpfResult::PermError, outcome.result);
        assert_eq!(
            Some(SpfError::Dns(DnsError::LimitExceeded)),
            outcome.reason,
        );

        let checker = Checker::with_resolver(zone(), SpfConfig::default());
        let outcome = checker.check_host(ip, "example.com", "").await;
        assert_eq!(SpfResult::Fail, outcome.result);
    }
}
