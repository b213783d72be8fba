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

//! Evaluation of SPF records: `check_host()` from RFC 7208 § 4.
//!
//! A record is a small program whose mechanisms run left to right until one
//! matches. `include` and `redirect` recurse into the records of other
//! domains; only the lookup budget keeps that recursion finite.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::prelude::*;
use futures::future::{BoxFuture, FutureExt};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use thiserror::Error;

use super::macros;
use super::syntax::{self as s, Kind, Mechanism, Modifier, Qualifier, Term};
use crate::dns::{self, DnsError, Resolver};
use crate::support::log_prefix::LogPrefix;

/// The fundamental SPF result types.
///
/// RFC 7208 § 2.6
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpfResult {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::None => "none",
            Self::Neutral => "neutral",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        };
        f.write_str(s)
    }
}

impl From<Qualifier> for SpfResult {
    fn from(q: Qualifier) -> Self {
        match q {
            Qualifier::Pass => Self::Pass,
            Qualifier::Fail => Self::Fail,
            Qualifier::SoftFail => Self::SoftFail,
            Qualifier::Neutral => Self::Neutral,
        }
    }
}

/// Why an evaluation ended the way it did, or a fault that was noted along
/// the way.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
    #[error("no SPF record found")]
    SpfNotFound,
    #[error("multiple SPF records found")]
    TooManySpfRecords,
    #[error("syntax error in '{term}': {error}")]
    Syntax { term: String, error: s::Error },
    #[error("unsupported SPF version: {0}")]
    InvalidVersion(String),
    #[error("invalid CIDR length in '{0}'")]
    InvalidCidr(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("wrong address family: {0}")]
    AddressFamily(String),
    #[error("duplicate {0} modifier")]
    DuplicateModifier(&'static str),
    #[error("domain expanded to nothing")]
    EmptyDomain,
    #[error("evaluation of {domain} returned {result}")]
    Included { domain: String, result: SpfResult },
    #[error(transparent)]
    Macro(#[from] macros::Error),
    #[error(transparent)]
    Dns(#[from] DnsError),
}

impl Error {
    /// The verdict an evaluation aborted by this error produces.
    fn verdict(&self) -> SpfResult {
        match *self {
            Self::Dns(DnsError::Temporary(_))
            | Self::Included {
                result: SpfResult::TempError,
                ..
            } => SpfResult::TempError,
            _ => SpfResult::PermError,
        }
    }
}

/// The conclusion of `check_host()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub result: SpfResult,
    /// The expanded `exp` text, only ever present for `Fail`.
    pub explanation: Option<String>,
    /// The underlying fault, if any, for diagnostics.
    pub reason: Option<Error>,
}

impl Outcome {
    fn new(result: SpfResult) -> Self {
        Self {
            result,
            explanation: None,
            reason: None,
        }
    }

    fn failed(result: SpfResult, reason: Error) -> Self {
        Self {
            result,
            explanation: None,
            reason: Some(reason),
        }
    }

    fn aborted(reason: Error) -> Self {
        Self::failed(reason.verdict(), reason)
    }
}

/// Values which are fixed for an entire evaluation tree.
#[derive(Clone)]
pub struct Environment {
    /// The name of this host, for `%{r}`.
    pub receiver_host: String,
    /// The time for `%{t}`.
    pub now: DateTime<Utc>,
    pub log_prefix: LogPrefix,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            receiver_host: "unknown".to_owned(),
            now: Utc::now(),
            log_prefix: LogPrefix::new("spf".to_owned()),
        }
    }
}

/// Evaluates the SPF policy of `domain` for mail from `sender` arriving from
/// `ip`.
///
/// RFC 7208 § 4
///
/// `resolver` should enforce the lookup limits; see
/// `dns::LimitedResolver`.
pub async fn check_host(
    resolver: &dyn Resolver,
    ip: IpAddr,
    domain: &str,
    sender: &str,
) -> Outcome {
    check_host_with(resolver, &Environment::default(), ip, domain, sender)
        .await
}

/// Like `check_host`, but with an explicit environment.
///
/// This is also how `include` and `redirect` recurse.
pub fn check_host_with<'a>(
    resolver: &'a dyn Resolver,
    env: &'a Environment,
    ip: IpAddr,
    domain: &'a str,
    sender: &'a str,
) -> BoxFuture<'a, Outcome> {
    async move {
        let domain = domain.strip_suffix('.').unwrap_or(domain);
        let ip = ip.to_canonical();
        let log_prefix = env.log_prefix.deep_clone();
        log_prefix.set_client(ip);
        log_prefix.set_domain(domain.to_owned());

        let evaluation = Evaluation {
            resolver,
            env,
            ip,
            domain,
            sender,
            log_prefix,
        };
        evaluation.run().await
    }
    .boxed()
}

/// The state of one (possibly nested) `check_host()` invocation.
struct Evaluation<'a> {
    resolver: &'a dyn Resolver,
    env: &'a Environment,
    ip: IpAddr,
    domain: &'a str,
    sender: &'a str,
    log_prefix: LogPrefix,
}

/// The terms of a record, sorted by role.
#[derive(Debug)]
struct Policy<'a> {
    /// Mechanisms in evaluation order, up to and including the first `all`.
    mechanisms: Vec<Term<'a>>,
    redirect: Option<Term<'a>>,
    explanation: Option<Term<'a>>,
}

impl<'a> Policy<'a> {
    fn classify(record: &'a str) -> Result<Self, Error> {
        let mut policy = Self {
            mechanisms: Vec::new(),
            redirect: None,
            explanation: None,
        };
        let mut seen_all = false;

        for term in s::Terms::new(record) {
            match term.kind {
                Kind::Error(error) => {
                    return Err(Error::Syntax {
                        term: term.value.to_owned(),
                        error,
                    })
                },

                Kind::Mechanism(m) => {
                    if !seen_all {
                        seen_all = Mechanism::All == m;
                        policy.mechanisms.push(term);
                    }
                },

                Kind::Modifier(m @ Modifier::Redirect) => {
                    set_once(&mut policy.redirect, term, m)?
                },
                Kind::Modifier(m @ Modifier::Explanation) => {
                    set_once(&mut policy.explanation, term, m)?
                },
            }
        }

        // RFC 7208 § 6.1: redirect is ignored if there is an `all` mechanism
        if seen_all {
            policy.redirect = None;
        }

        Ok(policy)
    }
}

fn set_once<'a>(
    slot: &mut Option<Term<'a>>,
    term: Term<'a>,
    modifier: Modifier,
) -> Result<(), Error> {
    if slot.replace(term).is_some() {
        Err(Error::DuplicateModifier(modifier.name()))
    } else {
        Ok(())
    }
}

/// Returns whether `record` is an SPF version 1 record.
///
/// RFC 7208 § 4.5. The version must be followed by a space or tab, or end
/// the record.
fn is_spf_record(record: &str) -> bool {
    const VERSION: &str = "v=spf1";

    record
        .get(..VERSION.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(VERSION))
        && record[VERSION.len()..]
            .chars()
            .next()
            .map_or(true, |c| matches!(c, ' ' | '\t'))
}

lazy_static! {
    /// `domain-spec [ "/" ip4-cidr-length ] [ "//" ip6-cidr-length ]`, also
    /// accepting a single slash before the IPv6 length.
    static ref DUAL_CIDR: Regex =
        Regex::new("^(.*?)(?:/([0-9]+))?(?://?([0-9]+))?$").unwrap();
}

impl Evaluation<'_> {
    async fn run(&self) -> Outcome {
        if !dns::is_domain_name(self.domain) {
            debug!("{} Invalid domain, no SPF evaluation", self.log_prefix);
            return Outcome::failed(
                SpfResult::None,
                Error::InvalidDomain(self.domain.to_owned()),
            );
        }

        let record = match self.fetch_record().await {
            Ok(record) => record,
            Err(outcome) => return outcome,
        };
        debug!("{} Evaluating '{}'", self.log_prefix, record);

        let policy = match Policy::classify(&record) {
            Ok(policy) => policy,
            Err(e) => {
                debug!("{} Bad record: {}", self.log_prefix, e);
                return Outcome::aborted(e);
            },
        };

        self.eval_policy(&policy).await
    }

    /// Fetches the single SPF record of the domain.
    async fn fetch_record(&self) -> Result<String, Outcome> {
        let txts = match self
            .resolver
            .lookup_txt_strict(&dns::to_fqdn(self.domain))
            .await
        {
            Ok(txts) => txts,
            Err(e @ DnsError::NotFound) => {
                return Err(Outcome::failed(SpfResult::None, e.into()))
            },
            Err(e @ DnsError::Temporary(_)) => {
                warn!("{} Failed to fetch SPF record: {}", self.log_prefix, e);
                return Err(Outcome::failed(SpfResult::TempError, e.into()));
            },
            Err(e) => {
                return Err(Outcome::failed(SpfResult::PermError, e.into()))
            },
        };

        let mut records = txts.into_iter().filter(|txt| is_spf_record(txt));
        match (records.next(), records.next()) {
            (None, _) => {
                Err(Outcome::failed(SpfResult::None, Error::SpfNotFound))
            },
            (Some(record), None) => Ok(record),
            (Some(_), Some(_)) => Err(Outcome::failed(
                SpfResult::PermError,
                Error::TooManySpfRecords,
            )),
        }
    }

    async fn eval_policy(&self, policy: &Policy<'_>) -> Outcome {
        // RFC 7208 leaves open what a transient fault on a mechanism that
        // did not match means. It is held back here: a later match or a
        // redirect still decides the result, and it only surfaces as
        // TempError if evaluation would otherwise end in Neutral.
        let mut deferred = None::<Error>;

        for term in &policy.mechanisms {
            let Kind::Mechanism(mechanism) = term.kind else {
                continue;
            };

            match self.eval_mechanism(mechanism, term.value).await {
                Ok(false) => {},

                Ok(true) => {
                    debug!("{} '{}' matched", self.log_prefix, term);
                    let result = SpfResult::from(term.qualifier);
                    let mut outcome = Outcome {
                        result,
                        explanation: None,
                        reason: deferred,
                    };

                    if SpfResult::Fail == result {
                        if let Some(ref exp) = policy.explanation {
                            match self.explain(exp.value).await {
                                Ok(explanation) => {
                                    outcome.explanation = explanation;
                                },
                                Err(e) => {
                                    warn!(
                                        "{} Failed to generate explanation: {}",
                                        self.log_prefix, e,
                                    );
                                    outcome.reason = Some(e);
                                },
                            }
                        }
                    }

                    return outcome;
                },

                Err(e @ Error::Dns(DnsError::Temporary(_))) => {
                    warn!(
                        "{} Transient failure evaluating '{}': {}",
                        self.log_prefix, term, e,
                    );
                    deferred.get_or_insert(e);
                },

                Err(e) => {
                    debug!("{} '{}' failed: {}", self.log_prefix, term, e);
                    return Outcome::aborted(e);
                },
            }
        }

        if let Some(ref redirect) = policy.redirect {
            return self.eval_redirect(redirect.value, deferred).await;
        }

        match deferred {
            Some(e) => Outcome::failed(SpfResult::TempError, e),
            None => Outcome::new(SpfResult::Neutral),
        }
    }

    async fn eval_mechanism(
        &self,
        mechanism: Mechanism,
        value: &str,
    ) -> Result<bool, Error> {
        match mechanism {
            Mechanism::Version => {
                if value.eq_ignore_ascii_case("spf1") {
                    Ok(false)
                } else {
                    Err(Error::InvalidVersion(value.to_owned()))
                }
            },
            Mechanism::All => Ok(true),
            // RFC 7208 § 5.5: "ptr" SHOULD NOT be used. It is never looked up
            // and never matches.
            Mechanism::Ptr => Ok(false),
            Mechanism::Ip4 => self.eval_ip4(value),
            Mechanism::Ip6 => self.eval_ip6(value),
            Mechanism::A => self.eval_a(value).await,
            Mechanism::Mx => self.eval_mx(value).await,
            Mechanism::Include => self.eval_include(value).await,
            Mechanism::Exists => self.eval_exists(value).await,
        }
    }

    fn eval_ip4(&self, value: &str) -> Result<bool, Error> {
        let (addr, cidr_len) = split_cidr(value, 32)?;
        let addr = addr.parse::<Ipv4Addr>().map_err(|_| {
            if addr.parse::<Ipv6Addr>().is_ok() {
                Error::AddressFamily(value.to_owned())
            } else {
                Error::InvalidAddress(value.to_owned())
            }
        })?;

        Ok(match self.ip {
            IpAddr::V4(ip) => ipv4_addr_matches(addr, ip, cidr_len),
            IpAddr::V6(_) => false,
        })
    }

    fn eval_ip6(&self, value: &str) -> Result<bool, Error> {
        let (addr, cidr_len) = split_cidr(value, 128)?;
        let addr = match addr.parse::<Ipv6Addr>() {
            Ok(addr) if addr.to_ipv4_mapped().is_none() => addr,
            Ok(_) => return Err(Error::AddressFamily(value.to_owned())),
            Err(_) if addr.parse::<Ipv4Addr>().is_ok() => {
                return Err(Error::AddressFamily(value.to_owned()))
            },
            Err(_) => return Err(Error::InvalidAddress(value.to_owned())),
        };

        Ok(match self.ip {
            IpAddr::V6(ip) => ipv6_addr_matches(addr, ip, cidr_len),
            IpAddr::V4(_) => false,
        })
    }

    async fn eval_a(&self, value: &str) -> Result<bool, Error> {
        let (domain, v4_len, v6_len) = self.dual_cidr_target(value)?;
        let matcher = cidr_matcher(self.ip, v4_len, v6_len);
        Ok(self
            .resolver
            .match_ip(&dns::to_fqdn(&domain), &matcher)
            .await?)
    }

    async fn eval_mx(&self, value: &str) -> Result<bool, Error> {
        let (domain, v4_len, v6_len) = self.dual_cidr_target(value)?;
        let matcher = cidr_matcher(self.ip, v4_len, v6_len);
        Ok(self
            .resolver
            .match_mx(&dns::to_fqdn(&domain), &matcher)
            .await?)
    }

    async fn eval_include(&self, value: &str) -> Result<bool, Error> {
        let domain = self.expand_domain(value)?;
        debug!("{} Including {}", self.log_prefix, domain);
        let inner = check_host_with(
            self.resolver,
            self.env,
            self.ip,
            &domain,
            self.sender,
        )
        .await;

        // RFC 7208 § 5.2
        match inner.result {
            SpfResult::Pass => Ok(true),
            SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => {
                Ok(false)
            },
            result @ (SpfResult::TempError
            | SpfResult::PermError
            | SpfResult::None) => Err(Error::Included { domain, result }),
        }
    }

    async fn eval_exists(&self, value: &str) -> Result<bool, Error> {
        let domain = self.expand_domain(value)?;
        match self.resolver.exists(&dns::to_fqdn(&domain)).await {
            Ok(exists) => Ok(exists),
            Err(DnsError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn eval_redirect(
        &self,
        value: &str,
        deferred: Option<Error>,
    ) -> Outcome {
        let domain = match self.expand_domain(value) {
            Ok(domain) => domain,
            Err(e) => return Outcome::aborted(e),
        };

        debug!("{} Redirecting to {}", self.log_prefix, domain);
        let inner = check_host_with(
            self.resolver,
            self.env,
            self.ip,
            &domain,
            self.sender,
        )
        .await;

        // RFC 7208 § 6.1
        match inner.result {
            result @ (SpfResult::None | SpfResult::PermError) => {
                Outcome::failed(
                    SpfResult::PermError,
                    Error::Included { domain, result },
                )
            },
            _ => Outcome {
                reason: inner.reason.or(deferred),
                ..inner
            },
        }
    }

    /// Generates the explanation for a `Fail` result.
    ///
    /// RFC 7208 § 6.2
    async fn explain(&self, value: &str) -> Result<Option<String>, Error> {
        let domain = self.expand_domain(value)?;
        let text = self
            .resolver
            .lookup_txt(&dns::to_fqdn(&domain))
            .await?
            .concat();
        if text.is_empty() {
            return Ok(None);
        }

        Ok(Some(macros::expand_explanation(
            &self.macro_context(),
            &text,
        )?))
    }

    /// Parses the argument to `a` or `mx` into the domain to look up and the
    /// IPv4 and IPv6 CIDR lengths.
    fn dual_cidr_target(
        &self,
        value: &str,
    ) -> Result<(String, u32, u32), Error> {
        let captures = DUAL_CIDR
            .captures(value)
            .ok_or_else(|| Error::InvalidCidr(value.to_owned()))?;
        let cidr_len = |group: usize, max: u32| {
            captures.get(group).map_or(Ok(max), |len| {
                len.as_str()
                    .parse::<u32>()
                    .ok()
                    .filter(|&len| len <= max)
                    .ok_or_else(|| Error::InvalidCidr(value.to_owned()))
            })
        };
        let v4_len = cidr_len(2, 32)?;
        let v6_len = cidr_len(3, 128)?;

        let domain_spec = captures.get(1).map_or("", |m| m.as_str());
        let domain = if domain_spec.is_empty() {
            self.domain.to_owned()
        } else {
            self.expand_domain(domain_spec)?
        };

        Ok((domain, v4_len, v6_len))
    }

    /// Expands `domain_spec` and ensures the result can be looked up.
    fn expand_domain(&self, domain_spec: &str) -> Result<String, Error> {
        let expanded = macros::expand(&self.macro_context(), domain_spec)?;
        let domain = truncate_domain(&expanded);
        if domain.is_empty() {
            return Err(Error::EmptyDomain);
        }

        if !dns::is_domain_name(domain) {
            return Err(Error::InvalidDomain(domain.to_owned()));
        }

        Ok(domain.to_owned())
    }

    fn macro_context(&self) -> macros::Context<'_> {
        macros::Context {
            sender: self.sender,
            domain: self.domain,
            ip: self.ip,
            receiver_host: &self.env.receiver_host,
            now: self.env.now,
        }
    }
}

/// Drops labels from the left of `domain` until it is at most 253 octets.
///
/// RFC 7208 § 7.3
fn truncate_domain(mut domain: &str) -> &str {
    const MAX_LEN: usize = 253;

    domain = domain.strip_suffix('.').unwrap_or(domain);
    while domain.len() > MAX_LEN {
        match domain.split_once('.') {
            Some((_, rest)) => domain = rest,
            None => break,
        }
    }

    domain
}

/// Splits an `ip4` or `ip6` argument into the address and CIDR length.
fn split_cidr(value: &str, max: u32) -> Result<(&str, u32), Error> {
    match value.split_once('/') {
        None => Ok((value, max)),
        Some((addr, len)) => {
            let len = Some(len)
                .filter(|len| {
                    !len.is_empty() && len.bytes().all(|b| b.is_ascii_digit())
                })
                .and_then(|len| len.parse::<u32>().ok())
                .filter(|&len| len <= max)
                .ok_or_else(|| Error::InvalidCidr(value.to_owned()))?;
            Ok((addr, len))
        },
    }
}

/// Returns a predicate for DNS answers which match `client` in the network of
/// the CIDR length for its family.
fn cidr_matcher(
    client: IpAddr,
    v4_len: u32,
    v6_len: u32,
) -> impl Fn(IpAddr) -> Result<bool, DnsError> + Send + Sync {
    move |addr| {
        Ok(match (addr, client) {
            (IpAddr::V4(addr), IpAddr::V4(client)) => {
                ipv4_addr_matches(addr, client, v4_len)
            },
            (IpAddr::V6(addr), IpAddr::V6(client)) => {
                ipv6_addr_matches(addr, client, v6_len)
            },
            _ => false,
        })
    }
}

fn ipv4_addr_matches(a: Ipv4Addr, b: Ipv4Addr, cidr_len: u32) -> bool {
    let mask = u32::MAX.checked_shl(32 - cidr_len).unwrap_or(0);
    let a = u32::from_be_bytes(a.octets());
    let b = u32::from_be_bytes(b.octets());
    (a & mask) == (b & mask)
}

fn ipv6_addr_matches(a: Ipv6Addr, b: Ipv6Addr, cidr_len: u32) -> bool {
    let mask = u128::MAX.checked_shl(128 - cidr_len).unwrap_or(0);
    let a = u128::from_be_bytes(a.octets());
    let b = u128::from_be_bytes(b.octets());
    (a & mask) == (b & mask)
}
