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
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::{BoxFuture, FutureExt};

use super::{DnsError, IpMatcher, Resolver};

// RFC 7208 § 4.6.4
/// The default number of DNS-querying operations one evaluation may perform.
pub const DEFAULT_LOOKUP_LIMIT: u32 = 10;
/// The default number of exchanges whose addresses one `mx` mechanism may
/// look up, and of addresses it may examine.
pub const DEFAULT_MX_ADDRESS_LIMIT: u32 = 10;

/// Wraps a `Resolver` with the lookup budget of a single SPF evaluation.
///
/// Every operation consumes one unit of budget before it is forwarded; once
/// the budget is spent, operations fail with `DnsError::LimitExceeded`
/// without reaching the inner resolver. A `LimitedResolver` must be scoped to
/// exactly one top-level evaluation, including everything it recurses into.
pub struct LimitedResolver<R> {
    inner: R,
    remaining: AtomicU32,
    mx_address_limit: u32,
}

impl<R: Resolver> LimitedResolver<R> {
    pub fn new(inner: R, lookup_limit: u32, mx_address_limit: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(lookup_limit),
            mx_address_limit,
        }
    }

    /// Returns how much of the budget is left.
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Relaxed)
    }

    fn consume(&self) -> Result<(), DnsError> {
        take_one(&self.remaining)
    }
}

fn take_one(counter: &AtomicU32) -> Result<(), DnsError> {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .map(|_| ())
        .map_err(|_| DnsError::LimitExceeded)
}

impl<R: Resolver> Resolver for LimitedResolver<R> {
    fn lookup_txt<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
        async move {
            self.consume()?;
            self.inner.lookup_txt(name).await
        }
        .boxed()
    }

    fn lookup_txt_strict<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
        async move {
            self.consume()?;
            self.inner.lookup_txt_strict(name).await
        }
        .boxed()
    }

    fn exists<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        async move {
            self.consume()?;
            self.inner.exists(name).await
        }
        .boxed()
    }

    fn match_ip<'a>(
        &'a self,
        name: &'a str,
        matcher: &'a IpMatcher<'a>,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        async move {
            self.consume()?;
            self.inner.match_ip(name, matcher).await
        }
        .boxed()
    }

    // RFC 7208 § 4.6.4: the evaluation of each "mx" mechanism MUST NOT
    // result in querying more than 10 address records.
    fn match_mx_bounded<'a>(
        &'a self,
        name: &'a str,
        max_exchanges: usize,
        matcher: &'a IpMatcher<'a>,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        async move {
            self.consume()?;

            let max_exchanges = usize::try_from(self.mx_address_limit)
                .map_or(max_exchanges, |cap| cap.min(max_exchanges));
            let addresses = AtomicU32::new(self.mx_address_limit);
            let limited = |ip: IpAddr| -> Result<bool, DnsError> {
                take_one(&addresses)?;
                matcher(ip)
            };
            self.inner
                .match_mx_bounded(name, max_exchanges, &limited)
                .await
        }
        .boxed()
    }
}
