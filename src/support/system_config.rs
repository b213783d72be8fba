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

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::Error;
use crate::dns::limited::{DEFAULT_LOOKUP_LIMIT, DEFAULT_MX_ADDRESS_LIMIT};

/// The configuration for SPF evaluation.
///
/// This is stored in a TOML file, conventionally `spf.toml`. Every field is
/// optional.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SpfConfig {
    /// The maximum number of DNS-querying operations one evaluation may
    /// perform, including the fetch of the initial record and everything done
    /// by `include` and `redirect`.
    ///
    /// RFC 7208 requires this to be 10.
    pub lookup_limit: u32,

    /// The maximum number of addresses a single `mx` mechanism may examine
    /// before evaluation fails.
    pub mx_address_limit: u32,

    /// The host name substituted for `%{r}` in explanations.
    ///
    /// If empty, `unknown` is used.
    pub receiver_host: String,

    /// How to reach DNS.
    pub dns: DnsConfig,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            lookup_limit: DEFAULT_LOOKUP_LIMIT,
            mx_address_limit: DEFAULT_MX_ADDRESS_LIMIT,
            receiver_host: String::new(),
            dns: DnsConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DnsConfig {
    /// The timeout for a single DNS query, in seconds.
    pub timeout_secs: u64,

    /// The number of times a query is attempted before it is considered a
    /// temporary failure.
    pub attempts: usize,

    /// The name servers to query, as `address:port`.
    ///
    /// If empty, the system resolver configuration (`/etc/resolv.conf`) is
    /// used.
    pub nameservers: Vec<SocketAddr>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            attempts: 2,
            nameservers: Vec::new(),
        }
    }
}

impl SpfConfig {
    /// Reads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = fs::read(path)?;
        let config: Self = toml::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if 0 == self.lookup_limit {
            return Err(Error::Config(
                "lookup_limit must be positive".to_owned(),
            ));
        }

        if 0 == self.dns.attempts {
            return Err(Error::Config(
                "dns.attempts must be positive".to_owned(),
            ));
        }

        Ok(())
    }

    /// The value to use for `%{r}`.
    pub fn receiver_host(&self) -> &str {
        if self.receiver_host.is_empty() {
            "unknown"
        } else {
            &self.receiver_host
        }
    }
}
