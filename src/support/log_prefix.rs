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

use std::fmt;
use std::mem;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included in at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    protocol: String,
    client: Option<IpAddr>,
    domain: Option<String>,
    sender: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                client: None,
                domain: None,
                sender: None,
            })),
        }
    }

    pub fn deep_clone(&self) -> Self {
        let inner = self.inner.lock().unwrap();
        Self {
            inner: Arc::new(Mutex::new(Inner::clone(&inner))),
        }
    }

    pub fn set_client(&self, client: IpAddr) {
        self.inner.lock().unwrap().client = Some(client);
    }

    pub fn set_domain(&self, domain: String) {
        self.inner.lock().unwrap().domain = Some(sanitise(domain));
    }

    pub fn set_sender(&self, sender: String) {
        self.inner.lock().unwrap().sender = Some(sanitise(sender));
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.protocol)?;
        if inner.client.is_some()
            || inner.domain.is_some()
            || inner.sender.is_some()
        {
            write!(f, "[")?;
            let mut first = true;
            if let Some(client) = inner.client {
                write!(f, "{client}")?;
                first = false;
            }

            if let Some(ref domain) = inner.domain {
                if !mem::take(&mut first) {
                    write!(f, " ")?;
                }
                write!(f, "{domain}")?;
            }

            if let Some(ref sender) = inner.sender {
                if !mem::take(&mut first) {
                    write!(f, " ")?;
                }
                write!(f, "from=<{sender}>")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_format() {
        let prefix = LogPrefix::new("spf".to_owned());
        assert_eq!("spf", prefix.to_string());

        prefix.set_client("192.0.2.1".parse().unwrap());
        assert_eq!("spf[192.0.2.1]", prefix.to_string());

        let child = prefix.deep_clone();
        child.set_domain("example.com".to_owned());
        assert_eq!("spf[192.0.2.1 example.com]", child.to_string());
        assert_eq!("spf[192.0.2.1]", prefix.to_string());

        let shared = child.clone();
        shared.set_sender("a@example.com\n".to_owned());
        assert_eq!(
            "spf[192.0.2.1 example.com from=<a@example.com>]",
            child.to_string(),
        );

        child.set_domain("x".repeat(100));
        assert!(child.to_string().contains(&format!(" {} ", "x".repeat(64))));
    }
}
