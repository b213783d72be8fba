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

use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;

use log::LevelFilter;
use structopt::StructOpt;

use crymap_spf::spf::{Checker, Outcome};
use crymap_spf::support::logging;
use crymap_spf::support::sysexits::*;
use crymap_spf::support::system_config::SpfConfig;

/// Evaluate the SPF policy of a domain for a client address.
///
/// The result is printed on a line starting with `result:`, followed by the
/// explanation and the reason for the result if there are any. The exit
/// status is 0 whenever a result was produced, even if that result is `fail`
/// or `temperror`.
///
/// To check the HELO identity, pass the HELO domain as both DOMAIN and the
/// domain part of SENDER, e.g. `postmaster@mail.example.com`.
#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Command {
    /// Read settings from this TOML file.
    #[structopt(long, short, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Log progress to standard error. Pass twice for a full trace of the
    /// evaluation.
    #[structopt(long, short, parse(from_occurrences))]
    verbose: u8,

    /// Configure logging from this log4rs configuration file instead of
    /// writing to standard error. Overrides --verbose.
    #[structopt(long, parse(from_os_str))]
    log_config: Option<PathBuf>,

    /// The IPv4 or IPv6 address of the SMTP client.
    ip: String,

    /// The domain whose policy is evaluated, usually the domain of the
    /// MAIL FROM address.
    domain: String,

    /// The MAIL FROM address. [default: postmaster@DOMAIN]
    sender: Option<String>,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    let logging = match cmd.log_config {
        Some(ref path) => logging::init_file(path),
        None => logging::init_stderr(verbosity(cmd.verbose)),
    };
    if let Err(e) = logging {
        eprintln!("{}", e);
        EX_CONFIG.exit();
    }

    let ip = match cmd.ip.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(e) => {
            eprintln!("Invalid IP address '{}': {}", cmd.ip, e);
            EX_DATAERR.exit()
        },
    };

    let config = match cmd.config {
        Some(ref path) => match SpfConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error in config file '{}': {}", path.display(), e);
                EX_CONFIG.exit()
            },
        },
        None => SpfConfig::default(),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            EX_OSERR.exit()
        },
    };

    let outcome = runtime.block_on(async {
        let checker = match Checker::new(config) {
            Ok(checker) => checker,
            Err(e) => {
                eprintln!("Failed to set up DNS resolver: {}", e);
                EX_OSERR.exit()
            },
        };

        checker
            .check_host(ip, &cmd.domain, cmd.sender.as_deref().unwrap_or(""))
            .await
    });

    print!("{}", format_outcome(&outcome));
    EX_OK.exit()
}

fn verbosity(occurrences: u8) -> LevelFilter {
    match occurrences {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

fn format_outcome(outcome: &Outcome) -> String {
    let mut out = format!("result: {}\n", outcome.result);
    if let Some(ref explanation) = outcome.explanation {
        let _ = writeln!(out, "explanation: {}", explanation);
    }
    if let Some(ref reason) = outcome.reason {
        let _ = writeln!(out, "reason: {}", reason);
    }
    out
}
