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

use std::path::Path;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Deserializers, Root};
use log4rs::encode::pattern::PatternEncoder;

use super::error::Error;

const STDERR_PATTERN: &str = "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}";

/// Builds a configuration which writes everything at or above `level` to
/// standard error.
pub fn stderr_config(level: LevelFilter) -> Result<Config, Error> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(STDERR_PATTERN)))
        .build();

    Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .map_err(|e| Error::Logging(e.to_string()))
}

/// Logs to standard error at `level`.
pub fn init_stderr(level: LevelFilter) -> Result<(), Error> {
    log4rs::init_config(stderr_config(level)?)
        .map(|_| ())
        .map_err(|e| Error::Logging(e.to_string()))
}

/// Configures logging from the log4rs configuration file at `path`.
pub fn init_file(path: &Path) -> Result<(), Error> {
    log4rs::init_file(path, Deserializers::default())
        .map_err(|e| Error::Logging(e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stderr_config_builds() {
        let config = stderr_config(LevelFilter::Warn).unwrap();
        assert_eq!(LevelFilter::Warn, config.root().level());
        assert_eq!(1, config.appenders().len());
        assert_eq!("stderr", config.appenders()[0].name());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            Err(Error::Logging(_)),
            init_file(&dir.path().join("logging.toml")),
        );
    }
}
