use std::env::{self, VarError};
use std::fmt;
use std::io::Error;
use std::str::FromStr;

/// Environment variable that picks the runtime environment of a service.
pub const ENVIRONMENT_VAR: &str = "SLATE_ENVIRONMENT";

/// The runtime environment of a SLATE service.
///
/// Decides which `configuration/{overlay}.yaml` file is layered over the base
/// configuration and whether telemetry writes JSON log files or pretty
/// console output. An unset variable means [`Environment::Prod`], so a bare
/// deployment fails safe into the production overlay and file logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Prod,
    Staging,
    Dev,
}

impl Environment {
    /// Reads the environment from `SLATE_ENVIRONMENT`.
    pub fn detect() -> Result<Self, Error> {
        match env::var(ENVIRONMENT_VAR) {
            Ok(value) => value.parse(),
            Err(VarError::NotPresent) => Ok(Self::Prod),
            Err(error) => Err(Error::other(error)),
        }
    }

    /// Pins the environment for the rest of this process.
    ///
    /// Tests use this to force console logging and the dev overlay.
    pub fn install(self) {
        unsafe { env::set_var(ENVIRONMENT_VAR, self.overlay_name()) }
    }

    /// File stem of the configuration overlay for this environment.
    pub fn overlay_name(self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Staging => "staging",
            Self::Dev => "dev",
        }
    }

    /// Whether telemetry should treat this environment as production-like.
    ///
    /// Staging logs the same way production does, so problems found there
    /// look identical in the log pipeline.
    pub fn logs_to_files(self) -> bool {
        !matches!(self, Self::Dev)
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(Self::Prod),
            "staging" => Ok(Self::Staging),
            "dev" | "development" => Ok(Self::Dev),
            other => Err(Error::other(format!(
                "unrecognized environment `{other}`; expected prod, staging, or dev"
            ))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.overlay_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_names_parse_case_insensitively() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Prod);
        assert_eq!("Production".parse::<Environment>().unwrap(), Environment::Prod);
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert_eq!("DEVELOPMENT".parse::<Environment>().unwrap(), Environment::Dev);
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!("qa".parse::<Environment>().is_err());
        assert!("".parse::<Environment>().is_err());
    }

    #[test]
    fn overlay_names_round_trip_through_parse() {
        for environment in [Environment::Prod, Environment::Staging, Environment::Dev] {
            assert_eq!(
                environment.overlay_name().parse::<Environment>().unwrap(),
                environment
            );
        }
    }

    #[test]
    fn only_dev_logs_to_the_console() {
        assert!(Environment::Prod.logs_to_files());
        assert!(Environment::Staging.logs_to_files());
        assert!(!Environment::Dev.logs_to_files());
    }
}
