//! Command-line interface

pub mod args;

pub use args::{Args, Command};

use crate::config::Config;
use anyhow::Result;

impl Args {
    /// Configuration file (or defaults) with command-line overrides applied
    ///
    /// # Errors
    /// Returns an error if the configuration file cannot be loaded
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(limit) = self.trace_limit {
            config.trace_limit = limit;
        }
        if let Some(interval) = self.interval {
            config.poll_interval_ms = interval;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from(["callscope", "demo", "--trace-limit", "768", "--interval", "5"]);
        let config = args.load_config().unwrap();
        assert_eq!(config.trace_limit, 768);
        assert_eq!(config.poll_interval_ms, 5);
        assert!(matches!(args.command, Command::Demo { threads: 4, iterations: 200, .. }));
    }

    #[test]
    fn test_replay_arguments() {
        let args = Args::parse_from(["callscope", "replay", "t.json", "--json"]);
        match args.command {
            Command::Replay { trace, chunk, json } => {
                assert_eq!(trace, std::path::PathBuf::from("t.json"));
                assert_eq!(chunk, 384);
                assert!(json);
            }
            _ => panic!("expected replay"),
        }
    }

    #[test]
    fn test_command_is_required() {
        assert!(Args::try_parse_from(["callscope"]).is_err());
    }
}
