use std::env;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::tasks::flusher::{FailurePolicy, DEFAULT_FLUSH_INTERVAL};

const DEFAULT_DATABASE_URL: &str = "sqlite:vote_counter.db";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4150";

pub const USAGE: &str = "\
Environment:
  DATABASE_URL          database holding the polls (default: sqlite:vote_counter.db)
  VOTES_LISTEN_ADDR     address votes are received on, one option per line (default: 127.0.0.1:4150)
  FLUSH_INTERVAL_MS     milliseconds between database updates (default: 1000)
  FLUSH_FAILURE_POLICY  'requeue' or 'drop' votes whose update failed (default: requeue)
  RUST_LOG              log filter, e.g. info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub listen_addr: String,
    pub flush_interval: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    // Builds a config from any key lookup, unset keys fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(addr) = lookup("VOTES_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(interval) = lookup("FLUSH_INTERVAL_MS") {
            let millis: u64 = interval
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("FLUSH_INTERVAL_MS '{}': {}", interval, e)))?;
            if millis == 0 {
                return Err(Error::Config("FLUSH_INTERVAL_MS must be greater than zero".into()));
            }
            config.flush_interval = Duration::from_millis(millis);
        }
        if let Some(policy) = lookup("FLUSH_FAILURE_POLICY") {
            config.failure_policy = policy.parse().map_err(Error::Config)?;
        }

        Ok(config)
    }
}
