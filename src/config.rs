use std::{env, fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;
use tracing::{debug, info};

use crate::{live::LiveConfig, model::IceServer};

pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Used when neither `RUST_LOG` nor `LOG_FILTER` is set.
pub const DEFAULT_LOG_FILTER: &str = "info,sqlx=warn";

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    /// In-memory store when unset.
    pub database_url: Option<String>,
    pub session_idle: time::Duration,
    pub live: LiveConfig,
}

impl Config {
    /// Reads the process environment, after `.env` if one is present.
    pub fn from_env() -> anyhow::Result<Self> {
        if dotenv::dotenv().is_ok() {
            debug!("loaded .env");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, which returns the raw value of a key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let vars = Vars(lookup);
        let defaults = LiveConfig::default();

        let live = LiveConfig {
            lease: Duration::from_secs(vars.try_load("PRESENCE_LEASE_SECS", defaults.lease.as_secs())?),
            sweep_every: Duration::from_secs(vars.try_load(
                "PRESENCE_SWEEP_SECS",
                defaults.sweep_every.as_secs(),
            )?),
            max_participants: vars.try_load("MAX_PARTICIPANTS", defaults.max_participants)?,
            chat_max_len: vars.try_load("CHAT_MAX_LEN", defaults.chat_max_len)?,
            chat_history_limit: vars.try_load("CHAT_HISTORY_LIMIT", defaults.chat_history_limit)?,
            ice_servers: vars.ice_servers()?,
            event_buffer: defaults.event_buffer,
        };
        let session_idle = time::Duration::minutes(vars.try_load("SESSION_IDLE_MINUTES", 60i64)?);

        if live.lease.is_zero() {
            anyhow::bail!("PRESENCE_LEASE_SECS must be positive");
        }
        if live.sweep_every.is_zero() {
            anyhow::bail!("PRESENCE_SWEEP_SECS must be positive");
        }
        if live.max_participants == 0 {
            anyhow::bail!("MAX_PARTICIPANTS must be at least 1");
        }
        if !session_idle.is_positive() {
            anyhow::bail!("SESSION_IDLE_MINUTES must be positive");
        }

        Ok(Self {
            addr: vars.try_load("SPEAKSPACE_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            database_url: vars.var("DATABASE_URL"),
            session_idle,
            live,
        })
    }
}

/// The log filter from `LOG_FILTER`, readable before logging is set up.
pub fn log_filter() -> String {
    let _ = dotenv::dotenv();
    Vars(|key: &str| env::var(key).ok())
        .var("LOG_FILTER")
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_owned())
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn var(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn try_load<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr + Display,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.var(key) {
            Some(value) => value
                .trim()
                .parse()
                .with_context(|| format!("invalid {key} value {value:?}")),
            None => {
                info!("{key} not set, using default: {default}");
                Ok(default)
            }
        }
    }

    fn ice_servers(&self) -> anyhow::Result<Vec<IceServer>> {
        let mut servers: Vec<IceServer> = match self.var("STUN_URLS") {
            Some(urls) => urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect(),
            None => DEFAULT_STUN_URLS.into_iter().map(IceServer::stun).collect(),
        };

        if let Some(url) = self.var("TURN_URL") {
            let username = self
                .var("TURN_USERNAME")
                .context("TURN_URL is set without TURN_USERNAME")?;
            let credential = self
                .var("TURN_CREDENTIAL")
                .context("TURN_URL is set without TURN_CREDENTIAL")?;
            servers.push(IceServer {
                urls: vec![url],
                username: Some(username),
                credential: Some(credential),
            });
        }

        Ok(servers)
    }
}
