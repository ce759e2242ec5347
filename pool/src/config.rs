use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Anti-abuse thresholds for [`crate::policy::LocalPolicy`].
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PolicyConfig {
    /// Connections allowed per IP inside `limit_window`.
    pub connection_limit: usize,
    pub limit_window: String,
    /// Malformed requests tolerated before a ban.
    pub malformed_limit: u32,
    /// Shares observed before the invalid ratio is enforced.
    pub check_threshold: u32,
    /// Ban when invalid shares reach this percentage of the window.
    pub invalid_percent: f64,
    pub ban_timeout: String,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            connection_limit: 32,
            limit_window: "60s".to_string(),
            malformed_limit: 5,
            check_threshold: 30,
            invalid_percent: 30.0,
            ban_timeout: "30m".to_string(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

pub const POW_ETHASH: &str = "ethash";
pub const POW_KECCAK_SEAL: &str = "keccak-seal";

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub name: String,
    /// Key prefix for the Redis backend.
    pub coin: String,
    pub listen: String,
    /// Read deadline; reset after every message and every job push.
    pub timeout: String,
    pub max_conn: usize,
    /// Pool share difficulty.
    pub difficulty: u64,
    pub block_refresh_interval: String,
    pub hashrate_expiration: String,
    /// Upper bound for a single broadcast push to one session.
    pub push_timeout: String,
    pub daemon_url: String,
    pub daemon_timeout: String,
    pub redis_url: String,
    pub metrics_listen: String,
    /// Share verifier: `"ethash"`, or `"keccak-seal"` on development networks.
    pub pow: String,
    pub policy: PolicyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            coin: "eth".to_string(),
            listen: "0.0.0.0:8008".to_string(),
            timeout: "120s".to_string(),
            max_conn: 8192,
            difficulty: 2_000_000_000,
            block_refresh_interval: "120ms".to_string(),
            hashrate_expiration: "3h".to_string(),
            push_timeout: "10s".to_string(),
            daemon_url: "http://127.0.0.1:8545".to_string(),
            daemon_timeout: "10s".to_string(),
            redis_url: "redis://127.0.0.1/".to_string(),
            metrics_listen: "0.0.0.0:9100".to_string(),
            pow: POW_ETHASH.to_string(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then the JSON config file, then environment overrides.
    ///
    /// The file is `POOL_CONFIG` if set, otherwise `pool_config.json` in the
    /// working directory when present.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var("POOL_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => match std::fs::read_to_string("pool_config.json") {
                Ok(txt) => serde_json::from_str(&txt).context("pool_config.json")?,
                Err(_) => Self::default(),
            },
        };

        if let Ok(v) = std::env::var("POOL_LISTEN") {
            cfg.listen = v;
        }
        if let Ok(v) = std::env::var("POOL_DAEMON_URL") {
            cfg.daemon_url = v;
        }
        if let Ok(v) = std::env::var("POOL_REDIS_URL") {
            cfg.redis_url = v;
        } else if let Ok(v) = std::env::var("REDIS_URL") {
            cfg.redis_url = v;
        }
        if let Ok(v) = std::env::var("POOL_METRICS") {
            cfg.metrics_listen = v;
        }
        if let Ok(v) = std::env::var("POOL_COIN") {
            cfg.coin = v;
        }
        if let Ok(v) = std::env::var("POOL_POW") {
            cfg.pow = v;
        }
        if let Ok(v) = std::env::var("POOL_DIFFICULTY") {
            cfg.difficulty = v.parse().context("POOL_DIFFICULTY")?;
        }
        if let Ok(v) = std::env::var("POOL_MAX_CONN") {
            cfg.max_conn = v.parse().context("POOL_MAX_CONN")?;
        }
        if let Ok(v) = std::env::var("POOL_TIMEOUT") {
            cfg.timeout = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let txt = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path))?;
        serde_json::from_str(&txt).with_context(|| format!("parsing config {}", path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            bail!("listen address is empty");
        }
        if self.difficulty == 0 {
            bail!("share difficulty must be positive");
        }
        if self.max_conn == 0 {
            bail!("max_conn must be positive");
        }
        if self.pow != POW_ETHASH && self.pow != POW_KECCAK_SEAL {
            bail!("unknown pow verifier '{}'", self.pow);
        }
        for (name, value) in [
            ("timeout", &self.timeout),
            ("block_refresh_interval", &self.block_refresh_interval),
            ("hashrate_expiration", &self.hashrate_expiration),
            ("push_timeout", &self.push_timeout),
            ("daemon_timeout", &self.daemon_timeout),
            ("policy.limit_window", &self.policy.limit_window),
            ("policy.ban_timeout", &self.policy.ban_timeout),
        ] {
            parse_duration(value).with_context(|| format!("invalid {}", name))?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(120))
    }

    pub fn block_refresh_interval(&self) -> Duration {
        parse_duration(&self.block_refresh_interval).unwrap_or(Duration::from_millis(120))
    }

    pub fn hashrate_expiration(&self) -> Duration {
        parse_duration(&self.hashrate_expiration).unwrap_or(Duration::from_secs(3 * 3600))
    }

    pub fn push_timeout(&self) -> Duration {
        parse_duration(&self.push_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn daemon_timeout(&self) -> Duration {
        parse_duration(&self.daemon_timeout).unwrap_or(Duration::from_secs(10))
    }
}

/// Parse `"250ms"`, `"120s"`, `"10m"`, `"3h"`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num
        .parse()
        .map_err(|_| anyhow!("bad duration '{}'", s))?;
    let d = match unit {
        "ms" => Duration::from_millis(n),
        "" | "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        _ => bail!("bad duration unit in '{}'", s),
    };
    Ok(d)
}
