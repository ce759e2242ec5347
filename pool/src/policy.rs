//! Connection-rate, ban and share-quality policy.
//!
//! The stratum server only talks to [`PolicyEngine`]; [`LocalPolicy`] is the
//! in-process implementation used by the binary.

use crate::config::{parse_duration, PolicyConfig};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub trait PolicyEngine: Send + Sync {
    fn is_banned(&self, ip: IpAddr) -> bool;

    /// Record a connection attempt. `false` refuses the connection.
    fn apply_limit_policy(&self, ip: IpAddr) -> bool;

    /// Record a malformed request. `false` means the client is now banned.
    fn apply_malformed_policy(&self, ip: IpAddr) -> bool;

    /// Record a share outcome. `false` means too many invalid shares.
    fn apply_share_policy(&self, ip: IpAddr, valid: bool) -> bool;

    /// `false` when the login is blacklisted.
    fn apply_login_policy(&self, login: &str, ip: IpAddr) -> bool;

    fn ban_client(&self, ip: IpAddr);
}

struct ShareStats {
    valid: u32,
    invalid: u32,
    last: Instant,
}

impl ShareStats {
    fn new(now: Instant) -> Self {
        Self { valid: 0, invalid: 0, last: now }
    }
}

/// Malformed requests seen from one IP.
struct Strikes {
    count: u32,
    last: Instant,
}

pub struct LocalPolicy {
    connection_limit: usize,
    limit_window: Duration,
    malformed_limit: u32,
    check_threshold: u32,
    invalid_percent: f64,
    ban_timeout: Duration,
    whitelist: HashSet<IpAddr>,
    login_blacklist: HashSet<String>,

    attempts: Mutex<HashMap<IpAddr, Vec<Instant>>>,
    bans: Mutex<HashMap<IpAddr, Instant>>,
    malformed: Mutex<HashMap<IpAddr, Strikes>>,
    shares: Mutex<HashMap<IpAddr, ShareStats>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalPolicy {
    pub fn new(cfg: &PolicyConfig) -> Result<Self> {
        let whitelist = cfg
            .whitelist
            .iter()
            .map(|s| s.parse::<IpAddr>().with_context(|| format!("whitelist entry {}", s)))
            .collect::<Result<HashSet<_>>>()?;

        Ok(Self {
            connection_limit: cfg.connection_limit,
            limit_window: parse_duration(&cfg.limit_window)?,
            malformed_limit: cfg.malformed_limit,
            check_threshold: cfg.check_threshold,
            invalid_percent: cfg.invalid_percent,
            ban_timeout: parse_duration(&cfg.ban_timeout)?,
            whitelist,
            login_blacklist: cfg.blacklist.iter().map(|s| s.to_lowercase()).collect(),
            attempts: Mutex::new(HashMap::new()),
            bans: Mutex::new(HashMap::new()),
            malformed: Mutex::new(HashMap::new()),
            shares: Mutex::new(HashMap::new()),
        })
    }

    fn whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip)
    }

    /// Drop expired bans and any per-IP counters idle for `limit_window`.
    pub fn cleanup(&self) {
        let now = Instant::now();
        lock(&self.bans).retain(|ip, expiry| {
            let keep = now < *expiry;
            if !keep {
                info!("Ban expired for {}", ip);
            }
            keep
        });

        let window = self.limit_window;
        lock(&self.attempts).retain(|_, history| {
            history.retain(|t| now.duration_since(*t) < window);
            !history.is_empty()
        });
        lock(&self.malformed).retain(|_, strikes| now.duration_since(strikes.last) < window);
        lock(&self.shares).retain(|_, stats| now.duration_since(stats.last) < window);
    }

    /// (banned IPs, tracked IPs)
    pub fn stats(&self) -> (usize, usize) {
        (lock(&self.bans).len(), lock(&self.attempts).len())
    }
}

impl PolicyEngine for LocalPolicy {
    fn is_banned(&self, ip: IpAddr) -> bool {
        if self.whitelisted(&ip) {
            return false;
        }
        match lock(&self.bans).get(&ip) {
            Some(expiry) => Instant::now() < *expiry,
            None => false,
        }
    }

    fn apply_limit_policy(&self, ip: IpAddr) -> bool {
        if self.whitelisted(&ip) {
            return true;
        }
        let now = Instant::now();
        let mut attempts = lock(&self.attempts);
        let history = attempts.entry(ip).or_default();
        history.retain(|t| now.duration_since(*t) < self.limit_window);

        if history.len() >= self.connection_limit {
            warn!(
                "Connection rate limit for {}: {} attempts in {:?}",
                ip,
                history.len(),
                self.limit_window
            );
            return false;
        }
        history.push(now);
        true
    }

    fn apply_malformed_policy(&self, ip: IpAddr) -> bool {
        if self.whitelisted(&ip) {
            return true;
        }
        let now = Instant::now();
        let count = {
            let mut malformed = lock(&self.malformed);
            let strikes = malformed.entry(ip).or_insert(Strikes { count: 0, last: now });
            strikes.count += 1;
            strikes.last = now;
            strikes.count
        };
        if count >= self.malformed_limit {
            lock(&self.malformed).remove(&ip);
            self.ban_client(ip);
            return false;
        }
        true
    }

    fn apply_share_policy(&self, ip: IpAddr, valid: bool) -> bool {
        if self.whitelisted(&ip) {
            return true;
        }
        let ratio = {
            let mut shares = lock(&self.shares);
            let now = Instant::now();
            let stats = shares.entry(ip).or_insert_with(|| ShareStats::new(now));
            stats.last = now;
            if valid {
                stats.valid += 1;
            } else {
                stats.invalid += 1;
            }
            let total = stats.valid + stats.invalid;
            if total < self.check_threshold {
                return true;
            }
            let ratio = stats.invalid as f64 * 100.0 / total as f64;
            shares.remove(&ip);
            ratio
        };

        if ratio >= self.invalid_percent {
            warn!("Invalid share ratio {:.1}% from {}", ratio, ip);
            self.ban_client(ip);
            return false;
        }
        true
    }

    fn apply_login_policy(&self, login: &str, ip: IpAddr) -> bool {
        if self.login_blacklist.contains(&login.to_lowercase()) {
            warn!("Blacklisted login {} from {}", login, ip);
            self.ban_client(ip);
            return false;
        }
        true
    }

    fn ban_client(&self, ip: IpAddr) {
        if self.whitelisted(&ip) {
            return;
        }
        lock(&self.bans).insert(ip, Instant::now() + self.ban_timeout);
        warn!("Banned {} for {:?}", ip, self.ban_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn policy() -> LocalPolicy {
        let cfg = PolicyConfig {
            connection_limit: 3,
            malformed_limit: 2,
            check_threshold: 4,
            invalid_percent: 50.0,
            whitelist: vec!["10.0.0.1".to_string()],
            blacklist: vec!["0xDEADbeef00000000000000000000000000000000".to_string()],
            ..PolicyConfig::default()
        };
        LocalPolicy::new(&cfg).unwrap()
    }

    #[test]
    fn test_connection_rate_limit() {
        let p = policy();
        let a = ip("192.168.1.10");
        assert!(p.apply_limit_policy(a));
        assert!(p.apply_limit_policy(a));
        assert!(p.apply_limit_policy(a));
        assert!(!p.apply_limit_policy(a));
        assert!(p.apply_limit_policy(ip("192.168.1.11")));
    }

    #[test]
    fn test_malformed_requests_ban() {
        let p = policy();
        let a = ip("192.168.1.20");
        assert!(p.apply_malformed_policy(a));
        assert!(!p.is_banned(a));
        assert!(!p.apply_malformed_policy(a));
        assert!(p.is_banned(a));
    }

    #[test]
    fn test_invalid_share_ratio() {
        let p = policy();
        let a = ip("192.168.1.30");
        assert!(p.apply_share_policy(a, true));
        assert!(p.apply_share_policy(a, false));
        assert!(p.apply_share_policy(a, false));
        assert!(!p.apply_share_policy(a, false));
        assert!(p.is_banned(a));

        let b = ip("192.168.1.31");
        for _ in 0..3 {
            assert!(p.apply_share_policy(b, true));
        }
        assert!(p.apply_share_policy(b, false));
        assert!(!p.is_banned(b));
    }

    #[test]
    fn test_login_blacklist_is_case_insensitive() {
        let p = policy();
        let a = ip("192.168.1.40");
        assert!(!p.apply_login_policy("0xdeadbeef00000000000000000000000000000000", a));
        assert!(p.is_banned(a));
        assert!(p.apply_login_policy("0x1111111111111111111111111111111111111111", ip("192.168.1.41")));
    }

    #[test]
    fn test_whitelist_is_never_banned() {
        let p = policy();
        let w = ip("10.0.0.1");
        p.ban_client(w);
        assert!(!p.is_banned(w));
        for _ in 0..10 {
            assert!(p.apply_limit_policy(w));
        }
    }

    #[test]
    fn test_cleanup_expires_bans() {
        let cfg = PolicyConfig { ban_timeout: "0s".to_string(), ..PolicyConfig::default() };
        let p = LocalPolicy::new(&cfg).unwrap();
        let a = ip("192.168.1.50");
        p.ban_client(a);
        assert!(!p.is_banned(a));
        p.cleanup();
        assert_eq!(p.stats().0, 0);
    }

    #[test]
    fn test_cleanup_forgets_idle_counters() {
        let p = policy();
        p.apply_malformed_policy(ip("192.168.1.60"));
        p.apply_share_policy(ip("192.168.1.61"), false);
        p.cleanup();
        assert_eq!(lock(&p.malformed).len(), 1);
        assert_eq!(lock(&p.shares).len(), 1);

        let cfg = PolicyConfig { limit_window: "0s".to_string(), ..PolicyConfig::default() };
        let p = LocalPolicy::new(&cfg).unwrap();
        p.apply_malformed_policy(ip("192.168.1.60"));
        p.apply_share_policy(ip("192.168.1.61"), false);
        p.apply_limit_policy(ip("192.168.1.62"));
        p.cleanup();
        assert!(lock(&p.malformed).is_empty());
        assert!(lock(&p.shares).is_empty());
        assert!(lock(&p.attempts).is_empty());
    }
}
