/// Redis share ledger
///
/// Handles:
/// - Duplicate detection ({coin}:pow sorted set scored by height)
/// - Round shares ({coin}:shares:roundCurrent)
/// - Hashrate samples ({coin}:hashrate, {coin}:hashrate:login)
/// - Block candidates ({coin}:blocks:candidates) and finders
///
/// Uses redis::aio::ConnectionManager for async operations

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Shares older than this many heights can no longer be resubmitted.
const POW_BACKLOG: u64 = 8;

/// A share credited to `login.worker`.
#[derive(Debug, Clone, Copy)]
pub struct ShareRecord<'a> {
    pub login: &'a str,
    pub worker: &'a str,
    /// Raw `[nonce, header, mix]` submission.
    pub params: &'a [String],
    pub share_diff: u64,
    pub height: u64,
    /// Lifetime of hashrate samples.
    pub ttl: Duration,
}

impl ShareRecord<'_> {
    /// Member of the duplicate-detection set.
    pub fn pow_key(&self) -> String {
        self.params.join(":")
    }
}

/// Persistent share/block ledger. `Ok(true)` means the submission was
/// already recorded and earns no further credit.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn write_share(&self, share: &ShareRecord<'_>) -> Result<bool>;

    async fn write_block(&self, share: &ShareRecord<'_>, net_diff: u64) -> Result<bool>;
}

pub struct RedisBackend {
    client: redis::Client,
    prefix: String,
    connection: RwLock<Option<redis::aio::ConnectionManager>>,
}

impl RedisBackend {
    pub fn new(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        Ok(Self {
            client,
            prefix: prefix.to_string(),
            connection: RwLock::new(None),
        })
    }

    /// Lazily established connection
    async fn get_connection(&self) -> Result<redis::aio::ConnectionManager> {
        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let manager = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("Failed to get connection manager: {}", e))?;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for p in parts {
            key.push(':');
            key.push_str(p);
        }
        key
    }

    fn round_key(&self, height: u64, nonce: &str) -> String {
        self.key(&["shares", &format!("round{}", height), nonce])
    }

    /// Record the submission in the pow set. Returns true if it was there.
    async fn check_pow_exist(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        share: &ShareRecord<'_>,
    ) -> Result<bool> {
        let pow_key = self.key(&["pow"]);
        let (added,): (i64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&pow_key)
            .arg("-inf")
            .arg(format!("({}", share.height.saturating_sub(POW_BACKLOG)))
            .ignore()
            .zadd(&pow_key, share.pow_key(), share.height)
            .query_async(conn)
            .await
            .map_err(|e| anyhow!("Failed to check duplicate share: {}", e))?;
        Ok(added == 0)
    }

    /// Round credit, hashrate samples and last share time.
    fn queue_share(&self, pipe: &mut redis::Pipeline, share: &ShareRecord<'_>, now_ms: i64) {
        let now = now_ms / 1000;
        let hashrate_login = self.key(&["hashrate", share.login]);

        pipe.hincr(self.key(&["shares", "roundCurrent"]), share.login, share.share_diff)
            .ignore()
            .zadd(
                self.key(&["hashrate"]),
                format!("{}:{}:{}:{}", share.share_diff, share.login, share.worker, now_ms),
                now,
            )
            .ignore()
            .zadd(
                &hashrate_login,
                format!("{}:{}:{}", share.share_diff, share.worker, now_ms),
                now,
            )
            .ignore()
            .cmd("EXPIRE")
            .arg(&hashrate_login)
            .arg(share.ttl.as_secs())
            .ignore()
            .hset(self.key(&["miners", share.login]), "lastShare", now)
            .ignore();
    }

    /// Health check
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Redis PING failed: {}", e))?;

        if pong != "PONG" {
            return Err(anyhow!("Redis health check failed: got {}", pong));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn write_share(&self, share: &ShareRecord<'_>) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        if self.check_pow_exist(&mut conn, share).await? {
            return Ok(true);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        self.queue_share(&mut pipe, share, Utc::now().timestamp_millis());
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to write share: {}", e))?;
        Ok(false)
    }

    async fn write_block(&self, share: &ShareRecord<'_>, net_diff: u64) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        if self.check_pow_exist(&mut conn, share).await? {
            return Ok(true);
        }

        let nonce = share.params.first().map(String::as_str).unwrap_or_default();
        let round_key = self.round_key(share.height, nonce);
        let now_ms = Utc::now().timestamp_millis();
        let now = now_ms / 1000;

        let mut pipe = redis::pipe();
        pipe.atomic();
        self.queue_share(&mut pipe, share, now_ms);
        pipe.hset(self.key(&["stats"]), "lastBlockFound", now)
            .ignore()
            .hincr(self.key(&["finders"]), share.login, 1)
            .ignore()
            .rename(self.key(&["shares", "roundCurrent"]), &round_key)
            .ignore()
            .hgetall(&round_key);

        let (round,): (HashMap<String, i64>,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to archive round: {}", e))?;
        let total_shares: i64 = round.values().sum();

        let candidate = format!(
            "{}:{}:{}:{}:{}",
            share.params.join(":"),
            now,
            net_diff,
            total_shares,
            share.login
        );
        redis::cmd("ZADD")
            .arg(self.key(&["blocks", "candidates"]))
            .arg(share.height)
            .arg(candidate)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to store block candidate: {}", e))?;

        tracing::info!(
            "Block candidate stored: height={} login={} round_shares={}",
            share.height,
            share.login,
            total_shares
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backend_creation() {
        // Client creation succeeds, connection fails later
        let backend = RedisBackend::new("redis://invalid", "eth");
        assert!(backend.is_ok());
        assert!(RedisBackend::new("not a url", "eth").is_err());
    }

    #[test]
    fn test_key_layout() {
        let backend = RedisBackend::new("redis://127.0.0.1/", "etc").unwrap();
        assert_eq!(backend.key(&["pow"]), "etc:pow");
        assert_eq!(backend.key(&["hashrate", "0xabc"]), "etc:hashrate:0xabc");
        assert_eq!(backend.round_key(100, "0x01"), "etc:shares:round100:0x01");
    }

    #[test]
    fn test_pow_key_joins_params() {
        let params = vec!["0x01".to_string(), "0xaa".to_string(), "0xbb".to_string()];
        let share = ShareRecord {
            login: "0xabc",
            worker: "rig1",
            params: &params,
            share_diff: 1000,
            height: 100,
            ttl: Duration::from_secs(60),
        };
        assert_eq!(share.pow_key(), "0x01:0xaa:0xbb");
    }
}
