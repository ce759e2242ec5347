/// Coin daemon JSON-RPC client
///
/// Speaks the geth-style `eth_*` API over HTTP with a circuit breaker so a
/// dead daemon does not stall the template poller.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::metrics::prometheus as metrics;

/// Reply of `eth_getWork`: header hash without nonce, seed hash, boundary
/// and (on newer daemons) the pending block number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPackage {
    pub header: String,
    pub seed: String,
    pub target: String,
    pub height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlock {
    pub number: u64,
    pub difficulty: u64,
}

/// The daemon operations the pool consumes.
#[async_trait]
pub trait CoinDaemon: Send + Sync {
    async fn get_work(&self) -> Result<WorkPackage>;

    async fn get_pending_block(&self) -> Result<PendingBlock>;

    /// Relay a solved block as the raw `[nonce, header, mix]` triple.
    async fn submit_block(&self, params: &[String]) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());

        if self.failures >= self.max_failures && !self.is_open {
            self.is_open = true;
            tracing::error!(
                "Daemon circuit breaker open after {} failures, pausing RPC for {}s",
                self.failures,
                self.reset_timeout.as_secs()
            );
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("Daemon circuit breaker reset");
        }
    }

    fn check(&mut self) -> Result<()> {
        if self.is_open {
            match self.last_failure {
                Some(last) if last.elapsed() <= self.reset_timeout => {
                    return Err(anyhow!("daemon circuit breaker is open"));
                }
                _ => {
                    tracing::info!("Daemon circuit breaker half-open");
                    self.is_open = false;
                    self.failures = 0;
                }
            }
        }
        Ok(())
    }
}

pub struct DaemonClient {
    url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    breaker: Arc<RwLock<CircuitBreaker>>,
}

impl DaemonClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let url = url.into();
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        tracing::info!("Daemon RPC client: {}", url);

        Self {
            url,
            timeout,
            client,
            breaker: Arc::new(RwLock::new(CircuitBreaker::new())),
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        metrics::inc_rpc_requests();
        self.breaker.write().await.check()?;

        let res = self.send(method, params).await;
        match &res {
            Ok(_) => self.breaker.write().await.record_success(),
            Err(RpcFailure::Transport(_)) => self.breaker.write().await.record_failure(),
            Err(RpcFailure::Daemon(_)) => {}
        }
        res.map_err(|e| {
            metrics::inc_rpc_errors();
            match e {
                RpcFailure::Transport(e) => e,
                RpcFailure::Daemon(err) => anyhow!("{} failed: {}", method, err),
            }
        })
    }

    async fn send(&self, method: &str, params: Value) -> std::result::Result<Value, RpcFailure> {
        let payload = RpcRequest { jsonrpc: "2.0", id: 0, method, params };
        let body = serde_json::to_vec(&payload).map_err(|e| RpcFailure::Transport(e.into()))?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RpcFailure::Transport(e.into()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| RpcFailure::Transport(anyhow!("{} timed out", method)))?
            .map_err(|e| RpcFailure::Transport(anyhow!("daemon connection failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcFailure::Transport(anyhow!("daemon HTTP error: {}", status)));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcFailure::Transport(e.into()))?
            .to_bytes();
        let reply: RpcResponse = serde_json::from_reader(body.reader())
            .map_err(|e| RpcFailure::Transport(e.into()))?;

        // JSON-RPC level errors are the daemon's verdict, not an outage.
        if let Some(err) = reply.error.filter(|e| !e.is_null()) {
            return Err(RpcFailure::Daemon(err));
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }
}

enum RpcFailure {
    Transport(anyhow::Error),
    Daemon(Value),
}

#[async_trait]
impl CoinDaemon for DaemonClient {
    async fn get_work(&self) -> Result<WorkPackage> {
        let reply = self.call("eth_getWork", json!([])).await?;
        parse_work(&reply)
    }

    async fn get_pending_block(&self) -> Result<PendingBlock> {
        let reply = self
            .call("eth_getBlockByNumber", json!(["pending", false]))
            .await?;
        parse_pending_block(&reply)
    }

    async fn submit_block(&self, params: &[String]) -> Result<bool> {
        let reply = self.call("eth_submitWork", json!(params)).await?;
        reply
            .as_bool()
            .ok_or_else(|| anyhow!("unexpected eth_submitWork reply: {}", reply))
    }
}

fn parse_work(reply: &Value) -> Result<WorkPackage> {
    let fields: Vec<String> = serde_json::from_value(reply.clone())
        .map_err(|_| anyhow!("unexpected eth_getWork reply: {}", reply))?;
    if fields.len() < 3 {
        bail!("eth_getWork returned {} fields", fields.len());
    }
    let height = match fields.get(3) {
        Some(h) => Some(parse_hex_u64(h)?),
        None => None,
    };
    Ok(WorkPackage {
        header: fields[0].clone(),
        seed: fields[1].clone(),
        target: fields[2].clone(),
        height,
    })
}

fn parse_pending_block(reply: &Value) -> Result<PendingBlock> {
    let field = |name: &str| -> Result<u64> {
        let raw = reply
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("pending block without {}", name))?;
        parse_hex_u64(raw)
    };
    Ok(PendingBlock {
        number: field("number")?,
        difficulty: field("difficulty")?,
    })
}

/// Parse a `0x`-prefixed (or bare) hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        bail!("empty hex quantity");
    }
    u64::from_str_radix(digits, 16).map_err(|e| anyhow!("bad hex quantity '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker() {
        let mut breaker = CircuitBreaker::new();
        assert!(!breaker.is_open);

        for _ in 0..4 {
            breaker.record_failure();
            assert!(!breaker.is_open);
        }

        breaker.record_failure();
        assert!(breaker.is_open);
        assert!(breaker.check().is_err());

        breaker.last_failure = Some(Instant::now() - Duration::from_secs(61));
        assert!(breaker.check().is_ok());
        assert!(!breaker.is_open);
    }

    #[test]
    fn test_parse_work_with_height() {
        let reply = json!(["0xabc", "0xdef", "0x00ff", "0x64"]);
        let work = parse_work(&reply).unwrap();
        assert_eq!(work.header, "0xabc");
        assert_eq!(work.seed, "0xdef");
        assert_eq!(work.target, "0x00ff");
        assert_eq!(work.height, Some(100));

        let work = parse_work(&json!(["0xabc", "0xdef", "0x00ff"])).unwrap();
        assert_eq!(work.height, None);

        assert!(parse_work(&json!(["0xabc"])).is_err());
        assert!(parse_work(&Value::Null).is_err());
    }

    #[test]
    fn test_parse_pending_block() {
        let reply = json!({"number": "0x64", "difficulty": "0x3b9aca00", "hash": null});
        let block = parse_pending_block(&reply).unwrap();
        assert_eq!(block.number, 100);
        assert_eq!(block.difficulty, 1_000_000_000);

        assert!(parse_pending_block(&json!({"number": "0x1"})).is_err());
    }

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert_eq!(parse_hex_u64("ff").unwrap(), 255);
        assert!(parse_hex_u64("0x").is_err());
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = DaemonClient::new("http://127.0.0.1:8545", Duration::from_secs(3));
        assert_eq!(client.url, "http://127.0.0.1:8545");
        assert_eq!(client.timeout, Duration::from_secs(3));
    }
}
