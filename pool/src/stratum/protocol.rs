/// Wire format for both mining dialects
///
/// Classic polling (`eth_*`) and EthereumStratum/1.0.0 (`mining.*`) share a
/// single newline-delimited JSON-RPC stream. Only the error and push shapes
/// differ, and those are selected by [`Dialect`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const STRATUM_VERSION: &str = "EthereumStratum/1.0.0";

/// Inbound request. `id` is echoed back verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub worker: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub jsonrpc: &'static str,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self { id, jsonrpc: "2.0", result, error: None }
    }

    pub fn error(id: Value, error: Value) -> Self {
        Self { id, jsonrpc: "2.0", result: Value::Null, error: Some(error) }
    }
}

/// Server initiated Stratum message (`mining.notify`, `mining.set_*`).
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Value,
    pub method: &'static str,
    pub params: Value,
}

/// Unsolicited classic job push.
#[derive(Debug, Clone, Serialize)]
pub struct ClassicPush {
    pub id: u64,
    pub jsonrpc: &'static str,
    pub result: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Unnegotiated,
    ClassicPolling,
    StratumV1,
}

impl Dialect {
    pub fn encode_error(self, err: &RpcError) -> Value {
        match self {
            Dialect::StratumV1 => err.to_stratum(),
            Dialect::ClassicPolling | Dialect::Unnegotiated => err.to_classic(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub const INVALID_PARAMS: i32 = -1;
    pub const METHOD_NOT_FOUND: i32 = -3;
    pub const WORK_NOT_READY: i32 = 0;
    pub const UNSUPPORTED: i32 = 20;
    pub const STALE_SHARE: i32 = 21;
    pub const INVALID_SHARE: i32 = 23;
    pub const NOT_SUBSCRIBED: i32 = 25;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn invalid_params() -> Self {
        Self::new(Self::INVALID_PARAMS, "Invalid params")
    }

    pub fn malformed_request() -> Self {
        Self::new(Self::INVALID_PARAMS, "Malformed request")
    }

    pub fn malformed_pow() -> Self {
        Self::new(Self::INVALID_PARAMS, "Malformed PoW result")
    }

    pub fn invalid_login() -> Self {
        Self::new(Self::INVALID_PARAMS, "Invalid login")
    }

    pub fn blacklisted() -> Self {
        Self::new(Self::INVALID_PARAMS, "You are blacklisted")
    }

    pub fn method_not_found() -> Self {
        Self::new(Self::METHOD_NOT_FOUND, "Method not found")
    }

    pub fn work_not_ready() -> Self {
        Self::new(Self::WORK_NOT_READY, "Work not ready")
    }

    pub fn unsupported_version() -> Self {
        Self::new(Self::UNSUPPORTED, "unsupported stratum version")
    }

    pub fn not_supported() -> Self {
        Self::new(Self::UNSUPPORTED, "Not supported.")
    }

    pub fn stale_share() -> Self {
        Self::new(Self::STALE_SHARE, "Stale share.")
    }

    pub fn invalid_share() -> Self {
        Self::new(Self::INVALID_SHARE, "Invalid share")
    }

    pub fn not_subscribed() -> Self {
        Self::new(Self::NOT_SUBSCRIBED, "Not subscribed")
    }

    pub fn to_classic(&self) -> Value {
        json!({ "code": self.code, "message": self.message })
    }

    pub fn to_stratum(&self) -> Value {
        json!([self.code.to_string(), self.message])
    }
}

/// Params as a string list. Absent params read as an empty list.
pub fn string_params(params: &Value) -> Option<Vec<String>> {
    if params.is_null() {
        return Some(Vec::new());
    }
    serde_json::from_value(params.clone()).ok()
}

/// Split `address.worker`.
pub fn split_login(full: &str) -> (&str, Option<&str>) {
    match full.split_once('.') {
        Some((login, worker)) => (login, Some(worker)),
        None => (full, None),
    }
}

fn is_hex_with_prefix(s: &str, digits: usize) -> bool {
    match s.strip_prefix("0x") {
        Some(hex) => hex.len() == digits && hex.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

/// `0x` followed by 40 hex digits.
pub fn is_valid_login(login: &str) -> bool {
    is_hex_with_prefix(login, 40)
}

pub fn is_valid_nonce(nonce: &str) -> bool {
    is_hex_with_prefix(nonce, 16)
}

pub fn is_valid_hash(hash: &str) -> bool {
    is_hex_with_prefix(hash, 64)
}

/// Worker ids are `[0-9a-zA-Z_-]{1,8}`; anything else becomes `"0"`.
pub fn sanitize_worker(worker: &str) -> String {
    let ok = (1..=8).contains(&worker.len())
        && worker
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        worker.to_string()
    } else {
        "0".to_string()
    }
}

/// Random lowercase hex string of `len` characters.
pub fn random_hex(len: usize) -> String {
    const CHARS: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Share difficulty as advertised by `mining.set_difficulty`.
pub fn difficulty_to_float(diff: u64) -> f64 {
    diff as f64 / 4_294_967_296.0
}

pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

pub fn subscribe_result(subscription_id: &str, extranonce: &str) -> Value {
    json!([["mining.notify", subscription_id, STRATUM_VERSION], extranonce])
}

pub fn notify(job_id: &str, seed: &str, header: &str) -> Notification {
    Notification {
        id: Value::Null,
        method: "mining.notify",
        params: json!([job_id, seed, header, true]),
    }
}

pub fn set_difficulty(diff: u64) -> Notification {
    Notification {
        id: Value::Null,
        method: "mining.set_difficulty",
        params: json!([difficulty_to_float(diff)]),
    }
}

pub fn set_extranonce(extranonce: &str) -> Notification {
    Notification {
        id: json!(0),
        method: "mining.set_extranonce",
        params: json!([extranonce]),
    }
}
