/// Per-connection miner state
///
/// A session owns the write half of its connection. Every encode happens
/// under the outbound lock, together with any job rotation it implies.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use super::error::SessionError;
use super::protocol::{self, ClassicPush, Dialect, Notification, Response, RpcError};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub const STALE_CACHE_CAPACITY: usize = 10;
pub const STALE_CACHE_KEEP: usize = 3;

/// Job material as last sent to a Stratum miner (hashes without `0x`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDetails {
    pub job_id: String,
    pub seed: String,
    pub header: String,
}

impl JobDetails {
    pub fn new(seed: &str, header: &str) -> Self {
        Self {
            job_id: protocol::random_hex(12),
            seed: protocol::strip_0x(seed).to_string(),
            header: protocol::strip_0x(header).to_string(),
        }
    }

    fn notification(&self) -> Notification {
        protocol::notify(&self.job_id, &self.seed, &self.header)
    }
}

/// Jobs a miner may still be working on after a newer one was pushed.
#[derive(Debug)]
pub struct StaleJobCache {
    capacity: usize,
    keep: usize,
    order: VecDeque<String>,
    jobs: HashMap<String, JobDetails>,
}

impl Default for StaleJobCache {
    fn default() -> Self {
        Self::new(STALE_CACHE_CAPACITY, STALE_CACHE_KEEP)
    }
}

impl StaleJobCache {
    pub fn new(capacity: usize, keep: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            keep: keep.min(capacity.max(1) - 1),
            order: VecDeque::with_capacity(capacity),
            jobs: HashMap::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, job: JobDetails) {
        if self.jobs.contains_key(&job.job_id) {
            self.jobs.insert(job.job_id.clone(), job);
            return;
        }
        if self.order.len() >= self.capacity {
            while self.order.len() > self.keep {
                if let Some(old) = self.order.pop_front() {
                    self.jobs.remove(&old);
                }
            }
        }
        self.order.push_back(job.job_id.clone());
        self.jobs.insert(job.job_id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<&JobDetails> {
        self.jobs.get(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Template material broadcast to every session.
#[derive(Debug, Clone)]
pub struct JobPayload {
    pub header: String,
    pub seed: String,
    /// Share target derived from the pool difficulty.
    pub target: String,
    pub height: u64,
}

impl JobPayload {
    pub fn classic_result(&self) -> Value {
        json!([self.header, self.seed, self.target, format!("0x{:x}", self.height)])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub login: String,
    pub worker: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    /// Not logged in yet, nothing to push.
    Skipped,
}

struct Outbound {
    sink: BoxedWriter,
    job: Option<JobDetails>,
    stale: StaleJobCache,
}

pub struct Session {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub extranonce: String,
    dialect: OnceLock<Dialect>,
    identity: RwLock<Option<Identity>>,
    extranonce_subscribed: AtomicBool,
    out: Mutex<Outbound>,
    write_timeout: Duration,
    started: Instant,
    active_ms: AtomicU64,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Session {
    /// `write_timeout` bounds every single write to the miner.
    pub fn new(
        addr: SocketAddr,
        extranonce: String,
        sink: BoxedWriter,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            extranonce,
            dialect: OnceLock::new(),
            identity: RwLock::new(None),
            extranonce_subscribed: AtomicBool::new(false),
            out: Mutex::new(Outbound {
                sink,
                job: None,
                stale: StaleJobCache::default(),
            }),
            write_timeout,
            started: Instant::now(),
            active_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect.get().copied().unwrap_or(Dialect::Unnegotiated)
    }

    /// Fix the dialect. Returns false if it was already negotiated.
    pub fn negotiate(&self, dialect: Dialect) -> bool {
        let set = self.dialect.set(dialect).is_ok();
        if !set && self.dialect() != dialect {
            tracing::debug!(
                "{}: keeping {:?}, ignoring {:?} negotiation",
                self.addr,
                self.dialect(),
                dialect
            );
        }
        set
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.identity.read().await.clone()
    }

    pub async fn set_identity(&self, login: String, worker: String) {
        *self.identity.write().await = Some(Identity { login, worker });
    }

    pub fn subscribe_extranonce(&self) {
        self.extranonce_subscribed.store(true, Ordering::SeqCst);
    }

    /// Extranonce to prefix onto Stratum nonces, if the miner opted in.
    pub fn nonce_prefix(&self) -> &str {
        if self.extranonce_subscribed.load(Ordering::SeqCst) {
            &self.extranonce
        } else {
            ""
        }
    }

    /// Push the read deadline forward.
    pub fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.active_ms.fetch_max(ms, Ordering::SeqCst);
    }

    pub fn deadline(&self, timeout: Duration) -> Instant {
        self.started + Duration::from_millis(self.active_ms.load(Ordering::SeqCst)) + timeout
    }

    pub async fn send_result(&self, id: Value, result: Value) -> Result<(), SessionError> {
        let mut out = self.out.lock().await;
        self.write(&mut out, &Response::success(id, result)).await
    }

    pub async fn send_error(
        &self,
        id: Value,
        err: &RpcError,
        dialect: Dialect,
    ) -> Result<(), SessionError> {
        let mut out = self.out.lock().await;
        self.write(&mut out, &Response::error(id, dialect.encode_error(err))).await
    }

    pub async fn send_notification(&self, msg: &Notification) -> Result<(), SessionError> {
        let mut out = self.out.lock().await;
        self.write(&mut out, msg).await
    }

    /// Issue a new Stratum job; the previous one moves to the stale cache.
    pub async fn push_new_job(&self, seed: &str, header: &str) -> Result<JobDetails, SessionError> {
        let mut out = self.out.lock().await;
        let job = Self::rotate(&mut out, seed, header);
        self.write(&mut out, &job.notification()).await?;
        Ok(job)
    }

    /// Re-send the current Stratum job. `None` if there is none yet.
    pub async fn resend_job(&self) -> Result<Option<JobDetails>, SessionError> {
        let mut out = self.out.lock().await;
        let Some(job) = out.job.clone() else {
            return Ok(None);
        };
        self.write(&mut out, &job.notification()).await?;
        Ok(Some(job))
    }

    /// The current job or a cached stale one.
    pub async fn job_for(&self, job_id: &str) -> Option<JobDetails> {
        let out = self.out.lock().await;
        match &out.job {
            Some(job) if job.job_id == job_id => Some(job.clone()),
            _ => out.stale.get(job_id).cloned(),
        }
    }

    pub async fn current_job(&self) -> Option<JobDetails> {
        self.out.lock().await.job.clone()
    }

    pub async fn stale_jobs(&self) -> usize {
        self.out.lock().await.stale.len()
    }

    /// Broadcast push in the negotiated dialect.
    pub async fn push_job(&self, payload: &JobPayload) -> Result<PushOutcome, SessionError> {
        if self.identity.read().await.is_none() {
            return Ok(PushOutcome::Skipped);
        }

        let mut out = self.out.lock().await;
        match self.dialect() {
            Dialect::StratumV1 => {
                let job = Self::rotate(&mut out, &payload.seed, &payload.header);
                self.write(&mut out, &job.notification()).await?;
            }
            Dialect::ClassicPolling => {
                let push = ClassicPush { id: 0, jsonrpc: "2.0", result: payload.classic_result() };
                self.write(&mut out, &push).await?;
            }
            Dialect::Unnegotiated => return Ok(PushOutcome::Skipped),
        }
        drop(out);

        self.touch();
        Ok(PushOutcome::Sent)
    }

    fn rotate(out: &mut Outbound, seed: &str, header: &str) -> JobDetails {
        if let Some(prev) = out.job.take() {
            out.stale.insert(prev);
        }
        let job = JobDetails::new(seed, header);
        out.job = Some(job.clone());
        job
    }

    async fn write<T: Serialize>(&self, out: &mut Outbound, msg: &T) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut buf = serde_json::to_vec(msg)?;
        buf.push(b'\n');

        let sink = &mut out.sink;
        let send = async {
            sink.write_all(&buf).await?;
            sink.flush().await
        };
        tokio::select! {
            _ = self.closed() => Err(SessionError::Closed),
            res = tokio::time::timeout(self.write_timeout, send) => match res {
                Ok(res) => Ok(res?),
                Err(_) => Err(SessionError::Timeout),
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the read loop and shut the write half. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_notify.notify_waiters();

        // A writer stuck on a full socket still owns the sink. It wakes on
        // the notify above and the sink goes away with the session.
        if let Ok(mut out) = self.out.try_lock() {
            let _ = tokio::time::timeout(self.write_timeout, out.sink.shutdown()).await;
        }
    }

    /// Resolves once [`Session::close`] has been called.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn job(id: &str) -> JobDetails {
        JobDetails {
            job_id: id.to_string(),
            seed: "seed".to_string(),
            header: "header".to_string(),
        }
    }

    fn session() -> (Session, BufReader<tokio::io::DuplexStream>) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let s = Session::new(
            "127.0.0.1:4000".parse().unwrap(),
            "a1b2c3".to_string(),
            Box::new(ours),
            Duration::from_secs(1),
        );
        (s, BufReader::new(theirs))
    }

    async fn next_json(reader: &mut BufReader<tokio::io::DuplexStream>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn test_stale_cache_bounded() {
        let mut cache = StaleJobCache::default();
        for i in 0..10 {
            cache.insert(job(&format!("job{}", i)));
            assert!(cache.len() <= STALE_CACHE_CAPACITY);
        }
        assert_eq!(cache.len(), 10);

        cache.insert(job("job10"));
        assert_eq!(cache.len(), STALE_CACHE_KEEP + 1);
        assert!(cache.get("job0").is_none());
        for id in ["job7", "job8", "job9", "job10"] {
            assert!(cache.get(id).is_some(), "{} should be retained", id);
        }

        for i in 11..100 {
            cache.insert(job(&format!("job{}", i)));
            assert!(cache.len() <= STALE_CACHE_CAPACITY);
        }
        assert!(cache.get("job99").is_some());
    }

    #[test]
    fn test_job_details_strip_prefix() {
        let j = JobDetails::new("0xabcd", "0x1234");
        assert_eq!(j.seed, "abcd");
        assert_eq!(j.header, "1234");
        assert_eq!(j.job_id.len(), 12);
    }

    #[tokio::test]
    async fn test_dialect_set_once() {
        let (s, _r) = session();
        assert_eq!(s.dialect(), Dialect::Unnegotiated);
        assert!(s.negotiate(Dialect::StratumV1));
        assert!(!s.negotiate(Dialect::ClassicPolling));
        assert_eq!(s.dialect(), Dialect::StratumV1);
    }

    #[tokio::test]
    async fn test_push_rotates_jobs() {
        let (s, mut r) = session();
        s.negotiate(Dialect::StratumV1);
        s.set_identity("0xabc".to_string(), "rig".to_string()).await;

        let first = s.push_new_job("0xseed", "0xhead1").await.unwrap();
        let msg = next_json(&mut r).await;
        assert_eq!(msg["method"], "mining.notify");
        assert_eq!(msg["params"][0], first.job_id.as_str());
        assert_eq!(msg["params"][2], "head1");

        let payload = JobPayload {
            header: "0xhead2".to_string(),
            seed: "0xseed".to_string(),
            target: "0xff".to_string(),
            height: 10,
        };
        assert_eq!(s.push_job(&payload).await.unwrap(), PushOutcome::Sent);
        let msg = next_json(&mut r).await;
        assert_eq!(msg["params"][2], "head2");
        assert_eq!(msg["params"][3], true);

        assert_eq!(s.job_for(&first.job_id).await, Some(first));
        assert_eq!(s.stale_jobs().await, 1);
    }

    #[tokio::test]
    async fn test_classic_push_and_skip() {
        let (s, mut r) = session();
        let payload = JobPayload {
            header: "0xh".to_string(),
            seed: "0xs".to_string(),
            target: "0xt".to_string(),
            height: 255,
        };
        assert_eq!(s.push_job(&payload).await.unwrap(), PushOutcome::Skipped);

        s.negotiate(Dialect::ClassicPolling);
        s.set_identity("0xabc".to_string(), "0".to_string()).await;
        s.push_job(&payload).await.unwrap();
        let msg = next_json(&mut r).await;
        assert_eq!(msg, json!({"id": 0, "jsonrpc": "2.0", "result": ["0xh", "0xs", "0xt", "0xff"]}));
    }

    #[tokio::test]
    async fn test_close_rejects_writes() {
        let (s, _r) = session();
        s.close().await;
        s.closed().await;
        assert!(matches!(
            s.send_result(json!(1), json!(true)).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_extranonce_prefix_opt_in() {
        let (s, _r) = session();
        assert_eq!(s.nonce_prefix(), "");
        s.subscribe_extranonce();
        assert_eq!(s.nonce_prefix(), "a1b2c3");
    }

    fn stalled_session(write_timeout: Duration) -> (Arc<Session>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(8);
        let s = Session::new(
            "127.0.0.1:4001".parse().unwrap(),
            "d4e5f6".to_string(),
            Box::new(ours),
            write_timeout,
        );
        (Arc::new(s), theirs)
    }

    #[tokio::test]
    async fn test_write_to_stalled_peer_times_out() {
        let (s, _peer) = stalled_session(Duration::from_millis(50));
        let res = tokio::time::timeout(
            Duration::from_secs(2),
            s.send_result(json!(1), json!("x".repeat(1000))),
        )
        .await
        .expect("write should give up on its own");
        assert!(matches!(res, Err(SessionError::Timeout)));
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_stuck_writer() {
        let (s, _peer) = stalled_session(Duration::from_secs(60));
        let writer = {
            let s = s.clone();
            tokio::spawn(async move { s.send_result(json!(1), json!("x".repeat(1000))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), s.close())
            .await
            .expect("close blocked on the outbound lock");
        let res = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer not woken by close")
            .unwrap();
        assert!(matches!(res, Err(SessionError::Closed)));
    }
}
