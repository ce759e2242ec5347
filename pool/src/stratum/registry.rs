/// Live sessions, extranonce allocation and job fan-out

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::protocol::random_hex;
use super::session::{JobPayload, PushOutcome, Session};
use crate::blockchain::BlockTemplate;
use crate::metrics::prometheus as metrics;

pub const EXTRANONCE_LEN: usize = 6;
pub const BROADCAST_CONCURRENCY: usize = 1024;

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, Arc<Session>>,
    extranonces: HashSet<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct SessionRegistry {
    inner: RwLock<Inner>,
    fanout: Arc<Semaphore>,
    push_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(push_timeout: Duration) -> Self {
        Self::with_concurrency(push_timeout, BROADCAST_CONCURRENCY)
    }

    pub fn with_concurrency(push_timeout: Duration, concurrency: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            fanout: Arc::new(Semaphore::new(concurrency.max(1))),
            push_timeout,
        }
    }

    /// Deadline for one push, also used for every session write.
    pub fn push_timeout(&self) -> Duration {
        self.push_timeout
    }

    /// Reserve an extranonce no registered session holds.
    pub async fn allocate_extranonce(&self) -> String {
        loop {
            let candidate = random_hex(EXTRANONCE_LEN);
            if self.inner.read().await.extranonces.contains(&candidate) {
                continue;
            }
            if self.inner.write().await.extranonces.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    pub async fn register(&self, session: Arc<Session>) {
        let mut inner = self.inner.write().await;
        inner.extranonces.insert(session.extranonce.clone());
        inner.sessions.insert(session.id, session);
    }

    /// Drop the session and release its extranonce. False if already gone.
    pub async fn remove(&self, session: &Session) -> bool {
        let mut inner = self.inner.write().await;
        if inner.sessions.remove(&session.id).is_none() {
            return false;
        }
        inner.extranonces.remove(&session.extranonce);
        true
    }

    pub async fn contains(&self, session: &Session) -> bool {
        self.inner.read().await.sessions.contains_key(&session.id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn extranonces_in_use(&self) -> usize {
        self.inner.read().await.extranonces.len()
    }

    /// Push `template` to every session in its own dialect.
    ///
    /// Sessions that fail or time out are removed and closed. The registry
    /// lock is released before any I/O.
    pub async fn broadcast(&self, template: &BlockTemplate, share_target: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        if template.header.is_empty() {
            return report;
        }

        let payload = Arc::new(JobPayload {
            header: template.header.clone(),
            seed: template.seed.clone(),
            target: share_target.to_string(),
            height: template.height,
        });
        let sessions: Vec<Arc<Session>> = self.inner.read().await.sessions.values().cloned().collect();

        tracing::info!("Broadcasting new job to {} miners", sessions.len());
        let start = Instant::now();

        let mut pushes = JoinSet::new();
        for session in sessions {
            let Ok(permit) = self.fanout.clone().acquire_owned().await else {
                break;
            };
            let payload = payload.clone();
            let push_timeout = self.push_timeout;
            pushes.spawn(async move {
                let _permit = permit;
                let res = tokio::time::timeout(push_timeout, session.push_job(&payload)).await;
                (session, res)
            });
        }

        while let Some(joined) = pushes.join_next().await {
            let Ok((session, res)) = joined else {
                report.failed += 1;
                continue;
            };
            match res {
                Ok(Ok(PushOutcome::Sent)) => report.sent += 1,
                Ok(Ok(PushOutcome::Skipped)) => report.skipped += 1,
                Ok(Err(e)) => {
                    tracing::warn!("Job transmit error to {}: {}", session.addr, e);
                    self.drop_session(&session).await;
                    report.failed += 1;
                }
                Err(_) => {
                    tracing::warn!("Job transmit to {} timed out", session.addr);
                    self.drop_session(&session).await;
                    report.failed += 1;
                }
            }
        }

        metrics::inc_job_broadcasts();
        tracing::info!(
            "Jobs broadcast finished in {:?}: sent={} skipped={} failed={}",
            start.elapsed(),
            report.sent,
            report.skipped,
            report.failed
        );
        report
    }

    async fn drop_session(&self, session: &Session) {
        metrics::inc_push_failures();
        self.remove(session).await;
        session.close().await;
    }
}
