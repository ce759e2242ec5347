/// Block Template Manager - polls the daemon for work packages
///
/// Publishes immutable template snapshots and notifies the broadcaster

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;

use super::rpc_client::{CoinDaemon, WorkPackage};
use crate::metrics::prometheus as metrics;

/// Headers of earlier templates stay submittable for this many heights.
pub const MAX_BACKLOG: u64 = 3;

pub type TemplateChangeCallback = Arc<dyn Fn(Arc<BlockTemplate>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    pub height: u64,
    pub difficulty: u64,
}

/// One published job template. Never mutated after publication.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub header: String,
    pub seed: String,
    pub target: String,
    pub height: u64,
    pub difficulty: u64,
    /// Every header hash a share may still reference.
    pub headers: HashMap<String, HeaderInfo>,
}

impl BlockTemplate {
    pub fn new(
        header: impl Into<String>,
        seed: impl Into<String>,
        target: impl Into<String>,
        height: u64,
        difficulty: u64,
    ) -> Self {
        let header = header.into();
        let mut headers = HashMap::new();
        headers.insert(header.clone(), HeaderInfo { height, difficulty });
        Self {
            header,
            seed: seed.into(),
            target: target.into(),
            height,
            difficulty,
            headers,
        }
    }

    /// Build the successor of `prev`, carrying over its recent headers.
    pub fn succeed(
        prev: Option<&BlockTemplate>,
        work: WorkPackage,
        height: u64,
        difficulty: u64,
    ) -> Self {
        let mut next = Self::new(work.header, work.seed, work.target, height, difficulty);
        if let Some(prev) = prev {
            for (hash, info) in &prev.headers {
                let recent = height
                    .checked_sub(info.height)
                    .is_some_and(|age| age < MAX_BACKLOG);
                if recent {
                    next.headers.entry(hash.clone()).or_insert(*info);
                }
            }
        }
        next
    }

    pub fn lookup(&self, header: &str) -> Option<HeaderInfo> {
        self.headers.get(header).copied()
    }
}

/// Read side of the template manager, as seen by sessions and the validator.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// `None` until the first template has been fetched.
    async fn current(&self) -> Option<Arc<BlockTemplate>>;

    /// Fetch a new template right away.
    async fn refresh(&self) -> Result<()>;
}

pub struct BlockTemplateManager {
    daemon: Arc<dyn CoinDaemon>,
    update_interval: Duration,
    current_template: RwLock<Option<Arc<BlockTemplate>>>,
    refreshing: Mutex<()>,
    on_change: Option<TemplateChangeCallback>,
}

impl BlockTemplateManager {
    pub fn new(daemon: Arc<dyn CoinDaemon>, update_interval: Duration) -> Self {
        tracing::info!("BlockTemplateManager: refresh every {:?}", update_interval);

        Self {
            daemon,
            update_interval,
            current_template: RwLock::new(None),
            refreshing: Mutex::new(()),
            on_change: None,
        }
    }

    /// Register callback for template changes
    pub fn on_template_change<F>(&mut self, callback: F)
    where
        F: Fn(Arc<BlockTemplate>) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
    }

    /// Spawn the polling loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(manager.update_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(e) = manager.update().await {
                    tracing::error!("Failed to fetch block template: {:#}", e);
                }
            }
        })
    }

    /// One poll cycle. Returns whether a new template was published.
    pub async fn update(&self) -> Result<bool> {
        let _guard = self.refreshing.lock().await;

        let res = self.fetch().await;
        let template = match res {
            Ok(Some(t)) => Arc::new(t),
            Ok(None) => return Ok(false),
            Err(e) => {
                metrics::inc_template_fetch_errors();
                return Err(e);
            }
        };

        *self.current_template.write().await = Some(template.clone());
        metrics::set_template_height(template.height);
        metrics::inc_template_updates();
        tracing::info!(
            "New block template: height={} difficulty={} header={}",
            template.height,
            template.difficulty,
            short(&template.header)
        );

        if let Some(callback) = &self.on_change {
            callback(template);
        }
        Ok(true)
    }

    async fn fetch(&self) -> Result<Option<BlockTemplate>> {
        let work = self.daemon.get_work().await?;
        let prev = self.current_template.read().await.clone();
        if prev.as_ref().is_some_and(|t| t.header == work.header) {
            return Ok(None);
        }

        let pending = self.daemon.get_pending_block().await?;
        let height = work.height.unwrap_or(pending.number);
        Ok(Some(BlockTemplate::succeed(
            prev.as_deref(),
            work,
            height,
            pending.difficulty,
        )))
    }
}

#[async_trait]
impl TemplateSource for BlockTemplateManager {
    async fn current(&self) -> Option<Arc<BlockTemplate>> {
        self.current_template.read().await.clone()
    }

    async fn refresh(&self) -> Result<()> {
        self.update().await.map(|_| ())
    }
}

fn short(hash: &str) -> &str {
    hash.get(..18).unwrap_or(hash)
}
