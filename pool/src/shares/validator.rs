/// Share Validator - turns a `[nonce, header, mix]` submission into an outcome
///
/// Verifies the share at pool difficulty, relays block solutions to the
/// daemon and records credit in the backend.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::pow::{Candidate, PowVerifier};
use super::storage::{Backend, ShareRecord};
use crate::blockchain::{CoinDaemon, TemplateSource};
use crate::metrics::prometheus as metrics;

/// Result of [`ShareValidator::process_share`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareOutcome {
    /// The backend had already recorded this exact submission.
    pub exists: bool,
    pub accepted: bool,
}

impl ShareOutcome {
    pub const ACCEPTED: Self = Self { exists: false, accepted: true };
    pub const REJECTED: Self = Self { exists: false, accepted: false };
    pub const DUPLICATE: Self = Self { exists: true, accepted: false };
}

pub struct ShareValidator {
    template: Arc<dyn TemplateSource>,
    verifier: Arc<dyn PowVerifier>,
    daemon: Arc<dyn CoinDaemon>,
    backend: Arc<dyn Backend>,
    share_diff: u64,
    hashrate_ttl: Duration,
}

impl ShareValidator {
    pub fn new(
        template: Arc<dyn TemplateSource>,
        verifier: Arc<dyn PowVerifier>,
        daemon: Arc<dyn CoinDaemon>,
        backend: Arc<dyn Backend>,
        share_diff: u64,
        hashrate_ttl: Duration,
    ) -> Self {
        Self {
            template,
            verifier,
            daemon,
            backend,
            share_diff,
            hashrate_ttl,
        }
    }

    pub fn share_difficulty(&self) -> u64 {
        self.share_diff
    }

    /// Mix digest for a Stratum submission, which carries only the nonce.
    pub async fn derive_mix(&self, header: &str, nonce_hex: &str) -> Option<String> {
        let nonce = parse_nonce(nonce_hex)?;
        let number = self
            .template
            .current()
            .await
            .and_then(|t| t.lookup(header))
            .map(|h| h.height)?;
        self.verifier.mix_digest(number, header, nonce)
    }

    /// Main validation entry point. `params` is `[nonce, header, mix]`.
    pub async fn process_share(
        &self,
        login: &str,
        worker: &str,
        ip: IpAddr,
        params: &[String],
    ) -> ShareOutcome {
        let [nonce_hex, header, mix] = params else {
            return ShareOutcome::REJECTED;
        };

        let Some(nonce) = parse_nonce(nonce_hex) else {
            tracing::warn!("Invalid nonce format from {}@{}: {}", login, ip, nonce_hex);
            metrics::inc_rejected();
            return ShareOutcome::REJECTED;
        };

        let template = self.template.current().await;
        let Some(h) = template.as_ref().and_then(|t| t.lookup(header)) else {
            tracing::warn!(
                "Stale share from {}@{}: header {} not in current template",
                login,
                ip,
                header
            );
            metrics::inc_stale();
            return ShareOutcome::REJECTED;
        };

        let share = Candidate {
            number: h.height,
            header_hash: header.clone(),
            nonce,
            mix_digest: mix.clone(),
            difficulty: self.share_diff,
        };
        let block = share.with_difficulty(h.difficulty);

        if !self.verifier.verify(&share) {
            tracing::warn!(
                "Invalid share from {}@{}: nonce={} height={}",
                login,
                ip,
                nonce_hex,
                h.height
            );
            metrics::inc_rejected();
            return ShareOutcome::REJECTED;
        }

        let record = ShareRecord {
            login,
            worker,
            params,
            share_diff: self.share_diff,
            height: h.height,
            ttl: self.hashrate_ttl,
        };

        if self.verifier.verify(&block) {
            tracing::info!("Block candidate found by {}@{} at height {}", login, ip, h.height);
            return self.submit_block(&record, h.difficulty, ip).await;
        }

        match self.backend.write_share(&record).await {
            Ok(true) => {
                tracing::warn!("Duplicate share from {}@{}: nonce={}", login, ip, nonce_hex);
                metrics::inc_duplicate();
                ShareOutcome::DUPLICATE
            }
            Ok(false) => {
                tracing::debug!("Share stored for {}.{}@{} at height {}", login, worker, ip, h.height);
                metrics::inc_accepted();
                ShareOutcome::ACCEPTED
            }
            Err(e) => {
                // Not the miner's fault; never penalize.
                tracing::error!("Failed to insert share for {}@{}: {:#}", login, ip, e);
                metrics::inc_backend_errors();
                ShareOutcome::ACCEPTED
            }
        }
    }

    async fn submit_block(&self, record: &ShareRecord<'_>, net_diff: u64, ip: IpAddr) -> ShareOutcome {
        match self.daemon.submit_block(record.params).await {
            Err(e) => {
                tracing::error!("Block submission failure at height {}: {:#}", record.height, e);
                metrics::inc_block_submit_rejected();
                return ShareOutcome::ACCEPTED;
            }
            Ok(false) => {
                tracing::warn!("Block rejected at height {} from {}@{}", record.height, record.login, ip);
                metrics::inc_block_submit_rejected();
                return ShareOutcome::REJECTED;
            }
            Ok(true) => {}
        }

        metrics::inc_blocks_found();
        if let Err(e) = self.template.refresh().await {
            tracing::error!("Template refresh after block failed: {:#}", e);
        }

        match self.backend.write_block(record, net_diff).await {
            Ok(true) => {
                tracing::warn!("Block already recorded for {}@{}", record.login, ip);
                metrics::inc_duplicate();
                ShareOutcome::DUPLICATE
            }
            Ok(false) => {
                tracing::info!(
                    "Block found by {}.{}@{} at height {}",
                    record.login,
                    record.worker,
                    ip,
                    record.height
                );
                metrics::inc_accepted();
                ShareOutcome::ACCEPTED
            }
            Err(e) => {
                tracing::error!("Failed to insert block candidate for {}@{}: {:#}", record.login, ip, e);
                metrics::inc_backend_errors();
                ShareOutcome::ACCEPTED
            }
        }
    }
}

fn parse_nonce(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{BlockTemplate, PendingBlock, WorkPackage};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const HEADER: &str = "0x0000000000000000000000000000000000000000000000000000000000000aaa";
    const MIX: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    struct FixedTemplate {
        template: Option<Arc<BlockTemplate>>,
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl TemplateSource for FixedTemplate {
        async fn current(&self) -> Option<Arc<BlockTemplate>> {
            self.template.clone()
        }

        async fn refresh(&self) -> Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Solves every difficulty up to `max`.
    struct UpTo {
        max: u64,
    }

    impl PowVerifier for UpTo {
        fn verify(&self, c: &Candidate) -> bool {
            c.difficulty <= self.max
        }

        fn mix_digest(&self, _number: u64, _header: &str, _nonce: u64) -> Option<String> {
            Some(MIX.to_string())
        }
    }

    enum Verdict {
        Accept,
        Reject,
        Fail,
    }

    struct ScriptedDaemon {
        verdict: Verdict,
        submits: AtomicUsize,
    }

    #[async_trait]
    impl CoinDaemon for ScriptedDaemon {
        async fn get_work(&self) -> Result<WorkPackage> {
            Err(anyhow!("unused"))
        }

        async fn get_pending_block(&self) -> Result<PendingBlock> {
            Err(anyhow!("unused"))
        }

        async fn submit_block(&self, _params: &[String]) -> Result<bool> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            match self.verdict {
                Verdict::Accept => Ok(true),
                Verdict::Reject => Ok(false),
                Verdict::Fail => Err(anyhow!("connection refused")),
            }
        }
    }

    #[derive(Default)]
    struct RecordingBackend {
        seen: Mutex<HashSet<String>>,
        shares: Mutex<Vec<(String, u64)>>,
        blocks: Mutex<Vec<(String, u64, u64)>>,
        fail: bool,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn write_share(&self, s: &ShareRecord<'_>) -> Result<bool> {
            if self.fail {
                return Err(anyhow!("redis down"));
            }
            if !self.seen.lock().unwrap().insert(s.pow_key()) {
                return Ok(true);
            }
            self.shares.lock().unwrap().push((s.login.to_string(), s.height));
            Ok(false)
        }

        async fn write_block(&self, s: &ShareRecord<'_>, net_diff: u64) -> Result<bool> {
            if !self.seen.lock().unwrap().insert(s.pow_key()) {
                return Ok(true);
            }
            self.blocks
                .lock()
                .unwrap()
                .push((s.login.to_string(), s.height, net_diff));
            Ok(false)
        }
    }

    struct Harness {
        validator: ShareValidator,
        template: Arc<FixedTemplate>,
        daemon: Arc<ScriptedDaemon>,
        backend: Arc<RecordingBackend>,
    }

    fn harness(solves: u64, verdict: Verdict, backend: RecordingBackend) -> Harness {
        let template = Arc::new(FixedTemplate {
            template: Some(Arc::new(BlockTemplate::new(HEADER, "0xseed", "0xtarget", 100, 1_000_000_000))),
            refreshes: AtomicUsize::new(0),
        });
        let daemon = Arc::new(ScriptedDaemon { verdict, submits: AtomicUsize::new(0) });
        let backend = Arc::new(backend);
        let validator = ShareValidator::new(
            template.clone(),
            Arc::new(UpTo { max: solves }),
            daemon.clone(),
            backend.clone(),
            1000,
            Duration::from_secs(3600),
        );
        Harness { validator, template, daemon, backend }
    }

    fn params(nonce: &str, header: &str) -> Vec<String> {
        vec![nonce.to_string(), header.to_string(), MIX.to_string()]
    }

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_share_only_solution() {
        let h = harness(1000, Verdict::Accept, RecordingBackend::default());
        let out = h
            .validator
            .process_share("0xminer", "rig1", ip(), &params("0x0000000000000001", HEADER))
            .await;

        assert_eq!(out, ShareOutcome::ACCEPTED);
        assert_eq!(*h.backend.shares.lock().unwrap(), vec![("0xminer".to_string(), 100)]);
        assert!(h.backend.blocks.lock().unwrap().is_empty());
        assert_eq!(h.daemon.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_block_solution_and_resubmission() {
        let h = harness(u64::MAX, Verdict::Accept, RecordingBackend::default());
        let p = params("0x0000000000000002", HEADER);

        let out = h.validator.process_share("0xminer", "rig1", ip(), &p).await;
        assert_eq!(out, ShareOutcome::ACCEPTED);
        assert_eq!(h.daemon.submits.load(Ordering::SeqCst), 1);
        assert_eq!(h.template.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            *h.backend.blocks.lock().unwrap(),
            vec![("0xminer".to_string(), 100, 1_000_000_000)]
        );
        assert!(h.backend.shares.lock().unwrap().is_empty());

        let again = h.validator.process_share("0xminer", "rig1", ip(), &p).await;
        assert_eq!(again, ShareOutcome::DUPLICATE);
        assert_eq!(h.backend.blocks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_header_is_stale() {
        let h = harness(u64::MAX, Verdict::Accept, RecordingBackend::default());
        let other = format!("0x{}", "b".repeat(64));
        let out = h
            .validator
            .process_share("0xminer", "rig1", ip(), &params("0x0000000000000003", &other))
            .await;

        assert_eq!(out, ShareOutcome::REJECTED);
        assert!(h.backend.shares.lock().unwrap().is_empty());
        assert_eq!(h.daemon.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_low_difficulty_and_bad_nonce_rejected() {
        let h = harness(999, Verdict::Accept, RecordingBackend::default());
        let out = h
            .validator
            .process_share("0xminer", "rig1", ip(), &params("0x0000000000000004", HEADER))
            .await;
        assert_eq!(out, ShareOutcome::REJECTED);

        let out = h
            .validator
            .process_share("0xminer", "rig1", ip(), &params("0xnothex", HEADER))
            .await;
        assert_eq!(out, ShareOutcome::REJECTED);
        assert!(h.backend.shares.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_block_is_not_written() {
        let h = harness(u64::MAX, Verdict::Reject, RecordingBackend::default());
        let out = h
            .validator
            .process_share("0xminer", "rig1", ip(), &params("0x0000000000000005", HEADER))
            .await;
        assert_eq!(out, ShareOutcome::REJECTED);
        assert!(h.backend.blocks.lock().unwrap().is_empty());
        assert_eq!(h.template.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_daemon_and_backend_errors_do_not_penalize() {
        let h = harness(u64::MAX, Verdict::Fail, RecordingBackend::default());
        let out = h
            .validator
            .process_share("0xminer", "rig1", ip(), &params("0x0000000000000006", HEADER))
            .await;
        assert_eq!(out, ShareOutcome::ACCEPTED);
        assert!(h.backend.blocks.lock().unwrap().is_empty());

        let failing = RecordingBackend { fail: true, ..Default::default() };
        let h = harness(1000, Verdict::Accept, failing);
        let out = h
            .validator
            .process_share("0xminer", "rig1", ip(), &params("0x0000000000000007", HEADER))
            .await;
        assert_eq!(out, ShareOutcome::ACCEPTED);
    }

    #[tokio::test]
    async fn test_derive_mix_needs_known_header() {
        let h = harness(1000, Verdict::Accept, RecordingBackend::default());
        assert_eq!(
            h.validator.derive_mix(HEADER, "0x0000000000000001").await.as_deref(),
            Some(MIX)
        );
        assert!(h.validator.derive_mix("0xdead", "0x01").await.is_none());
        assert!(h.validator.derive_mix(HEADER, "0xzz").await.is_none());
    }
}
