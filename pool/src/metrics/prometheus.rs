use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static SHARES: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static PUSH_FAILURES: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static BACKEND_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static SOCKET_FLOODS: OnceLock<IntCounter> = OnceLock::new();
static REFUSED_CONNECTIONS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();

fn shares() -> &'static IntCounterVec {
    SHARES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_total", "Submitted shares by outcome"),
            &["status"],
        )
        .unwrap()
    })
}

fn blocks_found() -> &'static IntCounter {
    BLOCKS_FOUND.get_or_init(|| IntCounter::new("blocks_found_total", "Blocks accepted by the daemon").unwrap())
}

fn block_submit_rejected() -> &'static IntCounter {
    BLOCK_SUBMIT_REJECTED.get_or_init(|| {
        IntCounter::new(
            "block_submit_rejected_total",
            "Block candidates rejected by the daemon or failed to submit",
        )
        .unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| IntCounter::new("job_broadcasts_total", "Completed job broadcasts").unwrap())
}

fn push_failures() -> &'static IntCounter {
    PUSH_FAILURES.get_or_init(|| {
        IntCounter::new("job_push_failures_total", "Job pushes that dropped a session").unwrap()
    })
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS.get_or_init(|| IntCounter::new("daemon_rpc_requests_total", "Daemon RPC requests").unwrap())
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| IntCounter::new("daemon_rpc_errors_total", "Daemon RPC errors").unwrap())
}

fn template_updates() -> &'static IntCounter {
    TEMPLATE_UPDATES
        .get_or_init(|| IntCounter::new("block_template_updates_total", "Template updates").unwrap())
}

fn template_fetch_errors() -> &'static IntCounter {
    TEMPLATE_FETCH_ERRORS.get_or_init(|| {
        IntCounter::new("block_template_fetch_errors_total", "Template fetch errors").unwrap()
    })
}

fn backend_errors() -> &'static IntCounter {
    BACKEND_ERRORS.get_or_init(|| IntCounter::new("backend_errors_total", "Backend write errors").unwrap())
}

fn socket_floods() -> &'static IntCounter {
    SOCKET_FLOODS.get_or_init(|| IntCounter::new("socket_floods_total", "Oversized request lines").unwrap())
}

fn refused_connections() -> &'static IntCounter {
    REFUSED_CONNECTIONS.get_or_init(|| {
        IntCounter::new("refused_connections_total", "Connections refused by policy").unwrap()
    })
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| IntGauge::new("stratum_active_connections", "Active miner connections").unwrap())
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT.get_or_init(|| IntGauge::new("block_template_height", "Current block template height").unwrap())
}

pub fn inc_accepted() {
    shares().with_label_values(&["accepted"]).inc();
}

pub fn inc_rejected() {
    shares().with_label_values(&["invalid"]).inc();
}

pub fn inc_duplicate() {
    shares().with_label_values(&["duplicate"]).inc();
}

pub fn inc_stale() {
    shares().with_label_values(&["stale"]).inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_block_submit_rejected() {
    block_submit_rejected().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_push_failures() {
    push_failures().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_template_updates() {
    template_updates().inc();
}

pub fn inc_template_fetch_errors() {
    template_fetch_errors().inc();
}

pub fn inc_backend_errors() {
    backend_errors().inc();
}

pub fn inc_socket_floods() {
    socket_floods().inc();
}

pub fn inc_refused_connections() {
    refused_connections().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(shares().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(block_submit_rejected().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(push_failures().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(backend_errors().collect());
    mfs.extend(socket_floods().collect());
    mfs.extend(refused_connections().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(template_height().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_share_outcomes() {
        inc_accepted();
        inc_duplicate();
        set_template_height(42);
        let out = render();
        assert!(out.contains("shares_total"));
        assert!(out.contains("status=\"accepted\""));
        assert!(out.contains("block_template_height"));
    }
}
