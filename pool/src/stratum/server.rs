/// Stratum Server - miner-facing TCP front end
///
/// Serves classic polling and EthereumStratum/1.0.0 miners on one listener:
/// - Connection cap and per-IP policy at accept
/// - Bounded line reader with a sliding read deadline
/// - Per-dialect request dispatch
/// - Share submission through the validator

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use super::error::SessionError;
use super::protocol::{
    self, is_valid_hash, is_valid_login, is_valid_nonce, sanitize_worker, split_login,
    string_params, Dialect, Request, RpcError, STRATUM_VERSION,
};
use super::registry::{BroadcastReport, SessionRegistry};
use super::session::Session;
use crate::blockchain::{BlockTemplate, TemplateSource};
use crate::config::Config;
use crate::metrics::prometheus as metrics;
use crate::policy::PolicyEngine;
use crate::shares::pow::target_hex;
use crate::shares::{ShareOutcome, ShareValidator};

/// Longest request line accepted before the client is banned.
pub const MAX_REQ_SIZE: usize = 1024;

pub struct StratumServer {
    listen: String,
    timeout: Duration,
    share_diff: u64,
    share_target: String,
    connections: Arc<Semaphore>,
    registry: Arc<SessionRegistry>,
    policy: Arc<dyn PolicyEngine>,
    template: Arc<dyn TemplateSource>,
    validator: Arc<ShareValidator>,
}

impl StratumServer {
    pub fn new(
        cfg: &Config,
        registry: Arc<SessionRegistry>,
        policy: Arc<dyn PolicyEngine>,
        template: Arc<dyn TemplateSource>,
        validator: Arc<ShareValidator>,
    ) -> Self {
        let share_diff = validator.share_difficulty();
        tracing::info!(
            "Creating Stratum server on {} (max_conn={}, share difficulty={})",
            cfg.listen,
            cfg.max_conn,
            share_diff
        );

        Self {
            listen: cfg.listen.clone(),
            timeout: cfg.timeout(),
            share_diff,
            share_target: target_hex(share_diff),
            connections: Arc::new(Semaphore::new(cfg.max_conn.max(1))),
            registry,
            policy,
            template,
            validator,
        }
    }

    pub async fn broadcast_new_job(&self, template: &BlockTemplate) -> BroadcastReport {
        self.registry.broadcast(template, &self.share_target).await
    }

    /// Bind the listener with SO_REUSEADDR.
    pub fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .map_err(|e| anyhow!("Invalid address '{}': {}", self.listen, e))?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(addr))?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;

        tracing::info!("Stratum listening on {}", addr);
        Ok(listener)
    }

    /// Accept loop. Runs until the task is dropped.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let permit = self
                .connections
                .clone()
                .acquire_owned()
                .await
                .context("connection semaphore closed")?;

            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let ip = addr.ip();
            if self.policy.is_banned(ip) || !self.policy.apply_limit_policy(ip) {
                tracing::debug!("Refusing connection from {}", addr);
                metrics::inc_refused_connections();
                continue;
            }

            if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
                tracing::debug!("Failed to enable keepalive for {}: {}", addr, e);
            }

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.serve(stream, addr).await;
                drop(permit);
            });
        }
    }

    /// Drive one miner connection to completion.
    pub async fn serve<S>(self: Arc<Self>, stream: S, addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let extranonce = self.registry.allocate_extranonce().await;
        let session = Arc::new(Session::new(
            addr,
            extranonce,
            Box::new(writer),
            self.registry.push_timeout(),
        ));
        self.registry.register(session.clone()).await;
        metrics::inc_connections();
        tracing::debug!("Session {} from {} (extranonce {})", session.id, addr, session.extranonce);

        match self.read_loop(&session, reader).await {
            Ok(()) => tracing::info!("Client {} disconnected", addr),
            Err(SessionError::SocketFlood(_)) => {
                tracing::warn!("Socket flood detected from {}", addr.ip());
                metrics::inc_socket_floods();
                self.policy.ban_client(addr.ip());
            }
            Err(e) if e.is_disconnect() => tracing::debug!("Client {} gone: {}", addr, e),
            Err(e) => tracing::warn!("Closing session {}: {}", addr, e),
        }

        self.registry.remove(&session).await;
        session.close().await;
        metrics::dec_connections();
    }

    async fn read_loop<R>(&self, session: &Arc<Session>, reader: R) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::with_capacity(MAX_REQ_SIZE, reader);
        let mut line = Vec::with_capacity(MAX_REQ_SIZE);
        session.touch();

        loop {
            let deadline = session.deadline(self.timeout);
            let read = tokio::select! {
                _ = session.closed() => return Err(SessionError::Closed),
                r = tokio::time::timeout_at(deadline, read_line(&mut reader, &mut line)) => r,
            };

            match read {
                // A job push may have moved the deadline while we waited.
                Err(_) if session.deadline(self.timeout) > tokio::time::Instant::now() => continue,
                Err(_) => return Err(SessionError::Timeout),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(false)) => return Ok(()),
                Ok(Ok(true)) => {}
            }

            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > 1 {
                self.handle_line(session, &line).await?;
            }
            line.clear();
        }
    }

    async fn handle_line(&self, session: &Arc<Session>, line: &[u8]) -> Result<(), SessionError> {
        let req: Request = match serde_json::from_slice(line) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("Malformed stratum request from {}: {}", session.addr, e);
                return self
                    .malformed(session, Value::Null, &RpcError::malformed_request(), session.dialect())
                    .await;
            }
        };

        session.touch();
        tracing::debug!("{} -> {}", session.addr, req.method);
        self.dispatch(session, req).await
    }

    async fn dispatch(&self, session: &Arc<Session>, req: Request) -> Result<(), SessionError> {
        match req.method.as_str() {
            "eth_submitLogin" => self.handle_submit_login(session, req).await,
            "eth_getWork" => self.handle_get_work(session, req).await,
            "eth_submitWork" => self.handle_submit_work(session, req).await,
            "eth_submitHashrate" => session.send_result(req.id, json!(true)).await,
            "mining.subscribe" => self.handle_subscribe(session, req).await,
            "mining.authorize" => self.handle_authorize(session, req).await,
            "mining.extranonce.subscribe" => self.handle_extranonce_subscribe(session, req).await,
            "mining.submit" => self.handle_mining_submit(session, req).await,
            other => {
                tracing::warn!("Method {} not found, from {}", other, session.addr);
                self.malformed(session, req.id, &RpcError::method_not_found(), session.dialect())
                    .await
            }
        }
    }

    /// Send an error reply. The session ends only if the client is now banned.
    async fn reply_error(
        &self,
        session: &Session,
        id: Value,
        err: &RpcError,
        dialect: Dialect,
    ) -> Result<(), SessionError> {
        session.send_error(id, err, dialect).await?;
        if self.policy.is_banned(session.ip()) {
            return Err(SessionError::Banned);
        }
        Ok(())
    }

    async fn malformed(
        &self,
        session: &Session,
        id: Value,
        err: &RpcError,
        dialect: Dialect,
    ) -> Result<(), SessionError> {
        self.policy.apply_malformed_policy(session.ip());
        self.reply_error(session, id, err, dialect).await
    }

    async fn login(&self, session: &Session, login: Option<&str>, worker: &str) -> Result<(), RpcError> {
        let login = login.ok_or_else(RpcError::invalid_params)?.to_lowercase();
        if !is_valid_login(&login) {
            return Err(RpcError::invalid_login());
        }
        if !self.policy.apply_login_policy(&login, session.ip()) {
            return Err(RpcError::blacklisted());
        }

        let worker = sanitize_worker(worker);
        tracing::info!("Miner connected {}.{}@{}", login, worker, session.ip());
        session.set_identity(login, worker).await;
        Ok(())
    }

    async fn handle_submit_login(&self, session: &Arc<Session>, req: Request) -> Result<(), SessionError> {
        let Some(params) = string_params(&req.params) else {
            return self
                .malformed(session, req.id, &RpcError::invalid_params(), Dialect::ClassicPolling)
                .await;
        };

        match self.login(session, params.first().map(String::as_str), &req.worker).await {
            Ok(()) => {
                session.negotiate(Dialect::ClassicPolling);
                session.send_result(req.id, json!(true)).await
            }
            Err(err) => self.reply_error(session, req.id, &err, Dialect::ClassicPolling).await,
        }
    }

    async fn handle_get_work(&self, session: &Arc<Session>, req: Request) -> Result<(), SessionError> {
        match self.current_template().await {
            Some(t) => {
                session
                    .send_result(req.id, json!([t.header, t.seed, self.share_target]))
                    .await
            }
            None => {
                self.reply_error(session, req.id, &RpcError::work_not_ready(), Dialect::ClassicPolling)
                    .await
            }
        }
    }

    async fn handle_submit_work(&self, session: &Arc<Session>, req: Request) -> Result<(), SessionError> {
        let Some(params) = string_params(&req.params) else {
            return self
                .malformed(session, req.id, &RpcError::invalid_params(), Dialect::ClassicPolling)
                .await;
        };

        let worker = if req.worker.is_empty() {
            session.identity().await.map(|i| i.worker).unwrap_or_default()
        } else {
            req.worker.clone()
        };
        self.submit(session, req.id, &worker, params, Dialect::ClassicPolling).await
    }

    async fn handle_subscribe(&self, session: &Arc<Session>, req: Request) -> Result<(), SessionError> {
        let version = req
            .params
            .as_array()
            .and_then(|p| p.get(1))
            .and_then(Value::as_str);
        if version != Some(STRATUM_VERSION) {
            tracing::warn!("Unsupported stratum version from {}: {:?}", session.addr, version);
            return self
                .reply_error(session, req.id, &RpcError::unsupported_version(), Dialect::StratumV1)
                .await;
        }

        session.negotiate(Dialect::StratumV1);
        let subscription_id = protocol::random_hex(16);
        session
            .send_result(req.id, protocol::subscribe_result(&subscription_id, &session.extranonce))
            .await
    }

    async fn handle_authorize(&self, session: &Arc<Session>, req: Request) -> Result<(), SessionError> {
        let params = string_params(&req.params).unwrap_or_default();
        let Some(full) = params.first() else {
            return self
                .malformed(session, req.id, &RpcError::invalid_params(), Dialect::StratumV1)
                .await;
        };

        let (login, worker) = split_login(full);
        let worker = worker.unwrap_or(req.worker.as_str());
        if let Err(err) = self.login(session, Some(login), worker).await {
            return self.reply_error(session, req.id, &err, Dialect::StratumV1).await;
        }

        session.negotiate(Dialect::StratumV1);
        session.send_result(req.id.clone(), json!(true)).await?;
        session
            .send_notification(&protocol::set_difficulty(self.share_diff))
            .await?;
        self.send_job(session, req.id, true).await
    }

    async fn handle_extranonce_subscribe(
        &self,
        session: &Arc<Session>,
        req: Request,
    ) -> Result<(), SessionError> {
        let Some(params) = string_params(&req.params) else {
            return self
                .malformed(session, req.id, &RpcError::invalid_params(), Dialect::StratumV1)
                .await;
        };
        if !params.is_empty() {
            return self
                .reply_error(session, req.id, &RpcError::not_supported(), Dialect::StratumV1)
                .await;
        }

        session.send_result(req.id, json!(true)).await?;
        session.subscribe_extranonce();
        session
            .send_notification(&protocol::set_extranonce(&session.extranonce))
            .await
    }

    /// `[login.worker, jobId, minerNonce]`
    async fn handle_mining_submit(&self, session: &Arc<Session>, req: Request) -> Result<(), SessionError> {
        let params = string_params(&req.params).unwrap_or_default();
        if params.len() < 3 {
            return self
                .malformed(session, req.id, &RpcError::invalid_params(), Dialect::StratumV1)
                .await;
        }
        if session.identity().await.is_none() {
            return self
                .reply_error(session, req.id, &RpcError::not_subscribed(), Dialect::StratumV1)
                .await;
        }

        let worker = split_login(&params[0]).1.unwrap_or("0");
        let job_id = &params[1];
        let Some(job) = session.job_for(job_id).await else {
            let current = session.current_job().await.map(|j| j.job_id);
            tracing::info!(
                "Stale share from {}: job {} (current {:?})",
                session.addr,
                job_id,
                current
            );
            metrics::inc_stale();
            self.reply_error(session, req.id.clone(), &RpcError::stale_share(), Dialect::StratumV1)
                .await?;
            return self.send_job(session, req.id, false).await;
        };

        let nonce = format!("0x{}{}", session.nonce_prefix(), params[2]);
        let header = format!("0x{}", job.header);
        if !is_valid_nonce(&nonce) || !is_valid_hash(&header) {
            return self
                .malformed(session, req.id, &RpcError::malformed_pow(), Dialect::StratumV1)
                .await;
        }

        let Some(mix) = self.validator.derive_mix(&header, &nonce).await else {
            tracing::warn!("No mix digest for {} at header {}", session.addr, header);
            return self
                .answer_share(session, req.id, ShareOutcome::REJECTED, Dialect::StratumV1)
                .await;
        };

        self.submit(session, req.id, worker, vec![nonce, header, mix], Dialect::StratumV1)
            .await
    }

    /// Validate and credit a `[nonce, header, mix]` submission.
    async fn submit(
        &self,
        session: &Session,
        id: Value,
        worker: &str,
        params: Vec<String>,
        dialect: Dialect,
    ) -> Result<(), SessionError> {
        let Some(identity) = session.identity().await else {
            return self
                .reply_error(session, id, &RpcError::not_subscribed(), dialect)
                .await;
        };
        let worker = sanitize_worker(worker);

        if params.len() != 3 {
            return self
                .malformed(session, id, &RpcError::invalid_params(), dialect)
                .await;
        }
        if !is_valid_nonce(&params[0]) || !is_valid_hash(&params[1]) || !is_valid_hash(&params[2]) {
            return self
                .malformed(session, id, &RpcError::malformed_pow(), dialect)
                .await;
        }

        let outcome = self
            .validator
            .process_share(&identity.login, &worker, session.ip(), &params)
            .await;
        self.answer_share(session, id, outcome, dialect).await
    }

    async fn answer_share(
        &self,
        session: &Session,
        id: Value,
        outcome: ShareOutcome,
        dialect: Dialect,
    ) -> Result<(), SessionError> {
        let valid = !outcome.exists && outcome.accepted;
        if !self.policy.apply_share_policy(session.ip(), valid) {
            session
                .send_error(id, &RpcError::invalid_share(), dialect)
                .await?;
            return Err(SessionError::InvalidShareLimit);
        }

        if outcome.exists {
            session.send_result(id, json!(false)).await
        } else if outcome.accepted {
            session.send_result(id, json!(true)).await
        } else {
            self.reply_error(session, id, &RpcError::invalid_share(), dialect)
                .await
        }
    }

    /// Push a Stratum job. With `new == false` the current job is re-sent
    /// when there is one.
    async fn send_job(&self, session: &Session, id: Value, new: bool) -> Result<(), SessionError> {
        if !new && session.resend_job().await?.is_some() {
            return Ok(());
        }

        let Some(t) = self.current_template().await else {
            return self
                .reply_error(session, id, &RpcError::work_not_ready(), Dialect::StratumV1)
                .await;
        };
        session.push_new_job(&t.seed, &t.header).await?;
        Ok(())
    }

    async fn current_template(&self) -> Option<Arc<BlockTemplate>> {
        self.template
            .current()
            .await
            .filter(|t| !t.header.is_empty())
    }
}

/// Read one `\n`-terminated line into `line`, without the terminator.
///
/// Returns `Ok(false)` on EOF. Safe to cancel: bytes already consumed stay
/// in `line` for the next call.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<bool, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(false);
        }

        let (used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => {
                line.extend_from_slice(&available[..i]);
                (i + 1, true)
            }
            None => {
                line.extend_from_slice(available);
                (available.len(), false)
            }
        };
        reader.consume(used);

        if line.len() > MAX_REQ_SIZE {
            return Err(SessionError::SocketFlood(MAX_REQ_SIZE));
        }
        if done {
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_line_splits_and_strips() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        tx.write_all(b"{\"a\":1}\n{\"b\":2}\n").await.unwrap();
        drop(tx);

        let mut reader = BufReader::new(rx);
        let mut line = Vec::new();
        assert!(read_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, b"{\"a\":1}");
        line.clear();
        assert!(read_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, b"{\"b\":2}");
        line.clear();
        assert!(!read_line(&mut reader, &mut line).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_line_flood() {
        let (mut tx, rx) = tokio::io::duplex(8192);
        tx.write_all(&vec![b'x'; MAX_REQ_SIZE + 1]).await.unwrap();

        let mut reader = BufReader::with_capacity(MAX_REQ_SIZE, rx);
        let mut line = Vec::new();
        assert!(matches!(
            read_line(&mut reader, &mut line).await,
            Err(SessionError::SocketFlood(MAX_REQ_SIZE))
        ));
    }

    #[tokio::test]
    async fn test_read_line_keeps_partial_across_cancel() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut reader = BufReader::new(rx);
        let mut line = Vec::new();

        tx.write_all(b"{\"par").await.unwrap();
        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            read_line(&mut reader, &mut line),
        )
        .await;
        assert!(timed_out.is_err());

        tx.write_all(b"tial\":true}\n").await.unwrap();
        assert!(read_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, b"{\"partial\":true}");
    }
}
