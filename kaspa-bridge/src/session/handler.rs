//! Per-connection session task.
//!
//! The handler owns one miner's transport and session state. It waits on
//! three things at once: the next message from the miner, the next job queued
//! for this session, and shutdown. Protocol mistakes are answered with an
//! error and the connection stays up; only transport failures end it.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ClientSession, Identity, JobDispatch, SessionContext, SessionState};
use crate::outbox::{now_rfc3339, EventKind};
use crate::share::ShareOutcome;
use crate::stratum::{
    set_difficulty, set_extranonce, AuthorizeParams, ErrorCode, JobFormat, JsonRpcMessage,
    StratumMethod, StratumResult, SubmitParams, SubscribeParams, Transport, PROTOCOL_VERSION,
};
use crate::tracing::prelude::*;
use crate::wallet::parse_identity;

/// Miner software that wants header and timestamp as one hex string.
static BIG_JOB_MINERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)BzMiner|IceRiverMiner").expect("miner regex is valid"));

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRecord<'a> {
    current_time: String,
    ses_uid: &'a str,
    remote_addr: String,
    wallet_addr: &'a str,
    worker_name: &'a str,
    password: &'a str,
    remote_app: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DisconnectRecord<'a> {
    current_time: String,
    ses_uid: &'a str,
    remote_addr: String,
    wallet_addr: &'a str,
    worker_name: &'a str,
}

/// Drives one miner connection.
pub struct SessionHandler<T: Transport> {
    transport: T,
    session: ClientSession,
    ctx: Arc<SessionContext>,
    jobs: Option<mpsc::Receiver<JobDispatch>>,
    shutdown: CancellationToken,
}

async fn next_job(jobs: &mut Option<mpsc::Receiver<JobDispatch>>) -> Option<JobDispatch> {
    match jobs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<T: Transport> SessionHandler<T> {
    pub fn new(
        transport: T,
        remote_addr: SocketAddr,
        ctx: Arc<SessionContext>,
        shutdown: CancellationToken,
    ) -> Self {
        let conn_id = ctx.sessions.next_conn_id();
        let session = ClientSession::new(conn_id, remote_addr, ctx.min_diff);
        Self {
            transport,
            session,
            ctx,
            jobs: None,
            shutdown,
        }
    }

    /// Serve the miner until it disconnects or shutdown is requested.
    pub async fn run(mut self) {
        let conn_id = self.session.conn_id;
        let remote = self.session.remote_addr;
        self.ctx.stats.session_opened();
        debug!(conn_id, remote = %remote, "Session started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(conn_id, "Session closing for shutdown");
                    break;
                }

                msg = self.transport.read_message() => {
                    let result = match msg {
                        Ok(Some(msg)) => self.dispatch(msg).await,
                        Ok(None) => {
                            debug!(conn_id, "Miner disconnected");
                            break;
                        }
                        Err(e) if e.is_recoverable() => {
                            warn!(conn_id, error = %e, "Malformed message from miner");
                            self.reply(JsonRpcMessage::error(
                                Value::Null,
                                ErrorCode::Other,
                                "malformed request",
                            ))
                            .await
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        debug!(conn_id, error = %e, "Connection error");
                        break;
                    }
                }

                Some(dispatch) = next_job(&mut self.jobs) => {
                    if let Err(e) = self.send_job(dispatch).await {
                        debug!(conn_id, error = %e, "Failed to send job");
                        break;
                    }
                }
            }
        }

        self.teardown();
    }

    async fn reply(&mut self, msg: JsonRpcMessage) -> StratumResult<()> {
        self.transport.write_message(&msg).await
    }

    async fn dispatch(&mut self, msg: JsonRpcMessage) -> StratumResult<()> {
        let (id, method, params) = match msg {
            JsonRpcMessage::Request { id, method, params } => (id, method, params),
            // Neither a result nor an error: a request missing its method.
            JsonRpcMessage::Response {
                id,
                result: None,
                error: None,
            } => {
                debug!(conn_id = self.session.conn_id, "Request without a method");
                return self
                    .reply(JsonRpcMessage::error(id, ErrorCode::Other, "malformed request"))
                    .await;
            }
            JsonRpcMessage::Response { .. } => {
                trace!(conn_id = self.session.conn_id, "Ignoring response from miner");
                return Ok(());
            }
        };
        let id = id.unwrap_or(Value::Null);

        match StratumMethod::parse(&method) {
            StratumMethod::Subscribe => self.handle_subscribe(id, &params).await,
            StratumMethod::Authorize => self.handle_authorize(id, &params).await,
            StratumMethod::Submit => self.handle_submit(id, &params).await,
            StratumMethod::ExtranonceSubscribe => {
                self.reply(JsonRpcMessage::result(id, json!(true))).await
            }
            StratumMethod::Unknown(name) => {
                debug!(conn_id = self.session.conn_id, method = %name, "Unknown method");
                self.reply(JsonRpcMessage::error(id, ErrorCode::Other, "unknown method"))
                    .await
            }
        }
    }

    async fn handle_subscribe(&mut self, id: Value, params: &Value) -> StratumResult<()> {
        if self.session.state == SessionState::Connected {
            let subscribe = SubscribeParams::from_params(params);
            self.session.job_format = if BIG_JOB_MINERS.is_match(&subscribe.remote_app) {
                JobFormat::BigJob
            } else {
                JobFormat::Words
            };
            self.session.remote_app = subscribe.remote_app;
            self.session.state = SessionState::Subscribed;
            debug!(
                conn_id = self.session.conn_id,
                remote_app = %self.session.remote_app,
                "Miner subscribed"
            );
        }

        self.reply(JsonRpcMessage::result(id, json!([true, PROTOCOL_VERSION])))
            .await
    }

    async fn handle_authorize(&mut self, id: Value, params: &Value) -> StratumResult<()> {
        match self.session.state {
            // Disconnected sessions never reach dispatch.
            SessionState::Connected | SessionState::Disconnected => {
                return self
                    .reply(JsonRpcMessage::error(id, ErrorCode::NotSubscribed, "not subscribed"))
                    .await;
            }
            SessionState::Authorized | SessionState::Active => {
                return self.reply(JsonRpcMessage::result(id, json!(true))).await;
            }
            SessionState::Subscribed => {}
        }

        let params = match AuthorizeParams::from_params(params) {
            Ok(p) => p,
            Err(e) => {
                return self
                    .reply(JsonRpcMessage::error(id, ErrorCode::Other, e))
                    .await;
            }
        };

        let (wallet, worker) = match parse_identity(&params.username) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(conn_id = self.session.conn_id, error = %e, "Authorization refused");
                return self
                    .reply(JsonRpcMessage::error(id, ErrorCode::Unauthorized, e.to_string()))
                    .await;
            }
        };

        let extranonce = match self.ctx.extranonces.allocate() {
            Ok(e) => e,
            Err(e) => {
                error!(conn_id = self.session.conn_id, error = %e, "Cannot authorize miner");
                return self
                    .reply(JsonRpcMessage::error(id, ErrorCode::Other, e.to_string()))
                    .await;
            }
        };

        let payout = self.ctx.pool_wallet.clone().unwrap_or_else(|| wallet.clone());
        let identity = Identity {
            session_id: Uuid::new_v4().simple().to_string(),
            wallet,
            worker,
            password: params.password,
            payout: payout.clone(),
        };

        info!(
            conn_id = self.session.conn_id,
            session = %identity.session_id,
            wallet = %identity.wallet,
            worker = %identity.worker,
            extranonce = %extranonce,
            "Miner authorized"
        );

        self.ctx.outbox.enqueue_json(
            EventKind::Session,
            &SessionRecord {
                current_time: now_rfc3339(),
                ses_uid: &identity.session_id,
                remote_addr: self.session.remote_addr.to_string(),
                wallet_addr: identity.wallet.as_str(),
                worker_name: &identity.worker,
                password: &identity.password,
                remote_app: &self.session.remote_app,
            },
        );

        self.session.extranonce = extranonce;
        self.session.identity = Some(identity);
        self.session.state = SessionState::Authorized;
        self.jobs = Some(self.ctx.sessions.register(self.session.conn_id, payout.clone()));
        self.ctx.stats.session_authorized();

        self.reply(JsonRpcMessage::result(id, json!(true))).await?;

        if !extranonce.is_empty() {
            self.reply(set_extranonce(&extranonce.to_hex(), extranonce.size()))
                .await?;
        }
        self.reply(set_difficulty(self.session.min_diff.value()))
            .await?;

        match self.ctx.registry.latest_for(&payout) {
            Some(job) => {
                self.send_job(JobDispatch {
                    job,
                    clean_jobs: true,
                })
                .await
            }
            None => {
                self.ctx.refresh.notify_one();
                Ok(())
            }
        }
    }

    async fn handle_submit(&mut self, id: Value, params: &Value) -> StratumResult<()> {
        if !self.session.is_active() {
            return self
                .reply(JsonRpcMessage::error(id, ErrorCode::Unauthorized, "unauthorized worker"))
                .await;
        }

        let params = match SubmitParams::from_params(params) {
            Ok(p) => p,
            Err(e) => {
                debug!(conn_id = self.session.conn_id, error = %e, "Malformed submit");
                return self
                    .reply(JsonRpcMessage::error(id, ErrorCode::Other, e))
                    .await;
            }
        };

        let outcome = self
            .ctx
            .validator
            .handle_submit(&mut self.session, params.job_id, &params.nonce)
            .await;

        match outcome {
            ShareOutcome::Accepted { .. } => {
                self.reply(JsonRpcMessage::result(id, json!(true))).await
            }
            ShareOutcome::Rejected(reason) => {
                debug!(
                    conn_id = self.session.conn_id,
                    job_id = params.job_id,
                    reason = reason.message(),
                    "Share rejected"
                );
                self.reply(JsonRpcMessage::error(id, reason.code(), reason.message()))
                    .await
            }
        }
    }

    /// Send a job unless the miner already has it or something newer.
    async fn send_job(&mut self, dispatch: JobDispatch) -> StratumResult<()> {
        if self
            .session
            .last_job_id
            .is_some_and(|last| dispatch.job.id <= last)
        {
            return Ok(());
        }

        let msg = dispatch
            .job
            .notification(dispatch.clean_jobs)
            .to_message(self.session.job_format);
        self.reply(msg).await?;

        self.session.last_job_id = Some(dispatch.job.id);
        if self.session.state == SessionState::Authorized {
            self.session.state = SessionState::Active;
        }
        trace!(conn_id = self.session.conn_id, job_id = dispatch.job.id, "Job sent");
        Ok(())
    }

    fn teardown(&mut self) {
        let was_registered = self.jobs.take().is_some();
        if was_registered {
            self.ctx.sessions.deregister(self.session.conn_id);
        }
        self.ctx.extranonces.release(self.session.extranonce);

        if let Some(identity) = self.session.identity.as_ref() {
            self.ctx.outbox.enqueue_json(
                EventKind::Disconnect,
                &DisconnectRecord {
                    current_time: now_rfc3339(),
                    ses_uid: &identity.session_id,
                    remote_addr: self.session.remote_addr.to_string(),
                    wallet_addr: identity.wallet.as_str(),
                    worker_name: &identity.worker,
                },
            );
            info!(
                conn_id = self.session.conn_id,
                session = %identity.session_id,
                worker = %identity.worker,
                "Miner disconnected"
            );
        }

        self.session.state = SessionState::Disconnected;
        self.ctx.stats.session_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::mock::{template, MockNode};
    use crate::outbox::Outbox;
    use crate::pow::DoubleSha256;
    use crate::registry::JobRegistry;
    use crate::session::extranonce::ExtranonceAllocator;
    use crate::session::SessionSet;
    use crate::share::ShareValidator;
    use crate::stats::BridgeStats;
    use crate::stratum::{MockTransport, MockTransportHandle};
    use crate::types::Difficulty;
    use crate::wallet::test_addresses::{MINER_A, MINER_B};
    use crate::wallet::WalletAddress;
    use tokio::sync::Notify;

    struct Harness {
        ctx: Arc<SessionContext>,
        miner: MockTransportHandle,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn context(extranonce_size: usize, pool_wallet: Option<&str>) -> Arc<SessionContext> {
        let registry = Arc::new(JobRegistry::new(8));
        let stats = Arc::new(BridgeStats::new());
        let outbox = Arc::new(Outbox::new("kaspa", stats.clone()));
        let (node, _notify) = MockNode::new();
        let validator = Arc::new(ShareValidator::new(
            registry.clone(),
            Arc::new(node),
            Arc::new(DoubleSha256),
            outbox.clone(),
            stats.clone(),
        ));
        Arc::new(SessionContext {
            registry,
            sessions: Arc::new(SessionSet::new()),
            extranonces: Arc::new(ExtranonceAllocator::new(extranonce_size)),
            validator,
            outbox,
            stats,
            refresh: Arc::new(Notify::new()),
            min_diff: Difficulty::new(4),
            pool_wallet: pool_wallet.map(|w| WalletAddress::parse(w).unwrap()),
        })
    }

    fn start(ctx: Arc<SessionContext>) -> Harness {
        let (transport, miner) = MockTransport::pair();
        let shutdown = CancellationToken::new();
        let handler = SessionHandler::new(
            transport,
            "10.0.0.7:51000".parse().unwrap(),
            ctx.clone(),
            shutdown.clone(),
        );
        let task = tokio::spawn(handler.run());
        Harness {
            ctx,
            miner,
            shutdown,
            task,
        }
    }

    fn request(id: u64, method: &str, params: Value) -> JsonRpcMessage {
        JsonRpcMessage::request(id, method, params)
    }

    fn error_code(msg: &JsonRpcMessage) -> Option<i64> {
        match msg {
            JsonRpcMessage::Response { error: Some(e), .. } => e[0].as_i64(),
            _ => None,
        }
    }

    async fn subscribe(h: &mut Harness, app: &str) {
        h.miner
            .send(request(1, "mining.subscribe", json!([app, "EthereumStratum/1.0.0"])));
        let reply = h.miner.recv().await;
        assert_eq!(
            reply,
            JsonRpcMessage::result(json!(1), json!([true, "EthereumStratum/1.0.0"]))
        );
    }

    #[tokio::test]
    async fn test_authorize_emits_session_event() {
        let mut h = start(context(0, None));
        let job = h
            .ctx
            .registry
            .publish(template(&WalletAddress::parse(MINER_A).unwrap(), 1, 0x1d00ffff));

        subscribe(&mut h, "lolMiner 1.8").await;
        h.miner.send(request(
            2,
            "mining.authorize",
            json!([format!("{}.rig1", MINER_A), "secret"]),
        ));

        assert_eq!(
            h.miner.recv().await,
            JsonRpcMessage::result(json!(2), json!(true))
        );
        // No extranonce at width 0; difficulty then the cached job.
        let diff = h.miner.recv().await;
        assert_eq!(diff.method(), Some("mining.set_difficulty"));
        let notify = h.miner.recv().await;
        assert_eq!(notify.method(), Some("mining.notify"));
        match notify {
            JsonRpcMessage::Request { params, .. } => {
                assert_eq!(params[0], job.id.to_string());
                assert!(params[1].is_array());
            }
            _ => panic!("expected notification"),
        }

        assert_eq!(h.ctx.outbox.pending(), 1);
        assert_eq!(h.ctx.sessions.len(), 1);

        h.shutdown.cancel();
        h.task.await.unwrap();

        // Session event, then disconnect event.
        assert_eq!(h.ctx.outbox.pending(), 2);
        assert_eq!(h.ctx.sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_session_event_payload() {
        let mut h = start(context(0, None));
        subscribe(&mut h, "IceRiverMiner-v1.1").await;
        h.miner.send(request(
            2,
            "mining.authorize",
            json!([format!("{}.rig1", MINER_A), "x"]),
        ));
        h.miner.recv().await;

        let backend = Arc::new(crate::outbox::mock::MockBackend::ok());
        let dir = tempfile::tempdir().unwrap();
        let drain_shutdown = CancellationToken::new();
        let drain = tokio::spawn(h.ctx.outbox.clone().run_drain(
            backend.clone(),
            crate::outbox::DeadLetterWriter::new(dir.path()),
            std::time::Duration::from_millis(10),
            drain_shutdown.clone(),
        ));
        for _ in 0..100 {
            if h.ctx.outbox.pending() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        drain_shutdown.cancel();
        drain.await.unwrap();

        let calls = backend.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        let (coin, method, input) = &calls[0];
        assert_eq!(coin, "kaspa");
        assert_eq!(method, "session");

        let payload: Value = serde_json::from_str(input).unwrap();
        assert_eq!(payload["WalletAddr"], MINER_A);
        assert_eq!(payload["WorkerName"], "rig1");
        assert_eq!(payload["Password"], "x");
        assert_eq!(payload["RemoteAddr"], "10.0.0.7:51000");
        assert_eq!(payload["RemoteApp"], "IceRiverMiner-v1.1");
        let uid = payload["SesUid"].as_str().unwrap();
        assert_eq!(uid.len(), 32);
        assert!(uid.chars().all(|c| c.is_ascii_hexdigit()));

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_authorize_before_subscribe_is_refused() {
        let mut h = start(context(0, None));
        h.miner
            .send(request(1, "mining.authorize", json!([MINER_A, "x"])));
        let reply = h.miner.recv().await;
        assert_eq!(error_code(&reply), Some(25));
        assert_eq!(h.ctx.outbox.pending(), 0);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_before_authorize_is_unauthorized() {
        let mut h = start(context(0, None));
        subscribe(&mut h, "miner").await;
        h.miner
            .send(request(2, "mining.submit", json!([MINER_A, "1", "00"])));
        assert_eq!(error_code(&h.miner.recv().await), Some(24));

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_method_and_garbage_keep_connection() {
        let mut h = start(context(0, None));
        h.miner.send(request(1, "eth_submitLogin", json!([])));
        assert_eq!(error_code(&h.miner.recv().await), Some(20));

        h.miner.send_raw("{this is not json");
        assert_eq!(error_code(&h.miner.recv().await), Some(20));

        // Still serving.
        subscribe(&mut h, "miner").await;

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_without_method_is_answered() {
        let mut h = start(context(0, None));

        h.miner.send_raw(r#"{"id":7,"params":["x"]}"#);
        let reply = h.miner.recv().await;
        assert_eq!(error_code(&reply), Some(20));
        assert_eq!(reply.id(), Some(&json!(7)));

        // A real response from the miner is ignored and the connection stays up.
        h.miner.send_raw(r#"{"id":8,"result":true,"error":null}"#);
        subscribe(&mut h, "miner").await;

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_wallet_is_refused() {
        let mut h = start(context(0, None));
        subscribe(&mut h, "miner").await;
        h.miner
            .send(request(2, "mining.authorize", json!(["not-a-wallet.rig", "x"])));
        assert_eq!(error_code(&h.miner.recv().await), Some(24));
        assert_eq!(h.ctx.sessions.len(), 0);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_extranonce_and_big_job_format() {
        let mut h = start(context(2, None));
        let job = h
            .ctx
            .registry
            .publish(template(&WalletAddress::parse(MINER_A).unwrap(), 9, 0x1d00ffff));

        subscribe(&mut h, "BzMiner-v17").await;
        h.miner
            .send(request(2, "mining.authorize", json!([MINER_A, "x"])));
        h.miner.recv().await;

        let set_en = h.miner.recv().await;
        assert_eq!(set_en.method(), Some("mining.set_extranonce"));
        match set_en {
            JsonRpcMessage::Request { params, .. } => assert_eq!(params, json!(["0000", 6])),
            _ => panic!("expected notification"),
        }
        assert_eq!(h.miner.recv().await.method(), Some("mining.set_difficulty"));

        match h.miner.recv().await {
            JsonRpcMessage::Request { params, .. } => {
                assert_eq!(params[0], job.id.to_string());
                assert_eq!(params[1].as_str().unwrap().len(), 80);
                assert_eq!(params[2], true);
            }
            _ => panic!("expected notification"),
        }

        h.shutdown.cancel();
        h.task.await.unwrap();
        assert_eq!(h.ctx.extranonces.in_use(), 0);
    }

    #[tokio::test]
    async fn test_missing_job_requests_refresh_then_broadcast_activates() {
        let mut h = start(context(0, Some(MINER_B)));
        subscribe(&mut h, "miner").await;
        h.miner
            .send(request(2, "mining.authorize", json!([MINER_A, "x"])));
        h.miner.recv().await;
        assert_eq!(h.miner.recv().await.method(), Some("mining.set_difficulty"));

        // Nothing cached: the work source is asked for a template.
        tokio::time::timeout(std::time::Duration::from_secs(1), h.ctx.refresh.notified())
            .await
            .expect("refresh requested");

        // The pool wallet, not the miner's, is the payout address.
        assert_eq!(
            h.ctx.sessions.payout_addresses(),
            vec![WalletAddress::parse(MINER_B).unwrap()]
        );

        let job = h
            .ctx
            .registry
            .publish(template(&WalletAddress::parse(MINER_B).unwrap(), 3, 0x1d00ffff));
        assert_eq!(h.ctx.sessions.broadcast(&job, true), 1);
        assert_eq!(h.miner.recv().await.method(), Some("mining.notify"));

        // Active now, so a submit reaches the validator; a stale id proves it.
        h.miner
            .send(request(3, "mining.submit", json!([MINER_A, "999", "00"])));
        assert_eq!(error_code(&h.miner.recv().await), Some(21));

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_miner_disconnect_releases_resources() {
        let h = start(context(1, None));
        let Harness {
            ctx,
            mut miner,
            task,
            ..
        } = h;

        miner.send(request(1, "mining.subscribe", json!(["m"])));
        miner.recv().await;
        miner.send(request(2, "mining.authorize", json!([MINER_A, "x"])));
        miner.recv().await;
        assert_eq!(ctx.extranonces.in_use(), 1);

        drop(miner);
        task.await.unwrap();

        assert_eq!(ctx.extranonces.in_use(), 0);
        assert_eq!(ctx.sessions.len(), 0);
        assert_eq!(ctx.stats.snapshot(0, 0).sessions_live, 0);
    }
}
