//! Direction-agnostic replication orchestrator (spec.md §4.7), specialised
//! as [`puller`] or [`pusher`]. Follows the actor-per-entity idiom: one
//! `tokio::task` owns all mutable state and is driven exclusively through
//! [`Command`] messages, mirroring the single-threaded work executor the
//! original design assumed (SPEC_FULL.md §5 "Realization").

mod puller;
mod pusher;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::blob_store::BlobStore;
use crate::checkpoint::{checkpoint_id, Checkpoint};
use crate::config::{Direction, ReplicationConfig, RETRY_DELAY};
use crate::error::ReplicatorError;
use crate::local_store::LocalStore;
use crate::transport::HttpTransport;

/// Coarse lifecycle state, derived from `(running, online, activeWork>0)`
/// exactly as spec.md §4.7 lays out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    Stopped,
    Offline,
    Idle,
    Active,
}

/// Shared collaborators and per-run configuration handed to the pull/push
/// strategy functions. Cheap to clone: everything here is an `Arc` or a
/// small owned value.
#[derive(Clone)]
pub(crate) struct ReplicationContext {
    pub transport: Arc<dyn HttpTransport>,
    pub local_store: Arc<dyn LocalStore>,
    pub blob_store: BlobStore,
    pub config: ReplicationConfig,
    pub checkpoint: Arc<Checkpoint>,
    pub checkpoint_id: String,
    pub semaphore: Arc<Semaphore>,
    /// Revisions that failed to store/upload this pass (spec.md §4.7
    /// `revisionsFailed`), reset at the start of every pass and mirrored on
    /// [`ReplicationHandle::revisions_failed`].
    pub revisions_failed: Arc<AtomicUsize>,
}

/// Publishes `Active`/`Idle` transitions as the inbox goes from empty to
/// non-empty and back, the `activeWork` half of spec.md §4.7's state
/// formula (`running`/`online` are already fixed to true while a
/// replication pass is executing).
pub(crate) struct Progress {
    state_tx: watch::Sender<ReplicationState>,
    active_work: AtomicUsize,
}

impl Progress {
    fn new(state_tx: watch::Sender<ReplicationState>) -> Self {
        Progress {
            state_tx,
            active_work: AtomicUsize::new(0),
        }
    }

    fn enter(&self) {
        if self.active_work.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = self.state_tx.send(ReplicationState::Active);
        }
    }

    fn exit(&self) {
        if self.active_work.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.state_tx.send(ReplicationState::Idle);
        }
    }
}

enum Command {
    Start(oneshot::Sender<Result<(), ReplicatorError>>),
    Stop(oneshot::Sender<()>),
    GoOffline,
    GoOnline,
}

/// A running (or stoppable) replication. Cloning is cheap; every clone talks
/// to the same background actor task.
#[derive(Clone)]
pub struct ReplicationHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ReplicationState>,
    last_error_rx: watch::Receiver<Option<String>>,
    revisions_failed: Arc<AtomicUsize>,
}

impl ReplicationHandle {
    pub async fn start(&self) -> Result<(), ReplicatorError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Start(tx)).await;
        rx.await.unwrap_or(Err(ReplicatorError::Cancelled))
    }

    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Stop(tx)).await;
        let _ = rx.await;
    }

    pub async fn go_offline(&self) {
        let _ = self.cmd_tx.send(Command::GoOffline).await;
    }

    pub async fn go_online(&self) {
        let _ = self.cmd_tx.send(Command::GoOnline).await;
    }

    pub fn state(&self) -> ReplicationState {
        *self.state_rx.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error_rx.borrow().clone()
    }

    /// Revisions that failed to store/upload during the current (or most
    /// recently completed) pass (spec.md §4.7 `revisionsFailed`).
    pub fn revisions_failed(&self) -> usize {
        self.revisions_failed.load(Ordering::SeqCst)
    }
}

/// Entry point: spawns the actor task and returns a handle to it. Nothing
/// runs until [`ReplicationHandle::start`] is called.
pub struct ReplicationCore;

impl ReplicationCore {
    pub fn spawn(
        config: ReplicationConfig,
        transport: Arc<dyn HttpTransport>,
        local_store: Arc<dyn LocalStore>,
        blob_store: BlobStore,
    ) -> ReplicationHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ReplicationState::Stopped);
        let (error_tx, error_rx) = watch::channel(None);
        let revisions_failed = Arc::new(AtomicUsize::new(0));

        tokio::spawn(actor_loop(
            config,
            transport,
            local_store,
            blob_store,
            cmd_rx,
            state_tx,
            error_tx,
            revisions_failed.clone(),
        ));

        ReplicationHandle {
            cmd_tx,
            state_rx,
            last_error_rx: error_rx,
            revisions_failed,
        }
    }
}

async fn actor_loop(
    config: ReplicationConfig,
    transport: Arc<dyn HttpTransport>,
    local_store: Arc<dyn LocalStore>,
    blob_store: BlobStore,
    mut cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ReplicationState>,
    error_tx: watch::Sender<Option<String>>,
    revisions_failed: Arc<AtomicUsize>,
) {
    let mut running = false;
    let mut online = true;
    let mut work: Option<tokio::task::JoinHandle<Result<(), ReplicatorError>>> = None;
    let mut backoff = Backoff::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Start(reply) => {
                        if running {
                            let _ = reply.send(Err(ReplicatorError::AlreadyRunning));
                            continue;
                        }
                        if local_store.is_closed().await {
                            let _ = reply.send(Err(ReplicatorError::LocalStoreClosed));
                            continue;
                        }
                        running = true;
                        let _ = state_tx.send(ReplicationState::Idle);
                        work = Some(spawn_pass(&config, &transport, &local_store, &blob_store, &state_tx, &revisions_failed));
                        let _ = reply.send(Ok(()));
                    }
                    Command::Stop(reply) => {
                        running = false;
                        if let Some(handle) = work.take() {
                            handle.abort();
                        }
                        let _ = state_tx.send(ReplicationState::Stopped);
                        let _ = reply.send(());
                    }
                    Command::GoOffline => {
                        if running {
                            online = false;
                            if let Some(handle) = work.take() {
                                handle.abort();
                            }
                            let _ = state_tx.send(ReplicationState::Offline);
                        }
                    }
                    Command::GoOnline => {
                        if running && !online {
                            online = true;
                            let _ = state_tx.send(ReplicationState::Idle);
                            work = Some(spawn_pass(&config, &transport, &local_store, &blob_store, &state_tx, &revisions_failed));
                        }
                    }
                }
            }
            result = async { work.as_mut().unwrap().await }, if work.is_some() => {
                work = None;
                if !running || !online {
                    continue;
                }

                // Auth failures are not retried (spec.md §7 rule 2): the
                // replication stops and waits for a human to fix credentials
                // rather than hammering the remote with a bad login.
                let fatal_auth_error = matches!(&result, Ok(Err(ReplicatorError::Auth(_))));
                let mut had_error = false;

                match result {
                    Ok(Ok(())) => {
                        backoff.reset();
                    }
                    Ok(Err(e)) => {
                        had_error = true;
                        let _ = error_tx.send(Some(e.to_string()));
                    }
                    Err(join_err) if join_err.is_cancelled() => {}
                    Err(join_err) => {
                        had_error = true;
                        let _ = error_tx.send(Some(join_err.to_string()));
                    }
                }

                if fatal_auth_error || !config.continuous {
                    running = false;
                    let _ = state_tx.send(ReplicationState::Stopped);
                    continue;
                }

                // A clean pass polls again at the steady cadence; a
                // transient failure backs off exponentially instead
                // (spec.md §7 rule 1), resetting once a pass succeeds.
                let delay = if had_error { backoff.next() } else { RETRY_DELAY };
                tokio::time::sleep(delay).await;
                if running && online {
                    let _ = state_tx.send(ReplicationState::Idle);
                    work = Some(spawn_pass(&config, &transport, &local_store, &blob_store, &state_tx, &revisions_failed));
                }
            }
        }
    }
}

fn spawn_pass(
    config: &ReplicationConfig,
    transport: &Arc<dyn HttpTransport>,
    local_store: &Arc<dyn LocalStore>,
    blob_store: &BlobStore,
    state_tx: &watch::Sender<ReplicationState>,
    revisions_failed: &Arc<AtomicUsize>,
) -> tokio::task::JoinHandle<Result<(), ReplicatorError>> {
    let config = config.clone();
    let transport = transport.clone();
    let local_store = local_store.clone();
    let blob_store = blob_store.clone();
    let state_tx = state_tx.clone();
    let revisions_failed = revisions_failed.clone();
    tokio::spawn(async move {
        run_pass(config, transport, local_store, blob_store, state_tx, revisions_failed).await
    })
}

async fn run_pass(
    config: ReplicationConfig,
    transport: Arc<dyn HttpTransport>,
    local_store: Arc<dyn LocalStore>,
    blob_store: BlobStore,
    state_tx: watch::Sender<ReplicationState>,
    revisions_failed: Arc<AtomicUsize>,
) -> Result<(), ReplicatorError> {
    let session_id = Uuid::new_v4().to_string();
    local_store.add_active_replication(&session_id).await?;

    // Each pass starts counting failures fresh (spec.md §4.7 scopes
    // `revisionsFailed` to "this pass").
    revisions_failed.store(0, Ordering::SeqCst);

    let result = drive_replication(
        &config,
        &transport,
        &local_store,
        &blob_store,
        &state_tx,
        &revisions_failed,
    )
    .await;

    local_store.forget_replication(&session_id).await?;
    result
}

async fn drive_replication(
    config: &ReplicationConfig,
    transport: &Arc<dyn HttpTransport>,
    local_store: &Arc<dyn LocalStore>,
    blob_store: &BlobStore,
    state_tx: &watch::Sender<ReplicationState>,
    revisions_failed: &Arc<AtomicUsize>,
) -> Result<(), ReplicatorError> {
    if let Some(authorizer) = &config.authorizer {
        ensure_authenticated(transport, &config.remote_url, authorizer.as_ref()).await?;
    }

    let local_uuid = local_store.private_uuid().await?;
    let id = checkpoint_id(&local_uuid, &config.remote_url, config.direction == Direction::Push);
    let checkpoint = Arc::new(Checkpoint::new(transport.clone(), config.remote_url.clone(), id.clone()));

    let starting_seq = resolve_starting_sequence(config, transport, local_store, &checkpoint, &id).await?;

    let ctx = ReplicationContext {
        transport: transport.clone(),
        local_store: local_store.clone(),
        blob_store: blob_store.clone(),
        config: config.clone(),
        checkpoint: checkpoint.clone(),
        checkpoint_id: id.clone(),
        semaphore: Arc::new(Semaphore::new(config.remote_concurrency)),
        revisions_failed: revisions_failed.clone(),
    };
    let progress = Arc::new(Progress::new(state_tx.clone()));

    let durable_seq = match config.direction {
        Direction::Pull => puller::run(&ctx, starting_seq, &progress).await?,
        Direction::Push => pusher::run(&ctx, starting_seq, &progress).await?,
    };

    // The debounced `schedule_save` calls made during the pass (puller.rs,
    // pusher.rs) may still have a timer outstanding; this final `save` is
    // the authoritative, awaited write that must land before the local
    // store's own cached checkpoint sequence is advanced.
    if let Some(seq) = durable_seq {
        checkpoint.save(seq.clone()).await.map_err(ReplicatorError::Checkpoint)?;
        local_store
            .set_last_sequence(&id, &seq, config.direction == Direction::Push)
            .await?;
    }

    Ok(())
}

/// spec.md §4.7 step 3: if the authorizer drives cookie-based login, probe
/// `<db>/_session` then `<root>/_session`; log in only if neither reports an
/// authenticated `userCtx.name`.
async fn ensure_authenticated(
    transport: &Arc<dyn HttpTransport>,
    remote_url: &str,
    authorizer: &dyn crate::authorizer::Authorizer,
) -> Result<(), ReplicatorError> {
    if !authorizer.uses_cookie_based_login() {
        return Ok(());
    }

    let url = reqwest::Url::parse(remote_url)
        .map_err(|e| ReplicatorError::Auth(format!("invalid remote url: {e}")))?;
    let mut root = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        root.push_str(&format!(":{port}"));
    }

    let db_session_url = format!("{}/_session", remote_url.trim_end_matches('/'));
    let response = transport.get(&db_session_url).await?;
    let response = if response.status().as_u16() == 404 {
        transport.get(&format!("{root}/_session")).await?
    } else {
        response
    };

    if response.status().is_success() {
        let body: Value = response.json().await?;
        let name = body
            .get("userCtx")
            .and_then(|u| u.get("name"))
            .and_then(Value::as_str);
        if matches!(name, Some(n) if !n.is_empty()) {
            return Ok(());
        }
    }

    let params = authorizer
        .login_parameters_for_site(&root)
        .ok_or_else(|| ReplicatorError::Auth("authorizer has no login parameters for site".into()))?;
    let login_path = authorizer.login_path_for_site(&root);
    let login_url = format!("{root}{login_path}");
    let body = serde_json::to_value(&params)?;
    let response = transport.post_json(&login_url, &body).await?;
    if !response.status().is_success() {
        return Err(ReplicatorError::Auth(format!(
            "login to {login_url} failed with status {}",
            response.status()
        )));
    }
    Ok(())
}

/// spec.md §4.7 step 4: fetch the remote checkpoint doc, creating the
/// target database first if this is a push with `createTarget` and none
/// exists yet. Falls back to sequence `"0"` on a checkpoint mismatch
/// between the remote's record and the local store's cached value.
async fn resolve_starting_sequence(
    config: &ReplicationConfig,
    transport: &Arc<dyn HttpTransport>,
    local_store: &Arc<dyn LocalStore>,
    checkpoint: &Checkpoint,
    checkpoint_id: &str,
) -> Result<String, ReplicatorError> {
    match checkpoint.fetch().await.map_err(ReplicatorError::Checkpoint)? {
        Some(state) => {
            let remote_seq = state.last_sequence.unwrap_or_else(|| "0".to_string());
            let local_cached = local_store.last_sequence_for(checkpoint_id).await?;
            if local_cached.as_deref() == Some(remote_seq.as_str()) {
                Ok(remote_seq)
            } else {
                tracing::warn!(
                    checkpoint_id,
                    remote = %remote_seq,
                    local = ?local_cached,
                    "checkpoint mismatch between remote and local store, restarting from 0"
                );
                Ok("0".to_string())
            }
        }
        None => {
            if config.direction == Direction::Push && config.create_target {
                maybe_create_remote_db(transport, config).await?;
            }
            Ok("0".to_string())
        }
    }
}

async fn maybe_create_remote_db(
    transport: &Arc<dyn HttpTransport>,
    config: &ReplicationConfig,
) -> Result<(), ReplicatorError> {
    // A 412 (already exists) is an acceptable outcome here, not a failure.
    let _ = transport.client().put(&config.remote_url).send().await?;
    Ok(())
}

pub use crate::config::{Direction as ReplicationDirection, ReplicationConfig as Config};

/// Percent-encodes a single path segment (a document id) for inclusion in a
/// request URL.
pub(crate) fn encode_path_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
