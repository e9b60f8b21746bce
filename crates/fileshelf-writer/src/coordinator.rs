//! Replicated write coordinator
//!
//! Every mutation is published to the shared bus and applied by whichever
//! node consumes it; the originating node waits for the completion keyed by
//! the command's correlation id. Readiness (snapshot bootstrap, then schema
//! migration) is reached once and shared by all callers.

use crate::command::{Command, Envelope, SavePayload};
use crate::sync::{self, SnapshotServer};
use fileshelf_bus::{Message, MessageBus, Subscription};
use fileshelf_common::{Config, Error, NodeMode, Result};
use fileshelf_meta_store::MetaIndex;
use fileshelf_storage::BlobStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Initialization state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Uninitialized,
    Pending,
    Ready,
    /// Last initialization failed; the next caller retries
    Failed(String),
}

/// Coordinator counters
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Commands published by this node
    pub commits: AtomicU64,
    /// Commands applied to the local index
    pub applied: AtomicU64,
    /// Commands that failed to apply
    pub failed: AtomicU64,
    /// Deliveries dropped as malformed or unroutable
    pub dropped: AtomicU64,
    /// Commits that gave up waiting for completion
    pub timeouts: AtomicU64,
}

type Waiter = oneshot::Sender<Result<()>>;

struct Inner {
    config: Config,
    index: Arc<MetaIndex>,
    blobs: Arc<BlobStore>,
    bus: Arc<dyn MessageBus>,
    state: watch::Sender<Readiness>,
    pending: Mutex<HashMap<Uuid, Waiter>>,
    stats: CoordinatorStats,
    listener: Mutex<Option<JoinHandle<()>>>,
    snapshot_server: Mutex<Option<SnapshotServer>>,
}

/// Owns the single write path of a node
#[derive(Clone)]
pub struct WriteCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WriteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoordinator")
            .field("node", &self.inner.config.node.name)
            .field("mode", &self.inner.config.node.mode)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl WriteCoordinator {
    pub fn new(
        config: Config,
        index: Arc<MetaIndex>,
        blobs: Arc<BlobStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let (state, _) = watch::channel(Readiness::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                config,
                index,
                blobs,
                bus,
                state,
                pending: Mutex::new(HashMap::new()),
                stats: CoordinatorStats::default(),
                listener: Mutex::new(None),
                snapshot_server: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn mode(&self) -> NodeMode {
        self.inner.config.node.mode
    }

    #[must_use]
    pub fn readiness(&self) -> Readiness {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn stats(&self) -> &CoordinatorStats {
        &self.inner.stats
    }

    /// Endpoint of the snapshot server, once a primary is ready
    #[must_use]
    pub fn snapshot_endpoint(&self) -> Option<String> {
        self.inner
            .snapshot_server
            .lock()
            .as_ref()
            .map(|s| s.endpoint().to_string())
    }

    /// Attach to the bus and start applying commands
    ///
    /// The claim is retried with exponential backoff; running out of
    /// attempts is fatal for the node.
    pub async fn start(&self) -> Result<()> {
        if self.inner.listener.lock().is_some() {
            return Ok(());
        }

        let subscription = self.attach_with_retry().await?;
        let task = tokio::spawn(self.clone().listen(subscription));

        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            // Lost a race with a concurrent start
            task.abort();
        } else {
            *listener = Some(task);
        }
        Ok(())
    }

    async fn attach_with_retry(&self) -> Result<Subscription> {
        let bus_config = &self.inner.config.bus;
        let exchange = bus_config.exchange.as_str();
        let mode = self.mode();
        let attempts = bus_config.connect_attempts.max(1);
        let mut backoff = bus_config.connect_backoff();

        let mut attempt = 1;
        loop {
            let result = if mode.is_exclusive() {
                self.inner.bus.consume_exclusive(exchange).await
            } else {
                self.inner.bus.subscribe(exchange).await
            };

            match result {
                Ok(subscription) => {
                    info!(
                        bus = self.inner.bus.name(),
                        exchange,
                        %mode,
                        "listening for write commands"
                    );
                    return Ok(subscription);
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, ?backoff, "bus attach failed, retrying");
                    sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempts, error = %e, "bus attach failed, giving up");
                    return Err(Error::bus(format!(
                        "could not attach to exchange {exchange} after {attempts} attempts: {e}"
                    )));
                }
            }
        }
    }

    /// Stop listening and shut down the snapshot server
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.listener.lock().take() {
            task.abort();
        }
        self.inner.snapshot_server.lock().take();
        debug!(node = %self.inner.config.node.name, "coordinator stopped");
    }

    /// Wait until the node is ready, initializing it if nobody has yet
    ///
    /// Concurrent callers share one initialization. Callers that waited on a
    /// failed attempt get the error; later callers start a fresh attempt.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let mut waited = false;
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(reason) if waited => return Err(Error::NotReady(reason)),
                Readiness::Uninitialized | Readiness::Failed(_) => self.begin_initialization(),
                Readiness::Pending => {
                    waited = true;
                    rx.changed()
                        .await
                        .map_err(|_| Error::internal("coordinator dropped during initialization"))?;
                }
            }
        }
    }

    fn begin_initialization(&self) {
        let claimed = self.inner.state.send_if_modified(|state| match state {
            Readiness::Uninitialized | Readiness::Failed(_) => {
                *state = Readiness::Pending;
                true
            }
            Readiness::Pending | Readiness::Ready => false,
        });
        if claimed {
            // Detached so a cancelled caller cannot strand the state in Pending
            let this = self.clone();
            tokio::spawn(async move { this.initialize().await });
        }
    }

    async fn initialize(&self) {
        match self.bootstrap().await {
            Ok(version) => {
                // Replicas may bootstrap as soon as the primary reports ready
                if self.mode() == NodeMode::Primary {
                    self.start_snapshot_server().await;
                }
                self.inner.state.send_replace(Readiness::Ready);
                info!(
                    node = %self.inner.config.node.name,
                    mode = %self.mode(),
                    schema_version = version,
                    "coordinator ready"
                );
            }
            Err(e) => {
                error!(error = %e, "coordinator initialization failed");
                self.inner
                    .state
                    .send_replace(Readiness::Failed(e.to_string()));
            }
        }
    }

    async fn bootstrap(&self) -> Result<u32> {
        let config = &self.inner.config;
        if config.node.mode == NodeMode::Replica {
            let snapshot = sync::fetch_snapshot(
                self.inner.bus.as_ref(),
                &config.bus.sync_exchange(),
                &config.sync,
            )
            .await?;
            self.inner.index.restore(&snapshot)?;
        }
        self.inner.index.migrate()
    }

    async fn start_snapshot_server(&self) {
        if self.inner.snapshot_server.lock().is_some() {
            return;
        }
        let config = &self.inner.config;
        match SnapshotServer::start(
            self.inner.index.clone(),
            self.inner.bus.clone(),
            &config.bus.sync_exchange(),
            &config.sync,
        )
        .await
        {
            Ok(server) => *self.inner.snapshot_server.lock() = Some(server),
            Err(e) => error!(error = %e, "failed to start snapshot server"),
        }
    }

    /// Publish `command` and wait until this node has applied it
    pub async fn commit(&self, command: Command) -> Result<()> {
        self.ready().await?;

        let correlation_id = Uuid::new_v4();
        let action = command.action();
        let file_id = command.file_id();
        let payload = Envelope::new(command, correlation_id).encode()?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(correlation_id, tx);

        let message = Message::with_correlation_id(correlation_id, payload);
        if let Err(e) = self
            .inner
            .bus
            .publish(&self.inner.config.bus.exchange, message)
            .await
        {
            self.inner.pending.lock().remove(&correlation_id);
            return Err(e);
        }
        self.inner.stats.commits.fetch_add(1, Ordering::Relaxed);
        debug!(%correlation_id, action, %file_id, "command published");

        let wait = self.inner.config.writer.commit_timeout();
        match timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::internal("commit waiter dropped")),
            Err(_) => {
                self.inner.pending.lock().remove(&correlation_id);
                self.inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(%correlation_id, action, %file_id, ?wait, "commit timed out");
                Err(Error::CommitTimeout(correlation_id))
            }
        }
    }

    /// Commands waiting for completion
    #[must_use]
    pub fn pending_commits(&self) -> usize {
        self.inner.pending.lock().len()
    }

    async fn listen(self, mut subscription: Subscription) {
        while let Some(mut delivery) = subscription.next().await {
            let ready = self.ready().await;
            delivery.ack();
            if let Err(e) = ready {
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    correlation_id = %delivery.correlation_id(),
                    error = %e,
                    "node not ready, dropping command"
                );
                continue;
            }
            self.handle(delivery.payload()).await;
        }
        warn!(exchange = %self.inner.config.bus.exchange, "bus subscription closed");
    }

    async fn handle(&self, payload: &[u8]) {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping malformed command");
                return;
            }
        };

        let correlation_id = envelope.correlation_id;
        let action = envelope.command.action();
        let file_id = envelope.command.file_id();
        let result = self.apply(envelope.command).await;
        match &result {
            Ok(()) => {
                self.inner.stats.applied.fetch_add(1, Ordering::Relaxed);
                debug!(%correlation_id, action, %file_id, "command applied");
            }
            Err(e) => {
                self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                info!(%correlation_id, action, %file_id, error = %e, "command rejected");
            }
        }

        if let Some(waiter) = self.inner.pending.lock().remove(&correlation_id) {
            let _ = waiter.send(result);
        }
    }

    async fn apply(&self, command: Command) -> Result<()> {
        let replicate_blobs = self.inner.config.writer.replicate_blobs;
        match command {
            Command::Save(SavePayload {
                id,
                slug,
                metadata,
                data,
            }) => {
                self.inner.index.apply_save(id, &slug, &metadata)?;
                if replicate_blobs {
                    if let Some(data) = data {
                        self.inner.blobs.write(id, &data).await?;
                    }
                }
            }
            Command::Remove(payload) => {
                self.inner.index.apply_remove(payload.id)?;
                if replicate_blobs {
                    self.inner.blobs.delete(payload.id).await?;
                }
            }
        }
        Ok(())
    }
}
