//! A vault node: seal state, leadership, and request routing.
//!
//! Phases run `Sealed → Unsealing → {Standby ⇄ Active} → Sealing → Sealed`.
//! Without an HA backend an unsealed node is simply active. With one, an
//! unsealed node starts as a standby and runs an election task that takes
//! the storage lock when it can; holding that lock is the only way to be
//! active.
//!
//! All mutable node state lives behind one async mutex. Network I/O (TLS
//! handshakes, forwarded round trips, listener drain) happens outside it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustls::ClientConfig;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use zvault_storage::{HaBackend, StorageBackend};

use crate::barrier::Barrier;
use crate::cluster::{self, Cluster, ClusterIdentity, ClusterInfo};
use crate::error::{ClusterError, CoreError};
use crate::ha::{self, Coordinator, HaTiming, HoldOutcome, LeaderAdvertisement, Lock};
use crate::logical::{LogicalHandler, PassthroughBackend, Request, Response};
use crate::seal::{SealManager, SealStatus, ShareOutcome};
use crate::token::TokenStore;
use crate::transport::{ClusterListenerSet, ForwardingClient, ListenerProvider, cluster_router};

/// Lifecycle phase of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Sealed,
    Unsealing,
    Standby,
    Active,
    Sealing,
}

/// Everything a [`Core`] needs, supplied by the host.
#[derive(Clone)]
pub struct CoreConfig {
    pub storage: Arc<dyn StorageBackend>,
    /// Enables leader election when set.
    pub ha: Option<Arc<dyn HaBackend>>,
    /// Address clients should be redirected to when this node leads.
    pub advertise_addr: String,
    /// Cluster address advertised to standbys. Defaults to the first
    /// bound cluster listener.
    pub cluster_addr: Option<String>,
    /// Name recorded the first time the cluster is set up.
    pub cluster_name: Option<String>,
    pub listener_provider: Option<Arc<dyn ListenerProvider>>,
    pub handler: Arc<dyn LogicalHandler>,
    pub timing: HaTiming,
}

impl CoreConfig {
    /// Non-HA configuration with the passthrough backend and default timing.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, advertise_addr: impl Into<String>) -> Self {
        Self {
            storage,
            ha: None,
            advertise_addr: advertise_addr.into(),
            cluster_addr: None,
            cluster_name: None,
            listener_provider: None,
            handler: Arc::new(PassthroughBackend::default()),
            timing: HaTiming::default(),
        }
    }

    #[must_use]
    pub fn with_ha(mut self, ha: Arc<dyn HaBackend>) -> Self {
        self.ha = Some(ha);
        self
    }

    #[must_use]
    pub fn with_listener_provider(mut self, provider: Arc<dyn ListenerProvider>) -> Self {
        self.listener_provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_cluster_addr(mut self, addr: impl Into<String>) -> Self {
        self.cluster_addr = Some(addr.into());
        self
    }

    #[must_use]
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn LogicalHandler>) -> Self {
        self.handler = handler;
        self
    }

    #[must_use]
    pub fn with_timing(mut self, timing: HaTiming) -> Self {
        self.timing = timing;
        self
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.advertise_addr.trim().is_empty() {
            return Err(CoreError::InvalidConfig {
                reason: "advertise address must not be empty".to_owned(),
            });
        }
        let t = &self.timing;
        if t.heartbeat_interval.is_zero() || t.lock_retry_interval.is_zero() {
            return Err(CoreError::InvalidConfig {
                reason: "heartbeat and retry intervals must be non-zero".to_owned(),
            });
        }
        if t.heartbeat_interval >= t.lease_margin() {
            return Err(CoreError::InvalidConfig {
                reason: format!(
                    "heartbeat interval {:?} must be under half the lock TTL {:?}",
                    t.heartbeat_interval, t.lock_ttl
                ),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("ha_enabled", &self.ha.is_some())
            .field("advertise_addr", &self.advertise_addr)
            .field("cluster_addr", &self.cluster_addr)
            .field("cluster_name", &self.cluster_name)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

/// Output of [`Core::initialize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    /// Base64 unseal shares. Shown once.
    pub keys: Vec<String>,
    pub root_token: String,
}

/// Who leads, as seen from this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderStatus {
    pub ha_enabled: bool,
    pub is_self: bool,
    pub leader_address: String,
    pub leader_cluster_address: String,
}

#[derive(Default)]
struct CoreState {
    cluster: Option<ClusterInfo>,
    /// Last identity issued or inherited; kept across step-down.
    identity: Option<ClusterIdentity>,
    active: Option<ActiveTerm>,
    next_term: u64,
    election: Option<(CancellationToken, JoinHandle<()>)>,
    step_down_until: Option<Instant>,
}

/// Resources owned by the node while it leads.
struct ActiveTerm {
    id: u64,
    token: CancellationToken,
    lock: Option<Arc<Lock>>,
    advertisement_id: Option<String>,
    listeners: Option<ClusterListenerSet>,
}

struct CoreInner {
    node_id: String,
    config: CoreConfig,
    barrier: Arc<Barrier>,
    seal: SealManager,
    tokens: TokenStore,
    ha: Option<Coordinator>,
    phase: watch::Sender<NodeState>,
    state: Mutex<CoreState>,
    forwarder: Mutex<Option<(String, ForwardingClient)>>,
}

/// One vault node. Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("node_id", &self.inner.node_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Core {
    /// Build a sealed node.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] for an empty advertise address
    /// or inconsistent timing.
    pub fn new(config: CoreConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let node_id = uuid::Uuid::new_v4().to_string();
        let barrier = Arc::new(Barrier::new(Arc::clone(&config.storage)));
        let ha = config
            .ha
            .as_ref()
            .map(|backend| Coordinator::new(Arc::clone(backend), node_id.clone()));
        let (phase, _) = watch::channel(NodeState::Sealed);

        info!(node_id = %node_id, ha_enabled = ha.is_some(), "core created");
        Ok(Self {
            inner: Arc::new(CoreInner {
                seal: SealManager::new(Arc::clone(&barrier)),
                tokens: TokenStore::new(Arc::clone(&barrier)),
                node_id,
                config,
                barrier,
                ha,
                phase,
                state: Mutex::new(CoreState::default()),
                forwarder: Mutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> NodeState {
        *self.inner.phase.borrow()
    }

    /// Watch phase changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.inner.phase.subscribe()
    }

    /// Whether the node is sealed. Never blocks.
    #[must_use]
    pub fn sealed(&self) -> bool {
        matches!(self.state(), NodeState::Sealed | NodeState::Unsealing)
    }

    /// Whether the node is a standby.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Sealed`] while sealed.
    pub fn standby(&self) -> Result<bool, CoreError> {
        match self.state() {
            NodeState::Standby => Ok(true),
            NodeState::Active => Ok(false),
            _ => Err(CoreError::Sealed),
        }
    }

    #[must_use]
    pub fn ha_enabled(&self) -> bool {
        self.inner.ha.is_some()
    }

    fn set_phase(&self, phase: NodeState) {
        let previous = self.inner.phase.send_replace(phase);
        if previous != phase {
            debug!(node_id = %self.inner.node_id, from = ?previous, to = ?phase, "phase changed");
        }
    }

    /// Initialize the vault and return the unseal shares and root token.
    ///
    /// The node stays sealed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::AlreadyInitialized`] if storage already holds a vault.
    /// - [`CoreError::Seal`] for invalid share parameters.
    pub async fn initialize(&self, shares: u8, threshold: u8) -> Result<InitResponse, CoreError> {
        let _state = self.inner.state.lock().await;
        if !self.sealed() {
            return Err(CoreError::AlreadyInitialized);
        }

        let init = self.inner.seal.init(shares, threshold).await?;
        self.inner.barrier.unseal(&init.master_key).await?;
        let root_token = self.inner.tokens.create_root().await;
        self.inner.barrier.seal().await;
        let root_token = root_token?;

        info!(node_id = %self.inner.node_id, shares, threshold, "vault initialized");
        Ok(InitResponse {
            keys: init.shares,
            root_token,
        })
    }

    /// Current seal status.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Barrier`] if storage fails.
    pub async fn seal_status(&self) -> Result<SealStatus, CoreError> {
        Ok(self.inner.seal.status().await?)
    }

    /// Submit one unseal share.
    ///
    /// Returns the resulting status once the node is unsealed; a node that
    /// is already unsealed just reports its status.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ThresholdNotMet`] while more shares are needed.
    /// - [`CoreError::InvalidMasterKey`] if the shares do not open this vault.
    ///   The share buffer is discarded.
    /// - [`CoreError::NotInitialized`] before initialization.
    pub async fn unseal(&self, share: &str) -> Result<SealStatus, CoreError> {
        let mut state = self.inner.state.lock().await;
        match self.state() {
            NodeState::Standby | NodeState::Active => {
                drop(state);
                return self.seal_status().await;
            }
            NodeState::Sealing => return Err(CoreError::Sealed),
            NodeState::Sealed | NodeState::Unsealing => {}
        }

        let key = match self.inner.seal.submit_unseal_share(share).await? {
            ShareOutcome::Pending(progress) => {
                self.set_phase(NodeState::Unsealing);
                return Err(CoreError::ThresholdNotMet {
                    submitted: progress.submitted,
                    threshold: progress.threshold,
                });
            }
            ShareOutcome::Reconstructed(key) => key,
        };

        if let Err(e) = self.inner.barrier.unseal(&key).await {
            self.set_phase(NodeState::Sealed);
            warn!(node_id = %self.inner.node_id, error = %e, "unseal attempt rejected");
            return Err(e.into());
        }
        drop(key);

        // Only the lock holder creates the cluster record; see become_active.
        let info = match cluster::load_info(&self.inner.barrier).await {
            Ok(info) => info,
            Err(e) => {
                self.inner.barrier.seal().await;
                self.set_phase(NodeState::Sealed);
                return Err(e.into());
            }
        };
        info!(
            node_id = %self.inner.node_id,
            cluster_id = info.as_ref().map_or("<unset>", |i| i.id.as_str()),
            "vault unsealed"
        );
        state.cluster = info;

        if self.inner.ha.is_some() {
            self.set_phase(NodeState::Standby);
            let cancel = CancellationToken::new();
            let span = info_span!("election", node_id = %self.inner.node_id);
            let handle = tokio::spawn(
                self.clone()
                    .run_election(cancel.clone())
                    .instrument(span),
            );
            state.election = Some((cancel, handle));
        } else if let Err(e) = self.activate_without_ha(&mut state).await {
            state.cluster = None;
            self.inner.barrier.seal().await;
            self.set_phase(NodeState::Sealed);
            return Err(e);
        }
        drop(state);

        self.seal_status().await
    }

    /// Discard partially submitted unseal shares.
    pub async fn reset_unseal(&self) {
        let _state = self.inner.state.lock().await;
        self.inner.seal.reset().await;
        if self.state() == NodeState::Unsealing {
            self.set_phase(NodeState::Sealed);
        }
    }

    /// Seal the node. Requires the root token.
    ///
    /// Stops the election, gives up leadership without cooldown, and drops
    /// all key material. Sealing a sealed node is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PermissionDenied`] for any other token.
    pub async fn seal(&self, token: &str) -> Result<(), CoreError> {
        if self.sealed() {
            self.reset_unseal().await;
            return Ok(());
        }
        if !self.inner.tokens.check_root(token).await? {
            return Err(CoreError::PermissionDenied);
        }
        self.seal_internal().await;
        Ok(())
    }

    /// Seal without a token check, for process shutdown.
    pub async fn shutdown(&self) {
        if !self.sealed() {
            self.seal_internal().await;
        }
        info!(node_id = %self.inner.node_id, "core shut down");
    }

    async fn seal_internal(&self) {
        let election = {
            let mut state = self.inner.state.lock().await;
            if matches!(self.state(), NodeState::Sealed | NodeState::Sealing) {
                return;
            }
            self.set_phase(NodeState::Sealing);
            state.election.take()
        };

        let grace = self.inner.config.timing.teardown_grace;
        if let Some((cancel, handle)) = election {
            cancel.cancel();
            await_task(handle, grace, "election").await;
        }

        let active = {
            let mut state = self.inner.state.lock().await;
            state.identity = None;
            state.cluster = None;
            state.step_down_until = None;
            state.active.take()
        };
        if let Some(active) = active {
            self.teardown(active).await;
        }

        *self.inner.forwarder.lock().await = None;
        self.inner.seal.reset().await;
        self.inner.barrier.seal().await;
        self.set_phase(NodeState::Sealed);
        info!(node_id = %self.inner.node_id, "vault sealed");
    }

    /// Give up leadership voluntarily. Requires the root token.
    ///
    /// The cluster listeners close immediately, the lock is released, and
    /// this node will not try to lead again for the configured cooldown.
    /// A standby (or a node without HA) returns `Ok` without doing anything.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Sealed`] while sealed.
    /// - [`CoreError::PermissionDenied`] without the root token.
    pub async fn step_down(&self, request: &Request) -> Result<(), CoreError> {
        if self.sealed() {
            return Err(CoreError::Sealed);
        }
        let token = request.client_token.as_deref().unwrap_or_default();
        if !self.inner.tokens.check_root(token).await? {
            return Err(CoreError::PermissionDenied);
        }
        if self.inner.ha.is_none() {
            debug!(node_id = %self.inner.node_id, "step-down without HA is a no-op");
            return Ok(());
        }

        let active = {
            let mut state = self.inner.state.lock().await;
            if self.state() != NodeState::Active {
                return Ok(());
            }
            state.step_down_until = Some(Instant::now() + self.inner.config.timing.step_down_cooldown);
            self.set_phase(NodeState::Standby);
            state.active.take()
        };

        if let Some(active) = active {
            self.teardown(active).await;
        }
        info!(
            node_id = %self.inner.node_id,
            cooldown = ?self.inner.config.timing.step_down_cooldown,
            "stepped down"
        );
        Ok(())
    }

    /// The cluster record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Sealed`] while sealed.
    pub async fn cluster(&self) -> Result<Cluster, CoreError> {
        if self.sealed() {
            return Err(CoreError::Sealed);
        }
        let mut state = self.inner.state.lock().await;
        if let Some(identity) = &state.identity {
            return Ok(identity.cluster());
        }
        let info = match &state.cluster {
            Some(info) => info.clone(),
            None => {
                let info = cluster::load_info(&self.inner.barrier)
                    .await?
                    .ok_or(ClusterError::MissingInfo)?;
                state.cluster = Some(info.clone());
                info
            }
        };
        Ok(Cluster {
            name: info.name,
            id: info.id,
            certificate: Vec::new(),
            cert_pool: Arc::new(rustls::RootCertStore::empty()),
        })
    }

    /// TLS client configuration for dialing the cluster port with the
    /// current cluster certificate.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Sealed`] while sealed.
    /// - [`CoreError::Cluster`] if this node has no certificate yet.
    pub async fn cluster_tls_config(&self) -> Result<Arc<ClientConfig>, CoreError> {
        if self.sealed() {
            return Err(CoreError::Sealed);
        }
        let state = self.inner.state.lock().await;
        let identity = state.identity.as_ref().ok_or(ClusterError::MissingKey)?;
        Ok(identity.client_config()?)
    }

    /// Who leads the cluster.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Sealed`] while sealed.
    /// - [`CoreError::Ha`] if the lock backend cannot be reached.
    pub async fn leader(&self) -> Result<LeaderStatus, CoreError> {
        if self.sealed() {
            return Err(CoreError::Sealed);
        }
        let Some(ha) = &self.inner.ha else {
            return Ok(LeaderStatus {
                ha_enabled: false,
                is_self: self.state() == NodeState::Active,
                leader_address: self.inner.config.advertise_addr.clone(),
                leader_cluster_address: String::new(),
            });
        };

        let Some(holder) = ha.holder().await? else {
            return Ok(LeaderStatus {
                ha_enabled: true,
                is_self: false,
                leader_address: String::new(),
                leader_cluster_address: String::new(),
            });
        };
        let advertisement = ha::load_advertisement(&self.inner.barrier, &holder.value).await?;
        Ok(LeaderStatus {
            ha_enabled: true,
            is_self: holder.holder_id == self.inner.node_id,
            leader_address: advertisement
                .as_ref()
                .map(|a| a.advertise_addr.clone())
                .unwrap_or_default(),
            leader_cluster_address: advertisement
                .and_then(|a| a.cluster_addr)
                .unwrap_or_default(),
        })
    }

    /// Execute a logical request: locally when active, on the active node
    /// when standby.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Sealed`] while sealed.
    /// - [`CoreError::LeaderUnavailable`] if no node is active.
    /// - [`CoreError::ForwardFailed`] if the active node cannot be reached.
    /// - [`CoreError::Logical`] with the executing node's own error.
    pub async fn handle_request(&self, request: &Request) -> Result<Response, CoreError> {
        match self.state() {
            NodeState::Active => Ok(self
                .inner
                .config
                .handler
                .handle(&self.inner.barrier, request)
                .await?),
            NodeState::Standby => self.forward(request).await,
            NodeState::Sealed | NodeState::Unsealing | NodeState::Sealing => {
                Err(CoreError::Sealed)
            }
        }
    }

    async fn forward(&self, request: &Request) -> Result<Response, CoreError> {
        let ha = self.inner.ha.as_ref().ok_or(CoreError::LeaderUnavailable)?;
        let holder = ha.holder().await?.ok_or(CoreError::LeaderUnavailable)?;
        if holder.holder_id == self.inner.node_id {
            // Mid-transition: we hold the lock but are not active yet.
            return Err(CoreError::LeaderUnavailable);
        }

        let mut forwarder = self.inner.forwarder.lock().await;
        let client = match forwarder.as_ref() {
            Some((id, client)) if *id == holder.value => client.clone(),
            _ => {
                let client = self.connect_leader(&holder.value).await?;
                *forwarder = Some((holder.value.clone(), client.clone()));
                client
            }
        };
        drop(forwarder);

        debug!(
            node_id = %self.inner.node_id,
            leader = %client.addr(),
            path = %request.path,
            "forwarding request"
        );
        let result = client.forward(request).await.map_err(CoreError::from);
        if matches!(
            result,
            Err(CoreError::LeaderUnavailable | CoreError::ForwardFailed { .. })
        ) {
            let mut forwarder = self.inner.forwarder.lock().await;
            if forwarder.as_ref().is_some_and(|(id, _)| *id == holder.value) {
                *forwarder = None;
            }
        }
        result
    }

    async fn connect_leader(&self, advertisement_id: &str) -> Result<ForwardingClient, CoreError> {
        let barrier = &self.inner.barrier;
        let advertisement = ha::load_advertisement(barrier, advertisement_id)
            .await?
            .ok_or(CoreError::LeaderUnavailable)?;
        let addr = advertisement
            .cluster_addr
            .clone()
            .ok_or(CoreError::LeaderUnavailable)?;
        let info = cluster::load_info(barrier)
            .await?
            .ok_or(ClusterError::MissingInfo)?;
        let params = cluster::load_key(barrier)
            .await?
            .ok_or(CoreError::LeaderUnavailable)?;
        let cert = BASE64
            .decode(advertisement.cluster_cert.as_bytes())
            .map_err(|e| CoreError::ForwardFailed {
                reason: format!("leader certificate is not base64: {e}"),
            })?;

        let identity =
            ClusterIdentity::inherit(info.clone(), &params, CertificateDer::from(cert))?;
        let tls = identity.client_config()?;
        let client = ForwardingClient::new(&addr, &tls, self.inner.config.timing.forward_timeout)?;

        let mut state = self.inner.state.lock().await;
        if self.state() == NodeState::Standby {
            state.cluster = Some(info);
            state.identity = Some(identity);
        }
        info!(node_id = %self.inner.node_id, leader = %addr, "connected to active node");
        Ok(client)
    }

    async fn activate_without_ha(&self, state: &mut CoreState) -> Result<(), CoreError> {
        let barrier = &self.inner.barrier;
        let info = cluster::ensure_info(barrier, self.inner.config.cluster_name.as_deref()).await?;
        let params = cluster::ensure_key(barrier).await?;
        let identity = ClusterIdentity::issue(&info, &params)?;
        state.cluster = Some(info);
        state.identity = Some(identity);
        state.next_term += 1;
        state.active = Some(ActiveTerm {
            id: state.next_term,
            token: CancellationToken::new(),
            lock: None,
            advertisement_id: None,
            listeners: None,
        });
        self.set_phase(NodeState::Active);
        info!(node_id = %self.inner.node_id, "became active (HA disabled)");
        Ok(())
    }

    async fn run_election(self, cancel: CancellationToken) {
        let Some(ha) = self.inner.ha.as_ref() else {
            return;
        };
        let timing = self.inner.config.timing;

        loop {
            let cooldown = self.inner.state.lock().await.step_down_until;
            if let Some(until) = cooldown {
                let remaining = until.saturating_duration_since(Instant::now());
                if !remaining.is_zero() {
                    debug!(?remaining, "waiting out step-down cooldown");
                    if !ha::sleep_or_cancel(remaining, &cancel).await {
                        return;
                    }
                }
            }

            let advertisement_id = uuid::Uuid::new_v4().to_string();
            let acquired = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                acquired = ha.try_acquire(&advertisement_id, timing.lock_ttl) => acquired,
            };

            match acquired {
                Ok(Some(lock)) => {
                    let lock = Arc::new(lock);
                    let pending = PendingLock::new(Arc::clone(&lock));
                    match self
                        .become_active(Arc::clone(&lock), &advertisement_id, &cancel)
                        .await
                    {
                        Ok((term_id, term)) => {
                            pending.installed();
                            let outcome = ha::hold(&lock, &timing, &term).await;
                            if let HoldOutcome::Lost { reason } = outcome {
                                self.lose_leadership(term_id, &reason).await;
                            }
                            if cancel.is_cancelled() {
                                return;
                            }
                            continue;
                        }
                        Err(e) => {
                            if cancel.is_cancelled() {
                                debug!(error = %e, "election cancelled while activating");
                            } else {
                                error!(error = %e, "failed to become active, releasing lock");
                            }
                            pending.release().await;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "HA lock acquisition failed"),
            }

            if !ha::sleep_or_cancel(timing.lock_retry_interval, &cancel).await {
                return;
            }
        }
    }

    async fn become_active(
        &self,
        lock: Arc<Lock>,
        advertisement_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(u64, CancellationToken), CoreError> {
        let barrier = &self.inner.barrier;
        let identity = {
            let mut state = self.inner.state.lock().await;
            if self.state() != NodeState::Standby || cancel.is_cancelled() {
                return Err(CoreError::Sealed);
            }
            let info =
                cluster::ensure_info(barrier, self.inner.config.cluster_name.as_deref()).await?;
            let params = cluster::ensure_key(barrier).await?;
            let identity = ClusterIdentity::issue(&info, &params)?;
            state.cluster = Some(info);
            identity
        };

        let term = cancel.child_token();
        let listeners = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CoreError::Sealed),
            started = self.start_listeners(&identity, &term) => started?,
        };

        let cluster_addr = self.inner.config.cluster_addr.clone().or_else(|| {
            listeners
                .as_ref()
                .and_then(|set| set.local_addrs().first())
                .map(SocketAddr::to_string)
        });
        let advertisement = LeaderAdvertisement {
            node_id: self.inner.node_id.clone(),
            advertise_addr: self.inner.config.advertise_addr.clone(),
            cluster_addr,
            cluster_cert: BASE64.encode(identity.certificate()),
        };
        if let Err(e) = ha::publish_advertisement(barrier, advertisement_id, &advertisement).await {
            term.cancel();
            if let Some(set) = listeners {
                set.shutdown(self.inner.config.timing.teardown_grace).await;
            }
            return Err(e.into());
        }

        let mut state = self.inner.state.lock().await;
        if self.state() != NodeState::Standby || cancel.is_cancelled() {
            drop(state);
            self.teardown(ActiveTerm {
                id: 0,
                token: term,
                lock: None,
                advertisement_id: Some(advertisement_id.to_owned()),
                listeners,
            })
            .await;
            return Err(CoreError::Sealed);
        }

        state.next_term += 1;
        let term_id = state.next_term;
        state.identity = Some(identity);
        state.active = Some(ActiveTerm {
            id: term_id,
            token: term.clone(),
            lock: Some(Arc::clone(&lock)),
            advertisement_id: Some(advertisement_id.to_owned()),
            listeners,
        });
        self.set_phase(NodeState::Active);
        drop(state);

        *self.inner.forwarder.lock().await = None;
        info!(
            fencing_token = lock.fencing_token(),
            cluster_addr = advertisement.cluster_addr.as_deref().unwrap_or(""),
            "became active"
        );
        Ok((term_id, term))
    }

    /// Bind and serve the cluster port for a new term, if the host provides
    /// listeners.
    async fn start_listeners(
        &self,
        identity: &ClusterIdentity,
        term: &CancellationToken,
    ) -> Result<Option<ClusterListenerSet>, CoreError> {
        let Some(provider) = &self.inner.config.listener_provider else {
            return Ok(None);
        };
        let listeners = provider.cluster_listeners().await.map_err(|e| {
            error!(error = %e, "cluster listener setup failed");
            CoreError::from(e)
        })?;
        let router = cluster_router(
            Arc::clone(&self.inner.barrier),
            Arc::clone(&self.inner.config.handler),
            term.clone(),
        );
        let set = ClusterListenerSet::start(
            listeners,
            identity.server_config()?,
            router,
            term,
            self.inner.config.timing.handshake_timeout,
        )
        .map_err(|e| {
            term.cancel();
            CoreError::from(e)
        })?;
        Ok(Some(set))
    }

    async fn lose_leadership(&self, term_id: u64, reason: &str) {
        let active = {
            let mut state = self.inner.state.lock().await;
            if self.state() != NodeState::Active
                || state.active.as_ref().is_none_or(|a| a.id != term_id)
            {
                return;
            }
            self.set_phase(NodeState::Standby);
            state.active.take()
        };
        warn!(reason, "HA lock lost, stepping down");
        if let Some(active) = active {
            self.teardown(active).await;
        }
    }

    /// Tear down an active term: close listeners, retract the
    /// advertisement, release the lock.
    async fn teardown(&self, active: ActiveTerm) {
        active.token.cancel();
        if let Some(listeners) = active.listeners {
            listeners.shutdown(self.inner.config.timing.teardown_grace).await;
        }
        if let Some(id) = &active.advertisement_id {
            if let Err(e) = ha::clear_advertisement(&self.inner.barrier, id).await {
                warn!(error = %e, "failed to clear leader advertisement");
            }
        }
        if let Some(lock) = &active.lock {
            release_lock(lock).await;
        }
    }
}

/// A lock acquired by the election task that no active term owns yet.
///
/// Dropped without [`PendingLock::installed`] (the election task was
/// aborted mid-activation), it releases the lock in the background instead
/// of leaving it to expire.
struct PendingLock(Option<Arc<Lock>>);

impl PendingLock {
    fn new(lock: Arc<Lock>) -> Self {
        Self(Some(lock))
    }

    /// The active term owns the lock now; teardown releases it.
    fn installed(mut self) {
        self.0 = None;
    }

    async fn release(mut self) {
        if let Some(lock) = self.0.take() {
            release_lock(&lock).await;
        }
    }
}

impl Drop for PendingLock {
    fn drop(&mut self) {
        if let Some(lock) = self.0.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { release_lock(&lock).await });
            }
        }
    }
}

async fn release_lock(lock: &Lock) {
    if let Err(e) = lock.release().await {
        warn!(error = %e, "failed to release HA lock");
    }
}

async fn await_task(mut handle: JoinHandle<()>, grace: Duration, name: &str) {
    if tokio::time::timeout(grace, &mut handle).await.is_err() {
        warn!(task = name, ?grace, "background task did not stop in time, aborting");
        handle.abort();
    }
}
