//! WalletSession: lifecycle state machine over the wallet core
//!
//! A session is an owned handle, cheap to clone, with no process-wide state.
//! Synchronous mutations run under the session's writer lock and are persisted
//! before they return. Long-running work (recovery, history sync, rate fetches)
//! runs on the tokio runtime and hands back a [`PendingOperation`]; dropping the
//! handle cancels it before anything is committed.
//!
//! ```text
//! Uninitialized --load/recover--> Loading --ok--> Ready --get_history--> Syncing --> Ready
//!                                         \--err--> Failed
//! Ready --upgrade_to_v3_wallet--> Upgrading --> Ready
//! any --load_js--> Uninitialized   (deferred while Loading/Syncing/Upgrading)
//! ```

use futures::future::try_join_all;
use rand::rngs::OsRng;
use rand::RngCore;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::account::balance::{BalanceKey, BalanceLedger, RefreshBatch, RefreshSummary, RefreshTargets};
use crate::account::recovery::{parse_mnemonic, RecoveryCoordinator, RecoveryState, WalletCredentials};
use crate::account::registry::{AccountRegistry, ArchiveTarget, RegistryTable};
use crate::account::types::{Account, Address, Identity, LegacyAddress};
use crate::config::WalletConfig;
use crate::derivation::{cashaddr, AssetType, DerivationEngine};
use crate::error::{AuthError, BridgeError, RecoveryError, StateError, WalletError, WalletResult};
use crate::external::{
    HistoryProvider, LoggingDelegate, MemoryMetadataStore, MetadataStore, OfflineHistoryProvider,
    ScriptBridge, StaticScriptBridge, WalletDelegate, WalletEvent,
};
use crate::rates::RateCache;
use crate::secret::{strength_of, SecretSnapshot, SecretStore};
use crate::storage::{MemoryPayloadStore, PayloadStore, WalletPayload, PAYLOAD_VERSION_HD, PAYLOAD_VERSION_LEGACY};

/// Bridge script returning the server's message for mobile clients
const MOBILE_MESSAGE_SCRIPT: &str = "wallet.getMobileMessage()";

/// Entropy of a freshly generated 12-word recovery phrase
const NEW_WALLET_ENTROPY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Loading,
    Ready,
    Syncing,
    Upgrading,
    Failed(WalletError),
}

impl SessionState {
    pub fn is_initialized(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Syncing)
    }

    /// An operation is outstanding; reloads must wait for it
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::Loading | SessionState::Syncing | SessionState::Upgrading
        )
    }

    fn can_load(&self) -> bool {
        matches!(self, SessionState::Uninitialized | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => f.write_str("uninitialized"),
            SessionState::Loading => f.write_str("loading"),
            SessionState::Ready => f.write_str("ready"),
            SessionState::Syncing => f.write_str("syncing"),
            SessionState::Upgrading => f.write_str("upgrading"),
            SessionState::Failed(e) => write!(f, "failed ({})", e),
        }
    }
}

fn invalid(operation: &'static str, state: &SessionState) -> WalletError {
    StateError::InvalidTransition {
        operation,
        state: state.to_string(),
    }
    .into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Completed,
    /// Runs once the outstanding operation finishes
    Deferred,
}

/// Handle to a long-running session operation.
///
/// Await it for the result. Dropping it cancels the operation: work already in
/// flight finishes, but its result is discarded and the session state reverts.
pub struct PendingOperation<T> {
    receiver: oneshot::Receiver<WalletResult<T>>,
    cancelled: Arc<AtomicBool>,
}

impl<T> PendingOperation<T> {
    fn failed(err: WalletError) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(err));
        Self {
            receiver,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Same as dropping the handle
    pub fn cancel(self) {
        drop(self);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl<T> Future for PendingOperation<T> {
    type Output = WalletResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(WalletError::Cancelled)))
    }
}

impl<T> Drop for PendingOperation<T> {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn spawn_operation<T, F>(work: impl FnOnce(Arc<AtomicBool>) -> F) -> PendingOperation<T>
where
    T: Send + 'static,
    F: Future<Output = WalletResult<T>> + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    let task = work(Arc::clone(&cancelled));
    tokio::spawn(async move {
        let _ = sender.send(task.await);
    });
    PendingOperation { receiver, cancelled }
}

/// In-memory wallet state captured before a write, restored if it cannot be persisted
struct Checkpoint {
    identity: Option<Identity>,
    secrets: SecretSnapshot,
    table: RegistryTable,
}

#[derive(Default)]
struct SessionCore {
    state: SessionState,
    identity: Option<Identity>,
    /// Survives reloads so `fetch_wallet` can reopen the same wallet
    known_guid: Option<String>,
    syncs: u32,
    recovered: HashMap<AssetType, u32>,
}

struct SessionInner {
    config: WalletConfig,
    secrets: SecretStore,
    registry: AccountRegistry,
    ledger: Arc<BalanceLedger>,
    rates: RateCache,
    recovery: RecoveryCoordinator,
    payloads: Arc<dyn PayloadStore>,
    bridge: Arc<dyn ScriptBridge>,
    delegate: Arc<dyn WalletDelegate>,
    core: Mutex<SessionCore>,
    pending_reload: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    fn core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: WalletEvent) {
        self.delegate.on_event(event);
    }

    fn ensure_initialized(&self) -> Result<(), StateError> {
        if self.core().state.is_initialized() {
            Ok(())
        } else {
            Err(StateError::NotInitialized)
        }
    }

    /// Run a mutation under the writer lock and persist the result. Nothing
    /// stays applied unless the payload was saved.
    fn mutate<R>(&self, f: impl FnOnce(&Self, &mut SessionCore) -> WalletResult<R>) -> WalletResult<R> {
        let mut core = self.core();
        if !core.state.is_initialized() {
            return Err(StateError::NotInitialized.into());
        }
        let checkpoint = self.checkpoint(&core);
        let result = f(self, &mut core).and_then(|value| {
            self.persist(&core)?;
            Ok(value)
        });
        if result.is_err() {
            self.rollback(&mut core, checkpoint);
        }
        result
    }

    fn checkpoint(&self, core: &SessionCore) -> Checkpoint {
        Checkpoint {
            identity: core.identity.clone(),
            secrets: self.secrets.snapshot(),
            table: self.registry.table(),
        }
    }

    fn rollback(&self, core: &mut SessionCore, checkpoint: Checkpoint) {
        core.identity = checkpoint.identity;
        self.secrets.restore(checkpoint.secrets);
        self.registry.replace(checkpoint.table);
        debug!("Uncommitted wallet changes rolled back");
    }

    /// Terminal failure: drop everything decrypted and park in `Failed`
    fn fail(&self, err: WalletError) -> WalletError {
        {
            let mut core = self.core();
            self.unload(&mut core);
            core.state = SessionState::Failed(err.clone());
        }
        warn!(error = %err, "Session failed");
        self.notify(WalletEvent::Error(err.clone()));
        err
    }

    fn persist(&self, core: &SessionCore) -> WalletResult<()> {
        let identity = core.identity.clone().ok_or(StateError::NotInitialized)?;
        let version = if self.registry.did_upgrade_to_hd() {
            PAYLOAD_VERSION_HD
        } else {
            PAYLOAD_VERSION_LEGACY
        };
        self.payloads.save(&WalletPayload {
            version,
            identity,
            secrets: self.secrets.seal()?,
            accounts: self.registry.table(),
        })
    }

    fn unload(&self, core: &mut SessionCore) {
        self.secrets.clear();
        self.registry.clear();
        self.ledger.clear();
        core.identity = None;
        core.syncs = 0;
        core.recovered.clear();
    }

    /// Full context reset
    fn reset(&self, core: &mut SessionCore) {
        self.unload(core);
        core.state = match self.bridge.load() {
            Ok(()) => SessionState::Uninitialized,
            Err(e) => SessionState::Failed(e.into()),
        };
        info!("Session reset");
    }

    /// Run a reload that was deferred while an operation was outstanding
    fn finish_operation(&self) {
        if !self.pending_reload.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut core = self.core();
        if core.state.is_busy() {
            self.pending_reload.store(true, Ordering::SeqCst);
            return;
        }
        self.reset(&mut core);
        drop(core);
        self.notify(WalletEvent::Reloaded);
    }

    fn load_payload(&self, guid: &str, shared_key: Option<&str>, password: &str) -> WalletResult<Identity> {
        let payload = self
            .payloads
            .load(guid)?
            .ok_or_else(|| StateError::UnknownWallet(guid.to_string()))?;
        if let Some(shared_key) = shared_key {
            if shared_key != payload.identity.shared_key {
                return Err(AuthError::InvalidSharedKey.into());
            }
        }
        self.secrets.unlock(&payload.secrets, password)?;
        if payload.is_hd() != self.secrets.has_entropy() || payload.is_hd() != payload.accounts.hd {
            self.secrets.clear();
            return Err(AuthError::Corrupt.into());
        }
        self.registry.replace(payload.accounts);
        Ok(payload.identity)
    }

    fn load_locked(
        &self,
        core: &mut SessionCore,
        guid: &str,
        shared_key: Option<&str>,
        password: &str,
    ) -> WalletResult<Identity> {
        if !core.state.can_load() {
            return Err(invalid("load a wallet", &core.state));
        }
        core.state = SessionState::Loading;
        match self.load_payload(guid, shared_key, password) {
            Ok(identity) => {
                core.identity = Some(identity.clone());
                core.known_guid = Some(identity.guid.clone());
                core.state = SessionState::Ready;
                info!(guid = %identity.guid, "Wallet loaded");
                Ok(identity)
            }
            Err(e) => {
                self.unload(core);
                core.state = SessionState::Failed(e.clone());
                warn!(error = %e, "Wallet load failed");
                Err(e)
            }
        }
    }

    fn create_wallet(
        &self,
        core: &mut SessionCore,
        password: &str,
        email: Option<String>,
        entropy: &[u8],
    ) -> WalletResult<Identity> {
        self.secrets.initialize(password, Some(entropy))?;
        let identity = Identity::generate(email);
        self.registry.replace(RegistryTable::default());
        self.secrets
            .with_seed(None, |seed| self.registry.upgrade_to_hd(seed, &self.config.assets))??;
        core.identity = Some(identity.clone());
        self.persist(core)?;
        Ok(identity)
    }

    /// Best-effort metadata backup of the login credentials
    fn spawn_credentials_backup(self: &Arc<Self>, identity: &Identity, password: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, skipping credentials backup");
            return;
        };
        let seed = match self.secrets.with_seed(None, |seed| Zeroizing::new(*seed)) {
            Ok(seed) => seed,
            Err(e) => {
                debug!(error = %e, "Seed unavailable, skipping credentials backup");
                return;
            }
        };
        let credentials = WalletCredentials {
            guid: identity.guid.clone(),
            shared_key: identity.shared_key.clone(),
            password: password.to_string(),
        };
        let inner = Arc::clone(self);
        let task = handle.spawn(async move {
            if let Err(e) = inner.recovery.save_credentials(&seed[..], &credentials).await {
                warn!(error = %e, "Credentials backup failed");
            }
        });
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Settle the state after a Loading operation
    fn conclude_load(&self, result: WalletResult<Identity>, previous: SessionState) -> WalletResult<Identity> {
        match &result {
            Ok(identity) => self.notify(WalletEvent::Recovered {
                guid: identity.guid.clone(),
            }),
            Err(WalletError::Cancelled) | Err(WalletError::Recovery(RecoveryError::NoMetadata)) => {
                self.core().state = previous;
            }
            Err(e) => {
                self.fail(e.clone());
            }
        }
        self.finish_operation();
        result
    }

    async fn fresh_recovery(
        self: Arc<Self>,
        cancelled: Arc<AtomicBool>,
        email: Option<String>,
        password: Zeroizing<String>,
        mnemonic: Zeroizing<String>,
    ) -> WalletResult<Identity> {
        let state = RecoveryState::new(&mnemonic, None);
        let entropy = state.entropy()?;
        let seed = state.seed()?;
        self.secrets.check_strength(&password)?;

        let scans = self.recovery.scan(&seed[..], &self.config.assets).await?;
        if cancelled.load(Ordering::SeqCst) {
            return Err(WalletError::Cancelled);
        }

        let identity = {
            let mut core = self.core();
            self.secrets.initialize(&password, Some(&entropy[..]))?;
            let identity = Identity::generate(email);
            self.registry.replace(RegistryTable {
                hd: true,
                books: BTreeMap::new(),
            });
            for scan in scans {
                if let Some(index) = scan.recovered_account_index {
                    core.recovered.insert(scan.asset, index);
                }
                self.registry.restore_accounts(scan.asset, scan.accounts);
            }
            core.identity = Some(identity.clone());
            core.known_guid = Some(identity.guid.clone());
            self.persist(&core)?;
            core.state = SessionState::Ready;
            identity
        };
        info!(guid = %identity.guid, "Wallet recovered from recovery phrase");

        let credentials = WalletCredentials {
            guid: identity.guid.clone(),
            shared_key: identity.shared_key.clone(),
            password: password.to_string(),
        };
        if let Err(e) = self.recovery.save_credentials(&seed[..], &credentials).await {
            warn!(error = %e, "Credentials backup failed");
        }
        Ok(identity)
    }

    async fn metadata_recovery(
        self: Arc<Self>,
        cancelled: Arc<AtomicBool>,
        mnemonic: Zeroizing<String>,
    ) -> WalletResult<Identity> {
        let mut state = RecoveryState::new(&mnemonic, None);
        let seed = state.seed()?;
        let credentials = self.recovery.load_credentials(&seed[..]).await?;
        state.has_metadata_backup = true;
        state.target_guid = Some(credentials.guid.clone());
        debug!(
            target_guid = ?state.target_guid,
            backup = state.has_metadata_backup,
            "Metadata backup found"
        );
        if cancelled.load(Ordering::SeqCst) {
            return Err(WalletError::Cancelled);
        }

        let mut core = self.core();
        let identity =
            self.load_payload(
            &credentials.guid,
            Some(credentials.shared_key.as_str()),
            &credentials.password,
        )?;
        core.identity = Some(identity.clone());
        core.known_guid = Some(identity.guid.clone());
        core.state = SessionState::Ready;
        info!(guid = %identity.guid, "Wallet recovered from metadata backup");
        Ok(identity)
    }

    fn begin_sync(&self, asset: Option<AssetType>) -> WalletResult<()> {
        {
            let mut core = self.core();
            if !core.state.is_initialized() {
                return Err(invalid("sync history", &core.state));
            }
            core.syncs += 1;
            core.state = SessionState::Syncing;
        }
        self.notify(WalletEvent::SyncStarted { asset });
        Ok(())
    }

    /// Publish fetched balances, unless the caller has gone away
    fn commit_sync(&self, cancelled: &AtomicBool, batches: &[RefreshBatch]) -> WalletResult<()> {
        let mut core = self.core();
        if cancelled.load(Ordering::SeqCst) {
            return Err(WalletError::Cancelled);
        }
        if !core.state.is_initialized() {
            return Err(StateError::NotInitialized.into());
        }
        let checkpoint = self.checkpoint(&core);
        if let Err(e) = self.stage_sync(&mut core, batches) {
            self.rollback(&mut core, checkpoint);
            return Err(e);
        }
        for batch in batches {
            self.ledger.commit(batch);
        }
        Ok(())
    }

    fn stage_sync(&self, core: &mut SessionCore, batches: &[RefreshBatch]) -> WalletResult<()> {
        for batch in batches {
            let asset = batch.summary.asset;
            for legacy in self.registry.all_legacy_addresses(asset) {
                let balance = batch.balance(&BalanceKey::Address(legacy.address.clone()));
                self.registry.set_legacy_balance(asset, &legacy.address, balance)?;
            }
        }
        if let Some(identity) = core.identity.as_mut() {
            identity.is_new = false;
        }
        self.persist(core)
    }

    fn end_sync<T>(&self, asset: Option<AssetType>, result: &WalletResult<T>) {
        {
            let mut core = self.core();
            core.syncs = core.syncs.saturating_sub(1);
            if core.syncs == 0 && core.state == SessionState::Syncing {
                core.state = SessionState::Ready;
            }
        }
        match result {
            Ok(_) => self.notify(WalletEvent::SyncFinished { asset }),
            Err(WalletError::Cancelled) => debug!("History sync cancelled"),
            Err(e) => self.notify(WalletEvent::Error(e.clone())),
        }
        self.finish_operation();
    }

    async fn sync(
        self: Arc<Self>,
        cancelled: Arc<AtomicBool>,
        asset: Option<AssetType>,
        assets: Vec<AssetType>,
    ) -> WalletResult<Vec<RefreshSummary>> {
        let fetches = assets.iter().map(|asset| {
            let targets = RefreshTargets::from_registry(&self.registry, *asset);
            self.ledger.fetch(*asset, targets)
        });
        let result = match try_join_all(fetches).await {
            Ok(batches) => self
                .commit_sync(&cancelled, &batches)
                .map(|()| batches.into_iter().map(|b| b.summary).collect()),
            Err(e) => Err(e),
        };
        self.end_sync(asset, &result);
        result
    }
}

/// Assembles a session from its collaborators
pub struct WalletSessionBuilder {
    config: WalletConfig,
    payloads: Option<Arc<dyn PayloadStore>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    history: Option<Arc<dyn HistoryProvider>>,
    bridge: Option<Arc<dyn ScriptBridge>>,
    delegate: Option<Arc<dyn WalletDelegate>>,
}

impl WalletSessionBuilder {
    pub fn payload_store(mut self, payloads: Arc<dyn PayloadStore>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    pub fn metadata_store(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn history_provider(mut self, history: Arc<dyn HistoryProvider>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn script_bridge(mut self, bridge: Arc<dyn ScriptBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn delegate(mut self, delegate: Arc<dyn WalletDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn build(self) -> WalletSession {
        let config = self.config;
        let engine = Arc::new(DerivationEngine::with_assets(&config.assets));
        let history: Arc<dyn HistoryProvider> = match self.history {
            Some(history) => history,
            None => Arc::new(OfflineHistoryProvider),
        };
        let metadata: Arc<dyn MetadataStore> = match self.metadata {
            Some(metadata) => metadata,
            None => Arc::new(MemoryMetadataStore::new()),
        };
        let payloads: Arc<dyn PayloadStore> = match self.payloads {
            Some(payloads) => payloads,
            None => Arc::new(MemoryPayloadStore::new()),
        };
        let bridge: Arc<dyn ScriptBridge> = match self.bridge {
            Some(bridge) => bridge,
            None => Arc::new(StaticScriptBridge::new()),
        };
        let delegate: Arc<dyn WalletDelegate> = match self.delegate {
            Some(delegate) => delegate,
            None => Arc::new(LoggingDelegate),
        };

        let inner = SessionInner {
            secrets: SecretStore::new(
                config.security.kdf_params(),
                config.security.min_password_strength,
            ),
            registry: AccountRegistry::new(Arc::clone(&engine)),
            ledger: Arc::new(BalanceLedger::new(Arc::clone(&history))),
            rates: RateCache::new(),
            recovery: RecoveryCoordinator::new(
                engine,
                history,
                metadata,
                config.recovery.account_gap_limit,
            )
            .with_address_window(config.recovery.address_window),
            payloads,
            bridge,
            delegate,
            core: Mutex::new(SessionCore::default()),
            pending_reload: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
            config,
        };
        WalletSession {
            inner: Arc::new(inner),
        }
    }
}

#[derive(Clone)]
pub struct WalletSession {
    inner: Arc<SessionInner>,
}

impl WalletSession {
    pub fn builder(config: WalletConfig) -> WalletSessionBuilder {
        WalletSessionBuilder {
            config,
            payloads: None,
            metadata: None,
            history: None,
            bridge: None,
            delegate: None,
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.inner.config
    }

    /// Wait for detached work (credentials backups) started by earlier calls
    pub async fn wait_for_background_tasks(&self) {
        let tasks = std::mem::take(
            &mut *self
                .inner
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }
    }

    // --- Lifecycle ---

    pub fn state(&self) -> SessionState {
        self.inner.core().state.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.core().state.is_initialized()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.core().state == SessionState::Syncing
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.core().identity.clone()
    }

    pub fn guid(&self) -> Option<String> {
        self.inner.core().identity.as_ref().map(|i| i.guid.clone())
    }

    pub fn is_new(&self) -> bool {
        self.inner
            .core()
            .identity
            .as_ref()
            .map(|i| i.is_new)
            .unwrap_or(false)
    }

    /// Create a wallet with a fresh 12-word recovery phrase
    pub fn new_account(&self, password: &str, email: Option<String>) -> WalletResult<Identity> {
        let mut entropy = Zeroizing::new([0u8; NEW_WALLET_ENTROPY_LEN]);
        OsRng.fill_bytes(&mut entropy[..]);
        self.create(password, email, &entropy[..])
    }

    /// Create a wallet around an existing recovery phrase, without scanning for activity
    pub fn new_account_with_mnemonic(
        &self,
        password: &str,
        email: Option<String>,
        mnemonic: &str,
    ) -> WalletResult<Identity> {
        let entropy = Zeroizing::new(parse_mnemonic(mnemonic)?.to_entropy());
        self.create(password, email, &entropy)
    }

    fn create(&self, password: &str, email: Option<String>, entropy: &[u8]) -> WalletResult<Identity> {
        let identity = {
            let mut core = self.inner.core();
            if core.state != SessionState::Uninitialized {
                return Err(invalid("create a wallet", &core.state));
            }
            match self.inner.create_wallet(&mut core, password, email, entropy) {
                Ok(identity) => {
                    core.known_guid = Some(identity.guid.clone());
                    core.state = SessionState::Ready;
                    identity
                }
                Err(e) => {
                    self.inner.unload(&mut core);
                    return Err(e);
                }
            }
        };
        info!(guid = %identity.guid, "Wallet created");
        self.inner.notify(WalletEvent::Loaded {
            guid: identity.guid.clone(),
        });
        self.inner.spawn_credentials_backup(&identity, password);
        Ok(identity)
    }

    pub fn load_wallet_with_guid(
        &self,
        guid: &str,
        shared_key: Option<&str>,
        password: &str,
    ) -> WalletResult<Identity> {
        let result = {
            let mut core = self.inner.core();
            self.inner.load_locked(&mut core, guid, shared_key, password)
        };
        self.notify_load(&result);
        result
    }

    /// Reopen the wallet this session last had loaded
    pub fn fetch_wallet(&self, password: &str) -> WalletResult<Identity> {
        let result = {
            let mut core = self.inner.core();
            let guid = core.known_guid.clone().ok_or(StateError::NotInitialized)?;
            self.inner.load_locked(&mut core, &guid, None, password)
        };
        self.notify_load(&result);
        result
    }

    fn notify_load(&self, result: &WalletResult<Identity>) {
        match result {
            Ok(identity) => self.inner.notify(WalletEvent::Loaded {
                guid: identity.guid.clone(),
            }),
            Err(e) => self.inner.notify(WalletEvent::Error(e.clone())),
        }
    }

    /// Turn a legacy wallet into an HD wallet. One-way.
    pub fn upgrade_to_v3_wallet(&self, second_password: Option<&str>) -> WalletResult<()> {
        let inner = &self.inner;
        let mut core = inner.core();
        if core.state != SessionState::Ready {
            return Err(invalid("upgrade", &core.state));
        }
        if inner.registry.did_upgrade_to_hd() {
            return Err(StateError::AlreadyUpgraded.into());
        }
        if inner.secrets.needs_second_password()
            && !second_password
                .map(|p| inner.secrets.validate_second_password(p))
                .unwrap_or(false)
        {
            return Err(AuthError::SecondPasswordRequired.into());
        }

        core.state = SessionState::Upgrading;
        let checkpoint = inner.checkpoint(&core);
        let result = (|| -> WalletResult<()> {
            let mut entropy = Zeroizing::new([0u8; NEW_WALLET_ENTROPY_LEN]);
            OsRng.fill_bytes(&mut entropy[..]);
            let mnemonic = bip39::Mnemonic::from_entropy(&entropy[..])
                .map_err(|_| AuthError::Corrupt)?;
            let seed = Zeroizing::new(mnemonic.to_seed(""));

            inner.registry.upgrade_to_hd(&seed[..], &inner.config.assets)?;
            inner.secrets.install_entropy(&entropy[..], second_password)?;
            inner.persist(&core)
        })();
        if result.is_err() {
            inner.rollback(&mut core, checkpoint);
        }
        core.state = SessionState::Ready;
        drop(core);

        match &result {
            Ok(()) => {
                info!("Wallet upgraded to v3");
                inner.notify(WalletEvent::Upgraded);
            }
            Err(e) => inner.notify(WalletEvent::Error(e.clone())),
        }
        result
    }

    /// Clear a stuck sync flag; secrets are untouched
    pub fn reset_sync_status(&self) -> WalletResult<()> {
        let mut core = self.inner.core();
        if !matches!(core.state, SessionState::Ready | SessionState::Syncing) {
            return Err(invalid("reset sync status", &core.state));
        }
        core.syncs = 0;
        core.state = SessionState::Ready;
        Ok(())
    }

    /// Tear down and reload the whole context
    pub fn load_js(&self) -> ReloadOutcome {
        let mut core = self.inner.core();
        if core.state.is_busy() {
            self.inner.pending_reload.store(true, Ordering::SeqCst);
            debug!(state = %core.state, "Reload deferred");
            return ReloadOutcome::Deferred;
        }
        self.inner.reset(&mut core);
        drop(core);
        self.inner.notify(WalletEvent::Reloaded);
        ReloadOutcome::Completed
    }

    /// Load the scripting context if it is not loaded; true when a load happened
    pub fn load_js_if_needed(&self) -> WalletResult<bool> {
        if self.inner.bridge.is_loaded() {
            return Ok(false);
        }
        self.inner.bridge.load()?;
        Ok(true)
    }

    /// Evaluate through the scripting bridge, reloading and retrying once on failure
    pub fn evaluate(&self, script: &str) -> WalletResult<serde_json::Value> {
        self.load_js_if_needed()?;
        let bridge = &self.inner.bridge;
        match bridge.evaluate(script) {
            Ok(value) => Ok(value),
            Err(BridgeError::EvaluationFailed(reason)) => {
                warn!(%reason, "Script evaluation failed, reloading bridge");
                bridge
                    .load()
                    .and_then(|()| bridge.evaluate(script))
                    .map_err(|e| self.inner.fail(e.into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn mobile_message(&self) -> WalletResult<Option<String>> {
        match self.evaluate(MOBILE_MESSAGE_SCRIPT)? {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(message) => Ok(Some(message)),
            other => Err(BridgeError::EvaluationFailed(format!(
                "mobile message is not a string: {}",
                other
            ))
            .into()),
        }
    }

    // --- Recovery ---

    /// Rebuild a wallet from its recovery phrase under a new identity
    pub fn recover_with_email(
        &self,
        email: Option<String>,
        password: &str,
        mnemonic: &str,
    ) -> PendingOperation<Identity> {
        let previous = {
            let mut core = self.inner.core();
            if !core.state.can_load() {
                return PendingOperation::failed(invalid("recover", &core.state));
            }
            std::mem::replace(&mut core.state, SessionState::Loading)
        };
        let inner = Arc::clone(&self.inner);
        let password = Zeroizing::new(password.to_string());
        let mnemonic = Zeroizing::new(mnemonic.to_string());
        spawn_operation(move |cancelled| async move {
            let result = Arc::clone(&inner)
                .fresh_recovery(cancelled, email, password, mnemonic)
                .await;
            inner.conclude_load(result, previous)
        })
    }

    /// Reopen an existing wallet through the credentials backup tied to a recovery
    /// phrase. Fails with `NoMetadata` when there is no backup, leaving the state as it was.
    pub fn recover_from_metadata_with_mnemonic_passphrase(&self, mnemonic: &str) -> PendingOperation<Identity> {
        let previous = {
            let mut core = self.inner.core();
            if !core.state.can_load() {
                return PendingOperation::failed(invalid("recover", &core.state));
            }
            std::mem::replace(&mut core.state, SessionState::Loading)
        };
        let inner = Arc::clone(&self.inner);
        let mnemonic = Zeroizing::new(mnemonic.to_string());
        spawn_operation(move |cancelled| async move {
            let result = Arc::clone(&inner).metadata_recovery(cancelled, mnemonic).await;
            inner.conclude_load(result, previous)
        })
    }

    pub fn recovered_account_index(&self, asset: AssetType) -> Option<u32> {
        self.inner.core().recovered.get(&asset).copied()
    }

    // --- Sync ---

    pub fn get_history(&self, asset: AssetType) -> PendingOperation<RefreshSummary> {
        if let Err(e) = self.inner.begin_sync(Some(asset)) {
            return PendingOperation::failed(e);
        }
        let inner = Arc::clone(&self.inner);
        spawn_operation(move |cancelled| async move {
            let summaries = inner.sync(cancelled, Some(asset), vec![asset]).await?;
            summaries
                .into_iter()
                .next()
                .ok_or_else(|| WalletError::Network(format!("no {} history returned", asset)))
        })
    }

    pub fn get_history_for_all_assets(&self) -> PendingOperation<Vec<RefreshSummary>> {
        if let Err(e) = self.inner.begin_sync(None) {
            return PendingOperation::failed(e);
        }
        let inner = Arc::clone(&self.inner);
        let assets = self.inner.config.assets.clone();
        spawn_operation(move |cancelled| inner.sync(cancelled, None, assets))
    }

    pub fn refresh_exchange_rates(&self) -> PendingOperation<HashMap<AssetType, Decimal>> {
        let inner = Arc::clone(&self.inner);
        spawn_operation(move |cancelled| async move {
            let rates = inner.ledger.provider().fetch_exchange_rates().await?;
            if cancelled.load(Ordering::SeqCst) {
                return Err(WalletError::Cancelled);
            }
            inner.rates.update(rates.clone());
            Ok(rates)
        })
    }

    // --- Secrets ---

    pub fn strength_of(password: &str) -> f32 {
        strength_of(password)
    }

    pub fn needs_second_password(&self) -> bool {
        self.inner.secrets.needs_second_password()
    }

    pub fn validate_second_password(&self, candidate: &str) -> bool {
        self.inner.secrets.validate_second_password(candidate)
    }

    pub fn set_second_password(&self, candidate: &str) -> WalletResult<()> {
        self.inner
            .mutate(|inner, _| inner.secrets.set_second_password(candidate))
    }

    pub fn remove_second_password(&self, current: &str) -> WalletResult<()> {
        self.inner
            .mutate(|inner, _| inner.secrets.remove_second_password(current))
    }

    pub fn get_mnemonic(&self, second_password: Option<&str>) -> WalletResult<Vec<String>> {
        self.inner.ensure_initialized()?;
        self.inner.secrets.mnemonic(second_password)
    }

    pub fn is_recovery_phrase_verified(&self) -> bool {
        self.inner
            .core()
            .identity
            .as_ref()
            .map(|i| i.recovery_phrase_verified)
            .unwrap_or(false)
    }

    /// Record the user's explicit confirmation that the phrase was written down
    pub fn mark_recovery_phrase_verified(&self) -> WalletResult<()> {
        self.inner.mutate(|_, core| {
            let identity = core.identity.as_mut().ok_or(StateError::NotInitialized)?;
            identity.recovery_phrase_verified = true;
            Ok(())
        })
    }

    // --- Accounts ---

    /// Derive the next HD account for `asset`
    pub fn create_account(
        &self,
        asset: AssetType,
        label: &str,
        second_password: Option<&str>,
    ) -> WalletResult<Account> {
        self.inner.mutate(|inner, _| {
            inner
                .secrets
                .with_seed(second_password, |seed| inner.registry.create_account(seed, asset, label))?
        })
    }

    pub fn has_account(&self, asset: AssetType) -> bool {
        self.inner.registry.has_account(asset)
    }

    pub fn did_upgrade_to_hd(&self) -> bool {
        self.inner.registry.did_upgrade_to_hd()
    }

    pub fn default_account_index(&self, asset: AssetType) -> WalletResult<Option<u32>> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.registry.default_account_index(asset))
    }

    pub fn set_default_account(&self, asset: AssetType, index: u32) -> WalletResult<()> {
        self.inner
            .mutate(|inner, _| inner.registry.set_default(asset, index))
    }

    pub fn active_accounts(&self, asset: AssetType) -> WalletResult<Vec<Account>> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.registry.active_accounts(asset))
    }

    pub fn all_accounts(&self, asset: AssetType) -> WalletResult<Vec<Account>> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.registry.all_accounts(asset))
    }

    pub fn active_accounts_count(&self, asset: AssetType) -> WalletResult<usize> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.registry.active_accounts_count(asset))
    }

    pub fn all_accounts_count(&self, asset: AssetType) -> WalletResult<usize> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.registry.all_accounts_count(asset))
    }

    pub fn index_of_active_account(&self, asset: AssetType, index: u32) -> WalletResult<usize> {
        self.inner.ensure_initialized()?;
        self.inner.registry.index_of_active_account(asset, index)
    }

    pub fn empty_account_index(&self, asset: AssetType) -> WalletResult<u32> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.registry.empty_account_index(asset))
    }

    pub fn label_for_account(&self, asset: AssetType, index: u32) -> WalletResult<String> {
        self.inner.ensure_initialized()?;
        self.inner.registry.label_for(asset, index)
    }

    pub fn set_label(&self, asset: AssetType, index: u32, label: &str) -> WalletResult<()> {
        self.inner
            .mutate(|inner, _| inner.registry.set_label(asset, index, label))
    }

    pub fn xpub_for_account(&self, asset: AssetType, index: u32) -> WalletResult<String> {
        self.inner.ensure_initialized()?;
        self.inner.registry.xpub_for(asset, index)
    }

    pub fn is_account_archived(&self, asset: AssetType, index: u32) -> WalletResult<bool> {
        self.inner.ensure_initialized()?;
        self.inner.registry.is_account_archived(asset, index)
    }

    pub fn archive(&self, asset: AssetType, target: ArchiveTarget, archived: bool) -> WalletResult<()> {
        self.inner
            .mutate(|inner, _| inner.registry.archive(asset, target, archived))
    }

    pub fn toggle_archive_account(&self, asset: AssetType, index: u32) -> WalletResult<bool> {
        self.inner
            .mutate(|inner, _| inner.registry.toggle_archive_account(asset, index))
    }

    pub fn is_account_name_valid(name: &str) -> bool {
        AccountRegistry::is_account_name_valid(name)
    }

    pub fn receive_address(&self, asset: AssetType, index: u32) -> WalletResult<Address> {
        self.inner
            .mutate(|inner, _| inner.registry.receive_address(asset, index))
    }

    // --- Legacy addresses ---

    pub fn import_legacy_address(
        &self,
        asset: AssetType,
        address: &str,
        label: Option<String>,
        watch_only: bool,
    ) -> WalletResult<LegacyAddress> {
        self.inner.mutate(|inner, _| {
            inner
                .registry
                .import_legacy_address(asset, address, label, watch_only)
        })
    }

    pub fn has_legacy_addresses(&self, asset: AssetType) -> bool {
        self.inner.registry.has_legacy_addresses(asset)
    }

    pub fn active_legacy_addresses(&self, asset: AssetType) -> WalletResult<Vec<LegacyAddress>> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.registry.active_legacy_addresses(asset))
    }

    pub fn all_legacy_addresses(&self, asset: AssetType) -> WalletResult<Vec<LegacyAddress>> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.registry.all_legacy_addresses(asset))
    }

    pub fn label_for_legacy_address(&self, asset: AssetType, address: &str) -> WalletResult<Option<String>> {
        self.inner.ensure_initialized()?;
        self.inner.registry.label_for_legacy(asset, address)
    }

    pub fn set_legacy_label(&self, asset: AssetType, address: &str, label: Option<String>) -> WalletResult<()> {
        self.inner
            .mutate(|inner, _| inner.registry.set_legacy_label(asset, address, label))
    }

    pub fn is_address_archived(&self, asset: AssetType, address: &str) -> WalletResult<bool> {
        self.inner.ensure_initialized()?;
        self.inner.registry.is_address_archived(asset, address)
    }

    pub fn is_watch_only_legacy_address(&self, asset: AssetType, address: &str) -> WalletResult<bool> {
        self.inner.ensure_initialized()?;
        self.inner.registry.is_watch_only(asset, address)
    }

    pub fn toggle_archive_legacy_address(&self, asset: AssetType, address: &str) -> WalletResult<bool> {
        self.inner
            .mutate(|inner, _| inner.registry.toggle_archive_legacy_address(asset, address))
    }

    // --- Balances ---

    pub fn balance_for_account(&self, asset: AssetType, index: u32) -> WalletResult<u128> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.ledger.balance(asset, &BalanceKey::Account(index)))
    }

    pub fn legacy_address_balance(&self, asset: AssetType, address: &str) -> WalletResult<u128> {
        self.inner.ensure_initialized()?;
        Ok(self
            .inner
            .ledger
            .balance(asset, &BalanceKey::Address(address.to_string())))
    }

    pub fn total_active_balance(&self, asset: AssetType) -> WalletResult<u128> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.ledger.total_active_balance(asset, &self.inner.registry))
    }

    pub fn total_active_legacy_balance(&self, asset: AssetType) -> WalletResult<u128> {
        self.inner.ensure_initialized()?;
        Ok(self
            .inner
            .ledger
            .total_active_legacy_balance(asset, &self.inner.registry))
    }

    pub fn fiat_value(&self, asset: AssetType, atomic: u128) -> Option<Decimal> {
        self.inner.rates.fiat_value(asset, atomic)
    }

    // --- Bitcoin Cash address forms ---

    /// CashAddr -> legacy base58
    pub fn from_bitcoin_cash(address: &str) -> Option<String> {
        cashaddr::to_legacy(address)
    }

    /// Legacy base58 -> CashAddr
    pub fn to_bitcoin_cash(address: &str) -> Option<String> {
        cashaddr::from_legacy(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::external::{MemoryMetadataStore, RecordingDelegate, StaticHistoryProvider};
    use std::time::Duration;

    const PASSWORD: &str = "Tr0ub4dor&3";
    const SECOND: &str = "Gr33n-Lantern!42";
    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn session() -> WalletSession {
        WalletSession::builder(test_config()).build()
    }

    /// Payload store whose writes can be switched off
    #[derive(Default)]
    struct FlakyPayloadStore {
        payloads: MemoryPayloadStore,
        failing: AtomicBool,
    }

    impl FlakyPayloadStore {
        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl PayloadStore for FlakyPayloadStore {
        fn load(&self, guid: &str) -> Result<Option<WalletPayload>, WalletError> {
            self.payloads.load(guid)
        }

        fn save(&self, payload: &WalletPayload) -> Result<(), WalletError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(WalletError::Storage("disk full".to_string()));
            }
            self.payloads.save(payload)
        }

        fn guids(&self) -> Result<Vec<String>, WalletError> {
            self.payloads.guids()
        }
    }

    fn abandon_words() -> Vec<String> {
        ABANDON.split(' ').map(str::to_string).collect()
    }

    async fn wait_until(session: &WalletSession, predicate: impl Fn(&SessionState) -> bool) {
        for _ in 0..200 {
            if predicate(&session.state()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session stuck in {}", session.state());
    }

    #[tokio::test]
    async fn test_new_account_scenario() {
        let session = session();
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(!session.is_initialized());

        let identity = session
            .new_account_with_mnemonic(PASSWORD, Some("alice@example.com".to_string()), ABANDON)
            .unwrap();

        assert!(session.is_initialized());
        assert!(identity.is_new);
        assert!(session.is_new());
        assert!(!session.needs_second_password());

        let accounts = session.all_accounts(AssetType::Bitcoin).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].index, 0);
        assert!(accounts[0].is_default);
        assert!(accounts[0].xpub.starts_with("xpub"));
        assert_eq!(session.default_account_index(AssetType::Bitcoin).unwrap(), Some(0));
        assert_eq!(session.get_mnemonic(None).unwrap(), abandon_words());
    }

    #[tokio::test]
    async fn test_new_account_only_from_uninitialized() {
        let session = session();
        session.new_account(PASSWORD, None).unwrap();
        assert_eq!(session.get_mnemonic(None).unwrap().len(), 12);

        assert!(matches!(
            session.new_account(PASSWORD, None).unwrap_err(),
            WalletError::State(StateError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_weak_password_leaves_session_uninitialized() {
        let session = session();
        assert!(session.new_account("abc", None).is_err());
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(
            session.all_accounts(AssetType::Bitcoin).unwrap_err(),
            WalletError::State(StateError::NotInitialized)
        );
    }

    #[tokio::test]
    async fn test_second_password_gate() {
        let session = session();
        session
            .new_account_with_mnemonic(PASSWORD, None, ABANDON)
            .unwrap();
        session.set_second_password(SECOND).unwrap();

        assert!(session.needs_second_password());
        assert_eq!(
            session.get_mnemonic(None).unwrap_err(),
            WalletError::Auth(AuthError::SecondPasswordRequired)
        );
        assert_eq!(session.get_mnemonic(Some(SECOND)).unwrap(), abandon_words());

        assert!(session.create_account(AssetType::Bitcoin, "x", None).is_err());
        let account = session
            .create_account(AssetType::Bitcoin, "x", Some(SECOND))
            .unwrap();
        assert_eq!(account.index, 1);
    }

    #[tokio::test]
    async fn test_reload_and_fetch() {
        let payloads = Arc::new(MemoryPayloadStore::new());
        let session = WalletSession::builder(test_config())
            .payload_store(payloads.clone())
            .build();
        let identity = session.new_account(PASSWORD, None).unwrap();
        session.create_account(AssetType::Ethereum, "trading", None).unwrap();
        session.mark_recovery_phrase_verified().unwrap();
        let mnemonic = session.get_mnemonic(None).unwrap();

        assert_eq!(session.load_js(), ReloadOutcome::Completed);
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.identity().is_none());

        assert_eq!(
            session.fetch_wallet("wrong").unwrap_err(),
            WalletError::Auth(AuthError::WrongPassword)
        );
        assert!(matches!(session.state(), SessionState::Failed(_)));

        let reloaded = session.fetch_wallet(PASSWORD).unwrap();
        assert_eq!(reloaded.guid, identity.guid);
        assert!(session.is_recovery_phrase_verified());
        assert_eq!(session.get_mnemonic(None).unwrap(), mnemonic);
        assert_eq!(session.all_accounts_count(AssetType::Ethereum).unwrap(), 2);
        assert_eq!(session.label_for_account(AssetType::Ethereum, 1).unwrap(), "trading");

        let other = WalletSession::builder(test_config())
            .payload_store(payloads)
            .build();
        assert_eq!(
            other
                .load_wallet_with_guid(&identity.guid, Some("bogus"), PASSWORD)
                .unwrap_err(),
            WalletError::Auth(AuthError::InvalidSharedKey)
        );
        other
            .load_wallet_with_guid(&identity.guid, Some(identity.shared_key.as_str()), PASSWORD)
            .unwrap();
        assert!(other.is_initialized());
    }

    #[tokio::test]
    async fn test_upgrade_legacy_wallet() {
        let config = test_config();
        let payloads = Arc::new(MemoryPayloadStore::new());
        let secrets = SecretStore::new(config.security.kdf_params(), 0.5);
        let identity = Identity::generate(None);
        payloads
            .save(&WalletPayload {
                version: PAYLOAD_VERSION_LEGACY,
                identity: identity.clone(),
                secrets: secrets.initialize(PASSWORD, None).unwrap(),
                accounts: RegistryTable::default(),
            })
            .unwrap();

        let session = WalletSession::builder(config)
            .payload_store(payloads.clone())
            .build();
        session
            .load_wallet_with_guid(&identity.guid, None, PASSWORD)
            .unwrap();
        assert!(!session.did_upgrade_to_hd());
        assert!(session.get_mnemonic(None).is_err());

        session.upgrade_to_v3_wallet(None).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.did_upgrade_to_hd());
        for asset in AssetType::ALL {
            assert!(session.has_account(asset));
        }
        assert_eq!(session.get_mnemonic(None).unwrap().len(), 12);
        assert_eq!(payloads.load(&identity.guid).unwrap().unwrap().version, PAYLOAD_VERSION_HD);

        assert_eq!(
            session.upgrade_to_v3_wallet(None).unwrap_err(),
            WalletError::State(StateError::AlreadyUpgraded)
        );
    }

    #[tokio::test]
    async fn test_fresh_recovery_is_idempotent() {
        let engine = DerivationEngine::new();
        let seed = crate::derivation::tests::abandon_seed();
        let provider = Arc::new(StaticHistoryProvider::new());
        for index in [0, 1] {
            let account = engine.derive_account(&seed, AssetType::Bitcoin, index).unwrap();
            provider.set_activity(&account.derived_addresses[0].value, 2, 10_000);
        }

        let mut discovered = Vec::new();
        for _ in 0..2 {
            let session = WalletSession::builder(test_config())
                .history_provider(provider.clone())
                .build();
            let identity = session
                .recover_with_email(Some("bob@example.com".to_string()), PASSWORD, ABANDON)
                .await
                .unwrap();
            assert_eq!(identity.email.as_deref(), Some("bob@example.com"));
            assert_eq!(session.state(), SessionState::Ready);
            assert_eq!(session.recovered_account_index(AssetType::Bitcoin), Some(1));

            let xpubs: Vec<String> = session
                .all_accounts(AssetType::Bitcoin)
                .unwrap()
                .into_iter()
                .map(|a| a.xpub)
                .collect();
            discovered.push(xpubs);
        }
        assert_eq!(discovered[0].len(), 2);
        assert_eq!(discovered[0], discovered[1]);
    }

    #[tokio::test]
    async fn test_invalid_mnemonic_fails_recovery() {
        let session = session();
        let err = session
            .recover_with_email(None, PASSWORD, &vec!["abandon"; 12].join(" "))
            .await
            .unwrap_err();
        assert_eq!(err, WalletError::Recovery(RecoveryError::InvalidMnemonic));
        assert_eq!(session.state(), SessionState::Failed(err));
    }

    #[tokio::test]
    async fn test_metadata_recovery_without_backup() {
        let session = session();
        let err = session
            .recover_from_metadata_with_mnemonic_passphrase(ABANDON)
            .await
            .unwrap_err();

        assert_eq!(err, WalletError::Recovery(RecoveryError::NoMetadata));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_metadata_recovery_reuses_guid() {
        let payloads = Arc::new(MemoryPayloadStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let provider = Arc::new(StaticHistoryProvider::new());
        let build = || {
            WalletSession::builder(test_config())
                .payload_store(payloads.clone())
                .metadata_store(metadata.clone())
                .history_provider(provider.clone())
                .build()
        };

        let original = build();
        let identity = original
            .recover_with_email(None, PASSWORD, ABANDON)
            .await
            .unwrap();
        assert_eq!(metadata.len(), 1);

        let restored = build();
        let reopened = restored
            .recover_from_metadata_with_mnemonic_passphrase(ABANDON)
            .await
            .unwrap();
        assert_eq!(reopened.guid, identity.guid);
        assert_eq!(restored.state(), SessionState::Ready);
        assert_eq!(restored.get_mnemonic(None).unwrap(), abandon_words());
    }

    #[tokio::test]
    async fn test_new_account_backs_up_credentials() {
        let payloads = Arc::new(MemoryPayloadStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let created = WalletSession::builder(test_config())
            .payload_store(payloads.clone())
            .metadata_store(metadata.clone())
            .build();
        let identity = created
            .new_account_with_mnemonic(PASSWORD, None, ABANDON)
            .unwrap();
        created.wait_for_background_tasks().await;
        assert_eq!(metadata.len(), 1);

        let restored = WalletSession::builder(test_config())
            .payload_store(payloads)
            .metadata_store(metadata)
            .build();
        let reopened = restored
            .recover_from_metadata_with_mnemonic_passphrase(ABANDON)
            .await
            .unwrap();
        assert_eq!(reopened.guid, identity.guid);
    }

    #[tokio::test]
    async fn test_dropping_recovery_cancels_it() {
        let provider =
            Arc::new(StaticHistoryProvider::new().with_delay(Duration::from_millis(5)));
        let session = WalletSession::builder(test_config())
            .history_provider(provider.clone())
            .build();

        let pending = session.recover_with_email(None, PASSWORD, ABANDON);
        assert_eq!(session.state(), SessionState::Loading);
        drop(pending);

        wait_until(&session, |s| *s == SessionState::Uninitialized).await;
        assert!(session.identity().is_none());
        assert!(provider.history_calls() > 0);
    }

    #[tokio::test]
    async fn test_history_sync_and_deferred_reload() {
        let provider =
            Arc::new(StaticHistoryProvider::new().with_delay(Duration::from_millis(50)));
        let delegate = Arc::new(RecordingDelegate::default());
        let session = WalletSession::builder(test_config())
            .history_provider(provider.clone())
            .delegate(delegate.clone())
            .build();
        session
            .new_account_with_mnemonic(PASSWORD, None, ABANDON)
            .unwrap();
        let address = session.all_accounts(AssetType::Bitcoin).unwrap()[0].derived_addresses[0]
            .value
            .clone();
        provider.set_activity(&address, 1, 25_000);

        let summary = session.get_history(AssetType::Bitcoin).await.unwrap();
        assert_eq!(summary.total_balance, 25_000);
        assert_eq!(session.state(), SessionState::Ready);
        assert!(!session.is_new());
        assert_eq!(session.total_active_balance(AssetType::Bitcoin).unwrap(), 25_000);
        assert_eq!(session.balance_for_account(AssetType::Bitcoin, 0).unwrap(), 25_000);

        let events = delegate.events();
        assert!(events.contains(&WalletEvent::SyncStarted {
            asset: Some(AssetType::Bitcoin)
        }));
        assert!(events.contains(&WalletEvent::SyncFinished {
            asset: Some(AssetType::Bitcoin)
        }));

        let pending = session.get_history_for_all_assets();
        assert!(session.is_syncing());
        assert_eq!(session.load_js(), ReloadOutcome::Deferred);
        assert_eq!(session.state(), SessionState::Syncing);

        let summaries = pending.await.unwrap();
        assert_eq!(summaries.len(), AssetType::ALL.len());
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(delegate.events().contains(&WalletEvent::Reloaded));
    }

    #[tokio::test]
    async fn test_reset_sync_status() {
        let session = session();
        assert!(session.reset_sync_status().is_err());

        session.new_account(PASSWORD, None).unwrap();
        let pending = session.get_history(AssetType::Bitcoin);
        session.reset_sync_status().unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        // Offline provider: the sync itself fails, the session stays usable
        assert!(matches!(pending.await, Err(WalletError::Network(_))));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_evaluate_retries_once() {
        let bridge = Arc::new(
            StaticScriptBridge::new()
                .with_response(MOBILE_MESSAGE_SCRIPT, serde_json::json!("Upgrade available")),
        );
        let session = WalletSession::builder(test_config())
            .script_bridge(bridge.clone())
            .build();

        bridge.fail_next(1);
        assert_eq!(
            session.mobile_message().unwrap(),
            Some("Upgrade available".to_string())
        );
        assert_eq!(bridge.load_count(), 2);

        bridge.fail_next(2);
        assert!(matches!(
            session.evaluate(MOBILE_MESSAGE_SCRIPT).unwrap_err(),
            WalletError::Bridge(BridgeError::EvaluationFailed(_))
        ));
        assert!(matches!(session.state(), SessionState::Failed(_)));

        assert_eq!(session.load_js(), ReloadOutcome::Completed);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_account_management_is_persisted() {
        let payloads = Arc::new(MemoryPayloadStore::new());
        let session = WalletSession::builder(test_config())
            .payload_store(payloads.clone())
            .build();
        let identity = session.new_account(PASSWORD, None).unwrap();

        for _ in 0..5 {
            session.create_account(AssetType::Ethereum, "", None).unwrap();
        }
        session.set_default_account(AssetType::Ethereum, 2).unwrap();
        session.set_default_account(AssetType::Ethereum, 5).unwrap();
        session.toggle_archive_account(AssetType::Ethereum, 3).unwrap();
        session
            .import_legacy_address(
                AssetType::BitcoinCash,
                "bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a",
                Some("old".to_string()),
                true,
            )
            .unwrap();

        let stored = payloads.load(&identity.guid).unwrap().unwrap();
        let book = &stored.accounts.books[&AssetType::Ethereum];
        let defaults: Vec<u32> = book
            .accounts
            .iter()
            .filter(|a| a.is_default)
            .map(|a| a.index)
            .collect();
        assert_eq!(defaults, vec![5]);
        assert!(book.accounts[3].is_archived);
        assert_eq!(stored.accounts.books[&AssetType::BitcoinCash].legacy_addresses.len(), 1);

        assert_eq!(session.active_accounts_count(AssetType::Ethereum).unwrap(), 5);
        assert_eq!(session.all_accounts_count(AssetType::Ethereum).unwrap(), 6);
        assert!(session
            .is_watch_only_legacy_address(
                AssetType::BitcoinCash,
                "bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a"
            )
            .unwrap());
    }

    #[test]
    fn test_bitcoin_cash_conversion() {
        let cash = WalletSession::to_bitcoin_cash("1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu").unwrap();
        assert_eq!(
            WalletSession::from_bitcoin_cash(&cash).unwrap(),
            "1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu"
        );
        assert!(WalletSession::from_bitcoin_cash("nonsense").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_sync_drops_results() {
        let provider =
            Arc::new(StaticHistoryProvider::new().with_delay(Duration::from_millis(50)));
        let session = WalletSession::builder(test_config())
            .history_provider(provider.clone())
            .build();
        session
            .new_account_with_mnemonic(PASSWORD, None, ABANDON)
            .unwrap();
        let address = session.all_accounts(AssetType::Bitcoin).unwrap()[0].derived_addresses[0]
            .value
            .clone();
        provider.set_activity(&address, 1, 25_000);

        session.get_history(AssetType::Bitcoin).cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        wait_until(&session, |s| *s == SessionState::Ready).await;
        assert_eq!(session.balance_for_account(AssetType::Bitcoin, 0).unwrap(), 0);
        assert_eq!(session.total_active_balance(AssetType::Bitcoin).unwrap(), 0);
        assert!(session.is_new());

        let summary = session.get_history(AssetType::Bitcoin).await.unwrap();
        assert_eq!(summary.total_balance, 25_000);
        assert_eq!(session.balance_for_account(AssetType::Bitcoin, 0).unwrap(), 25_000);
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back() {
        let payloads = Arc::new(FlakyPayloadStore::default());
        let session = WalletSession::builder(test_config())
            .payload_store(payloads.clone())
            .build();
        let identity = session
            .new_account_with_mnemonic(PASSWORD, None, ABANDON)
            .unwrap();
        payloads.set_failing(true);

        assert_eq!(
            session.create_account(AssetType::Bitcoin, "x", None).unwrap_err(),
            WalletError::Storage("disk full".to_string())
        );
        assert_eq!(session.all_accounts_count(AssetType::Bitcoin).unwrap(), 1);
        assert_eq!(session.empty_account_index(AssetType::Bitcoin).unwrap(), 1);

        assert!(session.set_second_password(SECOND).is_err());
        assert!(!session.needs_second_password());
        assert_eq!(session.get_mnemonic(None).unwrap(), abandon_words());

        assert!(session.mark_recovery_phrase_verified().is_err());
        assert!(!session.is_recovery_phrase_verified());
        assert_eq!(session.state(), SessionState::Ready);

        payloads.set_failing(false);
        assert_eq!(
            session.create_account(AssetType::Bitcoin, "x", None).unwrap().index,
            1
        );
        let stored = payloads.load(&identity.guid).unwrap().unwrap();
        assert_eq!(stored.accounts.books[&AssetType::Bitcoin].accounts.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_upgrade_save_rolls_back() {
        let config = test_config();
        let payloads = Arc::new(FlakyPayloadStore::default());
        let identity = Identity::generate(None);
        payloads
            .save(&WalletPayload {
                version: PAYLOAD_VERSION_LEGACY,
                identity: identity.clone(),
                secrets: SecretStore::new(config.security.kdf_params(), 0.5)
                    .initialize(PASSWORD, None)
                    .unwrap(),
                accounts: RegistryTable::default(),
            })
            .unwrap();
        let session = WalletSession::builder(config)
            .payload_store(payloads.clone())
            .build();
        session
            .load_wallet_with_guid(&identity.guid, None, PASSWORD)
            .unwrap();

        payloads.set_failing(true);
        assert!(matches!(
            session.upgrade_to_v3_wallet(None).unwrap_err(),
            WalletError::Storage(_)
        ));
        assert_eq!(session.state(), SessionState::Ready);
        assert!(!session.did_upgrade_to_hd());
        assert!(!session.has_account(AssetType::Bitcoin));
        assert!(session.get_mnemonic(None).is_err());

        payloads.set_failing(false);
        session.upgrade_to_v3_wallet(None).unwrap();
        assert!(session.did_upgrade_to_hd());
        assert_eq!(session.get_mnemonic(None).unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_recovery_finds_handed_out_addresses() {
        let provider = Arc::new(StaticHistoryProvider::new());
        let build = || {
            WalletSession::builder(test_config())
                .history_provider(provider.clone())
                .build()
        };

        let original = build();
        original
            .new_account_with_mnemonic(PASSWORD, None, ABANDON)
            .unwrap();
        let account = original.create_account(AssetType::Bitcoin, "x", None).unwrap();
        let address = original.receive_address(AssetType::Bitcoin, account.index).unwrap();
        assert_eq!(address.index, 1);
        provider.set_activity(&address.value, 1, 5_000);

        let restored = build();
        restored
            .recover_with_email(None, PASSWORD, ABANDON)
            .await
            .unwrap();
        assert_eq!(restored.all_accounts_count(AssetType::Bitcoin).unwrap(), 2);
        assert_eq!(restored.recovered_account_index(AssetType::Bitcoin), Some(1));

        restored.get_history(AssetType::Bitcoin).await.unwrap();
        assert_eq!(restored.balance_for_account(AssetType::Bitcoin, 1).unwrap(), 5_000);
        assert_eq!(restored.receive_address(AssetType::Bitcoin, 1).unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_bridge_failures_unload_session() {
        let bridge = Arc::new(
            StaticScriptBridge::new()
                .with_response(MOBILE_MESSAGE_SCRIPT, serde_json::json!("hi")),
        );
        let session = WalletSession::builder(test_config())
            .script_bridge(bridge.clone())
            .build();
        session
            .new_account_with_mnemonic(PASSWORD, None, ABANDON)
            .unwrap();
        assert_eq!(session.mobile_message().unwrap(), Some("hi".to_string()));

        // Reload after a failed evaluation does not come back
        bridge.fail_next(1);
        bridge.fail_next_load(1);
        let err = session.evaluate(MOBILE_MESSAGE_SCRIPT).unwrap_err();
        assert_eq!(
            err,
            WalletError::Bridge(BridgeError::LoadFailed("injected load failure".to_string()))
        );
        assert_eq!(session.state(), SessionState::Failed(err));
        assert!(session.identity().is_none());
        assert!(session.get_mnemonic(None).is_err());
        assert!(!session.has_account(AssetType::Bitcoin));

        // Evaluation fails again after the reload
        session.fetch_wallet(PASSWORD).unwrap();
        bridge.fail_next(2);
        assert!(matches!(
            session.evaluate(MOBILE_MESSAGE_SCRIPT).unwrap_err(),
            WalletError::Bridge(BridgeError::EvaluationFailed(_))
        ));
        assert!(matches!(session.state(), SessionState::Failed(_)));
        assert!(session.identity().is_none());
        assert!(!session.has_account(AssetType::Bitcoin));
    }
}
