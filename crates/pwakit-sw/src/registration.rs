//! Worker registration: versions moving through install and activation.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hashbrown::HashMap;
use pwakit_common::{with_timeout, PwaConfig};
use pwakit_net::{Fetch, FetchRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::coordinator::{Handled, SkipWaiting, UpdateCoordinator};
use crate::lifecycle::{CacheLifecycleManager, CacheVersion, PrecacheManifest};
use crate::message::ReplyPort;
use crate::router::{in_scope, CacheStrategyRouter, RoutedResponse, RouterConfig};
use crate::storage::CacheStorage;
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

const EVENT_CAPACITY: usize = 64;

// ==================== Builds ====================

/// The deployable unit a worker runs: a version tag and its app shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBuild {
    pub version: String,
    /// Overrides the configured manifest when present.
    #[serde(default)]
    pub precache: Option<Vec<String>>,
}

impl WorkerBuild {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            precache: None,
        }
    }

    pub fn from_config(config: &PwaConfig) -> Self {
        Self {
            version: config.cache_version.clone(),
            precache: Some(config.precache.clone()),
        }
    }
}

/// Where update checks find the latest build.
#[async_trait]
pub trait BuildSource: Send + Sync {
    async fn fetch_build(&self, script_url: &Url) -> Result<WorkerBuild, ServiceWorkerError>;
}

/// Fetches the build descriptor (JSON) from the worker script URL.
pub struct RemoteBuildSource {
    fetcher: Arc<dyn Fetch>,
    timeout: Duration,
}

impl RemoteBuildSource {
    pub fn new(fetcher: Arc<dyn Fetch>, timeout: Duration) -> Self {
        Self { fetcher, timeout }
    }
}

#[async_trait]
impl BuildSource for RemoteBuildSource {
    async fn fetch_build(&self, script_url: &Url) -> Result<WorkerBuild, ServiceWorkerError> {
        let request = FetchRequest::get(script_url.clone());
        let failure = |reason: String| {
            ServiceWorkerError::NetworkFailure(format!("{script_url}: {reason}"))
        };

        let response = with_timeout(self.timeout, || self.fetcher.fetch(&request))
            .await
            .map_err(|e| failure(e.to_string()))?
            .map_err(|e| failure(e.to_string()))?;
        if !response.ok() {
            return Err(failure(response.status.to_string()));
        }

        response
            .json()
            .map_err(|e| ServiceWorkerError::InvalidBuild(format!("{script_url}: {e}")))
    }
}

/// A build set in process; handy for embedding and tests.
#[derive(Debug)]
pub struct StaticBuildSource {
    build: StdRwLock<WorkerBuild>,
}

impl StaticBuildSource {
    pub fn new(build: WorkerBuild) -> Self {
        Self {
            build: StdRwLock::new(build),
        }
    }

    /// Make `build` the one the next update check sees.
    pub fn publish(&self, build: WorkerBuild) {
        *self.build.write().unwrap_or_else(PoisonError::into_inner) = build;
    }
}

#[async_trait]
impl BuildSource for StaticBuildSource {
    async fn fetch_build(&self, _script_url: &Url) -> Result<WorkerBuild, ServiceWorkerError> {
        Ok(self
            .build
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Everything a worker needs from its host.
#[derive(Clone)]
pub struct WorkerEnvironment {
    pub config: PwaConfig,
    pub storage: Arc<dyn CacheStorage>,
    pub fetcher: Arc<dyn Fetch>,
    pub source: Arc<dyn BuildSource>,
}

impl WorkerEnvironment {
    /// Builds are fetched from the network through `fetcher`.
    pub fn new(config: PwaConfig, storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetch>) -> Self {
        let source = Arc::new(RemoteBuildSource::new(
            fetcher.clone(),
            config.network_timeout(),
        ));
        Self {
            config,
            storage,
            fetcher,
            source,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn BuildSource>) -> Self {
        self.source = source;
        self
    }
}

// ==================== Service Worker ====================

struct WorkerContext {
    router: CacheStrategyRouter,
    lifecycle: CacheLifecycleManager,
    coordinator: UpdateCoordinator,
}

/// One version of the worker.
#[derive(Clone)]
pub struct ServiceWorker {
    id: ServiceWorkerId,
    version: CacheVersion,
    state: ServiceWorkerState,
    context: Arc<WorkerContext>,
}

impl ServiceWorker {
    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn version(&self) -> &CacheVersion {
        &self.version
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.state
    }

    pub fn cache_name(&self) -> &str {
        self.context.lifecycle.cache_name()
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("state", &self.state)
            .finish()
    }
}

// ==================== Registration ====================

/// Lifecycle events, broadcast to every page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A new build started installing.
    UpdateFound {
        worker: ServiceWorkerId,
        version: CacheVersion,
    },
    /// A worker changed state.
    StateChange {
        worker: ServiceWorkerId,
        version: CacheVersion,
        state: ServiceWorkerState,
    },
    /// Controlled pages are now controlled by `worker`.
    ControllerChange {
        worker: ServiceWorkerId,
        version: CacheVersion,
    },
}

/// Which worker a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTarget {
    Active,
    Waiting,
}

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The latest build is already installed or active.
    UpToDate,
    Installed {
        version: CacheVersion,
        activated: bool,
    },
}

#[derive(Default)]
struct Slots {
    installing: Option<ServiceWorker>,
    waiting: Option<ServiceWorker>,
    active: Option<ServiceWorker>,
    clients: usize,
    last_update_check: Option<Instant>,
}

impl Slots {
    fn newest_version(&self) -> Option<&CacheVersion> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
            .map(ServiceWorker::version)
    }
}

struct RegistrationInner {
    scope: Url,
    script_url: Url,
    env: WorkerEnvironment,
    slots: RwLock<Slots>,
    // Install and activate steps never interleave.
    lifecycle: Mutex<()>,
    events: broadcast::Sender<RegistrationEvent>,
    weak_self: Weak<RegistrationInner>,
}

/// A worker registration for one scope.
#[derive(Clone)]
pub struct ServiceWorkerRegistration {
    inner: Arc<RegistrationInner>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url, script_url: Url, env: WorkerEnvironment) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new_cyclic(|weak_self| RegistrationInner {
            scope,
            script_url,
            env,
            slots: RwLock::new(Slots::default()),
            lifecycle: Mutex::new(()),
            events,
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    pub fn scope(&self) -> &Url {
        &self.inner.scope
    }

    pub fn script_url(&self) -> &Url {
        &self.inner.script_url
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistrationEvent> {
        self.inner.events.subscribe()
    }

    pub async fn installing(&self) -> Option<ServiceWorker> {
        self.inner.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<ServiceWorker> {
        self.inner.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<ServiceWorker> {
        self.inner.slots.read().await.active.clone()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.slots.read().await.clients
    }

    /// Check if an update check is due.
    pub async fn needs_update(&self, check_interval: Duration) -> bool {
        match self.inner.slots.read().await.last_update_check {
            Some(last) => last.elapsed() > check_interval,
            None => true,
        }
    }

    /// Look for a new build and install it.
    pub async fn update(&self) -> Result<UpdateOutcome, ServiceWorkerError> {
        self.inner.update().await
    }

    /// Promote the waiting worker, if any.
    pub async fn skip_waiting(&self) -> Result<bool, ServiceWorkerError> {
        let Some(waiting) = self.waiting().await else {
            return Ok(false);
        };
        self.inner.skip_waiting(waiting.id).await
    }

    /// A page started being controlled. Returns its controller.
    pub async fn client_attached(&self) -> Option<ServiceWorkerId> {
        let mut slots = self.inner.slots.write().await;
        slots.clients += 1;
        slots.active.as_ref().map(ServiceWorker::id)
    }

    /// A page went away. The last one leaving lets a waiting worker activate.
    pub async fn client_detached(&self) -> Result<(), ServiceWorkerError> {
        let _guard = self.inner.lifecycle.lock().await;
        let activate = {
            let mut slots = self.inner.slots.write().await;
            slots.clients = slots.clients.saturating_sub(1);
            slots.clients == 0 && slots.waiting.is_some()
        };
        if activate {
            self.inner.activate_waiting().await?;
        }
        Ok(())
    }

    /// Route a fetch through the active worker. `None` means pass through.
    pub async fn handle_fetch(
        &self,
        request: &FetchRequest,
    ) -> Option<Result<RoutedResponse, ServiceWorkerError>> {
        let active = self.active().await?;
        active.context.router.handle_fetch(request).await
    }

    /// Deliver a page message to a worker.
    pub async fn post_message(
        &self,
        target: WorkerTarget,
        data: JsonValue,
        reply: Option<ReplyPort>,
    ) -> Result<Handled, ServiceWorkerError> {
        let worker = match target {
            WorkerTarget::Active => self.active().await,
            WorkerTarget::Waiting => self.waiting().await,
        }
        .ok_or_else(|| ServiceWorkerError::NotFound(format!("no {target:?} worker")))?;

        Ok(worker.context.coordinator.handle_message(&data, reply).await)
    }

    /// Retire every worker. Stores are left alone.
    pub async fn unregister(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        let retired: Vec<ServiceWorker> = {
            let mut slots = self.inner.slots.write().await;
            [slots.installing.take(), slots.waiting.take(), slots.active.take()]
                .into_iter()
                .flatten()
                .collect()
        };
        for mut worker in retired {
            worker.state = ServiceWorkerState::Redundant;
            self.inner.emit_state(&worker);
        }
    }
}

impl fmt::Debug for ServiceWorkerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorkerRegistration")
            .field("scope", &self.inner.scope.as_str())
            .field("script_url", &self.inner.script_url.as_str())
            .finish()
    }
}

impl RegistrationInner {
    fn emit(&self, event: RegistrationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_state(&self, worker: &ServiceWorker) {
        debug!(worker = worker.id.raw(), version = %worker.version, state = ?worker.state, "Worker state");
        self.emit(RegistrationEvent::StateChange {
            worker: worker.id,
            version: worker.version.clone(),
            state: worker.state,
        });
    }

    fn spawn_worker(&self, build: WorkerBuild) -> Result<ServiceWorker, ServiceWorkerError> {
        if build.version.trim().is_empty() {
            return Err(ServiceWorkerError::InvalidBuild("empty version".to_string()));
        }

        let env = &self.env;
        let id = ServiceWorkerId::new();
        let version = CacheVersion::new(build.version);
        let cache_name = version.store_name(&env.config.cache_prefix);
        let manifest =
            PrecacheManifest::new(build.precache.unwrap_or_else(|| env.config.precache.clone()));

        let router = CacheStrategyRouter::new(
            RouterConfig::from_config(&env.config, cache_name.clone(), self.scope.clone()),
            env.storage.clone(),
            env.fetcher.clone(),
        );
        let lifecycle = CacheLifecycleManager::new(
            version.clone(),
            cache_name,
            manifest,
            self.scope.clone(),
            env.storage.clone(),
            env.fetcher.clone(),
            env.config.network_timeout(),
        );
        let host: Weak<dyn SkipWaiting> = self.weak_self.clone();
        let coordinator = UpdateCoordinator::new(id, version.clone(), host);

        Ok(ServiceWorker {
            id,
            version,
            state: ServiceWorkerState::Parsed,
            context: Arc::new(WorkerContext {
                router,
                lifecycle,
                coordinator,
            }),
        })
    }

    async fn update(&self) -> Result<UpdateOutcome, ServiceWorkerError> {
        let _guard = self.lifecycle.lock().await;
        self.slots.write().await.last_update_check = Some(Instant::now());

        let build = self.env.source.fetch_build(&self.script_url).await?;
        let up_to_date = self
            .slots
            .read()
            .await
            .newest_version()
            .is_some_and(|v| v.as_str() == build.version);
        if up_to_date {
            debug!(scope = %self.scope, version = %build.version, "Up to date");
            return Ok(UpdateOutcome::UpToDate);
        }

        let mut worker = self.spawn_worker(build)?;
        let version = worker.version.clone();
        info!(scope = %self.scope, version = %version, "Update found");
        self.emit(RegistrationEvent::UpdateFound {
            worker: worker.id,
            version: version.clone(),
        });

        worker.state = ServiceWorkerState::Installing;
        self.emit_state(&worker);
        self.slots.write().await.installing = Some(worker.clone());

        let installed = worker.context.lifecycle.install().await;

        let activate_now = {
            let mut slots = self.slots.write().await;
            slots.installing = None;

            if let Err(e) = installed {
                drop(slots);
                worker.state = ServiceWorkerState::Redundant;
                self.emit_state(&worker);
                return Err(e);
            }

            if let Some(mut replaced) = slots.waiting.take() {
                replaced.state = ServiceWorkerState::Redundant;
                self.emit_state(&replaced);
            }

            worker.state = ServiceWorkerState::Installed;
            slots.waiting = Some(worker.clone());
            slots.active.is_none() || slots.clients == 0
        };
        self.emit_state(&worker);

        let activated = activate_now && self.activate_waiting().await?;
        Ok(UpdateOutcome::Installed { version, activated })
    }

    /// Caller holds the lifecycle lock.
    async fn activate_waiting(&self) -> Result<bool, ServiceWorkerError> {
        let Some(mut worker) = self.slots.write().await.waiting.take() else {
            return Ok(false);
        };

        worker.state = ServiceWorkerState::Activating;
        self.emit_state(&worker);

        if let Err(e) = worker.context.lifecycle.activate().await {
            warn!(version = %worker.version, error = %e, "Activation failed, worker stays waiting");
            worker.state = ServiceWorkerState::Installed;
            self.slots.write().await.waiting = Some(worker);
            return Err(e);
        }

        worker.state = ServiceWorkerState::Activated;
        let (previous, clients) = {
            let mut slots = self.slots.write().await;
            (slots.active.replace(worker.clone()), slots.clients)
        };

        if let Some(mut previous) = previous {
            previous.state = ServiceWorkerState::Redundant;
            self.emit_state(&previous);
        }
        self.emit_state(&worker);

        if clients > 0 {
            info!(version = %worker.version, clients, "Claiming clients");
            self.emit(RegistrationEvent::ControllerChange {
                worker: worker.id,
                version: worker.version.clone(),
            });
        }
        Ok(true)
    }
}

#[async_trait]
impl SkipWaiting for RegistrationInner {
    async fn skip_waiting(&self, worker: ServiceWorkerId) -> Result<bool, ServiceWorkerError> {
        let _guard = self.lifecycle.lock().await;
        let is_waiting = self
            .slots
            .read()
            .await
            .waiting
            .as_ref()
            .is_some_and(|w| w.id == worker);
        if !is_waiting {
            return Ok(false);
        }
        self.activate_waiting().await
    }
}

// ==================== Container ====================

/// All registrations of an origin.
pub struct ServiceWorkerContainer {
    env: WorkerEnvironment,
    registrations: RwLock<HashMap<String, ServiceWorkerRegistration>>,
}

impl ServiceWorkerContainer {
    pub fn new(env: WorkerEnvironment) -> Self {
        Self {
            env,
            registrations: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PwaConfig {
        &self.env.config
    }

    /// Register a worker. A new registration runs its first install before
    /// being returned; an existing one for the same scope is returned as is.
    pub async fn register(
        &self,
        script_url: &str,
        scope: Option<&str>,
    ) -> Result<ServiceWorkerRegistration, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;

        let scope = match scope {
            Some(s) => script_url
                .join(s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
            None => script_url
                .join("./")
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
        };

        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {scope} is not same-origin with {script_url}"
            )));
        }

        let key = scope.to_string();
        if let Some(existing) = self.registrations.read().await.get(&key) {
            return Ok(existing.clone());
        }

        let registration = ServiceWorkerRegistration::new(scope, script_url, self.env.clone());
        registration.update().await?;

        let mut registrations = self.registrations.write().await;
        Ok(registrations.entry(key).or_insert(registration).clone())
    }

    /// Registration whose scope covers `url` most specifically.
    pub async fn get_registration(&self, url: &Url) -> Option<ServiceWorkerRegistration> {
        self.registrations
            .read()
            .await
            .values()
            .filter(|registration| in_scope(url, registration.scope()))
            .max_by_key(|registration| registration.scope().path().len())
            .cloned()
    }

    pub async fn get_registrations(&self) -> Vec<ServiceWorkerRegistration> {
        self.registrations.read().await.values().cloned().collect()
    }

    /// Route a page fetch through whichever registration controls it.
    pub async fn handle_fetch(
        &self,
        request: &FetchRequest,
    ) -> Option<Result<RoutedResponse, ServiceWorkerError>> {
        let registration = self.get_registration(&request.url).await?;
        registration.handle_fetch(request).await
    }

    pub async fn unregister(&self, scope: &str) -> bool {
        let removed = self.registrations.write().await.remove(scope);
        match removed {
            Some(registration) => {
                registration.unregister().await;
                true
            }
            None => false,
        }
    }
}
