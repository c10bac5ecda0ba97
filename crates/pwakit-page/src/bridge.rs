//! # Client Lifecycle Bridge
//!
//! The per-page session object. It owns the page's registration handle and
//! the captured install prompt, and turns worker lifecycle events into page
//! events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};

use async_trait::async_trait;
use pwakit_common::{with_timeout, PwaConfig};
use pwakit_sw::{
    ClientMessage, Handled, MessageChannel, RegistrationEvent, ServiceWorkerContainer,
    ServiceWorkerError, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
    UpdateOutcome, WorkerMessage, WorkerTarget,
};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::connectivity::{UiCommand, UiInput};
use crate::events::{PageEvent, PageEventBus};
use crate::PageError;

/// What the user chose when the install prompt was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Accepted,
    Dismissed,
}

/// The platform's deferred install prompt.
#[async_trait]
pub trait InstallPromptEvent: Send {
    /// Stop the platform from showing the prompt on its own.
    fn prevent_default(&mut self);

    /// Show the prompt and wait for the user's choice.
    async fn prompt(self: Box<Self>) -> InstallOutcome;
}

/// Page operations the bridge cannot perform itself.
pub trait PageHost: Send + Sync {
    fn reload(&self);
}

/// Per-page PWA session.
pub struct ClientLifecycleBridge {
    page_url: Url,
    config: PwaConfig,
    container: Arc<ServiceWorkerContainer>,
    bus: PageEventBus,
    registration: OnceLock<ServiceWorkerRegistration>,
    controller: Arc<watch::Sender<Option<ServiceWorkerId>>>,
    deferred_prompt: Mutex<Option<Box<dyn InstallPromptEvent>>>,
    installed: AtomicBool,
    closed: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ClientLifecycleBridge {
    pub fn new(
        page_url: Url,
        config: PwaConfig,
        container: Arc<ServiceWorkerContainer>,
        bus: PageEventBus,
    ) -> Self {
        let (controller, _) = watch::channel(None);
        Self {
            page_url,
            config,
            container,
            bus,
            registration: OnceLock::new(),
            controller: Arc::new(controller),
            deferred_prompt: Mutex::new(None),
            installed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// The page was launched as an installed app.
    pub fn launched_standalone(self, standalone: bool) -> Self {
        self.installed.store(standalone, Ordering::SeqCst);
        self
    }

    pub fn bus(&self) -> &PageEventBus {
        &self.bus
    }

    pub fn registration(&self) -> Option<&ServiceWorkerRegistration> {
        self.registration.get()
    }

    /// The worker controlling this page.
    pub fn controller(&self) -> Option<ServiceWorkerId> {
        *self.controller.borrow()
    }

    /// Register the worker at the configured base path and start
    /// listening to its lifecycle. Registering twice returns the same
    /// registration.
    pub async fn register(&self) -> Result<ServiceWorkerRegistration, PageError> {
        if let Some(registration) = self.registration.get() {
            return Ok(registration.clone());
        }

        let scope = self.page_url.join(&self.config.base_path)?;
        let script_url = scope.join(&self.config.worker_script)?;

        let registration = self
            .container
            .register(script_url.as_str(), Some(scope.as_str()))
            .await?;
        if self.registration.set(registration.clone()).is_err() {
            // Lost a race with a concurrent register().
            return self.registration().cloned().ok_or(PageError::NotRegistered);
        }

        let events = registration.subscribe();
        let controller = registration.client_attached().await;
        self.controller.send_replace(controller);
        info!(scope = %registration.scope(), ?controller, "Registered");

        let listener = tokio::spawn(listen(events, self.bus.clone(), self.controller.clone()));
        self.track(listener);

        Ok(registration)
    }

    /// Check for a new build every `update_check_interval`.
    pub fn start_update_checks(&self) -> Result<(), PageError> {
        let registration = self.require_registration()?.clone();
        let period = self.config.update_check_interval();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                match registration.update().await {
                    Ok(outcome) => debug!(?outcome, "Periodic update check"),
                    Err(e) => warn!(error = %e, "Periodic update check failed"),
                }
            }
        });
        self.track(task);
        Ok(())
    }

    pub async fn check_for_update(&self) -> Result<UpdateOutcome, PageError> {
        Ok(self.require_registration()?.update().await?)
    }

    /// Ask the waiting worker to take over and wait until it controls this
    /// page. Returns `false` when nothing was waiting.
    pub async fn apply_update(&self) -> Result<bool, PageError> {
        let registration = self.require_registration()?;
        let Some(waiting) = registration.waiting().await else {
            debug!("No waiting worker to activate");
            return Ok(false);
        };

        let mut controller = self.controller.subscribe();
        let posted = registration
            .post_message(
                WorkerTarget::Waiting,
                ClientMessage::ForceActivate.to_json(),
                None,
            )
            .await;
        let handled = match posted {
            Ok(handled) => handled,
            // Promoted by another page since the lookup above.
            Err(ServiceWorkerError::NotFound(_)) => {
                debug!(version = %waiting.version(), "Waiting worker already gone");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if handled != (Handled::SkipWaiting { activated: true }) {
            return Ok(false);
        }

        let target = Some(waiting.id());
        let controller = &mut controller;
        with_timeout(self.config.network_timeout(), move || async move {
            controller
                .wait_for(|current| *current == target)
                .await
                .map(|_| ())
        })
        .await?
        .map_err(|_| PageError::Closed)?;

        info!(version = %waiting.version(), "Update applied");
        Ok(true)
    }

    /// Ask the active worker for its version tag.
    pub async fn query_version(&self) -> Result<String, PageError> {
        let registration = self.require_registration()?;
        let channel = MessageChannel::new();

        registration
            .post_message(
                WorkerTarget::Active,
                ClientMessage::QueryVersion.to_json(),
                Some(channel.port2),
            )
            .await?;

        let reply = with_timeout(self.config.network_timeout(), || channel.port1.recv()).await??;
        match WorkerMessage::parse(&reply) {
            Some(WorkerMessage::VersionReply { version }) => Ok(version),
            None => Err(PageError::UnexpectedReply(reply.to_string())),
        }
    }

    /// Hold on to the platform's install prompt for later.
    pub async fn capture_install_prompt(&self, mut event: Box<dyn InstallPromptEvent>) {
        event.prevent_default();
        *self.deferred_prompt.lock().await = Some(event);
        debug!("Install prompt captured");
        self.bus.dispatch(PageEvent::Installable);
    }

    /// Replay the captured prompt. `None` if there is none; each captured
    /// prompt can be shown once.
    pub async fn prompt_install(&self) -> Option<InstallOutcome> {
        let Some(event) = self.deferred_prompt.lock().await.take() else {
            debug!("No install prompt available");
            return None;
        };

        let outcome = event.prompt().await;
        info!(?outcome, "Install prompt answered");
        Some(outcome)
    }

    pub async fn has_install_prompt(&self) -> bool {
        self.deferred_prompt.lock().await.is_some()
    }

    pub async fn on_app_installed(&self) {
        self.installed.store(true, Ordering::SeqCst);
        self.deferred_prompt.lock().await.take();
        info!("App installed");
        self.bus.dispatch(PageEvent::Installed);
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// The page is going away.
    pub async fn close(&self) -> Result<(), PageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        if let Some(registration) = self.registration.get() {
            registration.client_detached().await?;
        }
        debug!(page = %self.page_url, "Bridge closed");
        Ok(())
    }

    fn require_registration(&self) -> Result<&ServiceWorkerRegistration, PageError> {
        self.registration.get().ok_or(PageError::NotRegistered)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }
}

impl Drop for ClientLifecycleBridge {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

async fn listen(
    mut events: broadcast::Receiver<RegistrationEvent>,
    bus: PageEventBus,
    controller: Arc<watch::Sender<Option<ServiceWorkerId>>>,
) {
    loop {
        match events.recv().await {
            Ok(RegistrationEvent::StateChange {
                state: ServiceWorkerState::Installed,
                version,
                ..
            }) => {
                // Only an update if something already controls the page.
                if controller.borrow().is_some() {
                    info!(version = %version, "Update available");
                    bus.dispatch(PageEvent::UpdateAvailable);
                }
            }
            Ok(RegistrationEvent::ControllerChange { worker, version }) => {
                debug!(version = %version, "Controller changed");
                controller.send_replace(Some(worker));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Registration events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Carry out UI commands until the page reloads.
pub async fn serve_commands(
    bridge: Arc<ClientLifecycleBridge>,
    mut commands: mpsc::UnboundedReceiver<UiCommand>,
    inputs: mpsc::UnboundedSender<UiInput>,
    host: Arc<dyn PageHost>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            UiCommand::ForceActivate => match bridge.apply_update().await {
                // Nothing waiting usually means another page already activated it.
                Ok(_) => {
                    let _ = inputs.send(UiInput::ActivationAcknowledged);
                }
                Err(e) => {
                    warn!(error = %e, "Could not activate update");
                    let _ = inputs.send(UiInput::ActivationFailed);
                }
            },
            UiCommand::Reload => {
                host.reload();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pwakit_net::mock::MockFetcher;
    use crate::connectivity::{ConnectivityUiStateMachine, UpdateState};
    use pwakit_sw::{MemoryCacheStorage, StaticBuildSource, WorkerBuild, WorkerEnvironment};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const PAGE: &str = "https://example.com/app/index.html";

    struct Fixture {
        bridge: ClientLifecycleBridge,
        container: Arc<ServiceWorkerContainer>,
        source: Arc<StaticBuildSource>,
    }

    fn config() -> PwaConfig {
        PwaConfig {
            base_path: "/app/".to_string(),
            precache: vec!["./".to_string()],
            ..Default::default()
        }
    }

    fn fixture() -> Fixture {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://example.com/app/", "shell");
        let source = Arc::new(StaticBuildSource::new(WorkerBuild::new("v1")));
        let env = WorkerEnvironment::new(config(), Arc::new(MemoryCacheStorage::new()), fetcher)
            .with_source(source.clone());
        let container = Arc::new(ServiceWorkerContainer::new(env));

        Fixture {
            bridge: page(&container),
            container,
            source,
        }
    }

    fn page(container: &Arc<ServiceWorkerContainer>) -> ClientLifecycleBridge {
        ClientLifecycleBridge::new(
            Url::parse(PAGE).unwrap(),
            config(),
            container.clone(),
            PageEventBus::new(),
        )
    }

    fn forward(bus: &PageEventBus, event: PageEvent) -> mpsc::UnboundedReceiver<PageEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(event, move |e| {
            let _ = tx.send(e);
        });
        rx
    }

    struct FakePrompt {
        prevented: Arc<AtomicBool>,
        shown: Arc<AtomicUsize>,
        outcome: InstallOutcome,
    }

    #[async_trait]
    impl InstallPromptEvent for FakePrompt {
        fn prevent_default(&mut self) {
            self.prevented.store(true, Ordering::SeqCst);
        }

        async fn prompt(self: Box<Self>) -> InstallOutcome {
            self.shown.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        reloads: AtomicUsize,
    }

    impl PageHost for RecordingHost {
        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_register_uses_base_path_scope() {
        let f = fixture();
        let registration = f.bridge.register().await.unwrap();

        assert_eq!(registration.scope().as_str(), "https://example.com/app/");
        assert_eq!(
            registration.script_url().as_str(),
            "https://example.com/app/sw.json"
        );
        assert!(f.bridge.controller().is_some());
        assert_eq!(registration.client_count().await, 1);

        // Idempotent.
        f.bridge.register().await.unwrap();
        assert_eq!(registration.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_operations_require_registration() {
        let f = fixture();
        assert!(matches!(
            f.bridge.check_for_update().await,
            Err(PageError::NotRegistered)
        ));
        assert!(matches!(
            f.bridge.query_version().await,
            Err(PageError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_query_version() {
        let f = fixture();
        f.bridge.register().await.unwrap();
        assert_eq!(f.bridge.query_version().await.unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_update_signal_then_apply() {
        let f = fixture();
        f.bridge.register().await.unwrap();
        let mut updates = forward(f.bridge.bus(), PageEvent::UpdateAvailable);

        f.source.publish(WorkerBuild::new("v2"));
        let outcome = f.bridge.check_for_update().await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Installed { activated: false, .. }));
        assert_eq!(updates.recv().await, Some(PageEvent::UpdateAvailable));

        assert!(f.bridge.apply_update().await.unwrap());
        assert_eq!(f.bridge.query_version().await.unwrap(), "v2");
        let registration = f.bridge.registration().unwrap();
        assert_eq!(
            f.bridge.controller(),
            registration.active().await.map(|w| w.id())
        );
    }

    #[tokio::test]
    async fn test_apply_update_without_waiting_is_noop() {
        let f = fixture();
        f.bridge.register().await.unwrap();
        assert!(!f.bridge.apply_update().await.unwrap());
    }

    #[tokio::test]
    async fn test_first_install_is_not_an_update() {
        let f = fixture();
        let mut updates = forward(f.bridge.bus(), PageEvent::UpdateAvailable);
        f.bridge.register().await.unwrap();

        f.bridge.close().await.unwrap();
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_install_prompt_is_consumed_once() {
        let f = fixture();
        let mut installable = forward(f.bridge.bus(), PageEvent::Installable);
        let prevented = Arc::new(AtomicBool::new(false));
        let shown = Arc::new(AtomicUsize::new(0));

        f.bridge
            .capture_install_prompt(Box::new(FakePrompt {
                prevented: prevented.clone(),
                shown: shown.clone(),
                outcome: InstallOutcome::Accepted,
            }))
            .await;
        assert!(prevented.load(Ordering::SeqCst));
        assert_eq!(installable.recv().await, Some(PageEvent::Installable));

        assert_eq!(f.bridge.prompt_install().await, Some(InstallOutcome::Accepted));
        assert_eq!(f.bridge.prompt_install().await, None);
        assert_eq!(shown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_app_installed_clears_prompt() {
        let f = fixture();
        let mut installed = forward(f.bridge.bus(), PageEvent::Installed);

        f.bridge
            .capture_install_prompt(Box::new(FakePrompt {
                prevented: Arc::new(AtomicBool::new(false)),
                shown: Arc::new(AtomicUsize::new(0)),
                outcome: InstallOutcome::Dismissed,
            }))
            .await;
        assert!(!f.bridge.is_installed());

        f.bridge.on_app_installed().await;
        assert!(f.bridge.is_installed());
        assert!(!f.bridge.has_install_prompt().await);
        assert_eq!(installed.recv().await, Some(PageEvent::Installed));
    }

    #[tokio::test]
    async fn test_standalone_launch_counts_as_installed() {
        let f = fixture();
        let bridge = page(&f.container).launched_standalone(true);
        assert!(bridge.is_installed());
    }

    #[tokio::test]
    async fn test_closing_last_page_activates_waiting() {
        let f = fixture();
        let registration = f.bridge.register().await.unwrap();
        f.source.publish(WorkerBuild::new("v2"));
        f.bridge.check_for_update().await.unwrap();

        f.bridge.close().await.unwrap();
        f.bridge.close().await.unwrap();
        assert_eq!(registration.client_count().await, 0);
        assert_eq!(registration.active().await.unwrap().version().as_str(), "v2");
    }

    #[tokio::test]
    async fn test_second_page_shares_registration() {
        let f = fixture();
        let first = f.bridge.register().await.unwrap();
        let other = page(&f.container);
        let second = other.register().await.unwrap();

        assert_eq!(first.scope(), second.scope());
        assert_eq!(first.client_count().await, 2);
        assert_eq!(f.container.get_registrations().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_update_checks() {
        let f = fixture();
        let registration = f.bridge.register().await.unwrap();
        f.bridge.start_update_checks().unwrap();

        f.source.publish(WorkerBuild::new("v2"));
        tokio::time::sleep(Duration::from_secs(3600) + Duration::from_secs(1)).await;

        assert_eq!(registration.waiting().await.unwrap().version().as_str(), "v2");
    }

    #[tokio::test]
    async fn test_serve_commands_activates_and_reloads() {
        let f = fixture();
        let bridge = Arc::new(f.bridge);
        bridge.register().await.unwrap();
        f.source.publish(WorkerBuild::new("v2"));
        bridge.check_for_update().await.unwrap();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inputs_tx, mut inputs_rx) = mpsc::unbounded_channel();
        let host = Arc::new(RecordingHost::default());
        let server = tokio::spawn(serve_commands(
            bridge.clone(),
            commands_rx,
            inputs_tx,
            host.clone(),
        ));

        commands_tx.send(UiCommand::ForceActivate).unwrap();
        assert_eq!(inputs_rx.recv().await, Some(UiInput::ActivationAcknowledged));
        commands_tx.send(UiCommand::Reload).unwrap();
        server.await.unwrap();

        assert_eq!(host.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.query_version().await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_concurrent_apply_from_two_pages() {
        let f = fixture();
        f.bridge.register().await.unwrap();
        let other = page(&f.container);
        other.register().await.unwrap();
        f.source.publish(WorkerBuild::new("v2"));
        f.bridge.check_for_update().await.unwrap();

        let (first, second) = tokio::join!(f.bridge.apply_update(), other.apply_update());
        let applied = [first.unwrap(), second.unwrap()];
        assert_eq!(applied.iter().filter(|a| **a).count(), 1);
        assert_eq!(other.query_version().await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_failed_activation_reopens_banner() {
        let f = fixture();
        let bridge = Arc::new(f.bridge);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let mut sm = ConnectivityUiStateMachine::new(true, Duration::from_secs(8), commands_tx);
        let host = Arc::new(RecordingHost::default());
        let server = tokio::spawn(serve_commands(
            bridge.clone(),
            commands_rx,
            sm.sender(),
            host.clone(),
        ));

        // Never registered, so activation fails.
        sm.handle(UiInput::UpdateAvailable);
        sm.handle(UiInput::UpdateNow);
        assert_eq!(sm.step().await, Some(UiInput::ActivationFailed));
        assert_eq!(sm.update_state(), UpdateState::UpdateAvailable);
        assert!(sm.view().update_banner_visible);

        // The user can try again.
        assert!(sm.handle(UiInput::UpdateNow));
        assert_eq!(sm.step().await, Some(UiInput::ActivationFailed));
        assert_eq!(host.reloads.load(Ordering::SeqCst), 0);

        drop(sm);
        server.await.unwrap();
    }
}
