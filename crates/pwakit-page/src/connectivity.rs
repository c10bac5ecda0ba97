//! # Connectivity UI
//!
//! Offline panel / indicator and update banner state for one page.
//!
//! Two independent machines share one input queue:
//!
//! ```text
//! Online ──offline──▶ OfflineVisible ──timer──▶ OfflineMinimized
//!    ▲                  │      ▲                     │
//!    │               dismiss   └──────expand─────────┤
//!    │                  ▼                         dismiss
//!    └──online── DismissedUntilReconnect ◀───────────┘
//!
//! Idle ──update available──▶ UpdateAvailable ──update now──▶ Activating ──ack──▶ Reloading
//!                                  ▲                            │
//!                                  └───activation failed────────┘
//! ```
//!
//! `online` returns to `Online` from every state.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{PageEvent, PageEventBus, SubscriptionId};

// ==================== States ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityState {
    #[default]
    Online,
    /// Full offline panel.
    OfflineVisible,
    /// Collapsed indicator only.
    OfflineMinimized,
    /// Nothing shown until the network comes back.
    DismissedUntilReconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
    #[default]
    Idle,
    UpdateAvailable,
    /// Force-activate sent, waiting for the new controller.
    Activating,
    /// Terminal for the page's lifetime.
    Reloading,
}

/// Everything that can move the machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiInput {
    Online,
    Offline,
    /// The visibility timer armed as `generation` elapsed.
    VisibilityTimeout { generation: u64 },
    Expand,
    Dismiss,
    UpdateAvailable,
    UpdateNow,
    ActivationAcknowledged,
    /// The waiting worker could not be activated; the update stays on offer.
    ActivationFailed,
}

/// Side effects for the page glue to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCommand {
    /// Ask the waiting worker to take over.
    ForceActivate,
    Reload,
}

/// What should be on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UiView {
    pub offline_panel_visible: bool,
    pub offline_indicator_visible: bool,
    pub update_banner_visible: bool,
}

impl UiView {
    fn of(connectivity: ConnectivityState, update: UpdateState) -> Self {
        Self {
            offline_panel_visible: connectivity == ConnectivityState::OfflineVisible,
            offline_indicator_visible: connectivity == ConnectivityState::OfflineMinimized,
            update_banner_visible: matches!(
                update,
                UpdateState::UpdateAvailable | UpdateState::Activating
            ),
        }
    }
}

// ==================== Timer ====================

/// A pending visibility timeout. Dropping it cancels it.
#[derive(Debug)]
pub struct VisibilityTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl VisibilityTimer {
    /// Post `VisibilityTimeout { generation }` to `inputs` after `timeout`.
    pub fn arm(inputs: mpsc::UnboundedSender<UiInput>, timeout: Duration, generation: u64) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inputs.send(UiInput::VisibilityTimeout { generation });
        });
        Self { generation, handle }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(self) {
        // Drop aborts.
    }
}

impl Drop for VisibilityTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ==================== State Machine ====================

type ViewObserver = Box<dyn Fn(&UiView) + Send>;

/// Page-side connectivity and update UI.
pub struct ConnectivityUiStateMachine {
    connectivity: ConnectivityState,
    update: UpdateState,
    visibility_timeout: Duration,
    timer: Option<VisibilityTimer>,
    generation: u64,
    view: UiView,
    inputs_tx: mpsc::UnboundedSender<UiInput>,
    inputs_rx: mpsc::UnboundedReceiver<UiInput>,
    commands: mpsc::UnboundedSender<UiCommand>,
    observers: Vec<ViewObserver>,
    subscriptions: Vec<(PageEventBus, SubscriptionId)>,
}

impl ConnectivityUiStateMachine {
    /// Starts in `OfflineVisible` (timer armed) when the page loads offline.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        initially_online: bool,
        visibility_timeout: Duration,
        commands: mpsc::UnboundedSender<UiCommand>,
    ) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let mut machine = Self {
            connectivity: ConnectivityState::Online,
            update: UpdateState::Idle,
            visibility_timeout,
            timer: None,
            generation: 0,
            view: UiView::default(),
            inputs_tx,
            inputs_rx,
            commands,
            observers: Vec::new(),
            subscriptions: Vec::new(),
        };
        if !initially_online {
            machine.show_offline_panel();
            machine.view = UiView::of(machine.connectivity, machine.update);
        }
        machine
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity
    }

    pub fn update_state(&self) -> UpdateState {
        self.update
    }

    pub fn view(&self) -> UiView {
        self.view
    }

    /// Whether a visibility timer is pending.
    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Queue for user actions and acknowledgements.
    pub fn sender(&self) -> mpsc::UnboundedSender<UiInput> {
        self.inputs_tx.clone()
    }

    /// Called with the new view whenever it changes.
    pub fn observe<F>(&mut self, observer: F)
    where
        F: Fn(&UiView) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Feed `pwa:online`, `pwa:offline` and `pwa:updateavailable` from `bus`.
    pub fn attach(&mut self, bus: &PageEventBus) {
        let forwarded = [
            (PageEvent::Online, UiInput::Online),
            (PageEvent::Offline, UiInput::Offline),
            (PageEvent::UpdateAvailable, UiInput::UpdateAvailable),
        ];
        for (event, input) in forwarded {
            let inputs = self.inputs_tx.clone();
            let id = bus.subscribe(event, move |_| {
                let _ = inputs.send(input);
            });
            self.subscriptions.push((bus.clone(), id));
        }
    }

    pub fn detach(&mut self) {
        for (bus, id) in self.subscriptions.drain(..) {
            bus.unsubscribe(id);
        }
    }

    /// Apply one input. Returns `true` if either machine changed state.
    pub fn handle(&mut self, input: UiInput) -> bool {
        let before = (self.connectivity, self.update);

        match input {
            UiInput::Online => {
                self.cancel_timer();
                self.connectivity = ConnectivityState::Online;
            }
            UiInput::Offline => match self.connectivity {
                ConnectivityState::Online | ConnectivityState::OfflineMinimized => {
                    self.show_offline_panel();
                }
                ConnectivityState::OfflineVisible | ConnectivityState::DismissedUntilReconnect => {}
            },
            UiInput::VisibilityTimeout { generation } => {
                let current = self.timer.as_ref().map(VisibilityTimer::generation);
                if self.connectivity == ConnectivityState::OfflineVisible
                    && current == Some(generation)
                {
                    self.timer = None;
                    self.connectivity = ConnectivityState::OfflineMinimized;
                } else {
                    debug!(generation, "Stale visibility timeout");
                }
            }
            UiInput::Expand => {
                if self.connectivity == ConnectivityState::OfflineMinimized {
                    self.show_offline_panel();
                }
            }
            UiInput::Dismiss => {
                if matches!(
                    self.connectivity,
                    ConnectivityState::OfflineVisible | ConnectivityState::OfflineMinimized
                ) {
                    self.cancel_timer();
                    self.connectivity = ConnectivityState::DismissedUntilReconnect;
                }
            }
            UiInput::UpdateAvailable => {
                if self.update == UpdateState::Idle {
                    self.update = UpdateState::UpdateAvailable;
                }
            }
            UiInput::UpdateNow => {
                if self.update == UpdateState::UpdateAvailable {
                    self.update = UpdateState::Activating;
                    self.send_command(UiCommand::ForceActivate);
                }
            }
            UiInput::ActivationAcknowledged => {
                if self.update == UpdateState::Activating {
                    self.update = UpdateState::Reloading;
                    info!("New version active, reloading");
                    self.send_command(UiCommand::Reload);
                }
            }
            UiInput::ActivationFailed => {
                if self.update == UpdateState::Activating {
                    self.update = UpdateState::UpdateAvailable;
                }
            }
        }

        let changed = before != (self.connectivity, self.update);
        if changed {
            debug!(?input, connectivity = ?self.connectivity, update = ?self.update, "UI transition");
            self.publish_view();
        }
        changed
    }

    /// Wait for the next input and apply it.
    pub async fn step(&mut self) -> Option<UiInput> {
        let input = self.inputs_rx.recv().await?;
        self.handle(input);
        Some(input)
    }

    /// Apply an input if one is already queued.
    pub fn try_step(&mut self) -> Option<UiInput> {
        let input = self.inputs_rx.try_recv().ok()?;
        self.handle(input);
        Some(input)
    }

    /// Process inputs until the page reloads.
    pub async fn run(mut self) -> UiView {
        while self.update != UpdateState::Reloading {
            if self.step().await.is_none() {
                break;
            }
        }
        self.detach();
        self.view
    }

    fn show_offline_panel(&mut self) {
        self.cancel_timer();
        self.generation += 1;
        self.timer = Some(VisibilityTimer::arm(
            self.inputs_tx.clone(),
            self.visibility_timeout,
            self.generation,
        ));
        self.connectivity = ConnectivityState::OfflineVisible;
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    fn send_command(&self, command: UiCommand) {
        if self.commands.send(command).is_err() {
            debug!(?command, "No command consumer");
        }
    }

    fn publish_view(&mut self) {
        let view = UiView::of(self.connectivity, self.update);
        if view == self.view {
            return;
        }
        self.view = view;
        for observer in &self.observers {
            observer(&view);
        }
    }
}

impl fmt::Debug for ConnectivityUiStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityUiStateMachine")
            .field("connectivity", &self.connectivity)
            .field("update", &self.update)
            .field("timer_armed", &self.timer.is_some())
            .finish()
    }
}

impl Drop for ConnectivityUiStateMachine {
    fn drop(&mut self) {
        self.detach();
    }
}

// ==================== Monitor ====================

/// Turns raw connectivity reports into `pwa:online` / `pwa:offline`.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    bus: PageEventBus,
    online: bool,
}

impl ConnectivityMonitor {
    pub fn new(bus: PageEventBus, initially_online: bool) -> Self {
        Self {
            bus,
            online: initially_online,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Record the current connectivity. Repeats are swallowed; returns
    /// `true` if an event was dispatched.
    pub fn report(&mut self, online: bool) -> bool {
        if online == self.online {
            return false;
        }
        self.online = online;
        let event = if online {
            PageEvent::Online
        } else {
            PageEvent::Offline
        };
        info!(event = %event, "Connectivity changed");
        self.bus.dispatch(event);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const TIMEOUT: Duration = Duration::from_millis(8000);

    fn machine(online: bool) -> (ConnectivityUiStateMachine, mpsc::UnboundedReceiver<UiCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectivityUiStateMachine::new(online, TIMEOUT, tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_online_with_nothing_shown() {
        let (sm, _) = machine(true);
        assert_eq!(sm.connectivity(), ConnectivityState::Online);
        assert_eq!(sm.view(), UiView::default());
        assert!(!sm.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loading_offline_shows_panel() {
        let (sm, _) = machine(false);
        assert_eq!(sm.connectivity(), ConnectivityState::OfflineVisible);
        assert!(sm.view().offline_panel_visible);
        assert!(sm.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panel_minimizes_after_timeout() {
        let (mut sm, _) = machine(true);
        assert!(sm.handle(UiInput::Offline));
        assert_eq!(sm.connectivity(), ConnectivityState::OfflineVisible);

        let start = tokio::time::Instant::now();
        let input = sm.step().await;
        assert!(matches!(input, Some(UiInput::VisibilityTimeout { .. })));
        assert!(start.elapsed() >= TIMEOUT);

        assert_eq!(sm.connectivity(), ConnectivityState::OfflineMinimized);
        assert_eq!(
            sm.view(),
            UiView {
                offline_panel_visible: false,
                offline_indicator_visible: true,
                update_banner_visible: false,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expand_rearms_and_stale_timeout_is_ignored() {
        let (mut sm, _) = machine(false);
        sm.step().await;
        assert_eq!(sm.connectivity(), ConnectivityState::OfflineMinimized);

        sm.handle(UiInput::Expand);
        assert_eq!(sm.connectivity(), ConnectivityState::OfflineVisible);
        assert!(sm.timer_armed());

        // Generation 1 belonged to the first panel.
        assert!(!sm.handle(UiInput::VisibilityTimeout { generation: 1 }));
        assert_eq!(sm.connectivity(), ConnectivityState::OfflineVisible);

        sm.step().await;
        assert_eq!(sm.connectivity(), ConnectivityState::OfflineMinimized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_suppresses_until_reconnect() {
        let (mut sm, _) = machine(true);
        sm.handle(UiInput::Offline);
        sm.handle(UiInput::Dismiss);
        assert_eq!(sm.connectivity(), ConnectivityState::DismissedUntilReconnect);
        assert!(!sm.timer_armed());

        assert!(!sm.handle(UiInput::Offline));
        assert_eq!(sm.view(), UiView::default());

        sm.handle(UiInput::Online);
        assert_eq!(sm.connectivity(), ConnectivityState::Online);
        sm.handle(UiInput::Offline);
        assert!(sm.view().offline_panel_visible);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_from_minimized() {
        let (mut sm, _) = machine(false);
        sm.step().await;
        sm.handle(UiInput::Dismiss);
        assert_eq!(sm.connectivity(), ConnectivityState::DismissedUntilReconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_from_every_state_hides_everything() {
        let prepare: [&[UiInput]; 4] = [
            &[],
            &[UiInput::Offline],
            &[UiInput::Offline, UiInput::Dismiss],
            &[UiInput::Offline, UiInput::Expand, UiInput::UpdateAvailable],
        ];
        for inputs in prepare {
            let (mut sm, _) = machine(true);
            for input in inputs {
                sm.handle(*input);
            }
            sm.handle(UiInput::Online);
            assert_eq!(sm.connectivity(), ConnectivityState::Online);
            assert_eq!(sm.view(), UiView::default());
            assert!(!sm.timer_armed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cancels_pending_timer() {
        let (mut sm, _) = machine(true);
        sm.handle(UiInput::Offline);
        sm.handle(UiInput::Online);

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(sm.try_step(), None);
        assert_eq!(sm.connectivity(), ConnectivityState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_flow_emits_commands() {
        let (mut sm, mut commands) = machine(true);

        // Nothing to apply yet.
        assert!(!sm.handle(UiInput::UpdateNow));

        sm.handle(UiInput::UpdateAvailable);
        assert!(sm.view().update_banner_visible);

        sm.handle(UiInput::UpdateNow);
        assert_eq!(sm.update_state(), UpdateState::Activating);
        assert_eq!(commands.recv().await, Some(UiCommand::ForceActivate));

        sm.handle(UiInput::ActivationAcknowledged);
        assert_eq!(sm.update_state(), UpdateState::Reloading);
        assert_eq!(commands.recv().await, Some(UiCommand::Reload));
        assert!(!sm.view().update_banner_visible);

        // Terminal.
        assert!(!sm.handle(UiInput::UpdateAvailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_activation_allows_retry() {
        let (mut sm, mut commands) = machine(true);
        sm.handle(UiInput::UpdateAvailable);
        sm.handle(UiInput::UpdateNow);
        assert_eq!(commands.recv().await, Some(UiCommand::ForceActivate));

        assert!(sm.handle(UiInput::ActivationFailed));
        assert_eq!(sm.update_state(), UpdateState::UpdateAvailable);
        assert!(sm.view().update_banner_visible);

        assert!(sm.handle(UiInput::UpdateNow));
        assert_eq!(commands.recv().await, Some(UiCommand::ForceActivate));
        sm.handle(UiInput::ActivationAcknowledged);
        assert_eq!(sm.update_state(), UpdateState::Reloading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_activation_failure_is_ignored() {
        let (mut sm, _) = machine(true);
        assert!(!sm.handle(UiInput::ActivationFailed));
        assert_eq!(sm.update_state(), UpdateState::Idle);

        sm.handle(UiInput::UpdateAvailable);
        assert!(!sm.handle(UiInput::ActivationFailed));
        assert_eq!(sm.update_state(), UpdateState::UpdateAvailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_banner_is_independent_of_connectivity() {
        let (mut sm, _) = machine(true);
        sm.handle(UiInput::UpdateAvailable);
        sm.handle(UiInput::Offline);
        sm.handle(UiInput::Dismiss);
        assert!(sm.view().update_banner_visible);
        assert_eq!(sm.update_state(), UpdateState::UpdateAvailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_see_view_changes() {
        let (mut sm, _) = machine(true);
        let views = Arc::new(Mutex::new(Vec::new()));
        let seen = views.clone();
        sm.observe(move |view| seen.lock().unwrap().push(*view));

        sm.handle(UiInput::Offline);
        sm.handle(UiInput::Offline);
        sm.handle(UiInput::Online);

        let views = views.lock().unwrap();
        assert_eq!(views.len(), 2);
        assert!(views[0].offline_panel_visible);
        assert_eq!(views[1], UiView::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_bus_feeds_machine() {
        let bus = PageEventBus::new();
        let (mut sm, _) = machine(true);
        sm.attach(&bus);

        bus.dispatch(PageEvent::Offline);
        assert_eq!(sm.step().await, Some(UiInput::Offline));
        assert_eq!(sm.connectivity(), ConnectivityState::OfflineVisible);

        bus.dispatch(PageEvent::UpdateAvailable);
        assert_eq!(sm.step().await, Some(UiInput::UpdateAvailable));
        assert_eq!(sm.update_state(), UpdateState::UpdateAvailable);

        sm.detach();
        assert!(!bus.has_listeners(PageEvent::Offline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_reload() {
        let (sm, mut commands) = machine(true);
        let inputs = sm.sender();
        let runner = tokio::spawn(sm.run());

        inputs.send(UiInput::UpdateAvailable).unwrap();
        inputs.send(UiInput::UpdateNow).unwrap();
        assert_eq!(commands.recv().await, Some(UiCommand::ForceActivate));
        inputs.send(UiInput::ActivationAcknowledged).unwrap();

        let view = runner.await.unwrap();
        assert!(!view.update_banner_visible);
        assert_eq!(commands.recv().await, Some(UiCommand::Reload));
    }

    #[test]
    fn test_monitor_suppresses_repeats() {
        let bus = PageEventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [PageEvent::Online, PageEvent::Offline] {
            let seen = events.clone();
            bus.subscribe(kind, move |event| seen.lock().unwrap().push(event));
        }

        let mut monitor = ConnectivityMonitor::new(bus, true);
        assert!(!monitor.report(true));
        assert!(monitor.report(false));
        assert!(!monitor.report(false));
        assert!(monitor.report(true));

        assert_eq!(
            *events.lock().unwrap(),
            vec![PageEvent::Offline, PageEvent::Online]
        );
    }
}
