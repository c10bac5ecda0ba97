//! One page load, wired together.

use std::sync::Arc;

use pwakit_common::PwaConfig;
use pwakit_sw::ServiceWorkerContainer;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::bridge::{serve_commands, ClientLifecycleBridge, PageHost};
use crate::connectivity::{ConnectivityMonitor, ConnectivityUiStateMachine, UiView};
use crate::events::PageEventBus;
use crate::PageError;

/// Bridge, connectivity monitor and UI state sharing one event bus.
pub struct PageSession {
    bridge: Arc<ClientLifecycleBridge>,
    monitor: ConnectivityMonitor,
    ui: ConnectivityUiStateMachine,
    commands: JoinHandle<()>,
}

impl PageSession {
    /// Register the worker, start hourly update checks and hook the UI up.
    pub async fn start(
        page_url: Url,
        config: PwaConfig,
        container: Arc<ServiceWorkerContainer>,
        online: bool,
        host: Arc<dyn PageHost>,
    ) -> Result<Self, PageError> {
        let bus = PageEventBus::new();
        let banner_timeout = config.offline_banner_timeout();
        let bridge = Arc::new(ClientLifecycleBridge::new(
            page_url,
            config,
            container,
            bus.clone(),
        ));
        bridge.register().await?;
        bridge.start_update_checks()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let mut ui = ConnectivityUiStateMachine::new(online, banner_timeout, commands_tx);
        ui.attach(&bus);
        let commands = tokio::spawn(serve_commands(
            bridge.clone(),
            commands_rx,
            ui.sender(),
            host,
        ));

        Ok(Self {
            bridge,
            monitor: ConnectivityMonitor::new(bus, online),
            ui,
            commands,
        })
    }

    pub fn bridge(&self) -> &Arc<ClientLifecycleBridge> {
        &self.bridge
    }

    pub fn ui(&mut self) -> &mut ConnectivityUiStateMachine {
        &mut self.ui
    }

    pub fn view(&self) -> UiView {
        self.ui.view()
    }

    /// Report platform connectivity.
    pub fn set_online(&mut self, online: bool) -> bool {
        self.monitor.report(online)
    }

    pub async fn close(self) -> Result<(), PageError> {
        self.commands.abort();
        self.bridge.close().await
    }
}
