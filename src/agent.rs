//! Device-side agent
//!
//! Registers the device, keeps its session fresh across reconnects and
//! executes the commands addressed to it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::commands::{BusSubscription, CommandBus, CommandHandler, CommandKind, IssuedCommand, Watermark};
use crate::devices::DeviceRegistry;
use crate::identity::DeviceIdentity;
use crate::monitor::{ConnectionMonitor, ReconnectAction};
use crate::store::SharedStore;
use crate::telemetry::Telemetry;

/// A running device connected to the fleet
pub struct DeviceAgent {
    identity: DeviceIdentity,
    registry: DeviceRegistry,
    subscription: BusSubscription,
    monitor: Arc<ConnectionMonitor>,
}

impl std::fmt::Debug for DeviceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAgent")
            .field("device_id", &self.identity.device_id)
            .finish_non_exhaustive()
    }
}

impl DeviceAgent {
    /// Register the device and start receiving commands
    ///
    /// # Errors
    ///
    /// Returns error if the command or connectivity subscriptions fail
    pub async fn start(
        store: Arc<dyn SharedStore>,
        identity: DeviceIdentity,
        handler: Arc<dyn CommandHandler>,
        watermark: Arc<Watermark>,
        telemetry: Telemetry,
    ) -> Result<Self> {
        let bus = CommandBus::new(Arc::clone(&store), telemetry.clone());
        let registry = DeviceRegistry::new(Arc::clone(&store), bus.clone(), telemetry);

        registry
            .register_or_update(&identity.device_id, identity.metadata())
            .await;

        let subscription = bus
            .subscribe(&identity.device_id, handler, watermark)
            .await?;

        let monitor = ConnectionMonitor::start(store).await?;
        monitor.add_reconnect_action(Arc::new(Reregister {
            registry: registry.clone(),
            identity: identity.clone(),
        }));
        monitor.add_reconnect_action(subscription.resync_action());

        tracing::info!(device_id = %identity.device_id, "device agent started");
        Ok(Self {
            identity,
            registry,
            subscription,
            monitor,
        })
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    #[must_use]
    pub const fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    /// Re-read command slots now, outside of a reconnect
    pub async fn resync(&self) {
        self.subscription.resync().await;
    }

    /// Stop receiving commands and following connectivity
    pub async fn shutdown(mut self) {
        self.monitor.shutdown();
        self.subscription.shutdown().await;
        tracing::info!(device_id = %self.identity.device_id, "device agent stopped");
    }
}

/// Refreshes the device session after a reconnect
struct Reregister {
    registry: DeviceRegistry,
    identity: DeviceIdentity,
}

#[async_trait]
impl ReconnectAction for Reregister {
    fn name(&self) -> &'static str {
        "reregister-device"
    }

    async fn on_reconnect(&self) {
        self.registry
            .register_or_update(&self.identity.device_id, self.identity.metadata())
            .await;
    }
}

/// Handler that records each command in the log
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl CommandHandler for LoggingHandler {
    async fn handle(&self, command: &IssuedCommand) -> Result<()> {
        match command.kind {
            CommandKind::BlockDevice => tracing::warn!(
                reason = command.payload_text().unwrap_or_default(),
                "device blocked by administrator"
            ),
            CommandKind::UnblockDevice => tracing::info!(
                reason = command.payload_text().unwrap_or_default(),
                "device unblocked by administrator"
            ),
            kind => tracing::info!(command = %kind, issued_at = command.issued_at, "command received"),
        }
        Ok(())
    }
}
