//! Gateway daemon: control plane, HTTP API and optional local device agent

use std::sync::Arc;

use crate::agent::{DeviceAgent, LoggingHandler};
use crate::api::ApiServer;
use crate::commands::Watermark;
use crate::config::Config;
use crate::control::ControlPlane;
use crate::db::{self, WatermarkRepo};
use crate::identity::DeviceIdentity;
use crate::store::MemoryStore;
use crate::Result;

/// Fleet gateway daemon
pub struct Daemon {
    config: Config,
    store: MemoryStore,
}

impl Daemon {
    /// Create a daemon over a fresh in-process store
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: MemoryStore::new(),
        }
    }

    /// Run until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the control plane, agent or API server fail to start
    pub async fn run(self) -> Result<()> {
        let control = ControlPlane::start(Arc::new(self.store.clone()), &self.config).await?;

        let agent = if self.config.local_agent {
            Some(self.start_local_agent(&control).await?)
        } else {
            None
        };

        let server = ApiServer::new(
            Arc::clone(&control),
            self.config.api_server.api_key.clone(),
            self.config.api_server.port,
        );
        let result = server.run(shutdown_signal()).await;

        tracing::info!("shutting down");
        if let Some(agent) = agent {
            agent.shutdown().await;
        }
        control.shutdown();
        result
    }

    /// Run a device agent on its own link, as a separate device would
    async fn start_local_agent(&self, control: &ControlPlane) -> Result<DeviceAgent> {
        let identity = DeviceIdentity::load_or_create(&self.config.identity_path())?;
        let watermark = self.open_watermark(&identity.device_id);

        DeviceAgent::start(
            Arc::new(self.store.attach()),
            identity,
            Arc::new(LoggingHandler),
            watermark,
            control.telemetry().clone(),
        )
        .await
    }

    /// Persistent watermark, or an in-memory one if the database is unusable
    fn open_watermark(&self, device_id: &str) -> Arc<Watermark> {
        let loaded = db::init(self.config.database_path())
            .and_then(|pool| Watermark::load(device_id, WatermarkRepo::new(pool)));
        match loaded {
            Ok(watermark) => Arc::new(watermark),
            Err(e) => {
                tracing::warn!(error = %e, "watermark database unavailable, broadcasts may repeat after restart");
                Arc::new(Watermark::in_memory(device_id))
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
