//! Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_gateway::{
    CommandHandler, CommandKind, Config, ControlPlane, IssuedCommand, MemoryStore,
};
use tokio::sync::mpsc;

/// Configuration with short timeouts and no session sweeping
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.store.connect_timeout = Duration::from_millis(500);
    config.registry.session_ttl = None;
    config
}

/// Start a control plane on a new shared store
pub async fn start_control(store: &MemoryStore) -> Arc<ControlPlane> {
    let control = ControlPlane::start(Arc::new(store.clone()), &test_config())
        .await
        .expect("failed to start control plane");
    tokio::time::timeout(Duration::from_secs(2), control.gate().wait_ready())
        .await
        .expect("gate never populated");
    control
}

/// Handler that forwards every executed command to a channel
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<IssuedCommand>,
}

impl RecordingHandler {
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<IssuedCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn handle(&self, command: &IssuedCommand) -> fleet_gateway::Result<()> {
        let _ = self.tx.send(command.clone());
        Ok(())
    }
}

/// Wait for the next executed command
pub async fn next_command(rx: &mut mpsc::UnboundedReceiver<IssuedCommand>) -> IssuedCommand {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for command")
        .expect("handler dropped")
}

/// Assert no command executes for a short while
pub async fn assert_no_command(rx: &mut mpsc::UnboundedReceiver<IssuedCommand>) {
    let extra = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(extra.is_err(), "unexpected command: {extra:?}");
}

/// Kinds of the commands currently queued, without waiting
pub fn drain_kinds(rx: &mut mpsc::UnboundedReceiver<IssuedCommand>) -> Vec<CommandKind> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(|c| c.kind)
        .collect()
}

/// Poll `check` until it returns true or two seconds pass
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
