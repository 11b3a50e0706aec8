//! Command publishing and per-device dispatch

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use super::dedup::CommandDedup;
use super::types::{CommandEnvelope, CommandKind, CommandResponse, IssuedCommand, Target};
use super::watermark::Watermark;
use crate::monitor::ReconnectAction;
use crate::store::{SharedStore, Snapshot, Subscription, path};
use crate::telemetry::{Failure, Telemetry};
use crate::Result;

/// Executes commands delivered to a device
///
/// Delivery is at-least-once; implementations must tolerate a repeat.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the primary effect of `command`
    async fn handle(&self, command: &IssuedCommand) -> Result<()>;
}

/// Strictly increasing millisecond timestamps for commands issued here
#[derive(Debug, Default)]
struct IssueClock {
    last: AtomicI64,
}

impl IssueClock {
    fn next(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }
}

/// Publishes commands into the store and subscribes devices to them
#[derive(Clone)]
pub struct CommandBus {
    store: Arc<dyn SharedStore>,
    clock: Arc<IssueClock>,
    telemetry: Telemetry,
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus").finish_non_exhaustive()
    }
}

impl CommandBus {
    /// Create a bus over `store`
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, telemetry: Telemetry) -> Self {
        Self {
            store,
            clock: Arc::new(IssueClock::default()),
            telemetry,
        }
    }

    /// Write a command into one device's slot, replacing any unconsumed one
    ///
    /// # Errors
    ///
    /// Returns error if the device id is invalid or the store rejects the write
    pub async fn send_targeted(
        &self,
        device_id: &str,
        kind: CommandKind,
        payload: Value,
    ) -> Result<IssuedCommand> {
        path::validate_device_id(device_id)?;
        self.publish(Target::Device(device_id.to_string()), kind, payload)
            .await
    }

    /// Write a command into the broadcast slot
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write
    pub async fn send_broadcast(&self, kind: CommandKind, payload: Value) -> Result<IssuedCommand> {
        self.publish(Target::All, kind, payload).await
    }

    /// Route a command to a device or, for [`Target::All`], to the broadcast slot
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write
    pub async fn send(
        &self,
        target: Target,
        kind: CommandKind,
        payload: Value,
    ) -> Result<IssuedCommand> {
        match target {
            Target::Device(id) => self.send_targeted(&id, kind, payload).await,
            Target::All => self.send_broadcast(kind, payload).await,
        }
    }

    async fn publish(
        &self,
        target: Target,
        kind: CommandKind,
        payload: Value,
    ) -> Result<IssuedCommand> {
        let command = IssuedCommand {
            kind,
            payload,
            target,
            issued_at: self.clock.next(),
        };
        let record = serde_json::to_value(command.to_envelope())?;
        self.store.set(&command.target.slot(), record).await?;

        tracing::info!(
            command = %command.kind,
            target = command.target.as_wire(),
            issued_at = command.issued_at,
            "command issued"
        );
        Ok(command)
    }

    /// Start delivering commands for `device_id` to `handler`
    ///
    /// Watches the device's targeted slot and the broadcast slot. Targeted
    /// commands are removed after execution; broadcasts run only when newer
    /// than `watermark`.
    ///
    /// # Errors
    ///
    /// Returns error if the device id is invalid or a subscription fails
    pub async fn subscribe(
        &self,
        device_id: &str,
        handler: Arc<dyn CommandHandler>,
        watermark: Arc<Watermark>,
    ) -> Result<BusSubscription> {
        path::validate_device_id(device_id)?;

        let dispatcher = Arc::new(Dispatcher {
            device_id: device_id.to_string(),
            store: Arc::clone(&self.store),
            handler,
            watermark,
            dedup: CommandDedup::default(),
            telemetry: self.telemetry.clone(),
            targeted_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let targeted = self.store.subscribe(&path::targeted(device_id)).await?;
        let broadcast = self.store.subscribe(path::BROADCAST).await?;

        let tasks = vec![
            tokio::spawn(run_targeted(Arc::clone(&dispatcher), targeted)),
            tokio::spawn(run_broadcast(Arc::clone(&dispatcher), broadcast)),
        ];

        tracing::info!(device_id, "command bus subscribed");
        Ok(BusSubscription { dispatcher, tasks })
    }
}

async fn run_targeted(dispatcher: Arc<Dispatcher>, mut sub: Subscription) {
    while let Some(mut snapshot) = sub.recv().await {
        // Skip ahead to the newest command; an empty slot queued behind a
        // command does not cancel it
        while let Some(newer) = sub.try_recv() {
            if newer.value.is_some() || snapshot.value.is_none() {
                snapshot = newer;
            }
        }
        dispatcher.on_targeted(snapshot).await;
    }
    tracing::debug!(device_id = %dispatcher.device_id, "targeted subscription ended");
}

async fn run_broadcast(dispatcher: Arc<Dispatcher>, mut sub: Subscription) {
    while let Some(snapshot) = sub.recv_latest().await {
        dispatcher.on_broadcast(snapshot).await;
    }
    tracing::debug!(device_id = %dispatcher.device_id, "broadcast subscription ended");
}

/// Receiving side of the bus for one device
struct Dispatcher {
    device_id: String,
    store: Arc<dyn SharedStore>,
    handler: Arc<dyn CommandHandler>,
    watermark: Arc<Watermark>,
    dedup: CommandDedup,
    telemetry: Telemetry,
    /// Serializes targeted handling between the task and resync
    targeted_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Dispatcher {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn on_targeted(&self, snapshot: Snapshot) {
        let Some(value) = snapshot.value else {
            return;
        };
        let _guard = self.targeted_lock.lock().await;
        if self.is_closed() {
            return;
        }

        let slot = Target::Device(self.device_id.clone());
        match decode(&value, &slot) {
            Ok(command) => {
                let key = command.dedup_key();
                if self.dedup.contains(&key) {
                    tracing::debug!(
                        device_id = %self.device_id,
                        command = %command.kind,
                        issued_at = command.issued_at,
                        "targeted command already executed"
                    );
                } else {
                    self.execute(&command).await;
                    self.dedup.insert(key);
                }
            }
            Err(e) => {
                tracing::warn!(device_id = %self.device_id, error = %e, "ignoring targeted command");
            }
        }

        self.clear_targeted(&value).await;
    }

    /// Remove the consumed command unless a newer one already replaced it
    ///
    /// The read and the remove are separate store calls. A command written
    /// between them is deleted from the slot, but its change notification
    /// is still queued on the subscription and the targeted task runs it.
    async fn clear_targeted(&self, consumed: &Value) {
        let slot = path::targeted(&self.device_id);
        let result = match self.store.get(&slot).await {
            Ok(Some(current)) if &current == consumed => self.store.remove(&slot).await,
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(device_id = %self.device_id, error = %e, "failed to clear targeted command");
            self.telemetry.record(Failure::CommandClear);
        }
    }

    async fn on_broadcast(&self, snapshot: Snapshot) {
        let Some(value) = snapshot.value else {
            return;
        };
        if self.is_closed() {
            return;
        }

        let envelope: CommandEnvelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(device_id = %self.device_id, error = %e, "malformed broadcast command");
                return;
            }
        };
        if envelope.target_device_id.as_deref() != Some(path::ALL_DEVICES) {
            tracing::debug!(device_id = %self.device_id, "broadcast slot holds a non-broadcast command");
            return;
        }

        // The in-memory claim keeps the task and a resync from both running
        // it; the stored watermark only moves once the handler succeeded.
        let issued_at = envelope.timestamp;
        if !self.watermark.try_claim(issued_at) {
            tracing::debug!(device_id = %self.device_id, issued_at, "broadcast already executed");
            return;
        }

        match IssuedCommand::from_envelope(envelope, &Target::All) {
            Ok(command) => {
                if self.execute(&command).await {
                    self.persist_watermark(issued_at);
                }
            }
            Err(e) => {
                tracing::warn!(device_id = %self.device_id, error = %e, "ignoring broadcast command");
                self.persist_watermark(issued_at);
            }
        }
    }

    fn persist_watermark(&self, issued_at: i64) {
        if let Err(e) = self.watermark.persist(issued_at) {
            tracing::warn!(device_id = %self.device_id, issued_at, error = %e, "failed to persist broadcast watermark");
            self.telemetry.record(Failure::WatermarkPersist);
        }
    }

    /// Run the handler and record the outcome; true when it succeeded
    async fn execute(&self, command: &IssuedCommand) -> bool {
        let outcome = self.handler.handle(command).await;
        let succeeded = outcome.is_ok();
        let response = match outcome {
            Ok(()) => {
                tracing::info!(
                    device_id = %self.device_id,
                    command = %command.kind,
                    issued_at = command.issued_at,
                    "command executed"
                );
                CommandResponse::executed(&self.device_id, command.kind)
            }
            Err(e) => {
                tracing::warn!(
                    device_id = %self.device_id,
                    command = %command.kind,
                    error = %e,
                    "command handler failed"
                );
                CommandResponse::failed(&self.device_id, command.kind, &e)
            }
        };
        self.respond(&response).await;
        succeeded
    }

    /// Append to the response log; failures are counted, never surfaced
    async fn respond(&self, response: &CommandResponse) {
        let result = match serde_json::to_value(response) {
            Ok(record) => self.store.push(path::RESPONSES, record).await.map(drop),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(device_id = %self.device_id, error = %e, "failed to record command response");
            self.telemetry.record(Failure::ResponseWrite);
        }
    }

    /// Re-read both slots and handle whatever they currently hold
    async fn resync(&self) {
        if self.is_closed() {
            return;
        }
        for slot in [path::targeted(&self.device_id), path::BROADCAST.to_string()] {
            let value = match self.store.get(&slot).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(device_id = %self.device_id, slot = %slot, error = %e, "resync read failed");
                    continue;
                }
            };
            let snapshot = Snapshot {
                path: slot.clone(),
                value,
            };
            if slot == path::BROADCAST {
                self.on_broadcast(snapshot).await;
            } else {
                self.on_targeted(snapshot).await;
            }
        }
    }
}

fn decode(value: &Value, slot: &Target) -> Result<IssuedCommand> {
    let envelope: CommandEnvelope = serde_json::from_value(value.clone())?;
    IssuedCommand::from_envelope(envelope, slot)
}

/// Live command delivery for one device
///
/// Dropping the subscription stops delivery.
pub struct BusSubscription {
    dispatcher: Arc<Dispatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription")
            .field("device_id", &self.dispatcher.device_id)
            .field("closed", &self.dispatcher.is_closed())
            .finish_non_exhaustive()
    }
}

impl BusSubscription {
    /// Device this subscription delivers to
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.dispatcher.device_id
    }

    /// Re-read the command slots and evaluate them again
    ///
    /// Anything already executed is suppressed by the watermark and the
    /// dedup cache.
    pub async fn resync(&self) {
        self.dispatcher.resync().await;
    }

    /// Reconnect action that resyncs this subscription
    #[must_use]
    pub fn resync_action(&self) -> Arc<dyn ReconnectAction> {
        Arc::new(BusResync {
            dispatcher: Arc::downgrade(&self.dispatcher),
        })
    }

    /// Stop delivery; no handler runs after this returns
    pub async fn shutdown(&mut self) {
        self.dispatcher.closed.store(true, Ordering::SeqCst);
        // Wait out a targeted command that is mid-flight
        drop(self.dispatcher.targeted_lock.lock().await);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!(device_id = %self.dispatcher.device_id, "command bus unsubscribed");
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.dispatcher.closed.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct BusResync {
    dispatcher: std::sync::Weak<Dispatcher>,
}

#[async_trait]
impl ReconnectAction for BusResync {
    fn name(&self) -> &'static str {
        "command-bus-resync"
    }

    async fn on_reconnect(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.resync().await;
        }
    }
}
