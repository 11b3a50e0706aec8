//! Shared state store abstraction
//!
//! Every component talks to the fleet through a replicated key-value store
//! addressed by slash-separated paths. Subscriptions follow a fixed replay
//! contract: the current value is emitted once as soon as the subscription
//! is attached, followed by one emission per subsequent change. Consumers
//! must be written against that contract, never assume it away.

pub mod memory;
pub mod path;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::Result;

pub use memory::MemoryStore;

/// A value observed at a path
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Normalized path the value was read from
    pub path: String,
    /// Value at the path, `None` when nothing is stored there
    pub value: Option<Value>,
}

impl Snapshot {
    /// Whether the path held a value
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.value.is_some()
    }

    /// Decode the value into a typed record
    ///
    /// # Errors
    ///
    /// Returns error if the value does not match the target shape
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.value
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }
}

/// Live stream of snapshots for one path
///
/// Yields the current value first, then every change. Ends when the store
/// side of the subscription is dropped.
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<Snapshot>,
}

impl Subscription {
    /// Wrap a receiver fed by a store implementation
    #[must_use]
    pub const fn new(path: String, rx: mpsc::UnboundedReceiver<Snapshot>) -> Self {
        Self { path, rx }
    }

    /// Path this subscription watches
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next snapshot
    ///
    /// Returns `None` once the subscription is closed
    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// Take a snapshot that is already queued, without waiting
    pub fn try_recv(&mut self) -> Option<Snapshot> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next snapshot, then skip ahead to the newest queued one
    ///
    /// Intermediate values that were superseded before the consumer got to
    /// them are dropped.
    pub async fn recv_latest(&mut self) -> Option<Snapshot> {
        let mut latest = self.rx.recv().await?;
        while let Some(newer) = self.try_recv() {
            latest = newer;
        }
        Some(latest)
    }
}

impl Stream for Subscription {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Replicated key-value store with path-scoped subscriptions
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read the value at `path`
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Replace the value at `path`; writing `null` removes it
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Shallow-merge an object into the value at `path`
    async fn update(&self, path: &str, fields: Value) -> Result<()>;

    /// Delete the value at `path`
    async fn remove(&self, path: &str) -> Result<()>;

    /// Append `value` under a generated, time-ordered child key of `path`
    ///
    /// Returns the generated key
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    /// Watch `path` for changes
    async fn subscribe(&self, path: &str) -> Result<Subscription>;
}
