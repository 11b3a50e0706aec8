//! In-process replicated store
//!
//! One shared tree of JSON values, observed through any number of client
//! links. Each [`MemoryStore`] handle belongs to a link; [`MemoryStore::attach`]
//! opens another link onto the same tree, standing in for a separate
//! process connected to the same backend.
//!
//! A link can be taken offline. While offline its writes and reads fail
//! with [`Error::StoreUnavailable`] and its subscriptions receive nothing;
//! on reconnect every subscription re-emits its path if the value changed
//! while the link was away. Changes are delivered synchronously under the
//! tree lock, so every link observes writes in the order they were applied.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{SharedStore, Snapshot, Subscription, path};
use crate::{Error, Result};

/// Shared tree plus the links observing it
struct Backend {
    state: Mutex<State>,
    next_link: AtomicU64,
    push_seq: AtomicU64,
}

struct State {
    root: Map<String, Value>,
    links: Vec<Weak<Link>>,
}

/// One client connection onto the backend
struct Link {
    id: u64,
    online: AtomicBool,
    watchers: Mutex<Vec<Watcher>>,
}

struct Watcher {
    segs: Vec<String>,
    path: String,
    tx: mpsc::UnboundedSender<Snapshot>,
    last: Option<Value>,
    primed: bool,
    connectivity: bool,
}

impl Watcher {
    /// Emit the value at this watcher's path if it changed
    ///
    /// Returns false once the subscriber has gone away
    fn refresh(&mut self, root: &Map<String, Value>) -> bool {
        let current = lookup(root, &self.segs);
        if self.primed && current == self.last {
            return !self.tx.is_closed();
        }
        self.primed = true;
        self.last.clone_from(&current);
        self.tx
            .send(Snapshot {
                path: self.path.clone(),
                value: current,
            })
            .is_ok()
    }
}

impl State {
    /// Fan a change at `changed` out to every online link
    fn notify(&mut self, changed: &[String]) {
        let root = &self.root;
        self.links.retain(|weak| {
            let Some(link) = weak.upgrade() else {
                return false;
            };
            if link.online.load(Ordering::SeqCst) {
                lock(&link.watchers).retain_mut(|w| {
                    if w.connectivity || !related(&w.segs, changed) {
                        !w.tx.is_closed()
                    } else {
                        w.refresh(root)
                    }
                });
            }
            true
        });
    }
}

/// Handle onto an in-process replicated store
#[derive(Clone)]
pub struct MemoryStore {
    backend: Arc<Backend>,
    link: Arc<Link>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("link", &self.link.id)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create an empty store with a single online link
    #[must_use]
    pub fn new() -> Self {
        let backend = Arc::new(Backend {
            state: Mutex::new(State {
                root: Map::new(),
                links: Vec::new(),
            }),
            next_link: AtomicU64::new(1),
            push_seq: AtomicU64::new(0),
        });
        Self::with_backend(backend)
    }

    fn with_backend(backend: Arc<Backend>) -> Self {
        let link = Arc::new(Link {
            id: backend.next_link.fetch_add(1, Ordering::Relaxed),
            online: AtomicBool::new(true),
            watchers: Mutex::new(Vec::new()),
        });
        lock(&backend.state).links.push(Arc::downgrade(&link));
        Self { backend, link }
    }

    /// Open another link onto the same shared tree
    #[must_use]
    pub fn attach(&self) -> Self {
        Self::with_backend(Arc::clone(&self.backend))
    }

    /// Identifier of this handle's link
    #[must_use]
    pub fn link_id(&self) -> u64 {
        self.link.id
    }

    /// Whether this link is currently connected
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.link.online.load(Ordering::SeqCst)
    }

    /// Connect or disconnect this link
    ///
    /// Connectivity subscribers see every transition. On reconnect, other
    /// subscriptions on this link catch up with changes they missed.
    pub fn set_online(&self, online: bool) {
        let state = lock(&self.backend.state);
        if self.link.online.swap(online, Ordering::SeqCst) == online {
            return;
        }

        lock(&self.link.watchers).retain_mut(|w| {
            if w.connectivity {
                w.tx.send(Snapshot {
                    path: w.path.clone(),
                    value: Some(Value::Bool(online)),
                })
                .is_ok()
            } else if online {
                w.refresh(&state.root)
            } else {
                !w.tx.is_closed()
            }
        });
        drop(state);

        tracing::debug!(link = self.link.id, online, "store link connectivity changed");
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::StoreUnavailable)
        }
    }

    /// Apply a mutation to the tree and notify observers of `path`
    fn apply<F>(&self, path: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>, &[String]) -> Result<()>,
    {
        let segs = path::segments(path)?;
        if segs.first().is_some_and(|s| s == ".info") {
            return Err(Error::InvalidPath(format!("{path} is read-only")));
        }
        self.ensure_online()?;

        let mut state = lock(&self.backend.state);
        mutate(&mut state.root, &segs)?;
        state.notify(&segs);
        Ok(())
    }

    fn next_push_key(&self) -> String {
        let millis = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        let seq = self.backend.push_seq.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;
        format!("{millis:012x}{seq:06x}")
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let segs = path::segments(path)?;
        if segs.join("/") == path::CONNECTED {
            return Ok(Some(Value::Bool(self.is_online())));
        }
        self.ensure_online()?;
        Ok(lookup(&lock(&self.backend.state).root, &segs))
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        self.apply(path, |root, segs| set_at(root, segs, value))
    }

    async fn update(&self, path: &str, fields: Value) -> Result<()> {
        let Value::Object(fields) = fields else {
            return Err(Error::Store(format!("update of {path} requires an object")));
        };
        for key in fields.keys() {
            if path::segments(key)?.len() != 1 {
                return Err(Error::InvalidPath(format!("{path}/{key}")));
            }
        }

        self.apply(path, |root, segs| {
            for (key, value) in fields {
                let mut child = segs.to_vec();
                child.push(key);
                set_at(root, &child, value)?;
            }
            Ok(())
        })
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.apply(path, |root, segs| {
            remove_at(root, segs);
            Ok(())
        })
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let key = self.next_push_key();
        let child = format!("{path}/{key}");
        self.apply(&child, |root, segs| set_at(root, segs, value))?;
        Ok(key)
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription> {
        let segs = path::segments(path)?;
        let normalized = segs.join("/");
        let connectivity = normalized == path::CONNECTED;
        let (tx, rx) = mpsc::unbounded_channel();

        let state = lock(&self.backend.state);
        let online = self.is_online();
        let mut watcher = Watcher {
            segs,
            path: normalized.clone(),
            tx,
            last: None,
            primed: false,
            connectivity,
        };

        if connectivity {
            let _ = watcher.tx.send(Snapshot {
                path: normalized.clone(),
                value: Some(Value::Bool(online)),
            });
        } else if online {
            watcher.refresh(&state.root);
        }

        lock(&self.link.watchers).push(watcher);
        drop(state);

        Ok(Subscription::new(normalized, rx))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether one path is an ancestor of, descendant of, or equal to the other
fn related(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b).all(|(x, y)| x == y)
}

fn lookup(root: &Map<String, Value>, segs: &[String]) -> Option<Value> {
    let Some((first, rest)) = segs.split_first() else {
        return (!root.is_empty()).then(|| Value::Object(root.clone()));
    };
    rest.iter()
        .try_fold(root.get(first)?, |node, seg| node.get(seg.as_str()))
        .cloned()
}

/// Drop nulls and empty objects so that "absent" has a single representation
fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| prune(v).map(|v| (k, v)))
                .collect();
            (!map.is_empty()).then_some(Value::Object(map))
        }
        other => Some(other),
    }
}

fn set_at(root: &mut Map<String, Value>, segs: &[String], value: Value) -> Result<()> {
    let Some(value) = prune(value) else {
        remove_at(root, segs);
        return Ok(());
    };

    let Some((last, parents)) = segs.split_last() else {
        let Value::Object(map) = value else {
            return Err(Error::Store("root value must be an object".to_string()));
        };
        *root = map;
        return Ok(());
    };

    let mut node = root;
    for seg in parents {
        let slot = node
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        node = slot
            .as_object_mut()
            .ok_or_else(|| Error::Store(format!("{seg} is not a container")))?;
    }
    node.insert(last.clone(), value);
    Ok(())
}

fn remove_at(map: &mut Map<String, Value>, segs: &[String]) {
    let Some((first, rest)) = segs.split_first() else {
        map.clear();
        return;
    };
    if rest.is_empty() {
        map.remove(first);
        return;
    }
    if let Some(child) = map.get_mut(first).and_then(Value::as_object_mut) {
        remove_at(child, rest);
        if child.is_empty() {
            map.remove(first);
        }
    }
}
