//! Local graph database the chat services read from and write to.
//!
//! Nodes are addressed by a soul, a `/`-joined path such as
//! `~<pub>/friends/<id>`. A field holds either a JSON scalar or a link
//! (`{"#": soul}`) to a child node. Writers never replace nodes, they only
//! set fields, and every change is pushed to subscribers over tokio channels.
//!
//! Two namespaces carry extra rules:
//! - `~<pub>` user spaces only accept writes signed by that user's key.
//! - `#...` index spaces are content addressed: a scalar field's key must be
//!   the hash of its value, and it can never be overwritten.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::backend::crypto::{self, HashEncoding, KeyPair};
use crate::backend::store::NodeStore;
use crate::error::{ChatError, Result};

pub type Node = BTreeMap<String, Value>;

const LINK_KEY: &str = "#";
const META_KEY: &str = "_";

/// One push notification: the current data under `soul`, or `None` when the
/// value was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub data: Option<Value>,
    pub key: String,
    pub soul: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenMode {
    Node,
    Map,
}

struct Listener {
    id: u64,
    mode: ListenMode,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Inner {
    nodes: RwLock<HashMap<String, Node>>,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    next_listener: AtomicU64,
    store: Option<NodeStore>,
    // Held across validate/apply/dispatch so deliveries keep commit order.
    write_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct GraphDb {
    inner: Arc<Inner>,
}

/// Handle for detaching a single listener.
#[derive(Clone)]
pub struct EventHandle {
    id: u64,
    soul: String,
    db: Weak<Inner>,
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandle")
            .field("id", &self.id)
            .field("soul", &self.soul)
            .finish()
    }
}

impl EventHandle {
    pub fn off(&self) {
        if let Some(inner) = self.db.upgrade() {
            let mut listeners = inner.listeners.lock();
            if let Some(list) = listeners.get_mut(&self.soul) {
                list.retain(|l| l.id != self.id);
                if list.is_empty() {
                    listeners.remove(&self.soul);
                }
            }
        }
    }
}

pub struct Subscription {
    pub rx: mpsc::UnboundedReceiver<Delivery>,
    pub event: EventHandle,
}

#[derive(Debug, Clone, Serialize)]
struct FieldWrite {
    soul: String,
    key: String,
    value: Value,
}

impl GraphDb {
    pub fn in_memory() -> Self {
        Self::with_nodes(HashMap::new(), None)
    }

    /// Opens a graph backed by `store`, loading every persisted node.
    pub fn open(store: NodeStore) -> Result<Self> {
        let nodes: HashMap<String, Node> = store.get_all_nodes()?.into_iter().collect();
        tracing::debug!(count = nodes.len(), "loaded graph nodes");
        Ok(Self::with_nodes(nodes, Some(store)))
    }

    fn with_nodes(nodes: HashMap<String, Node>, store: Option<NodeStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                nodes: RwLock::new(nodes),
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
                store,
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn get(&self, soul: &str) -> Chain {
        Chain {
            db: self.clone(),
            soul: soul.to_string(),
            signer: None,
        }
    }

    /// The user space `~<pub>`.
    pub fn user(&self, pub_key: &str) -> Chain {
        self.get(&format!("~{}", pub_key.trim_start_matches('~')))
    }

    /// The alias node `~@<alias>` that links to every user claiming it.
    pub fn alias(&self, alias: &str) -> Chain {
        self.get(&format!("~@{}", alias))
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.read().len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().values().map(Vec::len).sum()
    }

    /// Persisted `(node_count, total_bytes)`, `None` for in-memory graphs.
    pub fn storage_stats(&self) -> Result<Option<(usize, usize)>> {
        self.inner
            .store
            .as_ref()
            .map(NodeStore::storage_stats)
            .transpose()
    }

    fn read(&self, soul: &str) -> Option<Value> {
        read_value(&self.inner.nodes.read(), soul)
    }

    fn keys(&self, soul: &str) -> Vec<String> {
        child_keys(&self.inner.nodes.read(), soul)
    }

    fn subscribe(&self, soul: &str, mode: ListenMode) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);

        let _guard = self.inner.write_lock.lock();
        {
            let nodes = self.inner.nodes.read();
            match mode {
                ListenMode::Node => {
                    if let Some(data) = read_value(&nodes, soul) {
                        let _ = tx.send(Delivery {
                            data: Some(data),
                            key: last_segment(soul).to_string(),
                            soul: soul.to_string(),
                        });
                    }
                }
                ListenMode::Map => {
                    for key in child_keys(&nodes, soul) {
                        let child = join_soul(soul, &key);
                        if let Some(data) = read_value(&nodes, &child) {
                            let _ = tx.send(Delivery {
                                data: Some(data),
                                key,
                                soul: child,
                            });
                        }
                    }
                }
            }
        }
        self.inner
            .listeners
            .lock()
            .entry(soul.to_string())
            .or_default()
            .push(Listener { id, mode, tx });

        Subscription {
            rx,
            event: EventHandle {
                id,
                soul: soul.to_string(),
                db: Arc::downgrade(&self.inner),
            },
        }
    }

    fn commit(&self, writes: Vec<FieldWrite>, signer: Option<&KeyPair>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let _guard = self.inner.write_lock.lock();

        // 1. Authorize user-space writes
        self.authorize(&writes, signer)?;

        let mut nodes = self.inner.nodes.write();

        // 2. Enforce content addressing on index spaces
        for write in &writes {
            if !root_segment(&write.soul).starts_with('#') || is_link(&write.value) {
                continue;
            }
            let raw = match &write.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if crypto::hash(&raw, HashEncoding::Base64) != write.key {
                return Err(ChatError::AddressMismatch {
                    soul: write.soul.clone(),
                    key: write.key.clone(),
                });
            }
            if nodes
                .get(&write.soul)
                .and_then(|n| n.get(&write.key))
                .is_some_and(|v| !v.is_null())
            {
                return Err(ChatError::Immutable {
                    soul: write.soul.clone(),
                    key: write.key.clone(),
                });
            }
        }

        // 3. Apply
        let mut changed_nodes = BTreeSet::new();
        let mut scalar_changes = Vec::new();
        for write in writes {
            let node = nodes.entry(write.soul.clone()).or_default();
            let link = is_link(&write.value);
            if link && node.get(&write.key) == Some(&write.value) {
                continue;
            }
            node.insert(write.key.clone(), write.value);
            changed_nodes.insert(write.soul.clone());
            if !link {
                scalar_changes.push((write.soul, write.key));
            }
        }

        // 4. Persist
        if let Some(store) = &self.inner.store {
            for soul in &changed_nodes {
                if let Some(node) = nodes.get(soul) {
                    store.put_node(soul, node)?;
                }
            }
        }

        // 5. Notify
        let mut deliveries = Vec::new();
        for soul in &changed_nodes {
            let data = read_value(&nodes, soul);
            let key = last_segment(soul).to_string();
            deliveries.push((
                soul.clone(),
                ListenMode::Node,
                Delivery {
                    data: data.clone(),
                    key: key.clone(),
                    soul: soul.clone(),
                },
            ));
            if let Some((parent, _)) = split_soul(soul) {
                deliveries.push((
                    parent.to_string(),
                    ListenMode::Map,
                    Delivery {
                        data,
                        key,
                        soul: soul.clone(),
                    },
                ));
            }
        }
        for (soul, key) in scalar_changes {
            let child = join_soul(&soul, &key);
            let data = read_value(&nodes, &child);
            deliveries.push((
                child.clone(),
                ListenMode::Node,
                Delivery {
                    data: data.clone(),
                    key: key.clone(),
                    soul: child.clone(),
                },
            ));
            deliveries.push((
                soul,
                ListenMode::Map,
                Delivery {
                    data,
                    key,
                    soul: child,
                },
            ));
        }
        drop(nodes);

        self.dispatch(deliveries);
        Ok(())
    }

    fn authorize(&self, writes: &[FieldWrite], signer: Option<&KeyPair>) -> Result<()> {
        let owners: BTreeSet<&str> = writes
            .iter()
            .filter_map(|w| user_space_owner(&w.soul))
            .collect();
        if owners.is_empty() {
            return Ok(());
        }
        let signer = signer.ok_or_else(|| {
            ChatError::Unauthorized(owners.iter().next().copied().unwrap_or_default().to_string())
        })?;
        let payload = serde_json::to_vec(writes)?;
        let sig = signer.sign(&payload);
        for owner in owners {
            if !crypto::verify(owner, &payload, &sig) {
                tracing::warn!(%owner, "rejected write with foreign signature");
                return Err(ChatError::Unauthorized(format!("~{}", owner)));
            }
        }
        Ok(())
    }

    fn dispatch(&self, deliveries: Vec<(String, ListenMode, Delivery)>) {
        let mut listeners = self.inner.listeners.lock();
        for (soul, mode, delivery) in deliveries {
            if let Some(list) = listeners.get_mut(&soul) {
                list.retain(|l| l.mode != mode || l.tx.send(delivery.clone()).is_ok());
            }
        }
        listeners.retain(|_, list| !list.is_empty());
    }
}

/// A position in the graph. Cheap to clone; carries the signer used for
/// writes into a user space.
#[derive(Clone)]
pub struct Chain {
    db: GraphDb,
    soul: String,
    signer: Option<Arc<KeyPair>>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("soul", &self.soul)
            .field("signed", &self.signer.is_some())
            .finish()
    }
}

impl Chain {
    pub fn soul(&self) -> &str {
        &self.soul
    }

    pub fn key(&self) -> &str {
        last_segment(&self.soul)
    }

    pub fn get(&self, key: &str) -> Chain {
        Chain {
            db: self.db.clone(),
            soul: join_soul(&self.soul, key),
            signer: self.signer.clone(),
        }
    }

    pub fn signed(mut self, signer: Arc<KeyPair>) -> Chain {
        self.signer = Some(signer);
        self
    }

    /// Snapshot of the current data.
    pub fn read(&self) -> Option<Value> {
        self.db.read(&self.soul)
    }

    pub fn keys(&self) -> Vec<String> {
        self.db.keys(&self.soul)
    }

    pub fn put(&self, value: Value) -> Result<()> {
        let mut writes = Vec::new();
        match value {
            Value::Object(map) if !is_link_map(&map) => {
                link_ancestors(&self.soul, &mut writes);
                plan_object(&self.soul, map, &mut writes);
            }
            scalar => {
                let (parent, key) =
                    split_soul(&self.soul).ok_or_else(|| ChatError::ScalarOnRoot(self.soul.clone()))?;
                link_ancestors(parent, &mut writes);
                writes.push(FieldWrite {
                    soul: parent.to_string(),
                    key: key.to_string(),
                    value: scalar,
                });
            }
        }
        tracing::trace!(soul = %self.soul, fields = writes.len(), "put");
        self.db.commit(writes, self.signer.as_deref())
    }

    /// Subscribes to this node.
    pub fn on(&self) -> Subscription {
        self.db.subscribe(&self.soul, ListenMode::Node)
    }

    /// Subscribes to every child of this node.
    pub fn map_on(&self) -> Subscription {
        self.db.subscribe(&self.soul, ListenMode::Map)
    }
}

fn plan_object(soul: &str, map: Map<String, Value>, writes: &mut Vec<FieldWrite>) {
    for (key, value) in map {
        if key == META_KEY {
            continue;
        }
        match value {
            Value::Object(child) if !is_link_map(&child) => {
                let child_soul = join_soul(soul, &key);
                writes.push(FieldWrite {
                    soul: soul.to_string(),
                    key,
                    value: link_to(&child_soul),
                });
                plan_object(&child_soul, child, writes);
            }
            value => writes.push(FieldWrite {
                soul: soul.to_string(),
                key,
                value,
            }),
        }
    }
}

fn link_ancestors(soul: &str, writes: &mut Vec<FieldWrite>) {
    let mut current = soul;
    while let Some((parent, key)) = split_soul(current) {
        writes.push(FieldWrite {
            soul: parent.to_string(),
            key: key.to_string(),
            value: link_to(current),
        });
        current = parent;
    }
}

fn read_value(nodes: &HashMap<String, Node>, soul: &str) -> Option<Value> {
    let parent_field = split_soul(soul)
        .and_then(|(parent, key)| nodes.get(parent).and_then(|node| node.get(key)));
    match parent_field {
        Some(Value::Null) => return None,
        Some(value) if is_link(value) => {
            let target = link_target(value)?;
            if target != soul {
                return read_value(nodes, target);
            }
        }
        Some(value) => return Some(value.clone()),
        None => {}
    }
    nodes
        .get(soul)
        .map(|node| Value::Object(node.clone().into_iter().collect()))
}

fn child_keys(nodes: &HashMap<String, Node>, soul: &str) -> Vec<String> {
    nodes
        .get(soul)
        .map(|node| {
            node.iter()
                .filter(|(key, value)| key.as_str() != META_KEY && !value.is_null())
                .map(|(key, _)| key.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn user_space_owner(soul: &str) -> Option<&str> {
    let root = root_segment(soul);
    if root.starts_with("~@") {
        return None;
    }
    root.strip_prefix('~')
}

fn root_segment(soul: &str) -> &str {
    soul.split('/').next().unwrap_or(soul)
}

fn last_segment(soul: &str) -> &str {
    soul.rsplit('/').next().unwrap_or(soul)
}

fn split_soul(soul: &str) -> Option<(&str, &str)> {
    soul.rsplit_once('/')
}

fn join_soul(soul: &str, key: &str) -> String {
    debug_assert!(!key.contains('/'), "graph keys cannot contain '/'");
    format!("{}/{}", soul, key)
}

pub fn link_to(soul: &str) -> Value {
    let mut map = Map::new();
    map.insert(LINK_KEY.to_string(), Value::String(soul.to_string()));
    Value::Object(map)
}

pub fn is_link(value: &Value) -> bool {
    value.as_object().is_some_and(is_link_map)
}

fn is_link_map(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.get(LINK_KEY).is_some_and(Value::is_string)
}

pub fn link_target(value: &Value) -> Option<&str> {
    value.as_object()?.get(LINK_KEY)?.as_str()
}

/// Entries of a node snapshot, skipping metadata and removed fields.
pub fn extract_entries(data: &Value) -> Vec<(String, Value)> {
    data.as_object()
        .map(|map| {
            map.iter()
                .filter(|(key, value)| !key.is_empty() && key.as_str() != META_KEY && !value.is_null())
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default()
}

pub fn extract_keys(data: &Value) -> Vec<String> {
    extract_entries(data).into_iter().map(|(key, _)| key).collect()
}

pub fn extract_values(data: &Value) -> Vec<Value> {
    extract_entries(data).into_iter().map(|(_, value)| value).collect()
}

pub fn extract_first_entry(data: &Value) -> Option<(String, Value)> {
    extract_entries(data).into_iter().next()
}

pub fn extract_first_key(data: &Value) -> Option<String> {
    extract_first_entry(data).map(|(key, _)| key)
}

pub fn extract_first_value(data: &Value) -> Option<Value> {
    extract_first_entry(data).map(|(_, value)| value)
}

pub fn put_value(chain: &Chain, value: impl Serialize) -> Result<()> {
    chain.put(serde_json::to_value(value)?)
}

pub fn set_value(chain: &Chain, key: &str, value: impl Serialize) -> Result<()> {
    chain.get(key).put(serde_json::to_value(value)?)
}

/// Writes `data` key by key. A failed key is retried after `delay`; keys
/// already written are not written again.
pub async fn set_values(
    chain: &Chain,
    data: Map<String, Value>,
    attempts: u32,
    delay: Duration,
) -> Result<()> {
    let mut pending: Vec<(String, Value)> = data.into_iter().collect();
    let mut remaining = attempts;
    while let Some((key, value)) = pending.first().cloned() {
        match chain.get(&key).put(value) {
            Ok(()) => {
                pending.remove(0);
            }
            Err(e) if remaining > 0 => {
                tracing::debug!(soul = %chain.soul(), %key, error = %e, "retrying write");
                remaining -= 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(ChatError::SetValues(e.to_string())),
        }
    }
    Ok(())
}
