//! Reactive entity model.
//!
//! Entities are registered once and owned by the [`EntityRegistry`]; callers
//! hold [`EntityHandle`] proxies whose accessor methods route every write
//! through the property's behavior chain before it lands in the committed
//! value table. Committed mutations coalesce for a fixed window, are diffed
//! leaf-by-leaf against the previous snapshot, and fan out as typed
//! [`EntityEvent`]s on an explicit broadcast bus — subscribers register
//! explicitly, there is no ambient emitter.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Result, RoomsenseError};

pub mod behaviors;

use behaviors::{build_chain, BehaviorSpec, Sink};

/// How long committed mutations accumulate before a diff flush.
const FLUSH_WINDOW: Duration = Duration::from_millis(250);

/// Capacity of the entity event bus.
const EVENT_BUS_CAPACITY: usize = 256;

/// Description of an entity at registration time.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    /// Unique, immutable identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Whether this entity's state is shared across the cluster.
    pub distributable: bool,
    /// Whether distributed state uses "locked" authority semantics.
    pub lockable: bool,
    /// Behavior chains per property path.
    pub behaviors: Vec<BehaviorSpec>,
}

impl EntityDescriptor {
    /// A local-only entity with no behaviors.
    #[must_use]
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            distributable: false,
            lockable: false,
            behaviors: Vec::new(),
        }
    }

    /// Mark the entity as distributed across the cluster.
    #[must_use]
    pub fn distributed(mut self, lockable: bool) -> Self {
        self.distributable = true;
        self.lockable = lockable;
        self
    }

    /// Attach behavior chains.
    #[must_use]
    pub fn with_behaviors(mut self, behaviors: Vec<BehaviorSpec>) -> Self {
        self.behaviors = behaviors;
        self
    }
}

/// One changed leaf in a flushed mutation batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDiff {
    /// Slash-delimited pointer into state/attributes, e.g. `/state`.
    pub path: String,
    /// Previous committed value; `None` for a fresh path.
    pub old_value: Option<Value>,
    /// New committed value; `Null` marks a removed leaf.
    pub new_value: Value,
}

/// Typed messages on the entity event bus.
#[derive(Debug, Clone)]
pub enum EntityEvent {
    /// A new entity was registered.
    NewEntity {
        /// The raw entity description.
        entity: EntityDescriptor,
        /// Integration-supplied customizations passed through to publishers.
        customizations: Option<Value>,
    },
    /// A coalesced batch of committed mutations changed the entity.
    Updated {
        /// Entity id.
        id: String,
        /// Changed leaves in mutation-observation order.
        diffs: Vec<EntityDiff>,
        /// Whether this node's view of the entity is authoritative.
        authoritative: bool,
    },
}

/// External verdict on cluster leadership, consulted by the authority gate.
pub trait LeadershipOracle: Send + Sync {
    /// Is this node the cluster's majority leader?
    fn is_majority_leader(&self) -> bool;
}

#[derive(Debug, Clone)]
struct EntityMeta {
    id: String,
    name: String,
    distributable: bool,
    lockable: bool,
}

fn authority_for(meta: &EntityMeta, oracle: &dyn LeadershipOracle) -> bool {
    if !meta.distributable || !meta.lockable {
        return true;
    }
    oracle.is_majority_leader()
}

#[derive(Default)]
struct ValueTable {
    committed: BTreeMap<String, Value>,
    snapshot: BTreeMap<String, Value>,
    /// Paths touched since the last flush, in observation order.
    pending: Vec<String>,
    flush_scheduled: bool,
}

struct EntityShared {
    meta: EntityMeta,
    table: Mutex<ValueTable>,
    pipelines: HashMap<String, Sink>,
    events: broadcast::Sender<EntityEvent>,
    oracle: Arc<dyn LeadershipOracle>,
}

impl EntityShared {
    /// Record a committed mutation and schedule a coalesced flush.
    fn commit(self: &Arc<Self>, path: &str, value: Value) {
        let schedule = {
            let mut table = self.table.lock().expect("value table poisoned");
            if !table.pending.iter().any(|p| p == path) {
                table.pending.push(path.to_owned());
            }
            table.committed.insert(path.to_owned(), value);

            let schedule = !table.flush_scheduled;
            table.flush_scheduled = true;
            schedule
        };

        if schedule {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(FLUSH_WINDOW).await;
                if let Some(shared) = weak.upgrade() {
                    shared.flush();
                }
            });
        }
    }

    /// Diff the coalesced batch against the previous snapshot and emit an
    /// update when anything actually changed.
    fn flush(&self) {
        let diffs = {
            let mut table = self.table.lock().expect("value table poisoned");
            table.flush_scheduled = false;
            let pending = std::mem::take(&mut table.pending);

            let mut diffs = Vec::new();
            for path in pending {
                let old = table.snapshot.get(&path).cloned();
                let new = table.committed.get(&path).cloned().unwrap_or(Value::Null);
                diff_leaves(&path, old.as_ref(), &new, &mut diffs);
                table.snapshot.insert(path, new);
            }
            diffs
        };

        if diffs.is_empty() {
            return;
        }

        let authoritative = authority_for(&self.meta, &*self.oracle);
        debug!(
            entity = self.meta.id,
            changes = diffs.len(),
            authoritative,
            "entity updated"
        );
        let _ = self.events.send(EntityEvent::Updated {
            id: self.meta.id.clone(),
            diffs,
            authoritative,
        });
    }
}

/// Recursively emit per-leaf changes between the old and new value of one
/// property. Objects are descended; everything else (arrays included) is
/// compared structurally as a leaf.
fn diff_leaves(path: &str, old: Option<&Value>, new: &Value, out: &mut Vec<EntityDiff>) {
    if old == Some(new) {
        return;
    }

    if let (Some(Value::Object(old_map)), Value::Object(new_map)) = (old, new) {
        for (key, new_value) in new_map {
            diff_leaves(
                &format!("{path}/{key}"),
                old_map.get(key),
                new_value,
                out,
            );
        }
        for (key, old_value) in old_map {
            if !new_map.contains_key(key) {
                out.push(EntityDiff {
                    path: format!("{path}/{key}"),
                    old_value: Some(old_value.clone()),
                    new_value: Value::Null,
                });
            }
        }
        return;
    }

    out.push(EntityDiff {
        path: path.to_owned(),
        old_value: old.cloned(),
        new_value: new.clone(),
    });
}

/// Cloneable proxy to a registered entity. All mutation goes through these
/// accessors; the raw entity is never handed out.
#[derive(Clone)]
pub struct EntityHandle {
    shared: Arc<EntityShared>,
}

impl std::fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("id", &self.shared.meta.id)
            .finish_non_exhaustive()
    }
}

impl EntityHandle {
    /// Entity id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.meta.id
    }

    /// Entity name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.meta.name
    }

    /// Write the entity's state through its behavior chain.
    pub fn set_state(&self, value: Value) {
        self.write("/state", value);
    }

    /// Write a named attribute through its behavior chain.
    pub fn set_attribute(&self, key: &str, value: Value) {
        self.write(&format!("/attributes/{key}"), value);
    }

    /// Current committed state, if any has been committed yet.
    #[must_use]
    pub fn state(&self) -> Option<Value> {
        self.committed("/state")
    }

    /// Current committed value of a named attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.committed(&format!("/attributes/{key}"))
    }

    fn committed(&self, path: &str) -> Option<Value> {
        self.shared
            .table
            .lock()
            .expect("value table poisoned")
            .committed
            .get(path)
            .cloned()
    }

    fn write(&self, path: &str, value: Value) {
        match self.shared.pipelines.get(path) {
            Some(chain) => chain(value),
            None => self.shared.commit(path, value),
        }
    }
}

/// Owns all entities and fans out their lifecycle and update events.
pub struct EntityRegistry {
    entities: Mutex<HashMap<String, EntityHandle>>,
    events: broadcast::Sender<EntityEvent>,
    oracle: Arc<dyn LeadershipOracle>,
}

impl EntityRegistry {
    /// Create a registry consulting the given leadership oracle.
    #[must_use]
    pub fn new(oracle: Arc<dyn LeadershipOracle>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            entities: Mutex::new(HashMap::new()),
            events,
            oracle,
        }
    }

    /// Subscribe to entity lifecycle and update events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.events.subscribe()
    }

    /// Register an entity, emitting `NewEntity` synchronously.
    ///
    /// # Errors
    ///
    /// [`RoomsenseError::DuplicateEntityId`] when the id is already taken;
    /// ids are unique and immutable for the process lifetime.
    pub fn add(
        &self,
        descriptor: EntityDescriptor,
        customizations: Option<Value>,
    ) -> Result<EntityHandle> {
        let mut entities = self.entities.lock().expect("entity map poisoned");
        if entities.contains_key(&descriptor.id) {
            return Err(RoomsenseError::DuplicateEntityId(descriptor.id));
        }

        let meta = EntityMeta {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            distributable: descriptor.distributable,
            lockable: descriptor.lockable,
        };
        let events = self.events.clone();
        let oracle = Arc::clone(&self.oracle);
        let behavior_specs = descriptor.behaviors.clone();

        let shared = Arc::new_cyclic(|weak: &Weak<EntityShared>| {
            let pipelines = behavior_specs
                .into_iter()
                .map(|spec| {
                    let weak = weak.clone();
                    let path = spec.path.clone();
                    let commit_path = spec.path;
                    let commit: Sink = Arc::new(move |value| {
                        if let Some(shared) = weak.upgrade() {
                            shared.commit(&commit_path, value);
                        }
                    });
                    (path, build_chain(spec.stages, commit))
                })
                .collect();

            EntityShared {
                meta,
                table: Mutex::new(ValueTable::default()),
                pipelines,
                events,
                oracle,
            }
        });

        let handle = EntityHandle { shared };
        entities.insert(descriptor.id.clone(), handle.clone());
        drop(entities);

        let _ = self.events.send(EntityEvent::NewEntity {
            entity: descriptor,
            customizations,
        });
        Ok(handle)
    }

    /// Look up an entity; returns the same proxy identity handed out by
    /// [`EntityRegistry::add`].
    #[must_use]
    pub fn get(&self, id: &str) -> Option<EntityHandle> {
        self.entities
            .lock()
            .expect("entity map poisoned")
            .get(id)
            .cloned()
    }

    /// Whether an entity with this id is registered.
    #[must_use]
    pub fn has(&self, id: &str) -> bool {
        self.entities
            .lock()
            .expect("entity map poisoned")
            .contains_key(id)
    }

    /// All registered entities.
    #[must_use]
    pub fn all(&self) -> Vec<EntityHandle> {
        self.entities
            .lock()
            .expect("entity map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Whether this node's view of the entity should be treated as the
    /// source of truth. Non-distributable entities are always authoritative;
    /// distributable ones defer to the leadership oracle only when lock
    /// semantics are enabled.
    #[must_use]
    pub fn has_authority_over(&self, entity: &EntityHandle) -> bool {
        authority_for(&entity.shared.meta, &*self.oracle)
    }
}
