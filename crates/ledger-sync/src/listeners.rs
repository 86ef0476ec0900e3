//! Collaborators notified by the apply pipeline.
//!
//! The engine talks to the rest of the application through these seams:
//! the reactive layer ([`ChangeObserver`]), undo history
//! ([`UndoRecorder`]), preference storage ([`PreferenceStore`]), and any
//! number of sync listeners and event subscribers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use ledger_crdt::{Dataset, Message, Value};

use crate::error::BoxError;
use crate::snapshot::Snapshot;

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Called after every committed batch with the rows before and after it.
pub type SyncListener = dyn Fn(&Snapshot, &Snapshot) + Send + Sync;

/// Called for every [`SyncEvent`].
pub type EventCallback = dyn Fn(&SyncEvent) + Send + Sync;

/// Notifications about sync progress.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A batch was committed. Lists the datasets of applied messages.
    Applied {
        /// Datasets changed by the batch.
        tables: Vec<Dataset>,
    },
    /// A full sync converged.
    Success {
        /// Datasets changed by received messages.
        tables: Vec<Dataset>,
    },
    /// A local send or full sync failed.
    Error {
        /// Stable code from [`SyncError::kind`](crate::SyncError::kind).
        kind: &'static str,
        /// Description of the failure.
        message: String,
    },
}

/// Reactive layer that recomputes derived values from changed rows.
pub trait ChangeObserver: Send + Sync {
    /// Rows touched by a batch, before and after it committed.
    fn on_changes_applied(&self, old: &Snapshot, new: &Snapshot);
}

/// Undo history.
pub trait UndoRecorder: Send + Sync {
    /// Messages about to be applied and the rows they will overwrite.
    fn append_messages(&self, messages: &[Message], old: &Snapshot);
}

/// Storage for values of the reserved preferences dataset.
pub trait PreferenceStore: Send + Sync {
    /// Save preference values, keyed by preference id.
    fn save_prefs(&self, prefs: &BTreeMap<String, Value>) -> Result<(), BoxError>;
}

/// Keeps preferences in memory.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryPreferences {
    /// Create an empty preference store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a preference.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Every stored preference.
    pub fn all(&self) -> BTreeMap<String, Value> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn save_prefs(&self, prefs: &BTreeMap<String, Value>) -> Result<(), BoxError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.extend(prefs.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

/// Thread-safe registry of callbacks, invoked in subscription order.
pub struct CallbackRegistry<C: ?Sized> {
    callbacks: RwLock<BTreeMap<SubscriptionId, Arc<C>>>,
    next_id: AtomicU64,
}

impl<C: ?Sized> CallbackRegistry<C> {
    /// Create a new empty callback registry.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback. Returns an id for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, callback: Arc<C>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, callback);
        id
    }

    /// Remove a callback. Returns `true` if it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Registered callbacks. The lock is not held while they run.
    pub fn callbacks(&self) -> Vec<Arc<C>> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<C: ?Sized> Default for CallbackRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized> std::fmt::Debug for CallbackRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("subscriber_count", &self.subscriber_count())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

/// Everything the engine notifies.
pub(crate) struct Hooks {
    pub(crate) observer: Option<Arc<dyn ChangeObserver>>,
    pub(crate) undo: Option<Arc<dyn UndoRecorder>>,
    pub(crate) prefs: Arc<dyn PreferenceStore>,
    pub(crate) sync_listeners: CallbackRegistry<SyncListener>,
    pub(crate) events: CallbackRegistry<EventCallback>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            observer: None,
            undo: None,
            prefs: Arc::new(MemoryPreferences::new()),
            sync_listeners: CallbackRegistry::new(),
            events: CallbackRegistry::new(),
        }
    }
}

impl Hooks {
    pub(crate) fn emit(&self, event: &SyncEvent) {
        for callback in self.events.callbacks() {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribe_and_unsubscribe() {
        let registry: CallbackRegistry<EventCallback> = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let id = registry.subscribe(Arc::new(move |_: &SyncEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(registry.subscriber_count(), 1);

        let event = SyncEvent::Applied { tables: vec![] };
        for callback in registry.callbacks() {
            callback(&event);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert!(registry.callbacks().is_empty());
    }

    #[test]
    fn callbacks_keep_subscription_order() {
        let registry: CallbackRegistry<EventCallback> = CallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            registry.subscribe(Arc::new(move |_: &SyncEvent| order.lock().unwrap().push(n)));
        }
        let event = SyncEvent::Success { tables: vec![] };
        for callback in registry.callbacks() {
            callback(&event);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn memory_preferences_merge() {
        let prefs = MemoryPreferences::new();
        let mut batch = BTreeMap::new();
        batch.insert("budgetType".to_string(), Value::from("rollover"));
        prefs.save_prefs(&batch).unwrap();
        batch.insert("budgetType".to_string(), Value::from("report"));
        batch.insert("locale".to_string(), Value::from("en"));
        prefs.save_prefs(&batch).unwrap();
        assert_eq!(prefs.get("budgetType"), Some(Value::from("report")));
        assert_eq!(prefs.all().len(), 2);
    }
}
