//! Shared key-value store, site rules and the coordinator's caches.
//!
//! The store is last-write-wins and multi-writer. Readers that see stale rules
//! re-read on the next change notification or navigation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::host::TabId;
use crate::speed::Speed;

pub const SITE_SETTINGS_KEY: &str = "siteSettings";
pub const SHORTCUT_KEY: &str = "speedPopupShortcut";
pub const VERSION_KEY: &str = "version";
pub const DEFAULT_SHORTCUT: &str = "Ctrl + .";

/// Default TTL for cached reads.
pub const DEFAULT_CACHE_TTL_MS: u64 = 5_000;

/// Key of the per-tab last-speed entry.
#[must_use]
pub fn tab_speed_key(tab: TabId) -> String {
    format!("tab_{}_speed", tab.get())
}

// =============================================================================
// Store abstraction
// =============================================================================

/// A change notification for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Asynchronous string-keyed JSON store.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Value>, StorageError>> + Send;

    fn set(&self, key: &str, value: Value)
    -> impl Future<Output = Result<(), StorageError>> + Send;

    fn remove(&self, key: &str) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Every entry, in insertion order.
    fn get_all(&self) -> impl Future<Output = Result<IndexMap<String, Value>, StorageError>> + Send;

    /// Change notifications for every subsequent write.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// In-memory store with change notifications and failure injection.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<IndexMap<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
    unavailable: AtomicBool,
    reads: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(IndexMap::new()),
            changes,
            unavailable: AtomicBool::new(false),
            reads: AtomicU64::new(0),
        }
    }

    /// Make every operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `get`/`get_all` calls served so far.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, IndexMap<String, Value>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Unavailable("store lock poisoned".to_string()))
    }

    fn notify(&self, key: &str, old_value: Option<Value>, new_value: Option<Value>) {
        // No receivers is fine
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.check()?;
        let old = self.lock()?.insert(key.to_string(), value.clone());
        self.notify(key, old, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        let old = self.lock()?.shift_remove(key);
        if old.is_some() {
            self.notify(key, old, None);
        }
        Ok(())
    }

    async fn get_all(&self) -> Result<IndexMap<String, Value>, StorageError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock()?.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

// =============================================================================
// Site rules
// =============================================================================

/// Speed rule for one URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRule")]
pub struct SiteSpeedRule {
    pub speed: f64,
    pub enabled: bool,
}

impl SiteSpeedRule {
    #[must_use]
    pub fn new(speed: f64, enabled: bool) -> Self {
        Self { speed, enabled }
    }
}

fn default_enabled() -> bool {
    true
}

/// Accepts both `{speed, enabled}` and the legacy bare number.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawRule {
    Legacy(f64),
    Full {
        speed: f64,
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
}

impl From<RawRule> for SiteSpeedRule {
    fn from(raw: RawRule) -> Self {
        match raw {
            RawRule::Legacy(speed) => Self::new(speed, true),
            RawRule::Full { speed, enabled } => Self::new(speed, enabled),
        }
    }
}

/// Pattern → rule, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "IndexMap<String, Value>")]
pub struct SiteSettings {
    rules: IndexMap<String, SiteSpeedRule>,
}

impl From<IndexMap<String, Value>> for SiteSettings {
    fn from(raw: IndexMap<String, Value>) -> Self {
        let mut rules = IndexMap::with_capacity(raw.len());
        for (pattern, value) in raw {
            match serde_json::from_value::<SiteSpeedRule>(value) {
                Ok(rule) => {
                    rules.insert(pattern, rule);
                }
                Err(e) => warn!(pattern, error = %e, "Dropping malformed site rule"),
            }
        }
        Self { rules }
    }
}

impl SiteSettings {
    /// Decode a stored `siteSettings` value. Anything but an object is an
    /// empty rule set.
    #[must_use]
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Object(map)) => {
                let raw: IndexMap<String, Value> =
                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                Self::from(raw)
            }
            Some(other) => {
                warn!(kind = %value_kind(other), "Ignoring non-object siteSettings");
                Self::default()
            }
            None => Self::default(),
        }
    }

    /// Read the rule set from `store`.
    pub async fn load<S: KeyValueStore>(store: &S) -> Result<Self, StorageError> {
        let value = store.get(SITE_SETTINGS_KEY).await?;
        Ok(Self::from_value(value.as_ref()))
    }

    /// Insert or replace a rule. Replacing keeps the original position.
    pub fn insert(&mut self, pattern: impl Into<String>, rule: SiteSpeedRule) {
        self.rules.insert(pattern.into(), rule);
    }

    pub fn remove(&mut self, pattern: &str) -> Option<SiteSpeedRule> {
        self.rules.shift_remove(pattern)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SiteSpeedRule)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Serialize for SiteSettings {
    fn serialize<Ser: serde::Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        self.rules.serialize(serializer)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// StorageCache
// =============================================================================

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Option<Value>,
    stored_at_ms: u64,
}

/// TTL read cache in front of a store. Concurrent misses for the same key
/// share one underlying read.
#[derive(Debug)]
pub struct StorageCache<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
    entries: Mutex<HashMap<String, CacheEntry>>,
    loads: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    epoch: AtomicU64,
}

impl<S: KeyValueStore> StorageCache<S> {
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        Self {
            store,
            clock,
            ttl_ms,
            entries: Mutex::new(HashMap::new()),
            loads: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn fresh(&self, key: &str) -> Option<Option<Value>> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) if now.saturating_sub(entry.stored_at_ms) < self.ttl_ms => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn load_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.loads.lock() {
            Ok(mut loads) => Arc::clone(loads.entry(key.to_string()).or_default()),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Cached read of `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        if let Some(value) = self.fresh(key) {
            return Ok(value);
        }

        let lock = self.load_lock(key);
        let _loading = lock.lock().await;

        // Another caller may have finished the load while we waited
        if let Some(value) = self.fresh(key) {
            debug!(key, "Storage read coalesced");
            return Ok(value);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let value = self.store.get(key).await?;
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.put(key, value.clone());
        }
        Ok(value)
    }

    /// Write through to the store and cache the new value.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.put(key, Some(value.clone()));
        self.store.set(key, value).await
    }

    fn put(&self, key: &str, value: Option<Value>) {
        let stored_at_ms = self.clock.now_ms();
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), CacheEntry { value, stored_at_ms });
        }
    }

    /// Forget one key.
    pub fn clear(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
        if let Ok(mut loads) = self.loads.lock() {
            loads.remove(key);
        }
    }

    /// Forget everything. Loads already in flight will not repopulate.
    pub fn clear_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
        if let Ok(mut loads) = self.loads.lock() {
            loads.clear();
        }
    }

    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

// =============================================================================
// Tab speeds
// =============================================================================

/// Stored shape of `tab_<id>_speed`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TabSpeedRecord {
    pub speed: f64,
    pub timestamp: u64,
}

/// Short-lived per-tab speed memory, checked before the store.
#[derive(Debug)]
pub struct TabSpeedCache {
    ttl_ms: u64,
    speeds: HashMap<TabId, (Speed, u64)>,
}

impl TabSpeedCache {
    #[must_use]
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            speeds: HashMap::new(),
        }
    }

    pub fn set(&mut self, tab: TabId, speed: Speed, now_ms: u64) {
        self.speeds.insert(tab, (speed, now_ms));
    }

    /// Fresh entry for `tab`; expired entries are dropped.
    pub fn get(&mut self, tab: TabId, now_ms: u64) -> Option<Speed> {
        match self.speeds.get(&tab) {
            Some(&(speed, at)) if now_ms.saturating_sub(at) < self.ttl_ms => Some(speed),
            Some(_) => {
                self.speeds.remove(&tab);
                None
            }
            None => None,
        }
    }

    pub fn clear(&mut self, tab: TabId) {
        self.speeds.remove(&tab);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.speeds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.speeds.is_empty()
    }
}
