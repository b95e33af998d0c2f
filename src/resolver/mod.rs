//! The triple store everything else hangs off.
//!
//! Subjects map to attributes map to ordered value lists. On top of the
//! store sit the per URN locks, two LRU caches of opened objects (one per
//! [`Mode`]), the add/set observers and a queue of deferred work.
//!
//! Objects never hold a strong reference back to the resolver; they keep a
//! [`WeakResolver`] and look everything else up by URN.

mod handle;
pub mod hooks;
mod lock;
pub mod properties;

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use log::{debug, error, warn};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::error::{Aff4Error, Result};
use crate::object::{self, Object};
use crate::urn::{self, attr, config, types};

pub use handle::{Handle, Mode};
pub use hooks::{HookFn, HookId, HookKind};
pub use properties::UrnObject;

use hooks::Hooks;
use lock::LockTable;

pub const DEFAULT_CACHE_SIZE: usize = 100;

/// Work queued by code that must not re-enter the resolver where it runs.
pub type Deferred = Box<dyn FnOnce(&Resolver) -> Result<()> + Send>;

pub(crate) struct Inner {
    store: RwLock<HashMap<String, UrnObject>>,
    locks: LockTable,
    read_cache: Mutex<LruCache<String, Object>>,
    write_cache: Mutex<LruCache<String, Object>>,
    hooks: RwLock<Hooks>,
    deferred: Mutex<VecDeque<Deferred>>,
}

#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

/// Back reference held by opened objects.
#[derive(Clone)]
pub struct WeakResolver(Weak<Inner>);

impl WeakResolver {
    pub fn upgrade(&self) -> Result<Resolver> {
        self.0
            .upgrade()
            .map(|inner| Resolver { inner })
            .ok_or(Aff4Error::ResolverGone)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        Self::with_cache_size(DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(size: usize) -> Self {
        let cap = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN);
        let resolver = Resolver {
            inner: Arc::new(Inner {
                store: RwLock::new(HashMap::new()),
                locks: LockTable::new(),
                read_cache: Mutex::new(LruCache::new(cap)),
                write_cache: Mutex::new(LruCache::new(cap)),
                hooks: RwLock::new(Hooks::default()),
                deferred: Mutex::new(VecDeque::new()),
            }),
        };

        resolver.set(urn::NULL, attr::TYPE, types::ERROR);
        resolver.set(urn::ZERO, attr::TYPE, types::ERROR);
        resolver.set(urn::ZERO, attr::PAD, 1);
        resolver.set(urn::GLOBAL, config::CACHE_SIZE, cap);
        resolver
    }

    pub fn downgrade(&self) -> WeakResolver {
        WeakResolver(Arc::downgrade(&self.inner))
    }

    /// Replace the values of `attribute` with `value`.
    pub fn set<V: ToString>(&self, subject: &str, attribute: &str, value: V) {
        let value = value.to_string();
        {
            let mut store = self.inner.store.write();
            store
                .entry(subject.to_string())
                .or_default()
                .set(attribute, value.clone());
            mark_dirty(&mut store, subject, attribute);
        }
        self.fire(HookKind::Set, subject, attribute, &value);
    }

    /// Append `value` unless it is already there.
    pub fn add<V: ToString>(&self, subject: &str, attribute: &str, value: V) {
        let value = value.to_string();
        {
            let mut store = self.inner.store.write();
            let added = store
                .entry(subject.to_string())
                .or_default()
                .add(attribute, value.clone());
            if !added {
                return;
            }
            mark_dirty(&mut store, subject, attribute);
        }
        self.fire(HookKind::Add, subject, attribute, &value);
    }

    pub fn delete(&self, subject: &str, attribute: &str) {
        if let Some(obj) = self.inner.store.write().get_mut(subject) {
            obj.delete(attribute);
        }
    }

    pub fn delete_value(&self, subject: &str, attribute: &str, value: &str) {
        if let Some(obj) = self.inner.store.write().get_mut(subject) {
            obj.delete_value(attribute, value);
        }
    }

    /// First value, if any.
    pub fn resolve(&self, subject: &str, attribute: &str) -> Option<String> {
        self.inner
            .store
            .read()
            .get(subject)
            .and_then(|o| o.get(attribute))
            .and_then(|v| v.first().cloned())
    }

    pub fn resolve_list(&self, subject: &str, attribute: &str) -> Vec<String> {
        self.inner
            .store
            .read()
            .get(subject)
            .and_then(|o| o.get(attribute))
            .map(|v| v.to_vec())
            .unwrap_or_default()
    }

    /// Numeric attribute. Unparseable values are logged and treated as missing.
    pub fn resolve_u64(&self, subject: &str, attribute: &str) -> Option<u64> {
        let value = self.resolve(subject, attribute)?;
        match value.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("{} {}={} is not a number", subject, attribute, value);
                None
            }
        }
    }

    pub fn resolve_bool(&self, subject: &str, attribute: &str) -> bool {
        matches!(
            self.resolve(subject, attribute).as_deref().map(str::trim),
            Some("1") | Some("true") | Some("yes")
        )
    }

    /// Required attribute, missing is an error.
    pub fn require(&self, subject: &str, attribute: &str) -> Result<String> {
        self.resolve(subject, attribute)
            .ok_or_else(|| Aff4Error::missing(subject, attribute))
    }

    pub fn require_u64(&self, subject: &str, attribute: &str) -> Result<u64> {
        self.resolve_u64(subject, attribute)
            .ok_or_else(|| Aff4Error::missing(subject, attribute))
    }

    pub fn config_u64(&self, key: &str, default: u64) -> u64 {
        self.resolve_u64(urn::GLOBAL, key).unwrap_or(default)
    }

    pub fn config_bool(&self, key: &str) -> bool {
        self.resolve_bool(urn::GLOBAL, key)
    }

    /// Every `(subject, value)` carrying `attribute`.
    pub fn search_attribute(&self, attribute: &str) -> Vec<(String, String)> {
        let store = self.inner.store.read();
        let mut hits: Vec<_> = store
            .iter()
            .flat_map(|(s, o)| {
                o.get(attribute)
                    .unwrap_or_default()
                    .iter()
                    .map(move |v| (s.clone(), v.clone()))
            })
            .collect();
        hits.sort();
        hits
    }

    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<_> = self.inner.store.read().keys().cloned().collect();
        subjects.sort();
        subjects
    }

    pub fn snapshot(&self, subject: &str) -> Option<UrnObject> {
        self.inner.store.read().get(subject).cloned()
    }

    /// Persistent attributes of `subject`, one `subject attribute=value` line each.
    pub fn export(&self, subject: &str, prefix: &str) -> String {
        let store = self.inner.store.read();
        let mut text = String::new();
        if let Some(obj) = store.get(subject) {
            for (a, v) in obj.persistent() {
                text.push_str(prefix);
                text.push_str(&properties::format_line(Some(subject), a, v));
            }
        }
        text
    }

    /// Same as [`Resolver::export`] without the subject.
    pub fn export_relative(&self, subject: &str) -> String {
        let store = self.inner.store.read();
        let mut text = String::new();
        if let Some(obj) = store.get(subject) {
            for (a, v) in obj.persistent() {
                text.push_str(&properties::format_line(None, a, v));
            }
        }
        text
    }

    pub fn export_all(&self) -> String {
        self.subjects()
            .iter()
            .map(|s| self.export(s, ""))
            .collect()
    }

    /// Load properties text, returns how many triples were read.
    pub fn parse_properties(&self, text: &str, context: Option<&str>) -> usize {
        let mut count = 0;
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            match properties::parse_line(line, context) {
                Some((subject, attribute, value)) => {
                    self.add(&subject, &attribute, value);
                    count += 1;
                }
                None => warn!("Skipping malformed properties line: {:?}", line),
            }
        }
        count
    }

    pub fn on_add<F>(&self, filter: Option<&str>, callback: F) -> HookId
    where
        F: Fn(&Resolver, &str, &str, &str) + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .write()
            .register(HookKind::Add, filter, Arc::new(callback))
    }

    pub fn on_set<F>(&self, filter: Option<&str>, callback: F) -> HookId
    where
        F: Fn(&Resolver, &str, &str, &str) + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .write()
            .register(HookKind::Set, filter, Arc::new(callback))
    }

    pub fn remove_hook(&self, id: HookId) -> bool {
        self.inner.hooks.write().remove(id)
    }

    pub fn clear_hooks(&self) {
        self.inner.hooks.write().clear();
    }

    fn fire(&self, kind: HookKind, subject: &str, attribute: &str, value: &str) {
        let callbacks = self.inner.hooks.read().matching(kind, attribute);
        for cb in callbacks {
            cb(self, subject, attribute, value);
        }
    }

    pub fn defer(&self, task: Deferred) {
        self.inner.deferred.lock().push_back(task);
    }

    pub fn has_deferred(&self) -> bool {
        !self.inner.deferred.lock().is_empty()
    }

    /// Drain the deferred queue, tasks queued while draining run too.
    pub fn run_deferred(&self) -> Result<()> {
        loop {
            let task = self.inner.deferred.lock().pop_front();
            match task {
                Some(task) => task(self)?,
                None => return Ok(()),
            }
        }
    }

    fn cache(&self, mode: Mode) -> &Mutex<LruCache<String, Object>> {
        match mode {
            Mode::Read => &self.inner.read_cache,
            Mode::Write => &self.inner.write_cache,
        }
    }

    /// Check an object out, blocking on its lock for `mode`.
    pub fn open(&self, urn: &str, mode: Mode) -> Result<Handle> {
        self.inner.locks.acquire(urn, mode);

        let cached = self.cache(mode).lock().pop(urn);
        let object = match cached {
            Some(object) => Ok(object),
            None => object::construct(self, urn, mode),
        };

        match object {
            Ok(object) => Ok(Handle::new(self.clone(), object, mode)),
            Err(e) => {
                self.inner.locks.release(urn, mode);
                Err(e)
            }
        }
    }

    /// Open or `None`, for callers that treat a missing object as normal.
    pub fn try_open(&self, urn: &str, mode: Mode) -> Option<Handle> {
        match self.open(urn, mode) {
            Ok(h) => Some(h),
            Err(e) => {
                debug!("Could not open {} ({}): {}", urn, mode, e);
                None
            }
        }
    }

    /// Install a freshly built object as if it had been opened.
    pub(crate) fn adopt(&self, object: Object, mode: Mode) -> Handle {
        self.inner.locks.acquire(object.urn(), mode);
        Handle::new(self.clone(), object, mode)
    }

    pub fn cache_return(&self, handle: Handle) {
        drop(handle);
    }

    pub(crate) fn return_object(&self, object: Object, mode: Mode) {
        let urn = object.urn().to_string();
        let evicted = self.cache(mode).lock().push(urn.clone(), object);
        self.inner.locks.release(&urn, mode);

        if let Some((old_urn, old)) = evicted {
            if old_urn != urn {
                self.evict(&old_urn, old, mode);
            }
        }
    }

    pub(crate) fn release(&self, urn: &str, mode: Mode) {
        self.inner.locks.release(urn, mode);
    }

    fn evict(&self, urn: &str, mut object: Object, mode: Mode) {
        if mode != Mode::Write || !object.is_dirty() {
            return;
        }

        debug!("Evicting dirty {} {}", object.type_name(), urn);
        self.inner.locks.acquire(urn, mode);
        if let Err(e) = object.close() {
            error!("Closing evicted {} failed: {}", urn, e);
        }
        self.inner.locks.release(urn, mode);
    }

    /// Drop a cached reader, it goes stale when its URN gets rewritten.
    pub fn invalidate(&self, urn: &str) {
        self.inner.read_cache.lock().pop(urn);
    }

    /// Close every dirty stream stored in `volume`, then the volume itself.
    pub fn close_volume(&self, volume: &str) -> Result<()> {
        self.run_deferred()?;

        let mut dirty: Vec<String> = self
            .resolve_list(volume, attr::CONTAINS)
            .into_iter()
            .filter(|u| u != volume && self.resolve_bool(u, attr::DIRTY))
            .collect();
        // Layered streams still write into their targets on close and
        // identities sign what everything else wrote
        dirty.sort_by_key(|u| match self.resolve(u, attr::TYPE).as_deref() {
            Some(types::ENCRYPTED) | Some(types::MAP) => 0,
            Some(types::IDENTITY) => 2,
            _ => 1,
        });

        for urn in dirty {
            debug!("Flushing {} before closing {}", urn, volume);
            self.open(&urn, Mode::Write)?.close()?;
        }

        self.run_deferred()?;
        self.open(volume, Mode::Write)?.close()
    }

    /// Close every dirty volume.
    pub fn flush(&self) -> Result<()> {
        self.run_deferred()?;
        for (volume, _) in self
            .search_attribute(attr::TYPE)
            .into_iter()
            .filter(|(_, t)| t == types::ZIP_VOLUME)
        {
            if self.resolve_bool(&volume, attr::DIRTY) {
                self.close_volume(&volume)?;
            }
        }
        Ok(())
    }
}

// A persistent change to something a volume stores makes the volume dirty
fn mark_dirty(store: &mut HashMap<String, UrnObject>, subject: &str, attribute: &str) {
    if urn::is_volatile(attribute) {
        return;
    }

    let is_volume = |s: &str| {
        store
            .get(s)
            .and_then(|o| o.get(attr::TYPE))
            .map_or(false, |t| t.iter().any(|t| t == types::ZIP_VOLUME))
    };

    let volume = if is_volume(subject) {
        Some(subject.to_string())
    } else {
        store
            .get(subject)
            .and_then(|o| o.get(attr::STORED))
            .and_then(|v| v.first())
            .filter(|v| is_volume(v.as_str()))
            .cloned()
    };

    if let Some(volume) = volume {
        store
            .entry(volume)
            .or_default()
            .set(attr::DIRTY, "1".to_string());
    }
}
