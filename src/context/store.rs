//! Context store
//!
//! The single source of truth for "how do I reach cluster X". One coarse
//! `RwLock` guards the map; mutations are rare next to lookups. Adds and
//! renames of named contexts also hold a naming lock across their check,
//! persistence and insert, so kubeconfig writes never run under the map
//! lock. Transports are pooled beside the map and dropped whenever their
//! context goes away.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::{ClusterContext, ClusterTransport};
use crate::{Error, Result};

/// Thread-safe registry of cluster contexts
#[derive(Default)]
pub struct ContextStore {
    contexts: RwLock<HashMap<String, Arc<ClusterContext>>>,
    naming: Mutex<()>,
    transports: DashMap<String, ClusterTransport>,
}

impl ContextStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context under its name
    ///
    /// Non-internal contexts may not reuse the name (or original name) of
    /// another non-internal context. Internal contexts replace any previous
    /// entry under the same key.
    pub fn add(&self, ctx: ClusterContext) -> Result<()> {
        if ctx.internal {
            self.insert(vec![ctx]);
            return Ok(());
        }
        self.add_all(vec![ctx], |_| Ok(()))
    }

    /// Register a batch of contexts, persisting them first
    ///
    /// Every name is checked against the store and the rest of the batch
    /// before `persist` runs. On a collision or a failed `persist` nothing
    /// is written and nothing is added.
    pub fn add_all<F>(&self, batch: Vec<ClusterContext>, persist: F) -> Result<()>
    where
        F: FnOnce(&[ClusterContext]) -> Result<()>,
    {
        let _naming = self.naming.lock();

        {
            let contexts = self.contexts.read();
            for (i, ctx) in batch.iter().enumerate().filter(|(_, c)| !c.internal) {
                if let Some(existing) = find_collision(&contexts, &ctx.name, None) {
                    return Err(Error::NameCollision(format!(
                        "context name {} already in use by {existing}",
                        ctx.name
                    )));
                }
                if batch[..i]
                    .iter()
                    .any(|other| !other.internal && other.name == ctx.name)
                {
                    return Err(Error::NameCollision(format!(
                        "context name {} appears more than once",
                        ctx.name
                    )));
                }
            }
        }

        persist(&batch)?;
        self.insert(batch);
        Ok(())
    }

    fn insert(&self, batch: Vec<ClusterContext>) {
        let mut contexts = self.contexts.write();
        for ctx in batch {
            let name = ctx.name.clone();
            contexts.insert(name.clone(), Arc::new(ctx));
            self.transports.remove(&name);
            debug!(cluster = %name, "Context added");
        }
    }

    /// Remove a context, returning it
    pub fn remove(&self, name: &str) -> Result<Arc<ClusterContext>> {
        let removed = self
            .contexts
            .write()
            .remove(name)
            .ok_or_else(|| Error::ClusterNotFound(name.to_string()))?;
        self.transports.remove(name);
        debug!(cluster = %name, "Context removed");
        Ok(removed)
    }

    /// Look up a context by name
    pub fn get(&self, name: &str) -> Result<Arc<ClusterContext>> {
        self.contexts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ClusterNotFound(name.to_string()))
    }

    /// Snapshot of every context, sorted by name
    pub fn list(&self) -> Vec<Arc<ClusterContext>> {
        let mut all: Vec<_> = self.contexts.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Number of registered contexts
    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    /// Whether no contexts are registered
    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    /// Rename `old` to `new`
    ///
    /// The lookup and uniqueness check run first, then `persist`, then the
    /// swap under a single write lock so readers see exactly one of the two
    /// names. When `persist` fails the store is left untouched.
    pub fn rename<F>(&self, old: &str, new: &str, persist: F) -> Result<()>
    where
        F: FnOnce(&ClusterContext) -> Result<()>,
    {
        let _naming = self.naming.lock();

        let current = {
            let contexts = self.contexts.read();
            let current = contexts
                .get(old)
                .cloned()
                .ok_or_else(|| Error::ClusterNotFound(old.to_string()))?;
            if old != new {
                if let Some(existing) = find_collision(&contexts, new, Some(old)) {
                    return Err(Error::NameCollision(format!(
                        "custom name already in use by {existing}"
                    )));
                }
            }
            current
        };

        persist(&current)?;

        let mut contexts = self.contexts.write();
        // Removed or replaced while the kubeconfig was being written
        if !contexts
            .get(old)
            .is_some_and(|ctx| Arc::ptr_eq(ctx, &current))
        {
            return Err(Error::ClusterNotFound(old.to_string()));
        }

        let mut renamed = (*current).clone();
        renamed.name = new.to_string();
        contexts.remove(old);
        contexts.insert(new.to_string(), Arc::new(renamed));
        self.transports.remove(old);
        self.transports.remove(new);

        info!(from = %old, to = %new, "Context renamed");
        Ok(())
    }

    /// Drop internal contexts past their expiry
    pub fn remove_expired(&self) -> usize {
        let mut contexts = self.contexts.write();
        let expired: Vec<String> = contexts
            .iter()
            .filter(|(_, ctx)| ctx.internal && ctx.is_expired())
            .map(|(name, _)| name.clone())
            .collect();

        for name in &expired {
            contexts.remove(name);
            self.transports.remove(name);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired internal contexts removed");
        }
        expired.len()
    }

    /// Transport for `name`, built on first use
    pub fn transport(&self, name: &str) -> Result<ClusterTransport> {
        if let Some(existing) = self.transports.get(name) {
            return Ok(existing.clone());
        }

        // Hold the read lock while building so a concurrent remove cannot
        // leave a transport for a context that no longer exists.
        let contexts = self.contexts.read();
        let ctx = contexts
            .get(name)
            .ok_or_else(|| Error::ClusterNotFound(name.to_string()))?;
        if let Some(err) = &ctx.error {
            return Err(Error::ClusterSetup(err.clone()));
        }

        let transport = ClusterTransport::build(ctx)?;
        self.transports
            .insert(name.to_string(), transport.clone());
        Ok(transport)
    }

    /// HTTP client for `name`
    pub fn client(&self, name: &str) -> Result<reqwest::Client> {
        Ok(self.transport(name)?.http)
    }

    /// WebSocket TLS config for `name` (`None` for plain-HTTP servers)
    pub fn websocket_tls(&self, name: &str) -> Result<Option<Arc<rustls::ClientConfig>>> {
        Ok(self.transport(name)?.websocket_tls)
    }

    /// Number of pooled transports
    pub fn pooled_transports(&self) -> usize {
        self.transports.len()
    }
}

/// Name of a non-internal context (other than `skip`) whose display or
/// original name equals `name`
fn find_collision(
    contexts: &HashMap<String, Arc<ClusterContext>>,
    name: &str,
    skip: Option<&str>,
) -> Option<String> {
    contexts
        .iter()
        .filter(|(key, ctx)| !ctx.internal && Some(key.as_str()) != skip)
        .find(|(_, ctx)| ctx.name == name || ctx.original_name == name)
        .map(|(key, _)| key.clone())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::context::ContextSource;

    fn ctx(name: &str) -> ClusterContext {
        ClusterContext::new(name, "http://127.0.0.1:6443", ContextSource::KubeConfig)
    }

    #[test]
    fn add_then_get() {
        let store = ContextStore::new();
        store.add(ctx("alpha")).unwrap();
        assert_eq!(store.get("alpha").unwrap().server, "http://127.0.0.1:6443");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_non_internal_name_is_rejected() {
        let store = ContextStore::new();
        store.add(ctx("alpha")).unwrap();
        let err = store.add(ctx("alpha")).unwrap_err();
        assert!(matches!(err, Error::NameCollision(_)));
    }

    #[test]
    fn add_collides_with_original_name() {
        let store = ContextStore::new();
        let mut renamed = ctx("pretty");
        renamed.original_name = "raw".to_string();
        store.add(renamed).unwrap();

        assert!(matches!(store.add(ctx("raw")), Err(Error::NameCollision(_))));
    }

    #[test]
    fn add_all_checks_every_name_before_persisting() {
        let store = ContextStore::new();
        store.add(ctx("prod")).unwrap();

        let mut persisted = false;
        let err = store
            .add_all(vec![ctx("staging"), ctx("prod")], |_| {
                persisted = true;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, Error::NameCollision(ref m) if m.contains("prod")));
        assert!(!persisted);
        assert!(store.get("staging").is_err());
    }

    #[test]
    fn add_all_rejects_repeated_names_in_batch() {
        let store = ContextStore::new();
        let err = store
            .add_all(vec![ctx("lab"), ctx("lab")], |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::NameCollision(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn add_all_adds_nothing_when_persist_fails() {
        let store = ContextStore::new();
        let err = store
            .add_all(vec![ctx("a"), ctx("b")], |batch| {
                assert_eq!(batch.len(), 2);
                Err(Error::Kubeconfig("read-only".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Kubeconfig(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn internal_context_replaces_previous_entry() {
        let store = ContextStore::new();
        let mut first = ctx("alphauser1");
        first.internal = true;
        store.add(first).unwrap();

        let mut second = ctx("alphauser1");
        second.internal = true;
        second.server = "http://10.0.0.2:6443".into();
        store.add(second).unwrap();

        assert_eq!(store.get("alphauser1").unwrap().server, "http://10.0.0.2:6443");
    }

    #[test]
    fn remove_absent_is_not_found() {
        let store = ContextStore::new();
        assert!(matches!(store.remove("ghost"), Err(Error::ClusterNotFound(_))));
    }

    #[test]
    fn remove_drops_pooled_transport() {
        let store = ContextStore::new();
        store.add(ctx("alpha")).unwrap();
        store.client("alpha").unwrap();
        assert_eq!(store.pooled_transports(), 1);

        store.remove("alpha").unwrap();
        assert_eq!(store.pooled_transports(), 0);
        assert!(store.client("alpha").is_err());
    }

    #[test]
    fn transport_for_failed_context_is_setup_error() {
        let store = ContextStore::new();
        store
            .add(ClusterContext::failed("broken", ContextSource::KubeConfig, "bad CA"))
            .unwrap();
        let err = store.transport("broken").unwrap_err();
        assert!(matches!(err, Error::ClusterSetup(ref m) if m == "bad CA"));
    }

    #[test]
    fn rename_moves_entry() {
        let store = ContextStore::new();
        store.add(ctx("old")).unwrap();

        store.rename("old", "new", |_| Ok(())).unwrap();

        assert!(store.get("old").is_err());
        let renamed = store.get("new").unwrap();
        assert_eq!(renamed.name, "new");
        assert_eq!(renamed.original_name, "old");
    }

    #[test]
    fn rename_to_taken_name_fails_before_persist() {
        let store = ContextStore::new();
        store.add(ctx("a")).unwrap();
        store.add(ctx("b")).unwrap();

        let mut persisted = false;
        let err = store
            .rename("a", "b", |_| {
                persisted = true;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, Error::NameCollision(_)));
        assert!(!persisted);
        assert!(store.get("a").is_ok());
    }

    #[test]
    fn failed_persist_leaves_store_untouched() {
        let store = ContextStore::new();
        store.add(ctx("a")).unwrap();

        let err = store
            .rename("a", "z", |_| Err(Error::Kubeconfig("disk full".into())))
            .unwrap_err();

        assert!(matches!(err, Error::Kubeconfig(_)));
        assert!(store.get("a").is_ok());
        assert!(store.get("z").is_err());
    }

    #[test]
    fn rename_of_context_removed_during_persist_fails() {
        let store = ContextStore::new();
        store.add(ctx("a")).unwrap();

        let err = store
            .rename("a", "z", |_| {
                store.remove("a").map(|_| ())
            })
            .unwrap_err();

        assert!(matches!(err, Error::ClusterNotFound(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn rename_to_own_original_name_is_allowed() {
        let store = ContextStore::new();
        let mut c = ctx("pretty");
        c.original_name = "raw".into();
        store.add(c).unwrap();

        store.rename("pretty", "raw", |_| Ok(())).unwrap();
        assert!(store.get("raw").is_ok());
    }

    #[test]
    fn remove_expired_only_touches_internal() {
        let store = ContextStore::new();
        let mut stale = ctx("stale");
        stale.internal = true;
        stale.expires_at = Some(Instant::now().checked_sub(Duration::from_secs(1)).unwrap());
        store.add(stale).unwrap();

        let mut static_ctx = ctx("static");
        static_ctx.expires_at = Some(Instant::now().checked_sub(Duration::from_secs(1)).unwrap());
        store.add(static_ctx).unwrap();

        assert_eq!(store.remove_expired(), 1);
        assert!(store.get("stale").is_err());
        assert!(store.get("static").is_ok());
    }

    #[test]
    fn list_is_sorted() {
        let store = ContextStore::new();
        store.add(ctx("b")).unwrap();
        store.add(ctx("a")).unwrap();
        let names: Vec<_> = store.list().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
