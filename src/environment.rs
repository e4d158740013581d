//! The unit-of-work context: which store to talk to, on whose behalf, and
//! the field values already read during this unit of work.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

// written ids are looked up once per cache entry
use roaring::RoaringTreemap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::error::Result;
use crate::recordset::RecordSet;
use crate::registry::{FieldRef, OtherHasher, Registry};
use crate::settings::Settings;
use crate::store::{SqliteStore, Store};
use crate::value::{RecordId, Value};

pub const SUPERUSER: RecordId = 1;

/// How much of the cache a write drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Invalidation {
    /// everything, after every write
    #[default]
    Full,
    /// the written fields and whatever depends on them
    Precise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Principal {
    pub uid: RecordId,
}
impl Principal {
    pub fn new(uid: RecordId) -> Self {
        Self { uid }
    }
    pub fn superuser() -> Self {
        Self { uid: SUPERUSER }
    }
    pub fn is_superuser(&self) -> bool {
        self.uid == SUPERUSER
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub schema: String,
    pub id: RecordId,
    pub field: String,
}
impl CacheKey {
    pub fn new(schema: &str, id: RecordId, field: &str) -> Self {
        Self {
            schema: schema.to_string(),
            id,
            field: field.to_string(),
        }
    }
}

type Cache = HashMap<CacheKey, Value, OtherHasher>;

struct Inner {
    registry: Registry,
    store: Arc<dyn Store>,
    principal: Principal,
    context: Map<String, JsonValue>,
    invalidation: Invalidation,
    search_limit: Option<u64>,
    cache: Mutex<Cache>,
}

/// Cloning an environment shares its cache. Use [`Environment::with_context`]
/// and friends to get a sibling with a cache of its own.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<Inner>,
}

impl Environment {
    pub fn new(registry: Registry, store: Arc<dyn Store>) -> Self {
        Self::assemble(
            registry,
            store,
            Principal::superuser(),
            Map::new(),
            Invalidation::default(),
            None,
        )
    }

    /// Opens the configured database and creates the tables of every schema
    /// registered so far.
    pub fn from_settings(settings: &Settings, registry: Registry) -> Result<Self> {
        let store = SqliteStore::open(&settings.database)?;
        registry.install(&store)?;
        Ok(Self::assemble(
            registry,
            Arc::new(store),
            Principal::superuser(),
            Map::new(),
            settings.invalidation,
            settings.search_limit,
        ))
    }

    fn assemble(
        registry: Registry,
        store: Arc<dyn Store>,
        principal: Principal,
        context: Map<String, JsonValue>,
        invalidation: Invalidation,
        search_limit: Option<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                principal,
                context,
                invalidation,
                search_limit,
                cache: Mutex::new(HashMap::default()),
            }),
        }
    }

    fn sibling(
        &self,
        principal: Principal,
        context: Map<String, JsonValue>,
        invalidation: Invalidation,
    ) -> Self {
        Self::assemble(
            self.inner.registry.clone(),
            Arc::clone(&self.inner.store),
            principal,
            context,
            invalidation,
            self.inner.search_limit,
        )
    }
    pub fn with_context(&self, context: Map<String, JsonValue>) -> Self {
        self.sibling(self.inner.principal, context, self.inner.invalidation)
    }
    pub fn with_principal(&self, principal: Principal) -> Self {
        self.sibling(principal, self.inner.context.clone(), self.inner.invalidation)
    }
    pub fn with_invalidation(&self, invalidation: Invalidation) -> Self {
        self.sibling(self.inner.principal, self.inner.context.clone(), invalidation)
    }

    /// An empty record set of the named schema, bound to this environment.
    pub fn model(&self, name: &str) -> Result<RecordSet> {
        let schema = self.inner.registry.get(name)?;
        Ok(RecordSet::new(self.clone(), schema, Vec::new()))
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }
    pub fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }
    pub fn principal(&self) -> Principal {
        self.inner.principal
    }
    pub fn uid(&self) -> RecordId {
        self.inner.principal.uid
    }
    pub fn context(&self) -> &Map<String, JsonValue> {
        &self.inner.context
    }
    pub fn context_value(&self, key: &str) -> Option<&JsonValue> {
        self.inner.context.get(key)
    }
    pub fn invalidation(&self) -> Invalidation {
        self.inner.invalidation
    }
    pub fn search_limit(&self) -> Option<u64> {
        self.inner.search_limit
    }

    // ------------- Cache -------------
    fn cache(&self) -> MutexGuard<'_, Cache> {
        // a panic while holding the lock cannot leave a half-written entry
        match self.inner.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
    pub fn cached(&self, key: &CacheKey) -> Option<Value> {
        self.cache().get(key).cloned()
    }
    pub fn is_cached(&self, key: &CacheKey) -> bool {
        self.cache().contains_key(key)
    }
    pub(crate) fn cache_value(&self, key: CacheKey, value: Value) {
        self.cache().insert(key, value);
    }
    pub(crate) fn cache_values(&self, entries: impl IntoIterator<Item = (CacheKey, Value)>) {
        self.cache().extend(entries);
    }
    pub fn cache_len(&self) -> usize {
        self.cache().len()
    }

    /// Drops every cached value.
    pub fn invalidate_cache(&self) {
        let mut cache = self.cache();
        let dropped = cache.len();
        cache.clear();
        debug!(dropped, "Invalidated the whole cache");
    }

    /// Drops the cached values of `fields` for `ids`, and every value of the
    /// given dependents regardless of record.
    pub(crate) fn invalidate_fields(
        &self,
        schema: &str,
        ids: &[RecordId],
        fields: &[&str],
        dependents: &[FieldRef],
    ) {
        let ids: RoaringTreemap = ids.iter().map(|id| *id as u64).collect();
        let fields: HashSet<&str> = fields.iter().copied().collect();
        let dependents: HashSet<(&str, &str)> = dependents
            .iter()
            .map(|(s, f)| (s.as_str(), f.as_str()))
            .collect();
        let mut cache = self.cache();
        let before = cache.len();
        cache.retain(|key, _| {
            let written = key.schema == schema
                && fields.contains(key.field.as_str())
                && ids.contains(key.id as u64);
            let dependent = dependents.contains(&(key.schema.as_str(), key.field.as_str()));
            !(written || dependent)
        });
        debug!(dropped = before - cache.len(), schema, "Invalidated cached fields");
    }

    /// Invalidates after a confirmed write, following the configured
    /// strategy.
    pub(crate) fn invalidate_after_write(
        &self,
        schema: &str,
        ids: &[RecordId],
        fields: &[&str],
    ) -> Result<()> {
        match self.inner.invalidation {
            Invalidation::Full => self.invalidate_cache(),
            Invalidation::Precise => {
                let dependents = self.inner.registry.dependents(schema, fields)?;
                self.invalidate_fields(schema, ids, fields, &dependents);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Environment")
            .field("uid", &self.inner.principal.uid)
            .field("context", &self.inner.context)
            .field("invalidation", &self.inner.invalidation)
            .field("cached", &self.cache_len())
            .finish()
    }
}
