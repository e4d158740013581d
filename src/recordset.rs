//! Record sets: ordered, duplicate-free lists of record ids of one schema,
//! bound to an [`Environment`].
//!
//! Every transformation returns a new record set. The only operation that
//! changes its receiver is [`RecordSet::unlink`], which leaves it empty.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::{Add, BitAnd, BitOr, Range, Sub};
use std::sync::Arc;

// membership tests in the set algebra
use roaring::RoaringTreemap;

use tracing::debug;

use crate::domain::{Domain, Term};
use crate::environment::{CacheKey, Environment};
use crate::error::{OrmError, Result};
use crate::field::{Access, Field, FieldType, Reference, Relation};
use crate::order::order_by_sql;
use crate::registry::FieldRef;
use crate::schema::{ID, Schema};
use crate::store::{CHUNK, Select};
use crate::value::{RecordId, Value};

/// Field values keyed by field name, as taken by create and write.
pub type Values = BTreeMap<String, Value>;

/// Builds a [`Values`] map: `values! { "name" => "Ada", "age" => 36 }`.
#[macro_export]
macro_rules! values {
    () => {
        ::std::collections::BTreeMap::<String, $crate::value::Value>::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut values = ::std::collections::BTreeMap::<String, $crate::value::Value>::new();
        $( values.insert(::std::string::String::from($key), $crate::value::Value::from($value)); )+
        values
    }};
}

/// The result of reading a field from a record set.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// a non-reference field of a singleton
    Scalar(Value),
    /// a non-reference field of any other record set, one value per record
    List(Vec<Value>),
    /// a reference field, the union of the referenced records
    Records(RecordSet),
}

impl FieldValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(value) => Some(value),
            _ => None,
        }
    }
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            FieldValue::List(values) => Some(values),
            _ => None,
        }
    }
    pub fn into_records(self) -> Option<RecordSet> {
        match self {
            FieldValue::Records(records) => Some(records),
            _ => None,
        }
    }
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Scalar(_) => false,
            FieldValue::List(values) => values.is_empty(),
            FieldValue::Records(records) => records.is_empty(),
        }
    }
}

/// Paging and ordering of a search. The limit falls back to the
/// environment's `search_limit`, the order to the schema's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub offset: u64,
    pub limit: Option<u64>,
    pub order: Option<String>,
}
impl SearchOptions {
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }
}

fn key(id: RecordId) -> u64 {
    id as u64
}

fn unique(ids: impl IntoIterator<Item = RecordId>) -> Vec<RecordId> {
    let mut seen = RoaringTreemap::new();
    ids.into_iter().filter(|id| seen.insert(key(*id))).collect()
}

#[derive(Clone)]
pub struct RecordSet {
    env: Environment,
    schema: Arc<Schema>,
    ids: Vec<RecordId>,
}

impl RecordSet {
    pub(crate) fn new(env: Environment, schema: Arc<Schema>, ids: Vec<RecordId>) -> Self {
        Self {
            env,
            schema,
            ids: unique(ids),
        }
    }
    fn with_ids(&self, ids: Vec<RecordId>) -> RecordSet {
        RecordSet::new(self.env.clone(), Arc::clone(&self.schema), ids)
    }
    fn singleton(&self, id: RecordId) -> RecordSet {
        RecordSet {
            env: self.env.clone(),
            schema: Arc::clone(&self.schema),
            ids: vec![id],
        }
    }
    fn comodel(&self, name: &str, ids: Vec<RecordId>) -> Result<RecordSet> {
        let schema = self.env.registry().get(name)?;
        Ok(RecordSet::new(self.env.clone(), schema, ids))
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
    pub fn name(&self) -> &str {
        self.schema.name()
    }
    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }
    pub fn len(&self) -> usize {
        self.ids.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    // ------------- Construction -------------
    /// Records of the same schema with the given ids. Nothing is read until
    /// a field is accessed.
    pub fn browse(&self, ids: impl IntoIterator<Item = RecordId>) -> RecordSet {
        self.with_ids(ids.into_iter().collect())
    }

    pub fn search(&self, domain: &Domain) -> Result<RecordSet> {
        self.search_with(domain, &SearchOptions::default())
    }

    pub fn search_with(&self, domain: &Domain, options: &SearchOptions) -> Result<RecordSet> {
        let limit = options.limit.or(self.env.search_limit());
        self.select(domain, options.offset, limit, options.order.as_deref())
    }

    fn select(
        &self,
        domain: &Domain,
        offset: u64,
        limit: Option<u64>,
        order: Option<&str>,
    ) -> Result<RecordSet> {
        // everything that can fail on the domain fails before the store is hit
        let clause = domain.compile(&self.schema, self.env.registry())?;
        let order = order_by_sql(&self.schema, order.unwrap_or(self.schema.order()))?;
        let query = Select {
            order: Some(order),
            limit,
            offset,
            ..Select::new(self.schema.table(), &clause)
        };
        let ids = self.env.store().select(&query)?;
        debug!(schema = self.name(), found = ids.len(), "Searched");
        Ok(self.with_ids(ids))
    }

    pub fn count(&self, domain: &Domain) -> Result<u64> {
        let clause = domain.compile(&self.schema, self.env.registry())?;
        self.env.store().count(self.schema.table(), &clause)
    }

    // ------------- Algebra -------------
    fn check_same(&self, other: &RecordSet) -> Result<()> {
        if self.name() != other.name() {
            return Err(OrmError::SchemaMismatch {
                left: self.name().to_string(),
                right: other.name().to_string(),
            });
        }
        Ok(())
    }
    fn members(&self) -> RoaringTreemap {
        self.ids.iter().map(|id| key(*id)).collect()
    }

    /// Records of both, first occurrences kept in order.
    pub fn union(&self, other: &RecordSet) -> Result<RecordSet> {
        self.check_same(other)?;
        Ok(self.with_ids(self.ids.iter().chain(other.ids.iter()).copied().collect()))
    }
    pub fn difference(&self, other: &RecordSet) -> Result<RecordSet> {
        self.check_same(other)?;
        let right = other.members();
        Ok(self.with_ids(
            self.ids
                .iter()
                .copied()
                .filter(|id| !right.contains(key(*id)))
                .collect(),
        ))
    }
    pub fn intersection(&self, other: &RecordSet) -> Result<RecordSet> {
        self.check_same(other)?;
        let right = other.members();
        Ok(self.with_ids(
            self.ids
                .iter()
                .copied()
                .filter(|id| right.contains(key(*id)))
                .collect(),
        ))
    }

    // ------------- Singletons and indexing -------------
    pub fn ensure_one(&self) -> Result<RecordSet> {
        if self.ids.len() != 1 {
            return Err(OrmError::SingletonExpected(self.ids.len()));
        }
        Ok(self.clone())
    }
    /// The id of a singleton, `None` for the empty set.
    pub fn id(&self) -> Result<Option<RecordId>> {
        match self.ids.as_slice() {
            [] => Ok(None),
            [id] => Ok(Some(*id)),
            ids => Err(OrmError::SingletonExpected(ids.len())),
        }
    }
    pub fn get_index(&self, index: usize) -> Option<RecordSet> {
        self.ids.get(index).map(|id| self.singleton(*id))
    }
    /// The records at `range`, clamped to the set's bounds.
    pub fn slice(&self, range: Range<usize>) -> RecordSet {
        let end = range.end.min(self.ids.len());
        let start = range.start.min(end);
        self.with_ids(self.ids[start..end].to_vec())
    }
    /// Each record as a singleton, in order.
    pub fn iter(&self) -> impl Iterator<Item = RecordSet> + '_ {
        self.ids.iter().map(|id| self.singleton(*id))
    }

    // ------------- Higher-order -------------
    pub fn filtered<F>(&self, mut predicate: F) -> Result<RecordSet>
    where
        F: FnMut(&RecordSet) -> Result<bool>,
    {
        let mut kept = Vec::new();
        for record in self.iter() {
            if predicate(&record)? {
                kept.push(record.ids[0]);
            }
        }
        Ok(self.with_ids(kept))
    }

    /// Records whose value of `field` is truthy.
    pub fn filtered_by(&self, field: &str) -> Result<RecordSet> {
        self.filtered(|record| Ok(record.value(field)?.is_truthy()))
    }

    /// Records matching a domain, evaluated by the store, in this set's
    /// order.
    pub fn filtered_domain(&self, domain: &Domain) -> Result<RecordSet> {
        if domain.is_empty() || self.is_empty() {
            return Ok(self.clone());
        }
        let matching = self.select_among(ID, &self.ids, domain)?;
        Ok(self.with_ids(
            self.ids
                .iter()
                .copied()
                .filter(|id| matching.contains(key(*id)))
                .collect(),
        ))
    }

    /// Sorted by the values of `field`, nulls first. The sort is stable.
    pub fn sorted_by(&self, field: &str, reverse: bool) -> Result<RecordSet> {
        let mut keyed = Vec::with_capacity(self.ids.len());
        for record in self.iter() {
            keyed.push((record.value(field)?, record.ids[0]));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            let ordering = a.compare(b);
            if reverse { ordering.reverse() } else { ordering }
        });
        Ok(self.with_ids(keyed.into_iter().map(|(_, id)| id).collect()))
    }

    pub fn sorted_by_key<K, F>(&self, mut key_of: F, reverse: bool) -> Result<RecordSet>
    where
        K: Ord,
        F: FnMut(&RecordSet) -> Result<K>,
    {
        let mut keyed = Vec::with_capacity(self.ids.len());
        for record in self.iter() {
            keyed.push((key_of(&record)?, record.ids[0]));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            let ordering: Ordering = a.cmp(b);
            if reverse { ordering.reverse() } else { ordering }
        });
        Ok(self.with_ids(keyed.into_iter().map(|(_, id)| id).collect()))
    }

    /// Sorted by the schema's default order, as the store sees it.
    pub fn sorted(&self) -> Result<RecordSet> {
        if self.ids.len() < 2 {
            return Ok(self.clone());
        }
        if self.ids.len() <= CHUNK {
            let ids: Vec<Value> = self.ids.iter().map(|id| Value::Integer(*id)).collect();
            return self.select(&Domain::from(vec![Term::leaf(ID, "in", ids)]), 0, None, None);
        }
        // too many ids to bind, walk the whole table in order instead
        let members = self.members();
        let ordered = self.select(&Domain::new(), 0, None, None)?;
        Ok(self.with_ids(
            ordered
                .ids
                .into_iter()
                .filter(|id| members.contains(key(*id)))
                .collect(),
        ))
    }

    /// Records whose `path` is one of `ids` and that match `domain`, looked
    /// up a chunk of ids at a time.
    fn select_among(&self, path: &str, ids: &[RecordId], domain: &Domain) -> Result<RoaringTreemap> {
        let mut found = RoaringTreemap::new();
        for chunk in ids.chunks(CHUNK) {
            let listed: Vec<Value> = chunk.iter().map(|id| Value::Integer(*id)).collect();
            let restricted = Domain::from(vec![Term::leaf(path, "in", listed)]).and(domain);
            found.extend(self.select(&restricted, 0, None, None)?.ids.iter().map(|id| key(*id)));
        }
        Ok(found)
    }

    /// Follows a dot path. Reference fields yield the union of the reached
    /// records, other fields one value per reached record.
    pub fn mapped(&self, path: &str) -> Result<FieldValue> {
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop().unwrap_or_default();
        let mut current = self.clone();
        for segment in segments {
            current = current.records(segment)?;
        }
        let field = Arc::clone(current.schema.field(last)?);
        if field.comodel().is_some() {
            return current.get(last);
        }
        let mut values = Vec::with_capacity(current.len());
        for record in current.iter() {
            values.push(record.value(last)?);
        }
        Ok(FieldValue::List(values))
    }

    pub fn mapped_with<T, F>(&self, mut function: F) -> Result<Vec<T>>
    where
        F: FnMut(&RecordSet) -> Result<T>,
    {
        self.iter().map(|record| function(&record)).collect()
    }

    // ------------- Reading -------------
    /// Reads a field. Singletons give a scalar, other sets one value per
    /// record; reference fields give the referenced records.
    pub fn get(&self, name: &str) -> Result<FieldValue> {
        let field = Arc::clone(self.schema.field(name)?);
        if let Some(comodel) = field.comodel() {
            let mut targets = Vec::new();
            for id in &self.ids {
                let value = self.read_value(*id, &field)?;
                targets.extend(value.as_ids().unwrap_or_default());
            }
            return Ok(FieldValue::Records(self.comodel(comodel, targets)?));
        }
        if self.ids.len() == 1 {
            return Ok(FieldValue::Scalar(self.read_value(self.ids[0], &field)?));
        }
        let mut values = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            values.push(self.read_value(*id, &field)?);
        }
        Ok(FieldValue::List(values))
    }

    /// The raw value of a field of a singleton. References come back as ids.
    pub fn value(&self, name: &str) -> Result<Value> {
        let id = self
            .id()?
            .ok_or(OrmError::SingletonExpected(0))?;
        let field = Arc::clone(self.schema.field(name)?);
        self.read_value(id, &field)
    }

    /// The records referenced by a reference field.
    pub fn records(&self, name: &str) -> Result<RecordSet> {
        match self.get(name)? {
            FieldValue::Records(records) => Ok(records),
            _ => Err(OrmError::validation(name, "not a reference field")),
        }
    }

    /// One map per record with `id` and the requested fields, all fields
    /// when none are given.
    pub fn read(&self, fields: &[&str]) -> Result<Vec<Values>> {
        let fields: Vec<Arc<Field>> = if fields.is_empty() {
            self.schema.fields().cloned().collect()
        } else {
            fields
                .iter()
                .map(|name| self.schema.field(name).cloned())
                .collect::<Result<_>>()?
        };
        let mut rows = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            let mut row = Values::new();
            row.insert(ID.to_string(), Value::Integer(*id));
            for field in &fields {
                row.insert(field.name().to_string(), self.read_value(*id, field)?);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn cache_key(&self, id: RecordId, field: &str) -> CacheKey {
        CacheKey::new(self.name(), id, field)
    }

    fn read_value(&self, id: RecordId, field: &Arc<Field>) -> Result<Value> {
        if field.name() == ID {
            return Ok(Value::Integer(id));
        }
        let cache_key = self.cache_key(id, field.name());
        if let Some(value) = self.env.cached(&cache_key) {
            return Ok(value);
        }
        let value = match field.access() {
            Access::Stored | Access::Reference(Reference::One { .. }) => {
                if !field.is_stored() {
                    return Ok(field.type_default());
                }
                self.prefetch(id)?;
                return self.env.cached(&cache_key).ok_or_else(|| OrmError::MissingRecord {
                    schema: self.name().to_string(),
                    id,
                });
            }
            Access::Computed(_) if field.is_stored() => {
                self.prefetch(id)?;
                return self.env.cached(&cache_key).ok_or_else(|| OrmError::MissingRecord {
                    schema: self.name().to_string(),
                    id,
                });
            }
            Access::Computed(compute) => {
                let computed = compute(&self.singleton(id))?;
                field.convert_to_cache(computed)?
            }
            Access::Related(path) => self.follow(id, path)?,
            Access::Reference(Reference::Inverse { comodel, inverse }) => {
                let children = self
                    .env
                    .model(comodel)?
                    .select(&Domain::from(vec![Term::leaf(inverse, "=", id)]), 0, None, None)?;
                Value::from(children.ids)
            }
            Access::Reference(Reference::Many { relation, .. }) => {
                return self.prefetch_links(id, field.name(), relation);
            }
        };
        self.env.cache_value(cache_key, value.clone());
        Ok(value)
    }

    /// Loads every stored column of the records of this set that miss the
    /// column `id` was asked for, in one round trip.
    fn prefetch(&self, id: RecordId) -> Result<()> {
        let columns: Vec<&Arc<Field>> = self
            .schema
            .stored_fields()
            .filter(|f| f.name() != ID)
            .collect();
        let probe = columns.first().map(|f| f.name()).unwrap_or(ID);
        let mut ids: Vec<RecordId> = self
            .ids
            .iter()
            .copied()
            .filter(|other| *other != id && !self.env.is_cached(&self.cache_key(*other, probe)))
            .collect();
        ids.insert(0, id);
        let names: Vec<&str> = columns.iter().map(|f| f.name()).collect();
        let rows = self.env.store().fetch(self.schema.table(), &ids, &names)?;
        debug!(schema = self.name(), rows = rows.len(), "Fetched");
        let mut entries = Vec::with_capacity(rows.len() * columns.len());
        for (row_id, raw) in rows {
            for (field, value) in columns.iter().zip(raw) {
                entries.push((self.cache_key(row_id, field.name()), field.convert_from_store(value)));
            }
        }
        self.env.cache_values(entries);
        Ok(())
    }

    fn prefetch_links(&self, id: RecordId, name: &str, relation: &Relation) -> Result<Value> {
        let mut ids: Vec<RecordId> = self
            .ids
            .iter()
            .copied()
            .filter(|other| *other != id && !self.env.is_cached(&self.cache_key(*other, name)))
            .collect();
        ids.insert(0, id);
        let mut linked: HashMap<RecordId, Vec<Value>> = ids.iter().map(|i| (*i, Vec::new())).collect();
        for (owner, target) in self.env.store().links(relation, &ids)? {
            linked.entry(owner).or_default().push(Value::Integer(target));
        }
        let value = Value::List(linked.remove(&id).unwrap_or_default());
        self.env.cache_values(
            linked
                .into_iter()
                .map(|(owner, targets)| (self.cache_key(owner, name), Value::List(targets))),
        );
        self.env.cache_value(self.cache_key(id, name), value.clone());
        Ok(value)
    }

    /// Walks a related path one singleton at a time.
    fn follow(&self, id: RecordId, path: &str) -> Result<Value> {
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop().unwrap_or_default();
        let mut current = self.singleton(id);
        for segment in segments {
            let next = current.records(segment)?;
            if next.is_empty() {
                return Ok(next.schema.field(last).map(|f| f.type_default()).unwrap_or_default());
            }
            current = next.ensure_one()?;
        }
        current.value(last)
    }

    /// Ids among this set that the store still holds.
    pub fn exists(&self) -> Result<RecordSet> {
        if self.is_empty() {
            return Ok(self.clone());
        }
        let found: HashSet<RecordId> = self
            .env
            .store()
            .fetch(self.schema.table(), &self.ids, &[])?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        Ok(self.with_ids(self.ids.iter().copied().filter(|id| found.contains(id)).collect()))
    }

    /// `(id, label)` for each record, the label being the display field or
    /// `schema,id` when there is none.
    pub fn display_names(&self) -> Result<Vec<(RecordId, String)>> {
        let display = self.schema.display_field().cloned();
        let mut names = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            let label = match &display {
                Some(field) => match self.read_value(*id, field)? {
                    Value::Null => format!("{},{}", self.name(), id),
                    value => value.to_string(),
                },
                None => format!("{},{}", self.name(), id),
            };
            names.push((*id, label));
        }
        Ok(names)
    }

    // ------------- Writing -------------
    /// Read-only fields may still be given a value when a record is
    /// created, derived fields never.
    fn assignable(&self, name: &str, creating: bool) -> Result<Arc<Field>> {
        let field = Arc::clone(self.schema.field(name)?);
        let locked = if creating { field.is_computed() } else { field.is_readonly() };
        if name == ID || locked {
            return Err(OrmError::validation(name, "field is read-only"));
        }
        if matches!(field.field_type(), FieldType::One2many { .. }) {
            return Err(OrmError::Unsupported(format!(
                "assigning one2many field '{name}', write its inverse instead"
            )));
        }
        Ok(field)
    }

    /// Creates one record. Missing fields get their defaults; the result is
    /// a singleton of the new record.
    pub fn create(&self, values: Values) -> Result<RecordSet> {
        let mut provided = Vec::with_capacity(values.len());
        for name in values.keys() {
            provided.push(self.assignable(name, true)?);
        }
        let mut columns = Vec::new();
        let mut links: Vec<(Relation, Vec<RecordId>)> = Vec::new();
        let mut cached = Vec::new();
        for field in self.schema.fields() {
            if field.name() == ID || field.is_computed() {
                continue;
            }
            let value = match values.get(field.name()) {
                Some(value) => value.clone(),
                None if field.is_stored() || field.junction().is_some() => {
                    field.get_default(&self.env)
                }
                None => continue,
            };
            let value = field.convert_to_cache(value)?;
            if let Some(relation) = field.junction() {
                links.push((relation.clone(), value.as_ids().unwrap_or_default()));
            } else if field.is_stored() {
                columns.push((field.name().to_string(), field.convert_to_store(&value)));
            } else {
                continue;
            }
            cached.push((field.name().to_string(), value));
        }

        let id = self.env.store().insert(self.schema.table(), &columns, &links)?;
        debug!(schema = self.name(), id, "Created");

        let written: Vec<&str> = provided.iter().map(|f| f.name()).collect();
        self.env.invalidate_after_write(self.name(), &[id], &written)?;
        self.env.cache_values(
            cached
                .into_iter()
                .map(|(name, value)| (self.cache_key(id, &name), value)),
        );
        let record = self.singleton(id);
        let stored_computed: Vec<Arc<Field>> = self
            .schema
            .fields()
            .filter(|f| f.is_computed() && f.is_stored())
            .cloned()
            .collect();
        record.recompute(&stored_computed)?;
        let mut changed: Vec<&str> = written;
        changed.extend(stored_computed.iter().map(|f| f.name()));
        record.propagate(&changed, &mut HashSet::new())?;
        Ok(record)
    }

    /// Assigns the same values to every record of the set.
    pub fn write(&self, values: Values) -> Result<()> {
        if self.is_empty() || values.is_empty() {
            return Ok(());
        }
        let mut columns = Vec::new();
        let mut links: Vec<(Relation, Vec<RecordId>)> = Vec::new();
        let mut cached = Vec::new();
        for (name, value) in values {
            let field = self.assignable(&name, false)?;
            let value = field.convert_to_cache(value)?;
            if let Some(relation) = field.junction() {
                links.push((relation.clone(), value.as_ids().unwrap_or_default()));
            } else {
                columns.push((name.clone(), field.convert_to_store(&value)));
            }
            cached.push((name, value));
        }

        // columns and links are written together or not at all
        self.env
            .store()
            .update(self.schema.table(), &self.ids, &columns, &links)?;
        debug!(schema = self.name(), records = self.ids.len(), "Wrote");

        // only now that the store has taken the values may the cache see them
        let written: Vec<&str> = cached.iter().map(|(name, _)| name.as_str()).collect();
        self.env.invalidate_after_write(self.name(), &self.ids, &written)?;
        let mut entries = Vec::with_capacity(self.ids.len() * cached.len());
        for id in &self.ids {
            for (name, value) in &cached {
                entries.push((self.cache_key(*id, name), value.clone()));
            }
        }
        self.env.cache_values(entries);
        self.propagate(&written, &mut HashSet::new())
    }

    /// Deletes every record of the set and leaves it empty.
    pub fn unlink(&mut self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let deleted = self.env.store().delete(self.schema.table(), &self.ids)?;
        debug!(schema = self.name(), deleted, "Unlinked");
        self.env.invalidate_cache();
        self.ids.clear();
        Ok(())
    }

    /// Duplicates a singleton. Fields marked as not copied are left to
    /// their defaults; `overrides` win over copied values.
    pub fn copy(&self, overrides: Values) -> Result<RecordSet> {
        let id = self.id()?.ok_or(OrmError::SingletonExpected(0))?;
        let mut values = Values::new();
        for field in self.schema.fields() {
            let copyable = field.name() != ID
                && field.is_copied()
                && !field.is_computed()
                && (field.is_stored() || field.junction().is_some());
            if copyable {
                values.insert(field.name().to_string(), self.read_value(id, field)?);
            }
        }
        values.extend(overrides);
        self.create(values)
    }

    // ------------- Derived fields -------------
    /// Computes stored computed fields and persists the results, record by
    /// record.
    fn recompute(&self, fields: &[Arc<Field>]) -> Result<()> {
        for field in fields {
            let Access::Computed(compute) = field.access() else {
                continue;
            };
            for record in self.iter() {
                let value = field.convert_to_cache(compute(&record)?)?;
                self.env.store().update(
                    self.schema.table(),
                    &record.ids,
                    &[(field.name().to_string(), field.convert_to_store(&value))],
                    &[],
                )?;
                self.env
                    .cache_value(self.cache_key(record.ids[0], field.name()), value);
            }
        }
        Ok(())
    }

    /// Brings stored computed fields that follow `changed` up to date,
    /// wherever they live.
    fn propagate(&self, changed: &[&str], visited: &mut HashSet<FieldRef>) -> Result<()> {
        let registry = self.env.registry().clone();
        for name in changed {
            for dependent in registry.direct_dependents(self.name(), name)? {
                let target = (dependent.schema.clone(), dependent.field.clone());
                if !visited.insert(target) {
                    continue;
                }
                let affected = match &dependent.via {
                    None if dependent.schema == self.name() => self.clone(),
                    None => continue,
                    Some(path) => {
                        let model = self.env.model(&dependent.schema)?;
                        let found = model.select_among(path, &self.ids, &Domain::new())?;
                        model.browse(found.iter().map(|id| id as RecordId))
                    }
                };
                if affected.is_empty() {
                    continue;
                }
                let field = Arc::clone(affected.schema.field(&dependent.field)?);
                if field.is_computed() && field.is_stored() {
                    affected.recompute(std::slice::from_ref(&field))?;
                }
                affected.propagate(&[field.name()], visited)?;
            }
        }
        Ok(())
    }
}

// ------------- Traits -------------
impl PartialEq for RecordSet {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name() && self.members() == other.members()
    }
}

impl fmt::Debug for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ids: Vec<String> = self.ids.iter().map(|id| id.to_string()).collect();
        write!(f, "{}({})", self.name(), ids.join(", "))
    }
}

impl<'a> Add<&'a RecordSet> for &'a RecordSet {
    type Output = Result<RecordSet>;
    fn add(self, other: &'a RecordSet) -> Result<RecordSet> {
        self.union(other)
    }
}
impl<'a> BitOr<&'a RecordSet> for &'a RecordSet {
    type Output = Result<RecordSet>;
    fn bitor(self, other: &'a RecordSet) -> Result<RecordSet> {
        self.union(other)
    }
}
impl<'a> Sub<&'a RecordSet> for &'a RecordSet {
    type Output = Result<RecordSet>;
    fn sub(self, other: &'a RecordSet) -> Result<RecordSet> {
        self.difference(other)
    }
}
impl<'a> BitAnd<&'a RecordSet> for &'a RecordSet {
    type Output = Result<RecordSet>;
    fn bitand(self, other: &'a RecordSet) -> Result<RecordSet> {
        self.intersection(other)
    }
}
