use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

// the registry is consulted on every field access, so keep the hashing cheap
use core::hash::BuildHasherDefault;
use seahash::SeaHasher;

use tracing::info;

use crate::error::{OrmError, Result};
use crate::field::FieldType;
use crate::schema::Schema;
use crate::store::{Store, TableSpec};

pub type OtherHasher = BuildHasherDefault<SeaHasher>;

/// A field of a schema, as `(schema name, field name)`.
pub type FieldRef = (String, String);

/// A field whose value follows another one. `via` leads from the dependent
/// field's records to the records holding the field it follows, `None` when
/// both are the same record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    pub schema: String,
    pub field: String,
    pub via: Option<String>,
}

type Triggers = HashMap<FieldRef, Vec<Dependent>, OtherHasher>;

#[derive(Debug, Default)]
struct Kept {
    schemas: HashMap<String, Arc<Schema>, OtherHasher>,
    // bumped by every registration
    generation: u64,
    // built on first use after a registration
    triggers: Option<Arc<Triggers>>,
}

/// Schemas by name. Cloning a registry yields another handle to the same
/// definitions.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    kept: Arc<RwLock<Kept>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps a schema under its name. A later registration under the same
    /// name replaces the earlier one.
    pub fn register(&self, schema: Schema) -> Arc<Schema> {
        let schema = Arc::new(schema);
        let mut kept = match self.kept.write() {
            Ok(kept) => kept,
            Err(poisoned) => poisoned.into_inner(),
        };
        let replaced = kept
            .schemas
            .insert(schema.name().to_string(), Arc::clone(&schema));
        kept.generation += 1;
        kept.triggers = None;
        drop(kept);
        if replaced.is_some() {
            info!("Replaced schema {}", schema);
        } else {
            info!("Registered schema {}", schema);
        }
        schema
    }

    pub fn get(&self, name: &str) -> Result<Arc<Schema>> {
        self.kept
            .read()?
            .schemas
            .get(name)
            .cloned()
            .ok_or_else(|| OrmError::SchemaNotFound(name.to_string()))
    }
    pub fn contains(&self, name: &str) -> bool {
        self.kept.read().map(|kept| kept.schemas.contains_key(name)).unwrap_or(false)
    }
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.kept.read() {
            Ok(kept) => kept.schemas.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
    pub fn len(&self) -> usize {
        self.kept.read().map(|kept| kept.schemas.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn schemas(&self) -> Result<Vec<Arc<Schema>>> {
        let mut schemas: Vec<Arc<Schema>> = self.kept.read()?.schemas.values().cloned().collect();
        schemas.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(schemas)
    }

    /// Creates the tables, indexes and junction tables of every registered
    /// schema that the store does not have yet.
    pub fn install(&self, store: &dyn Store) -> Result<()> {
        for schema in self.schemas()? {
            let spec = TableSpec::for_schema(&schema, self)?;
            store.ensure_table(&spec)?;
        }
        Ok(())
    }

    /// Fields that directly follow `field` of `schema`.
    pub fn direct_dependents(&self, schema: &str, field: &str) -> Result<Vec<Dependent>> {
        let triggers = self.triggers()?;
        Ok(triggers
            .get(&(schema.to_string(), field.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    /// Every field whose value may change when one of `fields` of `schema`
    /// changes, followed transitively. Edges come from `depends` paths, where
    /// each segment of a path is a trigger on the schema it is read from,
    /// and from one-to-many fields, which change with their inverse.
    pub fn dependents(&self, schema: &str, fields: &[&str]) -> Result<Vec<FieldRef>> {
        let triggers = self.triggers()?;
        let mut found: BTreeSet<FieldRef> = BTreeSet::new();
        let mut pending: Vec<FieldRef> = fields
            .iter()
            .map(|field| (schema.to_string(), field.to_string()))
            .collect();
        while let Some(changed) = pending.pop() {
            for dependent in triggers.get(&changed).into_iter().flatten() {
                let target = (dependent.schema.clone(), dependent.field.clone());
                if found.insert(target.clone()) {
                    pending.push(target);
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    /// The dependency edges of every registered schema, kept until the next
    /// registration.
    fn triggers(&self) -> Result<Arc<Triggers>> {
        let (generation, triggers) = {
            let kept = self.kept.read()?;
            if let Some(triggers) = &kept.triggers {
                return Ok(Arc::clone(triggers));
            }
            (kept.generation, Arc::new(build_triggers(&kept.schemas)))
        };
        let mut kept = self.kept.write()?;
        // a registration in between makes this map stale, leave it uncached
        if kept.generation == generation {
            kept.triggers = Some(Arc::clone(&triggers));
        }
        Ok(triggers)
    }
}

fn build_triggers(schemas: &HashMap<String, Arc<Schema>, OtherHasher>) -> Triggers {
    let mut triggers = Triggers::default();
    let mut sorted: Vec<&Arc<Schema>> = schemas.values().collect();
    sorted.sort_by(|a, b| a.name().cmp(b.name()));
    for schema in sorted {
        for field in schema.fields() {
            let dependent = |via: Option<String>| Dependent {
                schema: schema.name().to_string(),
                field: field.name().to_string(),
                via,
            };
            if let FieldType::One2many { comodel, inverse } = field.field_type() {
                triggers
                    .entry((comodel.clone(), inverse.clone()))
                    .or_default()
                    .push(dependent(Some(field.name().to_string())));
            }
            for path in field.depends_on() {
                let mut current = Some(schema);
                let mut walked: Vec<&str> = Vec::new();
                for segment in path.split('.') {
                    let Some(on) = current.take() else { break };
                    let via = (!walked.is_empty()).then(|| walked.join("."));
                    triggers
                        .entry((on.name().to_string(), segment.to_string()))
                        .or_default()
                        .push(dependent(via));
                    walked.push(segment);
                    // comodels that are not registered yet end the walk
                    current = on
                        .field(segment)
                        .ok()
                        .and_then(|f| f.comodel())
                        .and_then(|comodel| schemas.get(comodel));
                }
            }
        }
    }
    triggers
}
