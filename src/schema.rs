use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// used to vet names that end up inside SQL text
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{OrmError, Result};
use crate::field::{Field, table_name_for};
use crate::registry::{OtherHasher, Registry};

lazy_static! {
    static ref SCHEMA_NAME: Regex = Regex::new(r"^[a-z_][a-z0-9_]*(\.[a-z0-9_]+)*$").unwrap();
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

pub const ID: &str = "id";

/// Whether a name can be spliced into SQL text as a table or column name.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

// ------------- Schema -------------
#[derive(Debug)]
pub struct Schema {
    name: String,
    description: String,
    table: String,
    order: String,
    rec_name: String,
    inherits: Vec<String>,
    fields: Vec<Arc<Field>>,
    index: HashMap<String, usize, OtherHasher>,
}

impl Schema {
    // Schemas are only constructed through a SchemaBuilder, after which
    // they are immutable and shared behind an Arc.
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn table(&self) -> &str {
        &self.table
    }
    pub fn order(&self) -> &str {
        &self.order
    }
    pub fn rec_name(&self) -> &str {
        &self.rec_name
    }
    pub fn inherits(&self) -> &[String] {
        &self.inherits
    }
    pub fn fields(&self) -> impl Iterator<Item = &Arc<Field>> {
        self.fields.iter()
    }
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name()).collect()
    }
    pub fn has_field(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }
    pub fn field(&self, name: &str) -> Result<&Arc<Field>> {
        self.index
            .get(name)
            .map(|&position| &self.fields[position])
            .ok_or_else(|| OrmError::field_not_found(&self.name, name))
    }
    /// Fields with a column in this schema's table, `id` first.
    pub fn stored_fields(&self) -> impl Iterator<Item = &Arc<Field>> {
        self.fields.iter().filter(|f| f.is_stored())
    }
    /// The field used as a record's display label, if the schema has one.
    pub fn display_field(&self) -> Option<&Arc<Field>> {
        self.field(&self.rec_name).ok()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({} fields, table {})", self.name, self.fields.len(), self.table)
    }
}

// ------------- SchemaBuilder -------------
#[derive(Debug)]
pub struct SchemaBuilder {
    name: String,
    description: Option<String>,
    table: Option<String>,
    order: Option<String>,
    rec_name: Option<String>,
    inherits: Vec<String>,
    fields: Vec<Field>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            table: None,
            order: None,
            rec_name: None,
            inherits: Vec::new(),
            fields: Vec::new(),
        }
    }
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }
    pub fn rec_name(mut self, rec_name: impl Into<String>) -> Self {
        self.rec_name = Some(rec_name.into());
        self
    }
    /// Inherits the fields of an already registered schema. Inheriting the
    /// schema's own name extends the existing definition.
    pub fn inherit(mut self, parent: impl Into<String>) -> Self {
        self.inherits.push(parent.into());
        self
    }
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Resolves inheritance against the registry and validates the result.
    pub fn build(self, registry: &Registry) -> Result<Schema> {
        if !SCHEMA_NAME.is_match(&self.name) {
            return Err(OrmError::Definition(format!(
                "'{}' is not a valid schema name",
                self.name
            )));
        }
        let mut parents = Vec::new();
        for parent in &self.inherits {
            parents.push(registry.get(parent)?);
        }
        // metadata falls back to the first parent, then to derived values
        let base = parents.first();
        let extends = self.inherits.contains(&self.name);
        let table = match (self.table, base) {
            (Some(table), _) => table,
            (None, Some(parent)) if extends => parent.table().to_string(),
            (None, _) => table_name_for(&self.name),
        };
        if !is_identifier(&table) {
            return Err(OrmError::Definition(format!("'{table}' is not a valid table name")));
        }
        let order = self
            .order
            .or_else(|| base.map(|p| p.order().to_string()))
            .unwrap_or_else(|| ID.to_string());
        let rec_name = self
            .rec_name
            .or_else(|| base.map(|p| p.rec_name().to_string()))
            .unwrap_or_else(|| "name".to_string());
        let description = self
            .description
            .or_else(|| base.map(|p| p.description().to_string()))
            .unwrap_or_default();

        // least specific first, later declarations override by name in place
        let mut fields: Vec<Field> = Vec::new();
        let declared = parents
            .iter()
            .flat_map(|p| p.fields().map(|f| f.as_ref().clone()))
            .chain(self.fields);
        for field in declared {
            match fields.iter().position(|f| f.name() == field.name()) {
                Some(position) => fields[position] = field,
                None => fields.push(field),
            }
        }
        if !fields.iter().any(|f| f.name() == ID) {
            fields.insert(0, Field::integer(ID).string("ID").required().readonly());
        }

        for field in &fields {
            for path in field.depends_on() {
                let first = path.split('.').next().unwrap_or_default();
                if !fields.iter().any(|f| f.name() == first) {
                    return Err(OrmError::Definition(format!(
                        "'{}.{}' depends on unknown field '{path}'",
                        self.name,
                        field.name()
                    )));
                }
            }
        }

        let mut index = HashMap::default();
        let mut kept = Vec::with_capacity(fields.len());
        for mut field in fields {
            if !is_identifier(field.name()) {
                return Err(OrmError::Definition(format!(
                    "'{}' is not a valid field name on '{}'",
                    field.name(),
                    self.name
                )));
            }
            field.check()?;
            field.resolve_relation(&table)?;
            index.insert(field.name().to_string(), kept.len());
            kept.push(Arc::new(field));
        }
        Ok(Schema {
            name: self.name,
            description,
            table,
            order,
            rec_name,
            inherits: self.inherits,
            fields: kept,
            index,
        })
    }

    /// Builds the schema and stores it in the registry, replacing any
    /// previous definition under the same name.
    pub fn register(self, registry: &Registry) -> Result<Arc<Schema>> {
        let schema = self.build(registry)?;
        Ok(registry.register(schema))
    }
}
