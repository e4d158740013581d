//! Field descriptors.
//!
//! A [`Field`] is declared once, when its schema is defined, and is shared by
//! every record of that schema afterwards. Descriptors are built with a small
//! builder API:
//!
//! ```
//! use openflow_orm::field::Field;
//! let name = Field::char("name").size(64).required();
//! let partner = Field::many2one("partner_id", "res.partner");
//! assert!(name.is_required());
//! assert_eq!(partner.comodel(), Some("res.partner"));
//! ```
//!
//! How a field is read is decided by [`Field::access`], which folds the
//! declaration into one of four kinds: stored, computed, related, reference.

use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};

use crate::environment::Environment;
use crate::error::{OrmError, Result};
use crate::recordset::RecordSet;
use crate::value::{DATE_FORMAT, DATETIME_FORMAT, Value};

/// Produces the value of a derived field for a singleton recordset.
pub type ComputeFn = Arc<dyn Fn(&RecordSet) -> Result<Value> + Send + Sync>;
/// Produces a default value from the environment a record is created in.
pub type DefaultFn = Arc<dyn Fn(&Environment) -> Value + Send + Sync>;

pub const DEFAULT_CHAR_SIZE: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    SetNull,
    Restrict,
    Cascade,
}
impl OnDelete {
    pub fn sql(&self) -> &'static str {
        match self {
            OnDelete::SetNull => "SET NULL",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::Cascade => "CASCADE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Char { size: usize },
    Text,
    Integer,
    Float { digits: Option<(u32, u32)> },
    Boolean,
    Date,
    DateTime,
    Binary,
    Selection(Vec<(String, String)>),
    Many2one { comodel: String, ondelete: OnDelete },
    One2many { comodel: String, inverse: String },
    Many2many {
        comodel: String,
        relation: Option<String>,
        column1: Option<String>,
        column2: Option<String>,
    },
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Char { .. } => "char",
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Float { .. } => "float",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Binary => "binary",
            FieldType::Selection(_) => "selection",
            FieldType::Many2one { .. } => "many2one",
            FieldType::One2many { .. } => "one2many",
            FieldType::Many2many { .. } => "many2many",
        }
    }
    /// Column type used when bootstrapping a table, `None` for the to-many
    /// kinds which have no column of their own.
    pub fn column_type(&self) -> Option<String> {
        match self {
            FieldType::Char { size } => Some(format!("VARCHAR({size})")),
            FieldType::Text => Some("TEXT".into()),
            FieldType::Integer | FieldType::Many2one { .. } => Some("INTEGER".into()),
            FieldType::Float { .. } => Some("REAL".into()),
            FieldType::Boolean => Some("BOOLEAN".into()),
            FieldType::Date => Some("DATE".into()),
            FieldType::DateTime => Some("TIMESTAMP".into()),
            FieldType::Binary => Some("BLOB".into()),
            FieldType::Selection(_) => Some("VARCHAR(255)".into()),
            FieldType::One2many { .. } | FieldType::Many2many { .. } => None,
        }
    }
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            FieldType::Many2one { .. } | FieldType::One2many { .. } | FieldType::Many2many { .. }
        )
    }
    pub fn is_to_many(&self) -> bool {
        matches!(self, FieldType::One2many { .. } | FieldType::Many2many { .. })
    }
}

#[derive(Clone)]
pub enum DefaultValue {
    Static(Value),
    Function(DefaultFn),
}

/// Junction table backing a many-to-many field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub table: String,
    /// column referencing the owning schema
    pub column1: String,
    /// column referencing the comodel
    pub column2: String,
}

/// The four ways a field value is obtained.
pub enum Access<'a> {
    Stored,
    Computed(&'a ComputeFn),
    Related(&'a str),
    Reference(Reference<'a>),
}

pub enum Reference<'a> {
    /// many-to-one, the column holds the target id
    One { comodel: &'a str },
    /// one-to-many, targets are found through their inverse many-to-one
    Inverse { comodel: &'a str, inverse: &'a str },
    /// many-to-many through a junction table
    Many { comodel: &'a str, relation: &'a Relation },
}

/// Derives a table name from a schema name.
pub fn table_name_for(schema_name: &str) -> String {
    schema_name.replace('.', "_")
}

#[derive(Clone)]
pub struct Field {
    name: String,
    field_type: FieldType,
    string: String,
    help: String,
    required: bool,
    readonly: bool,
    store: Option<bool>,
    index: bool,
    copy: Option<bool>,
    default: Option<DefaultValue>,
    compute: Option<ComputeFn>,
    depends: Vec<String>,
    related: Option<String>,
    relation: Option<Relation>,
}

impl Field {
    pub fn define(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            string: String::new(),
            help: String::new(),
            required: false,
            readonly: false,
            store: None,
            index: false,
            copy: None,
            default: None,
            compute: None,
            depends: Vec::new(),
            related: None,
            relation: None,
        }
    }
    pub fn char(name: impl Into<String>) -> Self {
        Self::define(name, FieldType::Char { size: DEFAULT_CHAR_SIZE })
    }
    pub fn text(name: impl Into<String>) -> Self {
        Self::define(name, FieldType::Text)
    }
    pub fn integer(name: impl Into<String>) -> Self {
        Self::define(name, FieldType::Integer)
    }
    pub fn float(name: impl Into<String>) -> Self {
        Self::define(name, FieldType::Float { digits: None })
    }
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::define(name, FieldType::Boolean)
    }
    pub fn date(name: impl Into<String>) -> Self {
        Self::define(name, FieldType::Date)
    }
    pub fn datetime(name: impl Into<String>) -> Self {
        Self::define(name, FieldType::DateTime)
    }
    pub fn binary(name: impl Into<String>) -> Self {
        Self::define(name, FieldType::Binary)
    }
    pub fn selection(name: impl Into<String>, choices: &[(&str, &str)]) -> Self {
        let choices = choices
            .iter()
            .map(|(key, label)| (key.to_string(), label.to_string()))
            .collect();
        Self::define(name, FieldType::Selection(choices))
    }
    pub fn many2one(name: impl Into<String>, comodel: impl Into<String>) -> Self {
        Self::define(
            name,
            FieldType::Many2one {
                comodel: comodel.into(),
                ondelete: OnDelete::SetNull,
            },
        )
    }
    pub fn one2many(
        name: impl Into<String>,
        comodel: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        Self::define(
            name,
            FieldType::One2many {
                comodel: comodel.into(),
                inverse: inverse.into(),
            },
        )
    }
    pub fn many2many(name: impl Into<String>, comodel: impl Into<String>) -> Self {
        Self::define(
            name,
            FieldType::Many2many {
                comodel: comodel.into(),
                relation: None,
                column1: None,
                column2: None,
            },
        )
    }

    // ------------- Modifiers -------------
    pub fn string(mut self, label: impl Into<String>) -> Self {
        self.string = label.into();
        self
    }
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
    pub fn stored(mut self, store: bool) -> Self {
        self.store = Some(store);
        self
    }
    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }
    pub fn no_copy(mut self) -> Self {
        self.copy = Some(false);
        self
    }
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Static(value.into()));
        self
    }
    pub fn default_fn<F>(mut self, function: F) -> Self
    where
        F: Fn(&Environment) -> Value + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Function(Arc::new(function)));
        self
    }
    /// Makes the field derived. It is not stored unless `stored(true)` is
    /// also given, in which case `depends` must not be empty.
    pub fn compute<F>(mut self, function: F) -> Self
    where
        F: Fn(&RecordSet) -> Result<Value> + Send + Sync + 'static,
    {
        self.compute = Some(Arc::new(function));
        self
    }
    pub fn depends(mut self, fields: &[&str]) -> Self {
        self.depends = fields.iter().map(|f| f.to_string()).collect();
        self
    }
    /// Derives the value by walking a dot path of reference fields,
    /// e.g. `partner_id.country_id.name`.
    pub fn related(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.depends = vec![path.clone()];
        self.related = Some(path);
        self
    }
    pub fn size(mut self, size: usize) -> Self {
        if let FieldType::Char { size: s } = &mut self.field_type {
            *s = size;
        }
        self
    }
    pub fn digits(mut self, precision: u32, scale: u32) -> Self {
        if let FieldType::Float { digits } = &mut self.field_type {
            *digits = Some((precision, scale));
        }
        self
    }
    pub fn ondelete(mut self, action: OnDelete) -> Self {
        if let FieldType::Many2one { ondelete, .. } = &mut self.field_type {
            *ondelete = action;
        }
        self
    }
    pub fn relation(
        mut self,
        table: impl Into<String>,
        column1: impl Into<String>,
        column2: impl Into<String>,
    ) -> Self {
        if let FieldType::Many2many {
            relation,
            column1: c1,
            column2: c2,
            ..
        } = &mut self.field_type
        {
            *relation = Some(table.into());
            *c1 = Some(column1.into());
            *c2 = Some(column2.into());
        }
        self
    }

    // ------------- Accessors -------------
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }
    pub fn label(&self) -> &str {
        if self.string.is_empty() { &self.name } else { &self.string }
    }
    pub fn help_text(&self) -> &str {
        &self.help
    }
    pub fn is_required(&self) -> bool {
        self.required
    }
    /// Related and computed fields without storage cannot be assigned.
    pub fn is_readonly(&self) -> bool {
        self.readonly || self.related.is_some() || self.compute.is_some()
    }
    pub fn is_indexed(&self) -> bool {
        self.index
    }
    pub fn is_computed(&self) -> bool {
        self.compute.is_some() || self.related.is_some()
    }
    /// Whether the field has a column in its schema's table.
    pub fn is_stored(&self) -> bool {
        if self.field_type.is_to_many() || self.related.is_some() {
            return false;
        }
        self.store.unwrap_or(self.compute.is_none())
    }
    pub fn is_copied(&self) -> bool {
        self.copy
            .unwrap_or(!matches!(self.field_type, FieldType::One2many { .. }) && !self.is_computed())
    }
    pub fn depends_on(&self) -> &[String] {
        &self.depends
    }
    pub fn related_path(&self) -> Option<&str> {
        self.related.as_deref()
    }
    pub fn comodel(&self) -> Option<&str> {
        match &self.field_type {
            FieldType::Many2one { comodel, .. }
            | FieldType::One2many { comodel, .. }
            | FieldType::Many2many { comodel, .. } => Some(comodel),
            _ => None,
        }
    }
    pub fn junction(&self) -> Option<&Relation> {
        self.relation.as_ref()
    }

    pub fn access(&self) -> Access<'_> {
        if let Some(path) = &self.related {
            return Access::Related(path);
        }
        if let Some(compute) = &self.compute {
            return Access::Computed(compute);
        }
        match &self.field_type {
            FieldType::Many2one { comodel, .. } => Access::Reference(Reference::One { comodel }),
            FieldType::One2many { comodel, inverse } => {
                Access::Reference(Reference::Inverse { comodel, inverse })
            }
            FieldType::Many2many { comodel, .. } => match &self.relation {
                Some(relation) => Access::Reference(Reference::Many { comodel, relation }),
                // unresolved junctions are rejected when the schema is built
                None => Access::Stored,
            },
            _ => Access::Stored,
        }
    }

    /// Declaration-time checks, run when the owning schema is built.
    pub(crate) fn check(&self) -> Result<()> {
        if self.compute.is_some() && self.related.is_none() {
            if self.store == Some(true) && self.depends.is_empty() {
                return Err(OrmError::Definition(format!(
                    "stored computed field '{}' must declare depends",
                    self.name
                )));
            }
        }
        if self.related.is_some() && self.store == Some(true) {
            return Err(OrmError::Definition(format!(
                "related field '{}' cannot be stored",
                self.name
            )));
        }
        if let FieldType::Selection(choices) = &self.field_type {
            if choices.is_empty() {
                return Err(OrmError::Definition(format!(
                    "selection field '{}' declares no choices",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Fills in the junction table of a many-to-many field from its owner's
    /// table.
    pub(crate) fn resolve_relation(&mut self, owner_table: &str) -> Result<()> {
        if let FieldType::Many2many {
            comodel,
            relation,
            column1,
            column2,
        } = &self.field_type
        {
            let comodel_table = table_name_for(comodel);
            let table = relation.clone().unwrap_or_else(|| {
                let (first, second) = if owner_table <= comodel_table.as_str() {
                    (owner_table, comodel_table.as_str())
                } else {
                    (comodel_table.as_str(), owner_table)
                };
                format!("{first}_{second}_rel")
            });
            let column1 = column1.clone().unwrap_or_else(|| format!("{owner_table}_id"));
            let column2 = column2.clone().unwrap_or_else(|| format!("{comodel_table}_id"));
            if column1 == column2 {
                return Err(OrmError::Definition(format!(
                    "many2many field '{}' needs explicit relation columns",
                    self.name
                )));
            }
            self.relation = Some(Relation {
                table,
                column1,
                column2,
            });
        }
        Ok(())
    }

    // ------------- Values -------------
    pub fn type_default(&self) -> Value {
        match &self.field_type {
            FieldType::Char { .. } | FieldType::Text => Value::Text(String::new()),
            FieldType::Integer => Value::Integer(0),
            FieldType::Float { .. } => Value::Float(0.0),
            FieldType::Boolean => Value::Bool(false),
            FieldType::One2many { .. } | FieldType::Many2many { .. } => Value::List(Vec::new()),
            _ => Value::Null,
        }
    }

    /// The declared default, falling back to the type default for optional
    /// fields. Required fields without a declared default get null.
    pub fn get_default(&self, env: &Environment) -> Value {
        match &self.default {
            Some(DefaultValue::Static(value)) => value.clone(),
            Some(DefaultValue::Function(function)) => function(env),
            None if self.required => Value::Null,
            None => self.type_default(),
        }
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if self.required {
                return Err(OrmError::validation(&self.name, "field is required"));
            }
            return Ok(());
        }
        let mismatch = || {
            OrmError::validation(
                &self.name,
                format!(
                    "expected a {} value, got {}",
                    self.field_type.name(),
                    value.type_name()
                ),
            )
        };
        match (&self.field_type, value) {
            (FieldType::Char { size }, Value::Text(s)) => {
                if s.chars().count() > *size {
                    return Err(OrmError::validation(
                        &self.name,
                        format!("value exceeds maximum size of {size}"),
                    ));
                }
            }
            (FieldType::Text, Value::Text(_)) => (),
            (FieldType::Integer, Value::Integer(_)) => (),
            (FieldType::Float { .. }, Value::Float(_) | Value::Integer(_)) => (),
            (FieldType::Boolean, Value::Bool(_)) => (),
            (FieldType::Date, Value::Date(_)) => (),
            (FieldType::Date, Value::Text(s)) => {
                parse_date(s).ok_or_else(|| {
                    OrmError::validation(&self.name, format!("cannot parse date '{s}'"))
                })?;
            }
            (FieldType::DateTime, Value::DateTime(_)) => (),
            (FieldType::DateTime, Value::Text(s)) => {
                parse_datetime(s).ok_or_else(|| {
                    OrmError::validation(&self.name, format!("cannot parse datetime '{s}'"))
                })?;
            }
            (FieldType::Binary, Value::Binary(_) | Value::Text(_)) => (),
            (FieldType::Selection(choices), Value::Text(key)) => {
                if !choices.iter().any(|(k, _)| k == key) {
                    return Err(OrmError::validation(
                        &self.name,
                        format!("'{key}' is not a valid selection"),
                    ));
                }
            }
            (FieldType::Many2one { .. }, Value::Integer(_)) => (),
            (FieldType::One2many { .. } | FieldType::Many2many { .. }, value) => {
                if value.as_ids().is_none() {
                    return Err(mismatch());
                }
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    /// Validates and normalizes a value on its way into the store or cache.
    pub fn convert_to_cache(&self, value: Value) -> Result<Value> {
        self.validate(&value)?;
        Ok(match (&self.field_type, value) {
            (FieldType::Float { .. }, Value::Integer(i)) => Value::Float(i as f64),
            (FieldType::Date, Value::Text(s)) => parse_date(&s).map_or(Value::Null, Value::Date),
            (FieldType::DateTime, Value::Text(s)) => {
                parse_datetime(&s).map_or(Value::Null, Value::DateTime)
            }
            (FieldType::Binary, Value::Text(s)) => Value::Binary(s.into_bytes()),
            (FieldType::Boolean, Value::Null) => Value::Bool(false),
            (FieldType::One2many { .. } | FieldType::Many2many { .. }, value) => {
                let ids = value.as_ids().unwrap_or_default();
                Value::List(ids.into_iter().map(Value::Integer).collect())
            }
            (_, value) => value,
        })
    }

    /// Boolean false is persisted as NULL so that `= False` domains, which
    /// compile to `IS NULL`, match it.
    pub fn convert_to_store(&self, value: &Value) -> Value {
        match (&self.field_type, value) {
            (FieldType::Boolean, Value::Bool(false)) => Value::Null,
            (_, value) => value.clone(),
        }
    }

    /// Operand of a domain comparison. Booleans are compared against
    /// `COALESCE(column, 0)`, so false is bound as 0 rather than NULL.
    pub fn convert_to_search(&self, value: &Value) -> Value {
        match (&self.field_type, value.as_bool()) {
            (FieldType::Boolean, Some(flag)) => Value::Bool(flag),
            _ => self.convert_to_store(value),
        }
    }

    pub fn convert_from_store(&self, raw: Value) -> Value {
        match (&self.field_type, raw) {
            (FieldType::Boolean, Value::Null) => Value::Bool(false),
            (FieldType::Boolean, Value::Integer(i)) => Value::Bool(i != 0),
            (FieldType::Float { .. }, Value::Integer(i)) => Value::Float(i as f64),
            (FieldType::Date, Value::Text(s)) => parse_date(&s).map_or(Value::Null, Value::Date),
            (FieldType::DateTime, Value::Text(s)) => {
                parse_datetime(&s).map_or(Value::Null, Value::DateTime)
            }
            (_, raw) => raw,
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("type", &self.field_type)
            .field("required", &self.required)
            .field("readonly", &self.readonly)
            .field("stored", &self.is_stored())
            .field("computed", &self.is_computed())
            .field("depends", &self.depends)
            .finish()
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", DATETIME_FORMAT]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
}
