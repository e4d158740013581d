use thiserror::Error;

use crate::value::RecordId;

#[derive(Error, Debug)]
pub enum OrmError {
    #[error("Validation error on field '{field}': {message}")]
    Validation { field: String, message: String },
    #[error("Domain syntax error at position {position}: {message}")]
    DomainSyntax { position: usize, message: String },
    #[error("Field '{field}' not found on schema '{schema}'")]
    FieldNotFound { schema: String, field: String },
    #[error("Schema '{0}' not found in registry")]
    SchemaNotFound(String),
    #[error("Schema mismatch: '{left}' cannot be combined with '{right}'")]
    SchemaMismatch { left: String, right: String },
    #[error("Expected singleton recordset, got {0} records")]
    SingletonExpected(usize),
    #[error("Record {id} of schema '{schema}' does not exist")]
    MissingRecord { schema: String, id: RecordId },
    #[error("Order syntax error: {0}")]
    OrderSyntax(String),
    #[error("Schema definition error: {0}")]
    Definition(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, OrmError>;

impl OrmError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::DomainSyntax {
            position,
            message: message.into(),
        }
    }
    pub fn field_not_found(schema: &str, field: &str) -> Self {
        Self::FieldNotFound {
            schema: schema.to_string(),
            field: field.to_string(),
        }
    }
}

// Helper conversions
impl From<rusqlite::Error> for OrmError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for OrmError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for OrmError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Lock(e.to_string())
    }
}
