//! Persistence. Record sets talk to a [`Store`], which executes the clauses
//! compiled from domains and moves column values in and out. [`SqliteStore`]
//! is the implementation shipped with the crate.

use std::collections::HashSet;
use std::sync::Mutex;

// used for persistence
use rusqlite::{Connection, params_from_iter};

use tracing::{debug, info, warn};

use crate::domain::Clause;
use crate::error::Result;
use crate::field::{FieldType, OnDelete, Relation};
use crate::registry::Registry;
use crate::schema::{ID, Schema};
use crate::settings::DatabaseSettings;
use crate::value::{RecordId, Value};

// stay well below SQLite's bound parameter limit
pub(crate) const CHUNK: usize = 500;

// ------------- Table definitions -------------
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub sql_type: String,
    pub not_null: bool,
    pub references: Option<(String, OnDelete)>,
    pub indexed: bool,
}

/// A many-to-many junction table, `column1` pointing at `table1` and
/// `column2` at `table2`.
#[derive(Debug, Clone, PartialEq)]
pub struct JunctionSpec {
    pub table: String,
    pub column1: String,
    pub table1: String,
    pub column2: String,
    pub table2: String,
}

/// Everything a store needs to bootstrap the table of one schema.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub junctions: Vec<JunctionSpec>,
}

impl TableSpec {
    pub fn for_schema(schema: &Schema, registry: &Registry) -> Result<TableSpec> {
        let mut columns = Vec::new();
        let mut junctions = Vec::new();
        for field in schema.fields() {
            if field.name() == ID {
                continue;
            }
            if let Some(relation) = field.junction() {
                let comodel = registry.get(field.comodel().unwrap_or_default())?;
                junctions.push(JunctionSpec {
                    table: relation.table.clone(),
                    column1: relation.column1.clone(),
                    table1: schema.table().to_string(),
                    column2: relation.column2.clone(),
                    table2: comodel.table().to_string(),
                });
                continue;
            }
            if !field.is_stored() {
                continue;
            }
            let Some(sql_type) = field.field_type().column_type() else {
                continue;
            };
            let references = match field.field_type() {
                FieldType::Many2one { comodel, ondelete } => {
                    Some((registry.get(comodel)?.table().to_string(), *ondelete))
                }
                _ => None,
            };
            columns.push(ColumnSpec {
                name: field.name().to_string(),
                sql_type,
                // false booleans are persisted as NULL
                not_null: field.is_required()
                    && !matches!(field.field_type(), FieldType::Boolean),
                references,
                indexed: field.is_indexed(),
            });
        }
        Ok(TableSpec {
            table: schema.table().to_string(),
            columns,
            junctions,
        })
    }
}

// ------------- Queries -------------
#[derive(Debug, Clone)]
pub struct Select<'a> {
    pub table: &'a str,
    pub clause: &'a Clause,
    /// rendered `ORDER BY` list
    pub order: Option<String>,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl<'a> Select<'a> {
    pub fn new(table: &'a str, clause: &'a Clause) -> Self {
        Self {
            table,
            clause,
            order: None,
            limit: None,
            offset: 0,
        }
    }
    pub fn to_sql(&self) -> String {
        let mut sql = format!("SELECT {table}.{ID} FROM {table}", table = self.table);
        if !self.clause.is_constant_true() {
            sql += &format!(" WHERE {}", self.clause.sql);
        }
        if let Some(order) = &self.order {
            sql += &format!(" ORDER BY {order}");
        }
        match (self.limit, self.offset) {
            (Some(limit), 0) => sql += &format!(" LIMIT {limit}"),
            (Some(limit), offset) => sql += &format!(" LIMIT {limit} OFFSET {offset}"),
            (None, 0) => (),
            // SQLite needs a LIMIT before OFFSET, -1 means unbounded
            (None, offset) => sql += &format!(" LIMIT -1 OFFSET {offset}"),
        }
        sql
    }
}

/// Junction rows to replace, the targets linked to each owner.
pub type Links = [(Relation, Vec<RecordId>)];

/// A backing store. Every operation either completes or returns an error
/// having changed nothing; callers only touch their caches after an
/// operation has returned `Ok`.
pub trait Store: Send + Sync {
    fn ensure_table(&self, spec: &TableSpec) -> Result<()>;
    fn select(&self, query: &Select) -> Result<Vec<RecordId>>;
    fn count(&self, table: &str, clause: &Clause) -> Result<u64>;
    /// Inserts one row and links it to its targets.
    fn insert(&self, table: &str, values: &[(String, Value)], links: &Links) -> Result<RecordId>;
    /// Assigns the same column values and link targets to every id.
    fn update(
        &self,
        table: &str,
        ids: &[RecordId],
        values: &[(String, Value)],
        links: &Links,
    ) -> Result<usize>;
    fn delete(&self, table: &str, ids: &[RecordId]) -> Result<usize>;
    /// Column values for the given ids, in the order of `columns`. Ids
    /// without a row are left out.
    fn fetch(
        &self,
        table: &str,
        ids: &[RecordId],
        columns: &[&str],
    ) -> Result<Vec<(RecordId, Vec<Value>)>>;
    /// `(owner, target)` pairs of a junction table for the given owners.
    fn links(&self, relation: &Relation, ids: &[RecordId]) -> Result<Vec<(RecordId, RecordId)>>;
}

// ------------- SQLite -------------
pub struct SqliteStore {
    connection: Mutex<Connection>,
    echo: bool,
}

impl SqliteStore {
    pub fn open(settings: &DatabaseSettings) -> Result<SqliteStore> {
        let connection = match &settings.path {
            Some(path) => {
                info!(path = %path, "Opening database");
                Connection::open(path)?
            }
            None => {
                info!("Opening in-memory database");
                Connection::open_in_memory()?
            }
        };
        Self::with_connection(connection, settings.echo)
    }
    pub fn open_in_memory() -> Result<SqliteStore> {
        Self::with_connection(Connection::open_in_memory()?, false)
    }
    fn with_connection(connection: Connection, echo: bool) -> Result<SqliteStore> {
        // like is case sensitive, ilike lowers both sides
        connection.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA case_sensitive_like = ON;
            ",
        )?;
        Ok(SqliteStore {
            connection: Mutex::new(connection),
            echo,
        })
    }

    fn trace(&self, sql: &str, params: usize) {
        if self.echo {
            info!(params, "{sql}");
        } else {
            debug!(params, "{sql}");
        }
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let connection = self.connection.lock()?;
        self.run(&connection, sql, params)
    }

    fn run(&self, connection: &Connection, sql: &str, params: &[Value]) -> Result<usize> {
        self.trace(sql, params.len());
        connection
            .execute(sql, params_from_iter(params.iter()))
            .map_err(|e| {
                warn!(error = %e, "{sql}");
                e.into()
            })
    }

    fn replace_links(
        &self,
        connection: &Connection,
        relation: &Relation,
        id: RecordId,
        targets: &[RecordId],
    ) -> Result<()> {
        let clear = format!(
            "DELETE FROM {} WHERE {} = ?",
            relation.table, relation.column1
        );
        self.run(connection, &clear, &[Value::Integer(id)])?;
        let link = format!(
            "INSERT OR IGNORE INTO {} ({}, {}) VALUES (?, ?)",
            relation.table, relation.column1, relation.column2
        );
        for target in targets {
            self.run(connection, &link, &[Value::Integer(id), Value::Integer(*target)])?;
        }
        Ok(())
    }

    fn query_ids(&self, sql: &str, params: &[Value]) -> Result<Vec<RecordId>> {
        self.trace(sql, params.len());
        let connection = self.connection.lock()?;
        let run = || -> rusqlite::Result<Vec<RecordId>> {
            let mut statement = connection.prepare(sql)?;
            let rows = statement.query_map(params_from_iter(params.iter()), |row| row.get(0))?;
            rows.collect()
        };
        run().map_err(|e| {
            warn!(error = %e, "{sql}");
            e.into()
        })
    }

    fn existing_columns(&self, table: &str) -> Result<HashSet<String>> {
        let connection = self.connection.lock()?;
        let mut statement = connection.prepare(&format!("PRAGMA table_info({table})"))?;
        let names = statement.query_map([], |row| row.get::<_, String>(1))?;
        Ok(names.collect::<rusqlite::Result<HashSet<String>>>()?)
    }
}

fn column_definition(column: &ColumnSpec, new_table: bool) -> String {
    let mut definition = format!("{} {}", column.name, column.sql_type);
    // columns added to an existing table cannot be NOT NULL without a default
    if column.not_null && new_table {
        definition += " NOT NULL";
    }
    if let Some((table, ondelete)) = &column.references {
        definition += &format!(" REFERENCES {table}({ID}) ON DELETE {}", ondelete.sql());
    }
    definition
}

fn id_list(ids: &[RecordId]) -> (String, Vec<Value>) {
    (
        vec!["?"; ids.len()].join(", "),
        ids.iter().map(|id| Value::Integer(*id)).collect(),
    )
}

impl Store for SqliteStore {
    fn ensure_table(&self, spec: &TableSpec) -> Result<()> {
        let existing = self.existing_columns(&spec.table)?;
        if existing.is_empty() {
            let mut definitions = vec![format!("{ID} INTEGER PRIMARY KEY AUTOINCREMENT")];
            definitions.extend(spec.columns.iter().map(|c| column_definition(c, true)));
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                spec.table,
                definitions.join(", ")
            );
            self.execute(&sql, &[])?;
            info!(table = %spec.table, columns = spec.columns.len(), "Created table");
        } else {
            for column in spec.columns.iter().filter(|c| !existing.contains(&c.name)) {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    spec.table,
                    column_definition(column, false)
                );
                self.execute(&sql, &[])?;
                info!(table = %spec.table, column = %column.name, "Added column");
            }
        }
        for column in spec.columns.iter().filter(|c| c.indexed) {
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table} ({column})",
                table = spec.table,
                column = column.name
            );
            self.execute(&sql, &[])?;
        }
        for junction in &spec.junctions {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    {c1} INTEGER NOT NULL REFERENCES {t1}({ID}) ON DELETE CASCADE,
                    {c2} INTEGER NOT NULL REFERENCES {t2}({ID}) ON DELETE CASCADE,
                    PRIMARY KEY ({c1}, {c2})
                )",
                table = junction.table,
                c1 = junction.column1,
                t1 = junction.table1,
                c2 = junction.column2,
                t2 = junction.table2,
            );
            self.execute(&sql, &[])?;
        }
        Ok(())
    }

    fn select(&self, query: &Select) -> Result<Vec<RecordId>> {
        self.query_ids(&query.to_sql(), &query.clause.params)
    }

    fn count(&self, table: &str, clause: &Clause) -> Result<u64> {
        let mut sql = format!("SELECT COUNT(*) FROM {table}");
        if !clause.is_constant_true() {
            sql += &format!(" WHERE {}", clause.sql);
        }
        self.trace(&sql, clause.params.len());
        let connection = self.connection.lock()?;
        let count: i64 = connection
            .query_row(&sql, params_from_iter(clause.params.iter()), |row| row.get(0))
            .map_err(|e| {
                warn!(error = %e, "{sql}");
                e
            })?;
        Ok(count.max(0) as u64)
    }

    fn insert(&self, table: &str, values: &[(String, Value)], links: &Links) -> Result<RecordId> {
        let sql = if values.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES")
        } else {
            let columns: Vec<&str> = values.iter().map(|(column, _)| column.as_str()).collect();
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                vec!["?"; values.len()].join(", ")
            )
        };
        let params: Vec<Value> = values.iter().map(|(_, value)| value.clone()).collect();
        let connection = self.connection.lock()?;
        // the row and its links land together, dropping the transaction rolls back
        let transaction = connection.unchecked_transaction()?;
        self.run(&transaction, &sql, &params)?;
        let id = transaction.last_insert_rowid();
        for (relation, targets) in links {
            self.replace_links(&transaction, relation, id, targets)?;
        }
        transaction.commit()?;
        Ok(id)
    }

    fn update(
        &self,
        table: &str,
        ids: &[RecordId],
        values: &[(String, Value)],
        links: &Links,
    ) -> Result<usize> {
        if ids.is_empty() || (values.is_empty() && links.is_empty()) {
            return Ok(0);
        }
        let assignments: Vec<String> = values
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect();
        let connection = self.connection.lock()?;
        let transaction = connection.unchecked_transaction()?;
        let mut updated = 0;
        if !values.is_empty() {
            for chunk in ids.chunks(CHUNK) {
                let (placeholders, keys) = id_list(chunk);
                let sql = format!(
                    "UPDATE {table} SET {} WHERE {ID} IN ({placeholders})",
                    assignments.join(", ")
                );
                let mut params: Vec<Value> =
                    values.iter().map(|(_, value)| value.clone()).collect();
                params.extend(keys);
                updated += self.run(&transaction, &sql, &params)?;
            }
        }
        for (relation, targets) in links {
            for id in ids {
                self.replace_links(&transaction, relation, *id, targets)?;
            }
        }
        transaction.commit()?;
        Ok(updated)
    }

    fn delete(&self, table: &str, ids: &[RecordId]) -> Result<usize> {
        let mut deleted = 0;
        for chunk in ids.chunks(CHUNK) {
            let (placeholders, keys) = id_list(chunk);
            let sql = format!("DELETE FROM {table} WHERE {ID} IN ({placeholders})");
            deleted += self.execute(&sql, &keys)?;
        }
        Ok(deleted)
    }

    fn fetch(
        &self,
        table: &str,
        ids: &[RecordId],
        columns: &[&str],
    ) -> Result<Vec<(RecordId, Vec<Value>)>> {
        let mut rows = Vec::with_capacity(ids.len());
        let selected: Vec<String> = std::iter::once(ID)
            .chain(columns.iter().copied())
            .map(|column| format!("{table}.{column}"))
            .collect();
        for chunk in ids.chunks(CHUNK) {
            let (placeholders, keys) = id_list(chunk);
            let sql = format!(
                "SELECT {} FROM {table} WHERE {table}.{ID} IN ({placeholders})",
                selected.join(", ")
            );
            self.trace(&sql, keys.len());
            let connection = self.connection.lock()?;
            let run = || -> rusqlite::Result<Vec<(RecordId, Vec<Value>)>> {
                let mut statement = connection.prepare(&sql)?;
                let fetched = statement.query_map(params_from_iter(keys.iter()), |row| {
                    let id: RecordId = row.get(0)?;
                    let mut values = Vec::with_capacity(columns.len());
                    for position in 1..=columns.len() {
                        values.push(Value::from_sql_ref(row.get_ref(position)?));
                    }
                    Ok((id, values))
                })?;
                fetched.collect()
            };
            rows.extend(run().map_err(|e| {
                warn!(error = %e, "{sql}");
                e
            })?);
        }
        Ok(rows)
    }

    fn links(&self, relation: &Relation, ids: &[RecordId]) -> Result<Vec<(RecordId, RecordId)>> {
        let mut pairs = Vec::new();
        for chunk in ids.chunks(CHUNK) {
            let (placeholders, keys) = id_list(chunk);
            let sql = format!(
                "SELECT {c1}, {c2} FROM {table} WHERE {c1} IN ({placeholders}) ORDER BY {c1}, {c2}",
                table = relation.table,
                c1 = relation.column1,
                c2 = relation.column2,
            );
            self.trace(&sql, keys.len());
            let connection = self.connection.lock()?;
            let mut statement = connection.prepare(&sql)?;
            let fetched = statement.query_map(params_from_iter(keys.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            pairs.extend(fetched.collect::<rusqlite::Result<Vec<(RecordId, RecordId)>>>()?);
        }
        Ok(pairs)
    }
}
