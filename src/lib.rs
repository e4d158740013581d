//! Openflow ORM – typed record schemas over a tabular store.
//!
//! Application code declares schemas made of [`field::Field`] descriptors,
//! registers them in a [`registry::Registry`] and works with the records
//! through [`recordset::RecordSet`]s handed out by an
//! [`environment::Environment`]:
//! * A [`schema::Schema`] is a named, ordered set of fields plus its table,
//!   default order and display field. Every schema carries an `id`.
//! * A [`domain::Domain`] is a filter in prefix notation, e.g.
//!   `["|", ("age", ">", 65), ("vip", "=", true)]`. Domains are parsed into an
//!   arena tree and compiled to a parameterized SQL clause.
//! * A [`recordset::RecordSet`] is an ordered, duplicate-free list of ids of
//!   one schema. It supports set algebra, indexing, filtering, sorting and
//!   mapping, and dispatches create, read, write and unlink to the store.
//! * The [`environment::Environment`] binds a store, an acting principal and
//!   a context mapping, and caches field values for one unit of work.
//!
//! ## Modules
//! * [`value`] – the [`value::Value`] union flowing between records, cache and store.
//! * [`field`] – field descriptors, defaults, validation and compute functions.
//! * [`schema`] – schema definitions and inheritance.
//! * [`domain`] – normalization, parsing and compilation of domains.
//! * [`order`] – order clauses, parsed with the grammar in `order.pest`.
//! * [`store`] – the [`store::Store`] trait and its SQLite implementation.
//! * [`registry`] – schemas by name, and the dependency graph of derived fields.
//! * [`environment`] – the unit-of-work context and its value cache.
//! * [`recordset`] – record sets and the `values!` macro.
//! * [`settings`] – configuration loading and logging bootstrap.
//!
//! ## Derived fields
//! A computed field is a function of a singleton record set. Unstored ones
//! are computed on first read and cached. Stored ones must declare the fields
//! they `depends` on and are recomputed and persisted whenever one of those
//! is written. By default a write clears the environment's whole cache; with
//! [`environment::Invalidation::Precise`] only the written fields and their
//! dependents are dropped.
//!
//! ## Quick Start
//! ```
//! use std::sync::Arc;
//! use openflow_orm::{domain, values};
//! use openflow_orm::environment::Environment;
//! use openflow_orm::field::Field;
//! use openflow_orm::registry::Registry;
//! use openflow_orm::schema::SchemaBuilder;
//! use openflow_orm::store::SqliteStore;
//!
//! let registry = Registry::new();
//! SchemaBuilder::new("res.partner")
//!     .field(Field::char("name").required())
//!     .field(Field::integer("age"))
//!     .register(&registry)?;
//! let store = SqliteStore::open_in_memory()?;
//! registry.install(&store)?;
//! let env = Environment::new(registry, Arc::new(store));
//!
//! let partners = env.model("res.partner")?;
//! partners.create(values! { "name" => "Ada", "age" => 36 })?;
//! partners.create(values! { "name" => "Bob", "age" => 12 })?;
//! let adults = partners.search(&domain![("age", ">=", 18)])?;
//! assert_eq!(adults.len(), 1);
//! assert_eq!(adults.value("name")?.as_str(), Some("Ada"));
//! # Ok::<(), openflow_orm::OrmError>(())
//! ```

pub mod domain;
pub mod environment;
pub mod error;
pub mod field;
pub mod order;
pub mod recordset;
pub mod registry;
pub mod schema;
pub mod settings;
pub mod store;
pub mod value;

pub use error::{OrmError, Result};
