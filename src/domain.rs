//! Domains: boolean filters in prefix (Polish) notation.
//!
//! A domain is a sequence of terms. Leaves are `(field, operator, value)`
//! triples; `"&"` and `"|"` consume the next two parsed sub-expressions and
//! `"!"` consumes one. A domain made of several leaves and no operator is an
//! implicit conjunction.
//!
//! ```
//! use openflow_orm::domain;
//! let d = domain![("age", ">", 18), ("active", "=", true)];
//! let normalized = d.normalize();
//! assert_eq!(normalized.len(), 3); // "&" inserted in front
//! let tree = normalized.parse().unwrap();
//! assert_eq!(tree.to_string(), "&(age > 18, active = true)");
//! ```
//!
//! Parsing produces a [`DomainTree`], an arena of nodes addressed by index
//! where every child sits before its parent. Compiling walks that arena once,
//! front to back, and yields a [`Clause`]: SQL text with `?` placeholders and
//! the parameters to bind, in the same left-to-right order.

use std::fmt;
use std::sync::Arc;

use crate::error::{OrmError, Result};
use crate::field::{Field, FieldType};
use crate::registry::Registry;
use crate::schema::{ID, Schema};
use crate::value::Value;

// ------------- Operators -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    And,
    Or,
    Not,
}
impl Logic {
    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol {
            "&" => Some(Logic::And),
            "|" => Some(Logic::Or),
            "!" => Some(Logic::Not),
            _ => None,
        }
    }
    pub fn symbol(&self) -> &'static str {
        match self {
            Logic::And => "&",
            Logic::Or => "|",
            Logic::Not => "!",
        }
    }
    pub fn arity(&self) -> usize {
        match self {
            Logic::Not => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
    Ilike,
    In,
    NotIn,
    ChildOf,
    ParentOf,
}
impl Comparator {
    pub fn parse(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "=" => Comparator::Eq,
            "!=" => Comparator::Ne,
            ">" => Comparator::Gt,
            "<" => Comparator::Lt,
            ">=" => Comparator::Ge,
            "<=" => Comparator::Le,
            "like" => Comparator::Like,
            "ilike" => Comparator::Ilike,
            "in" => Comparator::In,
            "not in" => Comparator::NotIn,
            "child_of" => Comparator::ChildOf,
            "parent_of" => Comparator::ParentOf,
            _ => return None,
        })
    }
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Ne => "!=",
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
            Comparator::Like => "like",
            Comparator::Ilike => "ilike",
            Comparator::In => "in",
            Comparator::NotIn => "not in",
            Comparator::ChildOf => "child_of",
            Comparator::ParentOf => "parent_of",
        }
    }
}

// ------------- Terms -------------
/// One element of a domain as given by the caller. Operators are kept as
/// text until parsing so that unknown ones can be reported with a position.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Operator(String),
    Leaf {
        field: String,
        operator: String,
        value: Value,
    },
}

impl Term {
    pub fn and() -> Self {
        Term::Operator("&".into())
    }
    pub fn or() -> Self {
        Term::Operator("|".into())
    }
    pub fn not() -> Self {
        Term::Operator("!".into())
    }
    pub fn leaf(field: impl Into<String>, operator: impl Into<String>, value: impl Into<Value>) -> Self {
        Term::Leaf {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
        }
    }
    fn is_logic(&self) -> bool {
        matches!(self, Term::Operator(symbol) if Logic::parse(symbol).is_some())
    }
}

impl From<&str> for Term {
    fn from(symbol: &str) -> Self {
        Term::Operator(symbol.to_string())
    }
}

impl<V: Into<Value>> From<(&str, &str, V)> for Term {
    fn from((field, operator, value): (&str, &str, V)) -> Self {
        Term::leaf(field, operator, value)
    }
}

/// Builds a [`Domain`] from operator strings and `(field, operator, value)`
/// tuples.
#[macro_export]
macro_rules! domain {
    () => {
        $crate::domain::Domain::new()
    };
    ($($term:expr),+ $(,)?) => {
        $crate::domain::Domain::from(vec![$($crate::domain::Term::from($term)),+])
    };
}

// ------------- Domain -------------
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Domain {
    terms: Vec<Term>,
}

impl From<Vec<Term>> for Domain {
    fn from(terms: Vec<Term>) -> Self {
        Self { terms }
    }
}

impl Domain {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }
    pub fn len(&self) -> usize {
        self.terms.len()
    }
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
    pub fn push(&mut self, term: impl Into<Term>) {
        self.terms.push(term.into());
    }

    /// Inserts the implicit `&` operators of a domain made only of leaves.
    pub fn normalize(&self) -> Domain {
        let operators = self.terms.iter().filter(|t| t.is_logic()).count();
        let leaves = self
            .terms
            .iter()
            .filter(|t| matches!(t, Term::Leaf { .. }))
            .count();
        if operators == 0 && leaves > 1 {
            let mut terms = vec![Term::and(); leaves - 1];
            terms.extend(self.terms.iter().cloned());
            return Domain { terms };
        }
        self.clone()
    }

    /// Both domains must hold, an empty side is dropped.
    pub fn and(&self, other: &Domain) -> Domain {
        self.combine(Term::and(), other)
    }
    /// Either domain may hold, an empty side matches everything.
    pub fn or(&self, other: &Domain) -> Domain {
        if self.is_empty() || other.is_empty() {
            return Domain::new();
        }
        self.combine(Term::or(), other)
    }
    fn combine(&self, operator: Term, other: &Domain) -> Domain {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other.clone(),
            (_, true) => self.clone(),
            _ => {
                let mut terms = vec![operator];
                terms.extend(self.normalize().terms);
                terms.extend(other.normalize().terms);
                Domain { terms }
            }
        }
    }

    /// Decodes the JSON shape `["&", ["age", ">", 18], ...]`.
    pub fn from_json(json: &serde_json::Value) -> Result<Domain> {
        let items = json
            .as_array()
            .ok_or_else(|| OrmError::syntax(0, "a domain must be a JSON array"))?;
        let mut terms = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            let term = match item {
                serde_json::Value::String(symbol) => Term::Operator(symbol.clone()),
                serde_json::Value::Array(parts) => {
                    if parts.len() != 3 {
                        return Err(OrmError::syntax(
                            position,
                            format!("a leaf needs 3 elements, found {}", parts.len()),
                        ));
                    }
                    let (Some(field), Some(operator)) = (parts[0].as_str(), parts[1].as_str())
                    else {
                        return Err(OrmError::syntax(
                            position,
                            "leaf field and operator must be strings",
                        ));
                    };
                    Term::leaf(field, operator, Value::from_json(&parts[2]))
                }
                other => {
                    return Err(OrmError::syntax(
                        position,
                        format!("invalid domain element {other}"),
                    ));
                }
            };
            terms.push(term);
        }
        Ok(Domain { terms })
    }

    /// Normalizes and parses into an arena tree. Positions in errors refer
    /// to this domain's own terms.
    pub fn parse(&self) -> Result<DomainTree> {
        let normalized = self.normalize();
        let inserted = normalized.len() - self.len();
        let mut nodes: Vec<Node> = Vec::with_capacity(normalized.len() + 1);
        if normalized.is_empty() {
            nodes.push(Node::And(Vec::new()));
            return Ok(DomainTree { nodes, root: 0 });
        }
        // Scanning right to left, every operand is complete before the
        // operator that consumes it, so a stack of pending roots suffices.
        let mut pending: Vec<NodeId> = Vec::new();
        for (position, term) in normalized.terms.iter().enumerate().rev() {
            let position = position.saturating_sub(inserted);
            let node = match term {
                Term::Leaf {
                    field,
                    operator,
                    value,
                } => {
                    let comparator = Comparator::parse(operator).ok_or_else(|| {
                        OrmError::syntax(position, format!("unknown comparison operator '{operator}'"))
                    })?;
                    if field.is_empty() {
                        return Err(OrmError::syntax(position, "leaf has an empty field name"));
                    }
                    Node::Leaf(Condition {
                        field: field.clone(),
                        comparator,
                        value: value.clone(),
                    })
                }
                Term::Operator(symbol) => {
                    let logic = Logic::parse(symbol).ok_or_else(|| {
                        OrmError::syntax(position, format!("unknown operator '{symbol}'"))
                    })?;
                    if pending.len() < logic.arity() {
                        return Err(OrmError::syntax(
                            position,
                            format!(
                                "'{}' expects {} operand(s), found {}",
                                logic.symbol(),
                                logic.arity(),
                                pending.len()
                            ),
                        ));
                    }
                    match logic {
                        Logic::Not => Node::Not(pending.pop().unwrap_or_default()),
                        Logic::And | Logic::Or => {
                            let left = pending.pop().unwrap_or_default();
                            let right = pending.pop().unwrap_or_default();
                            if logic == Logic::And {
                                Node::And(vec![left, right])
                            } else {
                                Node::Or(vec![left, right])
                            }
                        }
                    }
                }
            };
            nodes.push(node);
            pending.push(nodes.len() - 1);
        }
        // leftover top-level expressions are conjoined, leftmost first
        let root = if pending.len() == 1 {
            pending[0]
        } else {
            nodes.push(Node::And(pending.into_iter().rev().collect()));
            nodes.len() - 1
        };
        Ok(DomainTree { nodes, root })
    }

    /// Parses and compiles against a schema in one go.
    pub fn compile(&self, schema: &Arc<Schema>, registry: &Registry) -> Result<Clause> {
        self.parse()?.compile(schema, registry)
    }
}

// ------------- Tree -------------
pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub comparator: Comparator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    And(Vec<NodeId>),
    Or(Vec<NodeId>),
    Not(NodeId),
    Leaf(Condition),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl DomainTree {
    pub fn root(&self) -> NodeId {
        self.root
    }
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.nodes[id] {
            Node::And(children) | Node::Or(children) => children,
            Node::Not(child) => std::slice::from_ref(child),
            Node::Leaf(_) => &[],
        }
    }

    /// Emits the filter clause. Field references are resolved against the
    /// schema (and, for dot paths, the registry) before anything is returned,
    /// so a bad domain never reaches a store.
    pub fn compile(&self, schema: &Arc<Schema>, registry: &Registry) -> Result<Clause> {
        let mut compiled: Vec<Option<Clause>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let clause = match node {
                Node::Leaf(condition) => compile_leaf(schema, registry, condition)?,
                Node::And(children) if children.is_empty() => Clause::constant(true),
                Node::Or(children) if children.is_empty() => Clause::constant(false),
                Node::And(children) => join(&mut compiled, children, " AND ")?,
                Node::Or(children) => join(&mut compiled, children, " OR ")?,
                Node::Not(child) => {
                    let inner = take(&mut compiled, *child)?;
                    Clause {
                        sql: format!("NOT ({})", inner.sql),
                        params: inner.params,
                    }
                }
            };
            compiled.push(Some(clause));
        }
        take(&mut compiled, self.root)
    }
}

fn take(compiled: &mut [Option<Clause>], id: NodeId) -> Result<Clause> {
    compiled
        .get_mut(id)
        .and_then(Option::take)
        .ok_or_else(|| OrmError::syntax(id, "malformed domain tree"))
}

fn join(compiled: &mut [Option<Clause>], children: &[NodeId], separator: &str) -> Result<Clause> {
    let mut parts = Vec::with_capacity(children.len());
    let mut params = Vec::new();
    for &child in children {
        let clause = take(compiled, child)?;
        parts.push(format!("({})", clause.sql));
        params.extend(clause.params);
    }
    Ok(Clause {
        sql: parts.join(separator),
        params,
    })
}

impl fmt::Display for DomainTree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn write_node(tree: &DomainTree, id: NodeId, f: &mut fmt::Formatter) -> fmt::Result {
            match tree.node(id) {
                Node::Leaf(c) => write!(f, "{} {} {}", c.field, c.comparator.symbol(), c.value),
                node => {
                    let symbol = match node {
                        Node::Or(_) => "|",
                        Node::Not(_) => "!",
                        _ => "&",
                    };
                    write!(f, "{symbol}(")?;
                    for (i, child) in tree.children(id).iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write_node(tree, *child, f)?;
                    }
                    write!(f, ")")
                }
            }
        }
        write_node(self, self.root, f)
    }
}

// ------------- Clause -------------
/// A parameterized filter. Bind `params` in order against the `?`
/// placeholders of `sql`.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Clause {
    pub fn constant(matches: bool) -> Self {
        Self {
            sql: if matches { "TRUE".into() } else { "FALSE".into() },
            params: Vec::new(),
        }
    }
    fn new(sql: String, params: Vec<Value>) -> Self {
        Self { sql, params }
    }
    pub fn is_constant_true(&self) -> bool {
        self.sql == "TRUE"
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn compile_leaf(schema: &Arc<Schema>, registry: &Registry, condition: &Condition) -> Result<Clause> {
    if matches!(condition.comparator, Comparator::ChildOf | Comparator::ParentOf) {
        return Err(OrmError::Unsupported(format!(
            "operator '{}' needs hierarchical queries, which this engine does not implement",
            condition.comparator.symbol()
        )));
    }
    // Dot paths descend through reference fields into nested sub-queries.
    let mut parts: Vec<&str> = condition.field.split('.').collect();
    let last = parts.pop().unwrap_or_default();
    let mut current = Arc::clone(schema);
    let mut opening = String::new();
    let mut closing = String::new();
    for part in parts {
        let field = current.field(part)?;
        let Some(comodel) = field.comodel() else {
            return Err(OrmError::Unsupported(format!(
                "'{}.{part}' is not a reference field and cannot be traversed",
                current.name()
            )));
        };
        let comodel = registry.get(comodel)?;
        let table = current.table();
        let target = comodel.table();
        match field.field_type() {
            FieldType::Many2one { .. } => {
                opening += &format!("{table}.{part} IN (SELECT {target}.{ID} FROM {target} WHERE ");
                closing += ")";
            }
            FieldType::One2many { inverse, .. } => {
                opening += &format!("{table}.{ID} IN (SELECT {target}.{inverse} FROM {target} WHERE ");
                closing += ")";
            }
            FieldType::Many2many { .. } => {
                let relation = field.junction().ok_or_else(|| {
                    OrmError::Definition(format!("'{part}' has no junction table"))
                })?;
                opening += &format!(
                    "{table}.{ID} IN (SELECT {rel}.{c1} FROM {rel} WHERE {rel}.{c2} IN (SELECT {target}.{ID} FROM {target} WHERE ",
                    rel = relation.table,
                    c1 = relation.column1,
                    c2 = relation.column2,
                );
                closing += "))";
            }
            other => {
                return Err(OrmError::Unsupported(format!(
                    "cannot traverse a {} field",
                    other.name()
                )));
            }
        }
        current = comodel;
    }
    let field = current.field(last)?;
    let inner = if field.field_type().is_to_many() {
        compile_to_many(&current, registry, field, condition)?
    } else {
        compile_comparison(&current, field, condition)?
    };
    Ok(Clause::new(format!("{opening}{}{closing}", inner.sql), inner.params))
}

fn compile_comparison(schema: &Schema, field: &Field, condition: &Condition) -> Result<Clause> {
    if !field.is_stored() {
        return Err(OrmError::Unsupported(format!(
            "'{}.{}' is not stored and cannot be searched",
            schema.name(),
            field.name()
        )));
    }
    let stored = format!("{}.{}", schema.table(), field.name());
    let value = &condition.value;
    let single = || -> Result<Vec<Value>> {
        if value.as_list().is_some() {
            return Err(OrmError::validation(
                field.name(),
                format!("operator '{}' expects a single value", condition.comparator.symbol()),
            ));
        }
        Ok(vec![field.convert_to_search(value)])
    };
    if value.is_null_equivalent() {
        match condition.comparator {
            Comparator::Eq => return Ok(Clause::new(format!("{stored} IS NULL"), vec![])),
            Comparator::Ne => return Ok(Clause::new(format!("{stored} IS NOT NULL"), vec![])),
            _ => (),
        }
    }
    // false booleans are persisted as NULL
    let column = match field.field_type() {
        FieldType::Boolean => format!("COALESCE({stored}, 0)"),
        _ => stored,
    };
    Ok(match condition.comparator {
        Comparator::Eq => Clause::new(format!("{column} = ?"), single()?),
        Comparator::Ne => Clause::new(format!("{column} != ?"), single()?),
        Comparator::Gt => Clause::new(format!("{column} > ?"), single()?),
        Comparator::Lt => Clause::new(format!("{column} < ?"), single()?),
        Comparator::Ge => Clause::new(format!("{column} >= ?"), single()?),
        Comparator::Le => Clause::new(format!("{column} <= ?"), single()?),
        Comparator::Like => Clause::new(format!("{column} LIKE ?"), single()?),
        Comparator::Ilike => Clause::new(format!("LOWER({column}) LIKE LOWER(?)"), single()?),
        Comparator::In | Comparator::NotIn => {
            let items: Vec<Value> = match value {
                Value::List(items) => items.clone(),
                Value::Null => Vec::new(),
                other => vec![other.clone()],
            };
            let negated = condition.comparator == Comparator::NotIn;
            if items.is_empty() {
                return Ok(Clause::constant(negated));
            }
            let keyword = if negated { "NOT IN" } else { "IN" };
            Clause::new(
                format!("{column} {keyword} ({})", placeholders(items.len())),
                items.iter().map(|item| field.convert_to_search(item)).collect(),
            )
        }
        Comparator::ChildOf | Comparator::ParentOf => {
            return Err(OrmError::Unsupported(format!(
                "operator '{}'",
                condition.comparator.symbol()
            )));
        }
    })
}

/// Leaves on one2many/many2many fields test the ids of linked records.
fn compile_to_many(
    schema: &Schema,
    registry: &Registry,
    field: &Field,
    condition: &Condition,
) -> Result<Clause> {
    let table = schema.table();
    let (links, target) = match field.field_type() {
        FieldType::One2many { comodel, inverse } => {
            let co = registry.get(comodel)?;
            let co_table = co.table();
            (
                format!("SELECT {co_table}.{inverse} FROM {co_table} WHERE {co_table}.{inverse} IS NOT NULL"),
                format!("{co_table}.{ID}"),
            )
        }
        _ => {
            let relation = field
                .junction()
                .ok_or_else(|| OrmError::Definition(format!("'{}' has no junction table", field.name())))?;
            (
                format!(
                    "SELECT {rel}.{c1} FROM {rel} WHERE {rel}.{c1} IS NOT NULL",
                    rel = relation.table,
                    c1 = relation.column1
                ),
                format!("{}.{}", relation.table, relation.column2),
            )
        }
    };
    let value = &condition.value;
    let (negated, ids) = match condition.comparator {
        Comparator::Eq if value.is_null_equivalent() => {
            return Ok(Clause::new(format!("{table}.{ID} NOT IN ({links})"), vec![]));
        }
        Comparator::Ne if value.is_null_equivalent() => {
            return Ok(Clause::new(format!("{table}.{ID} IN ({links})"), vec![]));
        }
        Comparator::Eq | Comparator::In => (false, value.as_ids()),
        Comparator::Ne | Comparator::NotIn => (true, value.as_ids()),
        other => {
            return Err(OrmError::Unsupported(format!(
                "operator '{}' on to-many field '{}'",
                other.symbol(),
                field.name()
            )));
        }
    };
    let ids = ids.ok_or_else(|| {
        OrmError::validation(field.name(), "to-many comparisons expect record ids")
    })?;
    if ids.is_empty() {
        return Ok(Clause::constant(negated));
    }
    let keyword = if negated { "NOT IN" } else { "IN" };
    Ok(Clause::new(
        format!(
            "{table}.{ID} {keyword} ({links} AND {target} IN ({}))",
            placeholders(ids.len())
        ),
        ids.into_iter().map(Value::Integer).collect(),
    ))
}
