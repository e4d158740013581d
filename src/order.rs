//! Order clauses such as `"date desc, id"`, parsed with a small pest grammar
//! (`order.pest`) and checked against a schema before they reach the store.

use pest::Parser;
use pest_derive::Parser;

use crate::error::{OrmError, Result};
use crate::schema::Schema;

#[derive(Parser)]
#[grammar = "order.pest"]
struct OrderParser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub field: String,
    pub descending: bool,
}

pub fn parse_order(text: &str) -> Result<Vec<OrderTerm>> {
    let mut pairs = OrderParser::parse(Rule::order, text)
        .map_err(|e| OrmError::OrderSyntax(format!("'{text}': {e}")))?;
    let order = pairs
        .next()
        .ok_or_else(|| OrmError::OrderSyntax(format!("'{text}': empty order")))?;
    let mut terms = Vec::new();
    for term in order.into_inner() {
        if term.as_rule() != Rule::term {
            continue; // EOI
        }
        let mut field = String::new();
        let mut descending = false;
        for part in term.into_inner() {
            match part.as_rule() {
                Rule::identifier => field = part.as_str().to_string(),
                Rule::direction => descending = part.as_str().eq_ignore_ascii_case("desc"),
                _ => (),
            }
        }
        terms.push(OrderTerm { field, descending });
    }
    Ok(terms)
}

/// Renders an order clause as SQL for the schema's table. Every term must
/// name a stored field.
pub fn order_by_sql(schema: &Schema, text: &str) -> Result<String> {
    let mut rendered = Vec::new();
    for term in parse_order(text)? {
        let field = schema.field(&term.field)?;
        if !field.is_stored() {
            return Err(OrmError::OrderSyntax(format!(
                "cannot order '{}' by non-stored field '{}'",
                schema.name(),
                term.field
            )));
        }
        rendered.push(format!(
            "{}.{} {}",
            schema.table(),
            term.field,
            if term.descending { "DESC" } else { "ASC" }
        ));
    }
    Ok(rendered.join(", "))
}
