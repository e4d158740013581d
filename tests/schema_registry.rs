use std::sync::Arc;

use openflow_orm::environment::Environment;
use openflow_orm::field::{Field, FieldType};
use openflow_orm::registry::{Dependent, Registry};
use openflow_orm::schema::SchemaBuilder;
use openflow_orm::store::{SqliteStore, TableSpec};
use openflow_orm::value::Value;
use openflow_orm::{OrmError, values};

fn setup() -> Registry {
    let registry = Registry::new();
    SchemaBuilder::new("mail.thread")
        .field(Field::text("message"))
        .order("id desc")
        .register(&registry)
        .unwrap();
    SchemaBuilder::new("res.partner")
        .description("Contact")
        .inherit("mail.thread")
        .field(Field::char("name").required())
        .field(Field::integer("age"))
        .register(&registry)
        .unwrap();
    registry
}

#[test]
fn every_schema_gets_an_id() {
    let registry = setup();
    let partner = registry.get("res.partner").unwrap();
    assert_eq!(partner.field_names(), vec!["id", "message", "name", "age"]);
    let id = partner.field("id").unwrap();
    assert_eq!(id.field_type(), &FieldType::Integer);
    assert!(id.is_readonly());
    assert_eq!(partner.to_string(), "res.partner (4 fields, table res_partner)");
}

#[test]
fn tables_are_derived_or_explicit() {
    let registry = setup();
    assert_eq!(registry.get("mail.thread").unwrap().table(), "mail_thread");
    let custom = SchemaBuilder::new("res.users")
        .table("users")
        .register(&registry)
        .unwrap();
    assert_eq!(custom.table(), "users");
    assert!(SchemaBuilder::new("res.x").table("drop table").build(&registry).is_err());
}

#[test]
fn inheritance_copies_fields_and_metadata() {
    let registry = setup();
    let partner = registry.get("res.partner").unwrap();
    assert_eq!(partner.inherits(), &["mail.thread".to_string()]);
    assert!(partner.has_field("message"));
    assert_eq!(partner.order(), "id desc");
    assert_eq!(partner.table(), "res_partner");
    assert_eq!(partner.description(), "Contact");
    // the parent is left alone
    assert!(!registry.get("mail.thread").unwrap().has_field("name"));
}

#[test]
fn extending_a_schema_in_place() {
    let registry = setup();
    let extended = SchemaBuilder::new("res.partner")
        .inherit("res.partner")
        .field(Field::char("email"))
        .field(Field::char("name").size(10).required())
        .register(&registry)
        .unwrap();
    assert_eq!(extended.table(), "res_partner");
    assert_eq!(extended.description(), "Contact");
    assert_eq!(
        extended.field_names(),
        vec!["id", "message", "name", "age", "email"]
    );
    assert_eq!(
        extended.field("name").unwrap().field_type(),
        &FieldType::Char { size: 10 }
    );
    assert!(Arc::ptr_eq(&registry.get("res.partner").unwrap(), &extended));
    assert_eq!(registry.len(), 2);
}

#[test]
fn later_registrations_replace_earlier_ones() {
    let registry = setup();
    SchemaBuilder::new("res.partner")
        .field(Field::char("nickname"))
        .register(&registry)
        .unwrap();
    let partner = registry.get("res.partner").unwrap();
    assert!(partner.has_field("nickname"));
    assert!(!partner.has_field("age"));
    assert_eq!(registry.names(), vec!["mail.thread", "res.partner"]);
}

#[test]
fn definition_errors() {
    let registry = setup();
    let broken = [
        SchemaBuilder::new("Res Partner"),
        SchemaBuilder::new("res.bad").field(Field::char("bad-name")),
        SchemaBuilder::new("res.bad").field(
            Field::float("total")
                .compute(|_| Ok(Value::Float(0.0)))
                .stored(true),
        ),
        SchemaBuilder::new("res.bad").field(Field::char("code").related("x.code").stored(true)),
        SchemaBuilder::new("res.bad").field(Field::selection("state", &[])),
        SchemaBuilder::new("res.bad").field(Field::many2many("friend_ids", "res.bad")),
        SchemaBuilder::new("res.bad")
            .field(Field::float("amount"))
            .field(
                Field::float("total")
                    .compute(|_| Ok(Value::Float(0.0)))
                    .depends(&["amuont"])
                    .stored(true),
            ),
    ];
    for builder in broken {
        match builder.build(&registry) {
            Err(OrmError::Definition(_)) => (),
            other => panic!("expected a definition error, got {other:?}"),
        }
    }
    assert!(matches!(
        SchemaBuilder::new("res.bad").inherit("res.nothing").build(&registry),
        Err(OrmError::SchemaNotFound(_))
    ));
    assert!(matches!(registry.get("res.nothing"), Err(OrmError::SchemaNotFound(_))));
    assert!(!registry.contains("res.bad"));
}

#[test]
fn self_referencing_many_to_many_with_explicit_columns() {
    let registry = setup();
    let schema = SchemaBuilder::new("res.person")
        .field(Field::many2many("friend_ids", "res.person").relation(
            "res_person_friend_rel",
            "person_id",
            "friend_id",
        ))
        .register(&registry)
        .unwrap();
    let relation = schema.field("friend_ids").unwrap().junction().cloned().unwrap();
    assert_eq!(relation.table, "res_person_friend_rel");
    let spec = TableSpec::for_schema(&schema, &registry).unwrap();
    assert!(spec.columns.is_empty());
    assert_eq!(spec.junctions.len(), 1);
}

#[test]
fn dependency_graph() {
    let registry = Registry::new();
    SchemaBuilder::new("sale.order")
        .field(Field::one2many("line_ids", "sale.order.line", "order_id"))
        .field(
            Field::float("amount_total")
                .compute(|_| Ok(Value::Float(0.0)))
                .depends(&["line_ids.price"])
                .stored(true),
        )
        .field(
            Field::char("summary")
                .compute(|_| Ok(Value::Null))
                .depends(&["amount_total"]),
        )
        .register(&registry)
        .unwrap();
    SchemaBuilder::new("sale.order.line")
        .field(Field::many2one("order_id", "sale.order"))
        .field(Field::float("price"))
        .register(&registry)
        .unwrap();

    assert_eq!(
        registry.direct_dependents("sale.order.line", "price").unwrap(),
        vec![Dependent {
            schema: "sale.order".into(),
            field: "amount_total".into(),
            via: Some("line_ids".into()),
        }]
    );
    let pair = |s: &str, f: &str| (s.to_string(), f.to_string());
    assert_eq!(
        registry.dependents("sale.order.line", &["price"]).unwrap(),
        vec![pair("sale.order", "amount_total"), pair("sale.order", "summary")]
    );
    assert_eq!(
        registry.dependents("sale.order.line", &["order_id"]).unwrap(),
        vec![
            pair("sale.order", "amount_total"),
            pair("sale.order", "line_ids"),
            pair("sale.order", "summary"),
        ]
    );
    assert!(registry.dependents("sale.order", &["summary"]).unwrap().is_empty());

    // the graph follows later registrations
    SchemaBuilder::new("sale.order.line")
        .inherit("sale.order.line")
        .field(Field::float("qty"))
        .field(
            Field::float("subtotal")
                .compute(|_| Ok(Value::Float(0.0)))
                .depends(&["qty", "price"])
                .stored(true),
        )
        .register(&registry)
        .unwrap();
    assert_eq!(
        registry.dependents("sale.order.line", &["qty"]).unwrap(),
        vec![pair("sale.order.line", "subtotal")]
    );
    assert_eq!(
        registry.direct_dependents("sale.order.line", "price").unwrap().len(),
        2
    );
}

#[test]
fn installing_again_adds_new_columns() {
    let registry = setup();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    registry.install(store.as_ref()).unwrap();
    let env = Environment::new(registry.clone(), store.clone());
    let old = env
        .model("res.partner")
        .unwrap()
        .create(values! { "name" => "Ada" })
        .unwrap();

    SchemaBuilder::new("res.partner")
        .inherit("res.partner")
        .field(Field::char("email").indexed())
        .register(&registry)
        .unwrap();
    registry.install(store.as_ref()).unwrap();
    // installing is idempotent
    registry.install(store.as_ref()).unwrap();

    let env = Environment::new(registry, store);
    let partners = env.model("res.partner").unwrap();
    let new = partners
        .create(values! { "name" => "Bob", "email" => "bob@example.com" })
        .unwrap();
    assert_eq!(new.value("email").unwrap(), Value::from("bob@example.com"));
    let old = partners.browse(old.ids().to_vec());
    assert_eq!(old.value("email").unwrap(), Value::Null);
    assert_eq!(old.value("name").unwrap(), Value::from("Ada"));
}
