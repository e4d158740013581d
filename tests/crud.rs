use std::sync::Arc;

use openflow_orm::domain::Domain;
use openflow_orm::environment::{Environment, Principal};
use openflow_orm::field::Field;
use openflow_orm::recordset::{FieldValue, RecordSet};
use openflow_orm::registry::Registry;
use openflow_orm::schema::SchemaBuilder;
use openflow_orm::store::SqliteStore;
use openflow_orm::value::Value;
use openflow_orm::{OrmError, domain, values};

fn setup() -> Environment {
    let registry = Registry::new();
    SchemaBuilder::new("res.partner.category")
        .field(Field::char("name").required())
        .register(&registry)
        .unwrap();
    SchemaBuilder::new("res.country")
        .field(Field::char("name"))
        .register(&registry)
        .unwrap();
    SchemaBuilder::new("res.tag")
        .field(Field::integer("color"))
        .register(&registry)
        .unwrap();
    SchemaBuilder::new("res.partner")
        .field(Field::char("name").required())
        .field(Field::char("ref").size(4))
        .field(
            Field::selection("kind", &[("person", "Person"), ("company", "Company")])
                .default("person"),
        )
        .field(Field::integer("age"))
        .field(Field::boolean("active").default(true))
        .field(Field::integer("created_by").default_fn(|env| Value::from(env.uid())))
        .field(Field::char("secret").readonly())
        .field(Field::char("token").no_copy())
        .field(Field::many2one("parent_id", "res.partner"))
        .field(Field::one2many("child_ids", "res.partner", "parent_id"))
        .field(Field::many2many("category_ids", "res.partner.category"))
        .field(Field::many2one("country_id", "res.country"))
        .field(Field::char("upper").compute(|partner| {
            let name = partner.value("name")?;
            Ok(Value::from(name.as_str().unwrap_or_default().to_uppercase()))
        }))
        .register(&registry)
        .unwrap();
    let store = SqliteStore::open_in_memory().unwrap();
    registry.install(&store).unwrap();
    Environment::new(registry, Arc::new(store))
}

fn partners(env: &Environment) -> RecordSet {
    env.model("res.partner").unwrap()
}

#[test]
fn missing_values_get_defaults() {
    let env = setup();
    let ada = partners(&env).create(values! { "name" => "Ada" }).unwrap();
    assert_eq!(ada.ids(), &[1]);
    assert_eq!(ada.value("kind").unwrap(), Value::from("person"));
    assert_eq!(ada.value("active").unwrap(), Value::Bool(true));
    assert_eq!(ada.value("created_by").unwrap(), Value::Integer(1));
    assert_eq!(ada.value("age").unwrap(), Value::Integer(0));
    assert_eq!(ada.value("ref").unwrap(), Value::from(""));
    assert_eq!(ada.value("parent_id").unwrap(), Value::Null);
    assert_eq!(ada.value("upper").unwrap(), Value::from("ADA"));

    let guest = env.with_principal(Principal::new(7));
    let bob = partners(&guest).create(values! { "name" => "Bob" }).unwrap();
    assert_eq!(bob.value("created_by").unwrap(), Value::Integer(7));
}

#[test]
fn invalid_values_are_rejected_before_insert() {
    let env = setup();
    let people = partners(&env);
    let attempts = [
        (values! { "age" => 3 }, "required"),
        (values! { "name" => "Ada", "ref" => "ABCDE" }, "size"),
        (values! { "name" => "Ada", "kind" => "robot" }, "selection"),
        (values! { "name" => "Ada", "age" => "old" }, "type"),
        (values! { "name" => "Ada", "upper" => "ADA" }, "computed"),
        (values! { "name" => "Ada", "id" => 9 }, "id"),
    ];
    for (values, case) in attempts {
        match people.create(values) {
            Err(OrmError::Validation { .. }) => (),
            other => panic!("{case}: expected a validation error, got {other:?}"),
        }
    }
    assert!(matches!(
        people.create(values! { "name" => "Ada", "nickname" => "A" }),
        Err(OrmError::FieldNotFound { .. })
    ));
    assert_eq!(people.count(&Domain::new()).unwrap(), 0);
}

#[test]
fn readonly_fields_are_set_once() {
    let env = setup();
    let ada = partners(&env)
        .create(values! { "name" => "Ada", "secret" => "s3" })
        .unwrap();
    assert_eq!(ada.value("secret").unwrap(), Value::from("s3"));
    assert!(matches!(
        ada.write(values! { "secret" => "other" }),
        Err(OrmError::Validation { .. })
    ));
    assert!(matches!(
        ada.write(values! { "upper" => "X" }),
        Err(OrmError::Validation { .. })
    ));
    assert_eq!(ada.value("secret").unwrap(), Value::from("s3"));
}

#[test]
fn write_assigns_every_record() {
    let env = setup();
    let people = partners(&env);
    for name in ["Ada", "Bob", "Cyd"] {
        people.create(values! { "name" => name }).unwrap();
    }
    let first_two = people.browse([1, 2]);
    first_two.write(values! { "age" => 40, "active" => false }).unwrap();
    first_two.write(values! {}).unwrap();
    people.browse(Vec::new()).write(values! { "age" => 1 }).unwrap();

    let rows = people.browse([1, 2, 3]).read(&["age", "active"]).unwrap();
    let ages: Vec<&Value> = rows.iter().map(|row| &row["age"]).collect();
    assert_eq!(ages, vec![&Value::Integer(40), &Value::Integer(40), &Value::Integer(0)]);
    assert_eq!(rows[0]["id"], Value::Integer(1));
    assert_eq!(rows[1]["active"], Value::Bool(false));
    assert_eq!(rows[2]["active"], Value::Bool(true));
    assert!(!rows[0].contains_key("name"));

    let everything = people.browse([3]).read(&[]).unwrap();
    assert_eq!(everything[0]["name"], Value::from("Cyd"));
    assert_eq!(everything[0]["upper"], Value::from("CYD"));
    assert_eq!(everything[0]["child_ids"], Value::List(vec![]));
}

#[test]
fn unlink_empties_the_receiver() {
    let env = setup();
    let people = partners(&env);
    for name in ["Ada", "Bob", "Cyd"] {
        people.create(values! { "name" => name }).unwrap();
    }
    let mut doomed = people.browse([1, 2]);
    doomed.unlink().unwrap();
    assert!(doomed.is_empty());
    doomed.unlink().unwrap();
    assert_eq!(people.browse([1, 2, 3]).exists().unwrap().ids(), &[3]);
    assert_eq!(people.search(&Domain::new()).unwrap().ids(), &[3]);
    assert!(matches!(
        people.browse([1]).value("name"),
        Err(OrmError::MissingRecord { id: 1, .. })
    ));
}

#[test]
fn copy_skips_fields_marked_not_copied() {
    let env = setup();
    let people = partners(&env);
    let vip = env
        .model("res.partner.category")
        .unwrap()
        .create(values! { "name" => "vip" })
        .unwrap();
    let ada = people
        .create(values! {
            "name" => "Ada",
            "age" => 36,
            "token" => "t0k",
            "secret" => "s3",
            "category_ids" => vip.ids().to_vec(),
        })
        .unwrap();
    people
        .create(values! { "name" => "Kid", "parent_id" => ada.id().unwrap() })
        .unwrap();

    let twin = ada.copy(values! { "name" => "Ada II" }).unwrap();
    assert_ne!(twin, ada);
    assert_eq!(twin.value("name").unwrap(), Value::from("Ada II"));
    assert_eq!(twin.value("age").unwrap(), Value::Integer(36));
    assert_eq!(twin.value("secret").unwrap(), Value::from("s3"));
    assert_eq!(twin.value("token").unwrap(), Value::from(""));
    assert_eq!(twin.records("category_ids").unwrap(), vip);
    assert!(twin.records("child_ids").unwrap().is_empty());
    assert!(matches!(
        people.browse([1, 2]).copy(values! {}),
        Err(OrmError::SingletonExpected(2))
    ));
}

#[test]
fn many_to_one_and_its_inverse() {
    let env = setup();
    let people = partners(&env);
    let ada = people.create(values! { "name" => "Ada" }).unwrap();
    let parent = ada.id().unwrap();
    let kids: Vec<RecordSet> = ["Kim", "Kai"]
        .iter()
        .map(|name| {
            people
                .create(values! { "name" => *name, "parent_id" => parent })
                .unwrap()
        })
        .collect();

    match kids[0].get("parent_id").unwrap() {
        FieldValue::Records(parents) => assert_eq!(parents, ada),
        other => panic!("expected records, got {other:?}"),
    }
    let children = ada.records("child_ids").unwrap();
    assert_eq!(children.ids(), &[2, 3]);
    // the union of the referenced records
    let both = people.browse([2, 3]);
    assert_eq!(both.records("parent_id").unwrap(), ada);
    assert_eq!(
        both.mapped("parent_id.name").unwrap(),
        FieldValue::List(vec![Value::from("Ada")])
    );

    kids[1].write(values! { "parent_id" => Value::Null }).unwrap();
    assert_eq!(ada.records("child_ids").unwrap().ids(), &[2]);
    assert!(matches!(
        ada.write(values! { "child_ids" => vec![3] }),
        Err(OrmError::Unsupported(_))
    ));

    let found = people.search(&domain![("parent_id.name", "=", "Ada")]).unwrap();
    assert_eq!(found.ids(), &[2]);
    let found = people.search(&domain![("child_ids", "!=", false)]).unwrap();
    assert_eq!(found.ids(), &[1]);
}

#[test]
fn many_to_many_links() {
    let env = setup();
    let categories = env.model("res.partner.category").unwrap();
    let vip = categories.create(values! { "name" => "vip" }).unwrap();
    let new = categories.create(values! { "name" => "new" }).unwrap();
    let people = partners(&env);
    let ada = people
        .create(values! { "name" => "Ada", "category_ids" => vec![1, 2] })
        .unwrap();
    let bob = people
        .create(values! { "name" => "Bob", "category_ids" => vec![2] })
        .unwrap();
    let cyd = people.create(values! { "name" => "Cyd" }).unwrap();

    assert_eq!(ada.records("category_ids").unwrap(), (&vip + &new).unwrap());
    assert_eq!(ada.value("category_ids").unwrap(), Value::from(vec![1, 2]));
    assert!(cyd.records("category_ids").unwrap().is_empty());

    let tagged = people.search(&domain![("category_ids", "in", vec![1])]).unwrap();
    assert_eq!(tagged, ada);
    let untagged = people.search(&domain![("category_ids", "=", false)]).unwrap();
    assert_eq!(untagged, cyd);
    let found = people
        .search(&domain![("category_ids.name", "=", "new")])
        .unwrap();
    assert_eq!(found.ids(), &[1, 2]);

    bob.write(values! { "category_ids" => vec![1] }).unwrap();
    assert_eq!(bob.records("category_ids").unwrap(), vip);
    let found = people.search(&domain![("category_ids.name", "=", "new")]).unwrap();
    assert_eq!(found, ada);
}

#[test]
fn failed_writes_change_nothing() {
    let env = setup();
    let people = partners(&env);
    let ada = people.create(values! { "name" => "Ada" }).unwrap();
    assert_eq!(ada.value("name").unwrap(), Value::from("Ada"));

    // there is no category 999, the link fails after the name was assigned
    let failed = ada.write(values! { "name" => "Zed", "category_ids" => vec![999] });
    assert!(matches!(failed, Err(OrmError::Persistence(_))));
    assert_eq!(ada.value("name").unwrap(), Value::from("Ada"));
    let fresh = partners(&env.with_invalidation(env.invalidation()));
    let stored = fresh.browse(ada.ids().to_vec());
    assert_eq!(stored.value("name").unwrap(), Value::from("Ada"));
    assert!(stored.records("category_ids").unwrap().is_empty());

    let failed = people.create(values! { "name" => "Bob", "category_ids" => vec![999] });
    assert!(matches!(failed, Err(OrmError::Persistence(_))));
    assert_eq!(people.count(&Domain::new()).unwrap(), 1);
    assert!(people.browse([2]).exists().unwrap().is_empty());
}

#[test]
fn display_names_fall_back_to_schema_and_id() {
    let env = setup();
    let people = partners(&env);
    people.create(values! { "name" => "Ada" }).unwrap();
    people.create(values! { "name" => "Bob" }).unwrap();
    assert_eq!(
        people.browse([2, 1]).display_names().unwrap(),
        vec![(2, "Bob".to_string()), (1, "Ada".to_string())]
    );
    let tags = env.model("res.tag").unwrap();
    let tag = tags.create(values! { "color" => 3 }).unwrap();
    assert_eq!(tag.display_names().unwrap(), vec![(1, "res.tag,1".to_string())]);
}

#[test]
fn deleting_a_target_clears_references() {
    let env = setup();
    let mut country = env
        .model("res.country")
        .unwrap()
        .create(values! { "name" => "Belgium" })
        .unwrap();
    let ada = partners(&env)
        .create(values! { "name" => "Ada", "country_id" => country.id().unwrap() })
        .unwrap();
    assert_eq!(ada.records("country_id").unwrap().len(), 1);
    country.unlink().unwrap();
    assert_eq!(ada.value("country_id").unwrap(), Value::Null);
    assert!(ada.records("country_id").unwrap().is_empty());
}

#[test]
fn reading_a_missing_record_fails() {
    let env = setup();
    assert!(matches!(
        partners(&env).browse([99]).value("name"),
        Err(OrmError::MissingRecord { id: 99, .. })
    ));
    assert!(partners(&env).browse([99]).exists().unwrap().is_empty());
}
