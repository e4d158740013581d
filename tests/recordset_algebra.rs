use std::sync::Arc;

use openflow_orm::environment::Environment;
use openflow_orm::field::Field;
use openflow_orm::recordset::{FieldValue, RecordSet};
use openflow_orm::registry::Registry;
use openflow_orm::schema::SchemaBuilder;
use openflow_orm::store::SqliteStore;
use openflow_orm::OrmError;

fn setup() -> Environment {
    let registry = Registry::new();
    SchemaBuilder::new("res.partner")
        .field(Field::char("name"))
        .field(Field::many2one("parent_id", "res.partner"))
        .register(&registry)
        .unwrap();
    SchemaBuilder::new("res.country")
        .field(Field::char("code"))
        .register(&registry)
        .unwrap();
    let store = SqliteStore::open_in_memory().unwrap();
    registry.install(&store).unwrap();
    Environment::new(registry, Arc::new(store))
}

fn partners(env: &Environment, ids: &[i64]) -> RecordSet {
    env.model("res.partner").unwrap().browse(ids.iter().copied())
}

#[test]
fn browse_drops_duplicates_and_keeps_order() {
    let env = setup();
    let set = partners(&env, &[3, 1, 3, 2, 1]);
    assert_eq!(set.ids(), &[3, 1, 2]);
    assert_eq!(set.len(), 3);
}

#[test]
fn union_difference_intersection() {
    let env = setup();
    let a = partners(&env, &[1, 2, 3]);
    let b = partners(&env, &[3, 4]);
    assert_eq!(a.union(&b).unwrap().ids(), &[1, 2, 3, 4]);
    assert_eq!(b.union(&a).unwrap().ids(), &[3, 4, 1, 2]);
    assert_eq!(a.difference(&b).unwrap().ids(), &[1, 2]);
    assert_eq!(a.intersection(&b).unwrap().ids(), &[3]);
    // operator forms
    assert_eq!((&a + &b).unwrap(), (&a | &b).unwrap());
    assert_eq!((&a - &b).unwrap().ids(), &[1, 2]);
    assert_eq!((&a & &b).unwrap().ids(), &[3]);
}

#[test]
fn algebra_laws() {
    let env = setup();
    let samples: Vec<Vec<i64>> = vec![
        vec![],
        vec![1],
        vec![2, 1],
        vec![1, 2, 3],
        vec![5, 3, 1],
        vec![4, 2, 6, 8],
    ];
    for left in &samples {
        let a = partners(&env, left);
        assert_eq!(a, a.clone());
        assert_eq!((&a + &a).unwrap(), a);
        let empty = (&a - &a).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.name(), "res.partner");
        for right in &samples {
            let b = partners(&env, right);
            let rebuilt = (&(&a & &b).unwrap() + &(&a - &b).unwrap()).unwrap();
            assert_eq!(rebuilt, a, "{left:?} {right:?}");
        }
    }
}

#[test]
fn equality_ignores_order_but_not_schema() {
    let env = setup();
    assert_eq!(partners(&env, &[1, 2, 3]), partners(&env, &[3, 2, 1]));
    assert_ne!(partners(&env, &[1, 2]), partners(&env, &[1, 2, 3]));
    let countries = env.model("res.country").unwrap().browse([1, 2]);
    assert_ne!(partners(&env, &[1, 2]), countries);
}

#[test]
fn mixing_schemas_fails() {
    let env = setup();
    let countries = env.model("res.country").unwrap().browse([1]);
    let result = partners(&env, &[1]).union(&countries);
    match result {
        Err(OrmError::SchemaMismatch { left, right }) => {
            assert_eq!(left, "res.partner");
            assert_eq!(right, "res.country");
        }
        other => panic!("expected a schema mismatch, got {other:?}"),
    }
    assert!((&partners(&env, &[1]) & &countries).is_err());
}

#[test]
fn singletons() {
    let env = setup();
    assert!(matches!(
        partners(&env, &[]).ensure_one(),
        Err(OrmError::SingletonExpected(0))
    ));
    assert!(matches!(
        partners(&env, &[1, 2]).ensure_one(),
        Err(OrmError::SingletonExpected(2))
    ));
    let one = partners(&env, &[7]);
    assert_eq!(one.ensure_one().unwrap(), one);
    assert_eq!(one.id().unwrap(), Some(7));
    assert_eq!(partners(&env, &[]).id().unwrap(), None);
    assert!(partners(&env, &[1, 2]).id().is_err());
}

#[test]
fn indexing_slicing_iteration() {
    let env = setup();
    let set = partners(&env, &[4, 5, 6]);
    assert_eq!(set.get_index(0).unwrap(), partners(&env, &[4]));
    assert!(set.get_index(3).is_none());
    assert_eq!(set.slice(1..10).ids(), &[5, 6]);
    assert!(set.slice(5..9).is_empty());
    let singles: Vec<i64> = set.iter().map(|r| r.id().unwrap().unwrap()).collect();
    assert_eq!(singles, vec![4, 5, 6]);
    assert!(set.iter().all(|r| r.len() == 1));
    assert_eq!(set.to_string(), "res.partner(4, 5, 6)");
}

#[test]
fn empty_browse_reads_empty_results() {
    let env = setup();
    let empty = partners(&env, &[]);
    assert!(empty.is_empty());
    assert_eq!(empty.get("name").unwrap(), FieldValue::List(vec![]));
    match empty.get("parent_id").unwrap() {
        FieldValue::Records(parents) => {
            assert!(parents.is_empty());
            assert_eq!(parents.name(), "res.partner");
        }
        other => panic!("expected records, got {other:?}"),
    }
    assert!(empty.read(&["name"]).unwrap().is_empty());
    assert!(empty.mapped("parent_id.name").unwrap().is_empty());
    assert!(matches!(empty.value("name"), Err(OrmError::SingletonExpected(0))));
}

#[test]
fn transformations_leave_the_receiver_alone() {
    let env = setup();
    let set = partners(&env, &[1, 2, 3]);
    let odd = set.filtered(|r| Ok(r.id()?.unwrap_or(0) % 2 == 1)).unwrap();
    assert_eq!(odd.ids(), &[1, 3]);
    let reversed = set
        .sorted_by_key(|r| Ok(r.id()?.unwrap_or(0)), true)
        .unwrap();
    assert_eq!(reversed.ids(), &[3, 2, 1]);
    assert_eq!(set.ids(), &[1, 2, 3]);
    let ids = set.mapped_with(|r| Ok(r.id()?.unwrap_or(0) * 10)).unwrap();
    assert_eq!(ids, vec![10, 20, 30]);
}
