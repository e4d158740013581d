use std::fs;
use std::path::PathBuf;

use openflow_orm::domain::Domain;
use openflow_orm::environment::{Environment, Invalidation};
use openflow_orm::field::Field;
use openflow_orm::registry::Registry;
use openflow_orm::schema::SchemaBuilder;
use openflow_orm::settings::{DatabaseSettings, Settings, init_logging};
use openflow_orm::values;

fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("openflow_orm_{}_{name}", std::process::id()))
}

fn setup() -> Registry {
    let registry = Registry::new();
    SchemaBuilder::new("res.partner")
        .field(Field::char("name"))
        .register(&registry)
        .unwrap();
    registry
}

#[test]
fn defaults() {
    let settings = Settings::default();
    assert_eq!(settings.database, DatabaseSettings::default());
    assert_eq!(settings.database.path, None);
    assert!(!settings.database.echo);
    assert_eq!(settings.log_filter, "info");
    assert_eq!(settings.invalidation, Invalidation::Full);
    assert_eq!(settings.search_limit, None);
}

// every test touching the process environment lives here, so that none of
// them races another
#[test]
fn file_then_environment() {
    let path = scratch("settings.toml");
    fs::write(
        &path,
        r#"
log_filter = "debug"
invalidation = "precise"
search_limit = 50

[database]
echo = true
"#,
    )
    .unwrap();

    let loaded = Settings::load(Some(&path)).unwrap();
    assert_eq!(loaded.log_filter, "debug");
    assert_eq!(loaded.invalidation, Invalidation::Precise);
    assert_eq!(loaded.search_limit, Some(50));
    assert!(loaded.database.echo);
    assert_eq!(loaded.database.path, None);

    // a missing file is not an error
    let missing = Settings::load(Some(&scratch("absent.toml"))).unwrap();
    assert_eq!(missing.invalidation, Invalidation::Full);

    unsafe {
        std::env::set_var("OPENFLOW_ORM_SEARCH_LIMIT", "7");
        std::env::set_var("OPENFLOW_ORM_DATABASE__PATH", "/tmp/elsewhere.db");
    }
    let overridden = Settings::load(Some(&path)).unwrap();
    unsafe {
        std::env::remove_var("OPENFLOW_ORM_SEARCH_LIMIT");
        std::env::remove_var("OPENFLOW_ORM_DATABASE__PATH");
    }
    assert_eq!(overridden.search_limit, Some(7));
    assert_eq!(overridden.database.path.as_deref(), Some("/tmp/elsewhere.db"));
    assert_eq!(overridden.log_filter, "debug");

    let plain = Settings::load(None).unwrap();
    assert_eq!(plain, Settings::default());
    fs::remove_file(&path).unwrap();
}

#[test]
fn environments_from_settings_share_a_database_file() {
    let path = scratch("store.db");
    let _ = fs::remove_file(&path);
    let settings = Settings {
        database: DatabaseSettings {
            path: Some(path.to_string_lossy().into_owned()),
            echo: true,
        },
        invalidation: Invalidation::Precise,
        ..Settings::default()
    };

    let first = Environment::from_settings(&settings, setup()).unwrap();
    assert_eq!(first.invalidation(), Invalidation::Precise);
    first
        .model("res.partner")
        .unwrap()
        .create(values! { "name" => "Ada" })
        .unwrap();
    drop(first);

    // the table exists already, installing again leaves the rows alone
    let second = Environment::from_settings(&settings, setup()).unwrap();
    let partners = second.model("res.partner").unwrap();
    let found = partners.search(&Domain::new()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.value("name").unwrap().as_str(), Some("Ada"));
    drop(second);
    fs::remove_file(&path).unwrap();
}

#[test]
fn logging_can_be_initialized_twice() {
    init_logging("debug");
    init_logging("warn");
    tracing::info!("still logging");
}
