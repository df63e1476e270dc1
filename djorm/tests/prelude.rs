#![cfg(feature = "sqlite")]

use djorm::prelude::*;
use djorm::db::registry::ModelRegistry;

#[test]
fn test_connect_and_query_through_prelude() {
    let mut settings = Settings::default();
    settings.debug = false;
    settings
        .databases
        .insert(DEFAULT_DB_ALIAS.into(), DatabaseSettings::sqlite_memory());
    let mut conns: ConnectionHandler = djorm::connect(&settings);

    let registry = ModelRegistry::new();
    let tag = ModelBuilder::new("Tag", "site.tags.models")
        .field(Field::new("label", FieldType::CharField).max_length(20))
        .meta(Meta::new().ordering(&["label"]))
        .build(&registry)
        .unwrap();
    sync_db(&mut conns, &registry, DEFAULT_DB_ALIAS).unwrap();

    for label in ["rust", "orm"] {
        tag.objects()
            .create(&mut conns, vec![("label", label.into())])
            .unwrap();
    }
    let mut tags: QuerySet = tag.objects().all();
    let labels: Vec<String> = tags
        .fetch_all(&mut conns)
        .unwrap()
        .iter()
        .map(|t: &Instance| t.get_as::<String>("label").unwrap())
        .collect();
    assert_eq!(labels, vec!["orm", "rust"]);
    assert_eq!(conns.get(DEFAULT_DB_ALIAS).unwrap().queries().len(), 0);
}

#[test]
fn test_error_kinds_are_reexported() {
    let err = DjormError::IntegrityError("dup".into());
    assert_eq!(err.kind(), ErrorKind::Persistence);
}
