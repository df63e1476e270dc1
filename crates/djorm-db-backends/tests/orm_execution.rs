//! End-to-end ORM tests against real in-memory and file-backed SQLite.

#![cfg(feature = "sqlite")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use djorm_core::{DatabaseSettings, DjormError, Settings};
use djorm_db::connection::ConnectionHandler;
use djorm_db::fields::{Field, FieldType};
use djorm_db::instance::SaveOptions;
use djorm_db::loading::{load_objects, Fixture, LoadOptions};
use djorm_db::model::{ModelBuilder, ModelClass};
use djorm_db::options::Meta;
use djorm_db::registry::ModelRegistry;
use djorm_db::value::Value;
use djorm_db::{create_test_db, destroy_test_db, sync_db};
use djorm_db_backends::connection_handler;
use djorm_signals::{PostSave, SIGNALS};

fn memory_handler() -> ConnectionHandler {
    let mut settings = Settings::default();
    settings
        .databases
        .insert("default".into(), DatabaseSettings::sqlite_memory());
    connection_handler(&settings)
}

fn file_handler(path: &std::path::Path) -> ConnectionHandler {
    let mut settings = Settings::default();
    settings.databases.insert(
        "default".into(),
        DatabaseSettings::sqlite_file(path.to_string_lossy().into_owned()),
    );
    connection_handler(&settings)
}

fn person_model(registry: &ModelRegistry, app: &str) -> Arc<ModelClass> {
    ModelBuilder::new("Person", format!("site.{app}.models"))
        .field(Field::new("name", FieldType::CharField).max_length(50))
        .field(Field::new("age", FieldType::IntegerField).nullable())
        .build(registry)
        .unwrap()
}

fn blog_models(registry: &ModelRegistry) -> (Arc<ModelClass>, Arc<ModelClass>) {
    let blog = ModelBuilder::new("Blog", "site.blog.models")
        .field(Field::new("name", FieldType::CharField).max_length(100))
        .build(registry)
        .unwrap();
    let entry = ModelBuilder::new("Entry", "site.blog.models")
        .field(Field::new("blog", FieldType::ForeignKey { to: "blog.Blog".into() }))
        .field(Field::new("headline", FieldType::CharField).max_length(255))
        .field(Field::new("pub_date", FieldType::DateField))
        .meta(Meta::new().get_latest_by("pub_date"))
        .build(registry)
        .unwrap();
    (blog, entry)
}

fn date(y: i32, m: u32, d: u32) -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn names(items: &[djorm_db::Instance]) -> Vec<String> {
    items
        .iter()
        .map(|obj| obj.get_as::<String>("name").unwrap())
        .collect()
}

// ── Schema sync ─────────────────────────────────────────────────────

#[test]
fn test_sync_db_creates_tables_once() {
    let registry = ModelRegistry::new();
    blog_models(&registry);
    let mut conns = memory_handler();
    let created = sync_db(&mut conns, &registry, "default").unwrap();
    assert_eq!(created, vec!["blog_blog".to_string(), "blog_entry".to_string()]);
    assert_eq!(
        conns.get("default").unwrap().table_names().unwrap(),
        vec!["blog_blog".to_string(), "blog_entry".to_string()]
    );
    assert!(sync_db(&mut conns, &registry, "default").unwrap().is_empty());
}

// ── Save and fetch ──────────────────────────────────────────────────

#[test]
fn test_save_round_trip() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    let mut alice = person
        .build(vec![], vec![("name", "Alice".into()), ("age", 30.into())])
        .unwrap();
    assert!(alice.pk().is_null());
    alice.save(&mut conns, SaveOptions::new()).unwrap();
    assert_eq!(alice.pk(), Value::Int(1));

    let fetched = person
        .objects()
        .get(&mut conns, &[("pk", alice.pk())])
        .unwrap();
    assert_eq!(fetched, alice);
    assert_eq!(fetched.get_as::<String>("name").unwrap(), "Alice");
    assert_eq!(fetched.get("age"), Some(&Value::Int(30)));
}

#[test]
fn test_save_existing_row_updates() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    let mut bob = person
        .objects()
        .create(&mut conns, vec![("name", "Bob".into())])
        .unwrap();
    bob.set("age", 41).unwrap();
    bob.save(&mut conns, SaveOptions::new()).unwrap();

    assert_eq!(person.objects().count(&mut conns).unwrap(), 1);
    let fetched = person
        .objects()
        .get(&mut conns, &[("name", "Bob".into())])
        .unwrap();
    assert_eq!(fetched.get("age"), Some(&Value::Int(41)));
}

#[test]
fn test_get_missing_pk_does_not_exist() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    let err = person
        .objects()
        .get(&mut conns, &[("pk", Value::Int(999))])
        .unwrap_err();
    assert!(person.is_does_not_exist(&err));
    assert_eq!(err.to_string(), "Person matching query does not exist.");
}

#[test]
fn test_get_multiple_objects_returned() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    for _ in 0..2 {
        person
            .objects()
            .create(&mut conns, vec![("name", "Twin".into())])
            .unwrap();
    }
    let err = person
        .objects()
        .get(&mut conns, &[("name", "Twin".into())])
        .unwrap_err();
    assert!(person.is_multiple_objects_returned(&err));
    assert!(err.to_string().contains("it returned 2!"));
}

// ── QuerySet evaluation ─────────────────────────────────────────────

fn seed_people(conns: &mut ConnectionHandler, person: &Arc<ModelClass>) {
    for name in ["Alice", "Adam", "Bob"] {
        person
            .objects()
            .create(conns, vec![("name", name.into())])
            .unwrap();
    }
}

#[test]
fn test_startswith_order_slice() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    seed_people(&mut conns, &person);

    let mut qs = person
        .objects()
        .filter(&[("name__startswith", "A".into())])
        .unwrap()
        .order_by(&["name"])
        .unwrap()
        .slice(0..2);
    let people = qs.fetch_all(&mut conns).unwrap();
    assert_eq!(names(&people), vec!["Adam", "Alice"]);
}

#[test]
fn test_startswith_is_case_sensitive() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    seed_people(&mut conns, &person);

    let qs = person
        .objects()
        .filter(&[("name__startswith", "a".into())])
        .unwrap();
    assert_eq!(qs.count(&mut conns).unwrap(), 0);
}

#[test]
fn test_chained_filters_and_in() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    seed_people(&mut conns, &person);

    let names_in = Value::List(vec!["Alice".into(), "Bob".into()]);
    let mut qs = person
        .objects()
        .filter(&[("name__in", names_in)])
        .unwrap()
        .filter(&[("pk__lte", Value::Int(2))])
        .unwrap();
    assert_eq!(names(&qs.fetch_all(&mut conns).unwrap()), vec!["Alice"]);

    let mut none = person
        .objects()
        .filter(&[("name__in", Value::List(vec![]))])
        .unwrap();
    assert!(!none.exists(&mut conns).unwrap());
}

#[test]
fn test_reiteration_issues_one_query() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    seed_people(&mut conns, &person);
    conns.get("default").unwrap().reset_queries();

    let mut qs = person.objects().order_by(&["name"]).unwrap();
    let first = names(&qs.fetch_all(&mut conns).unwrap());
    let second = names(&qs.fetch_all(&mut conns).unwrap());
    assert_eq!(first, vec!["Adam", "Alice", "Bob"]);
    assert_eq!(first, second);
    assert_eq!(qs.len(&mut conns).unwrap(), 3);
    assert_eq!(conns.get("default").unwrap().queries().len(), 1);
}

#[test]
fn test_get_item_and_step() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    seed_people(&mut conns, &person);

    let mut qs = person.objects().order_by(&["-name"]).unwrap();
    let first = qs.get_item(&mut conns, 0).unwrap();
    assert_eq!(first.get_as::<String>("name").unwrap(), "Bob");
    let stepped = qs.slice_step(&mut conns, 0..3, 2).unwrap();
    assert_eq!(names(&stepped), vec!["Bob", "Adam"]);
    assert!(matches!(
        qs.get_item(&mut conns, 5),
        Err(DjormError::IndexOutOfRange(_))
    ));
}

#[test]
fn test_values_and_extra() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    seed_people(&mut conns, &person);

    let mut rows = person
        .objects()
        .extra(&[("name_length", "length(\"people_person\".\"name\")")])
        .unwrap()
        .order_by(&["name"])
        .unwrap()
        .values(&["name", "name_length"])
        .unwrap();
    let rows = rows.fetch_all(&mut conns).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].get("name"), Some(&Value::String("Adam".into())));
    assert_eq!(rows[0].get("name_length"), Some(&Value::Int(4)));

    let err = person.objects().values(&["nickname"]).unwrap_err();
    assert!(matches!(err, DjormError::UnknownProjectionField(_)));
}

#[test]
fn test_update_and_delete() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    seed_people(&mut conns, &person);

    let updated = person
        .objects()
        .filter(&[("name__startswith", "A".into())])
        .unwrap()
        .update(&mut conns, &[("age", Value::Int(20))])
        .unwrap();
    assert_eq!(updated, 2);
    let adults = person
        .objects()
        .filter(&[("age", Value::Int(20))])
        .unwrap();
    assert_eq!(adults.count(&mut conns).unwrap(), 2);

    let deleted = person
        .objects()
        .filter(&[("name", "Bob".into())])
        .unwrap()
        .delete(&mut conns)
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(person.objects().count(&mut conns).unwrap(), 2);
}

// ── Dates ───────────────────────────────────────────────────────────

fn seed_entries(conns: &mut ConnectionHandler, blog: &Arc<ModelClass>, entry: &Arc<ModelClass>) {
    let b = blog
        .objects()
        .create(conns, vec![("name", "News".into())])
        .unwrap();
    for (headline, day) in [
        ("first", date(2005, 7, 28)),
        ("second", date(2005, 7, 29)),
        ("third", date(2006, 1, 2)),
    ] {
        entry
            .objects()
            .create(
                conns,
                vec![
                    ("blog", b.pk()),
                    ("headline", headline.into()),
                    ("pub_date", Value::Date(day)),
                ],
            )
            .unwrap();
    }
}

#[test]
fn test_dates_by_year_and_month() {
    let registry = ModelRegistry::new();
    let (blog, entry) = blog_models(&registry);
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    seed_entries(&mut conns, &blog, &entry);

    let mut years = entry.objects().dates("pub_date", "year", "ASC").unwrap();
    assert_eq!(
        years.fetch_all(&mut conns).unwrap(),
        vec![date(2005, 1, 1), date(2006, 1, 1)]
    );
    let mut months = entry.objects().dates("pub_date", "month", "DESC").unwrap();
    assert_eq!(
        months.fetch_all(&mut conns).unwrap(),
        vec![date(2006, 1, 1), date(2005, 7, 1)]
    );
    assert!(entry.objects().dates("pub_date", "week", "ASC").is_err());
}

#[test]
fn test_date_lookups_and_latest() {
    let registry = ModelRegistry::new();
    let (blog, entry) = blog_models(&registry);
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    seed_entries(&mut conns, &blog, &entry);

    let in_2005 = entry
        .objects()
        .filter(&[("pub_date__year", Value::Int(2005))])
        .unwrap();
    assert_eq!(in_2005.count(&mut conns).unwrap(), 2);

    // 2005-07-28 was a Thursday: day 5 counting from Sunday = 1.
    let thursdays = entry
        .objects()
        .filter(&[("pub_date__week_day", Value::Int(5))])
        .unwrap();
    let first = thursdays.get(&mut conns, &[]).unwrap();
    assert_eq!(first.get_as::<String>("headline").unwrap(), "first");

    let latest = entry.objects().latest(&mut conns, None).unwrap();
    assert_eq!(latest.get_as::<String>("headline").unwrap(), "third");
    assert_eq!(latest.get("pub_date"), Some(&Value::Date(date(2006, 1, 2))));
}

// ── Transactions ────────────────────────────────────────────────────

#[test]
fn test_dirty_leave_rolls_back() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    {
        let conn = conns.get("default").unwrap();
        conn.enter_transaction_management(true);
        conn.managed(true).unwrap();
    }
    let mut zed = person
        .build(vec![], vec![("name", "Zed".into())])
        .unwrap();
    zed.save(&mut conns, SaveOptions::new()).unwrap();
    assert!(conns.get("default").unwrap().is_dirty());

    let err = conns
        .get("default")
        .unwrap()
        .leave_transaction_management()
        .unwrap_err();
    assert!(matches!(err, DjormError::TransactionManagement(_)));
    assert_eq!(person.objects().count(&mut conns).unwrap(), 0);
}

#[test]
fn test_managed_commit_persists() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    {
        let conn = conns.get("default").unwrap();
        conn.enter_transaction_management(true);
        conn.managed(true).unwrap();
    }
    person
        .objects()
        .create(&mut conns, vec![("name", "Kept".into())])
        .unwrap();
    {
        let conn = conns.get("default").unwrap();
        conn.commit().unwrap();
        conn.leave_transaction_management().unwrap();
    }
    assert_eq!(person.objects().count(&mut conns).unwrap(), 1);
}

#[test]
fn test_savepoint_rollback_keeps_earlier_writes() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    {
        let conn = conns.get("default").unwrap();
        conn.enter_transaction_management(true);
        conn.managed(true).unwrap();
    }
    person
        .objects()
        .create(&mut conns, vec![("name", "Before".into())])
        .unwrap();
    let sid = conns.get("default").unwrap().savepoint().unwrap();
    person
        .objects()
        .create(&mut conns, vec![("name", "After".into())])
        .unwrap();
    conns.get("default").unwrap().savepoint_rollback(&sid).unwrap();
    {
        let conn = conns.get("default").unwrap();
        conn.commit().unwrap();
        conn.leave_transaction_management().unwrap();
    }
    let mut all = person.objects().all();
    assert_eq!(names(&all.fetch_all(&mut conns).unwrap()), vec!["Before"]);
}

#[test]
fn test_forced_update_without_row_fails() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    {
        let conn = conns.get("default").unwrap();
        conn.enter_transaction_management(true);
        conn.managed(true).unwrap();
    }
    let mut ghost = person
        .build(vec![Value::Int(999), "Ghost".into()], vec![])
        .unwrap();
    let err = ghost
        .save(&mut conns, SaveOptions::new().force_update())
        .unwrap_err();
    assert_eq!(err.to_string(), "Database error: Forced update did not affect any rows.");

    let conn = conns.get("default").unwrap();
    conn.rollback().unwrap();
    conn.leave_transaction_management().unwrap();
    assert_eq!(conn.transaction_depth(), 0);
}

#[test]
fn test_forced_update_of_pk_only_model_is_a_no_op() {
    let registry = ModelRegistry::new();
    let tag = ModelBuilder::new("Tag", "site.tags.models")
        .build(&registry)
        .unwrap();
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    let mut first = tag.instance();
    first.save(&mut conns, SaveOptions::new()).unwrap();
    assert_eq!(first.pk(), Value::Int(1));
    first
        .save(&mut conns, SaveOptions::new().force_update())
        .unwrap();
    assert_eq!(tag.objects().count(&mut conns).unwrap(), 1);
}

#[test]
fn test_integrity_error_on_duplicate_pk() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    let mut one = person.build(vec![Value::Int(1), "One".into()], vec![]).unwrap();
    one.save(&mut conns, SaveOptions::new()).unwrap();
    let mut dup = person.build(vec![Value::Int(1), "Dup".into()], vec![]).unwrap();
    let err = dup
        .save(&mut conns, SaveOptions::new().force_insert())
        .unwrap_err();
    assert!(matches!(err, DjormError::IntegrityError(_)));
}

// ── Ordering within a group ─────────────────────────────────────────

#[test]
fn test_order_with_respect_to_numbers_each_group() {
    let registry = ModelRegistry::new();
    let answer = ModelBuilder::new("Answer", "site.poll.models")
        .field(Field::new("question", FieldType::IntegerField))
        .field(Field::new("text", FieldType::CharField).max_length(50))
        .meta(Meta::new().order_with_respect_to("question"))
        .build(&registry)
        .unwrap();
    let field_names: Vec<String> = answer
        .meta()
        .fields()
        .iter()
        .map(|f| f.name.clone())
        .collect();
    assert_eq!(field_names, vec!["id", "question", "text", "_order"]);

    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    let mut yes = answer
        .build(vec![Value::Null, Value::Int(1), "yes".into()], vec![])
        .unwrap();
    assert_eq!(yes.get("question"), Some(&Value::Int(1)));
    assert_eq!(yes.get_as::<String>("text").unwrap(), "yes");
    yes.save(&mut conns, SaveOptions::new()).unwrap();
    assert_eq!(yes.get("_order"), Some(&Value::Int(0)));

    let mut no = answer
        .build(vec![Value::Null, Value::Int(1), "no".into()], vec![])
        .unwrap();
    no.save(&mut conns, SaveOptions::new()).unwrap();
    assert_eq!(no.get("_order"), Some(&Value::Int(1)));

    let mut maybe = answer
        .build(vec![Value::Null, Value::Int(2), "maybe".into()], vec![])
        .unwrap();
    maybe.save(&mut conns, SaveOptions::new()).unwrap();
    assert_eq!(maybe.get("_order"), Some(&Value::Int(0)));

    let mut first_group = answer
        .objects()
        .filter(&[("question", Value::Int(1))])
        .unwrap();
    let texts: Vec<String> = first_group
        .fetch_all(&mut conns)
        .unwrap()
        .iter()
        .map(|obj| obj.get_as::<String>("text").unwrap())
        .collect();
    assert_eq!(texts, vec!["yes", "no"]);
}

// ── Inheritance ─────────────────────────────────────────────────────

#[test]
fn test_multi_table_inheritance() {
    let registry = ModelRegistry::new();
    let place = ModelBuilder::new("Place", "site.places.models")
        .field(Field::new("name", FieldType::CharField).max_length(50))
        .build(&registry)
        .unwrap();
    let restaurant = ModelBuilder::new("Restaurant", "site.places.models")
        .base(&place)
        .field(Field::new("serves_pizza", FieldType::BooleanField).default(false))
        .build(&registry)
        .unwrap();
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    let created = restaurant
        .objects()
        .create(
            &mut conns,
            vec![("name", "Luigi's".into()), ("serves_pizza", true.into())],
        )
        .unwrap();
    assert_eq!(created.get("place_ptr_id"), Some(&Value::Int(1)));
    place
        .objects()
        .create(&mut conns, vec![("name", "Corner Shop".into())])
        .unwrap();

    assert_eq!(place.objects().count(&mut conns).unwrap(), 2);
    assert_eq!(restaurant.objects().count(&mut conns).unwrap(), 1);
    let fetched = restaurant
        .objects()
        .get(&mut conns, &[("name", "Luigi's".into())])
        .unwrap();
    assert_eq!(fetched.get("serves_pizza"), Some(&Value::Bool(true)));

    let err = restaurant
        .objects()
        .get(&mut conns, &[("name", "Nowhere".into())])
        .unwrap_err();
    assert!(restaurant.is_does_not_exist(&err));
    assert!(place.is_does_not_exist(&err));

    restaurant
        .objects()
        .update(&mut conns, &[("name", "Mario's".into())])
        .unwrap();
    let renamed = place.objects().get(&mut conns, &[("pk", Value::Int(1))]).unwrap();
    assert_eq!(renamed.get_as::<String>("name").unwrap(), "Mario's");
    let untouched = place.objects().get(&mut conns, &[("pk", Value::Int(2))]).unwrap();
    assert_eq!(untouched.get_as::<String>("name").unwrap(), "Corner Shop");

    let mut fetched = fetched;
    fetched.delete(&mut conns, None).unwrap();
    assert!(fetched.pk().is_null());
    assert_eq!(restaurant.objects().count(&mut conns).unwrap(), 0);
    assert_eq!(place.objects().count(&mut conns).unwrap(), 1);
}

// ── Signals ─────────────────────────────────────────────────────────

#[test]
fn test_post_save_reports_created() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "signalled");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    let created = Arc::new(AtomicUsize::new(0));
    let updated = Arc::new(AtomicUsize::new(0));
    let (c, u) = (Arc::clone(&created), Arc::clone(&updated));
    SIGNALS.post_save.connect(
        "orm_execution.post_save",
        Arc::new(move |event: &PostSave| {
            if event.model == "signalled.Person" {
                if event.created {
                    c.fetch_add(1, Ordering::SeqCst);
                } else {
                    u.fetch_add(1, Ordering::SeqCst);
                }
            }
            None
        }),
    );

    let mut obj = person
        .objects()
        .create(&mut conns, vec![("name", "Sig".into())])
        .unwrap();
    obj.set("age", 3).unwrap();
    obj.save(&mut conns, SaveOptions::new()).unwrap();
    SIGNALS.post_save.disconnect("orm_execution.post_save");

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(updated.load(Ordering::SeqCst), 1);
}

// ── Bulk loading ────────────────────────────────────────────────────

#[test]
fn test_load_with_forward_references() {
    let registry = ModelRegistry::new();
    let (blog, entry) = blog_models(&registry);
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    // Entries reference a blog that is only loaded afterwards.
    let entries = vec![entry
        .build(
            vec![],
            vec![
                ("id", Value::Int(1)),
                ("blog_id", Value::Int(7)),
                ("headline", "Hello".into()),
                ("pub_date", Value::Date(date(2011, 3, 1))),
            ],
        )
        .unwrap()];
    let blogs = vec![blog
        .build(vec![Value::Int(7), "Seven".into()], vec![])
        .unwrap()];
    let summary = load_objects(
        &mut conns,
        vec![Fixture::new("entries", entries), Fixture::new("blogs", blogs)],
        &LoadOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.to_string(), "Installed 2 object(s) from 2 fixture(s)");
    assert_eq!(summary.models, vec!["blog.Entry".to_string(), "blog.Blog".to_string()]);
    assert_eq!(entry.objects().count(&mut conns).unwrap(), 1);
    assert_eq!(conns.get("default").unwrap().transaction_depth(), 0);
}

#[test]
fn test_load_with_dangling_reference_leaves_db_untouched() {
    let registry = ModelRegistry::new();
    let (blog, entry) = blog_models(&registry);
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();

    let objects = vec![
        blog.build(vec![Value::Int(1), "One".into()], vec![]).unwrap(),
        entry
            .build(
                vec![],
                vec![
                    ("id", Value::Int(1)),
                    ("blog_id", Value::Int(42)),
                    ("headline", "Orphan".into()),
                    ("pub_date", Value::Date(date(2011, 3, 1))),
                ],
            )
            .unwrap(),
    ];
    let err = load_objects(
        &mut conns,
        vec![Fixture::new("broken", objects)],
        &LoadOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, DjormError::IntegrityError(_)));
    assert_eq!(blog.objects().count(&mut conns).unwrap(), 0);
    assert_eq!(entry.objects().count(&mut conns).unwrap(), 0);

    // Referential checks are back on after the failed load.
    let mut orphan = entry
        .build(
            vec![],
            vec![
                ("blog_id", Value::Int(42)),
                ("headline", "Orphan".into()),
                ("pub_date", Value::Date(date(2011, 3, 1))),
            ],
        )
        .unwrap();
    assert!(matches!(
        orphan.save(&mut conns, SaveOptions::new()),
        Err(DjormError::IntegrityError(_))
    ));
}

// ── Connection lifecycle ────────────────────────────────────────────

#[test]
fn test_close_reopens_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = file_handler(&dir.path().join("app.db"));
    sync_db(&mut conns, &registry, "default").unwrap();
    person
        .objects()
        .create(&mut conns, vec![("name", "Persisted".into())])
        .unwrap();

    conns.close_all();
    assert!(!conns.get("default").unwrap().is_connected());
    assert_eq!(person.objects().count(&mut conns).unwrap(), 1);
    assert!(conns.get("default").unwrap().is_connected());
}

#[test]
fn test_close_keeps_memory_database() {
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");
    let mut conns = memory_handler();
    sync_db(&mut conns, &registry, "default").unwrap();
    seed_people(&mut conns, &person);

    conns.close_all();
    assert!(conns.get("default").unwrap().is_connected());
    assert_eq!(person.objects().count(&mut conns).unwrap(), 3);
}

#[test]
fn test_file_test_database_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let test_path = dir.path().join("test_app.db");
    let registry = ModelRegistry::new();
    let person = person_model(&registry, "people");

    let mut settings = Settings::default();
    let mut db = DatabaseSettings::sqlite_file(dir.path().join("app.db").to_string_lossy().into_owned());
    db.test_name = Some(test_path.to_string_lossy().into_owned());
    settings.databases.insert("default".into(), db);
    let mut conns = connection_handler(&settings);

    let old_name = create_test_db(&mut conns, &registry, "default").unwrap();
    assert!(old_name.ends_with("app.db"));
    person
        .objects()
        .create(&mut conns, vec![("name", "Temp".into())])
        .unwrap();
    assert!(test_path.exists());

    destroy_test_db(&mut conns, "default", &old_name).unwrap();
    assert!(!test_path.exists());
    assert_eq!(conns.settings_for("default").unwrap().name, old_name);
}
