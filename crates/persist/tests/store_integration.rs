use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use persist::{
    Collection, Database, ErrorCode, PersistError, QueryParams, Rule, last_error, rules_match,
};
use serde_json::{Value, json};
use tempfile::TempDir;

fn open_store() -> (Database, TempDir) {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().expect("tempdir");
    let db = persist::open(dir.path().join("store.db"), "sqlite", None).expect("open database");
    (db, dir)
}

fn ids(iter: persist::DocumentIter) -> Vec<String> {
    iter.map(|doc| doc.unwrap()["id"].as_str().unwrap().to_string())
        .collect()
}

fn id_set(collection: &Collection, rules: Option<&Value>) -> BTreeSet<String> {
    ids(collection.query(rules, QueryParams::new()).unwrap())
        .into_iter()
        .collect()
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[test]
fn s1_basic_crud() {
    let (db, _dir) = open_store();
    let users = db.collection("users", true).unwrap();

    users
        .save(&json!({"id": "u1", "name": "Ann", "age": 30}))
        .unwrap();
    assert_eq!(
        users.get("u1").unwrap(),
        json!({"id": "u1", "name": "Ann", "age": 30})
    );

    users
        .save(&json!({"id": "u1", "name": "Ann", "age": 31}))
        .unwrap();
    assert_eq!(users.get("u1").unwrap()["age"], 31);

    users.delete("u1").unwrap();
    assert!(matches!(users.get("u1"), Err(PersistError::NotFound(_))));
}

#[test]
fn s2_equality_query() {
    let (db, _dir) = open_store();
    let users = db.collection("users", true).unwrap();

    for (id, age) in [("u1", 30), ("u2", 40), ("u3", 30)] {
        users.save(&json!({"id": id, "age": age})).unwrap();
    }

    assert_eq!(
        id_set(&users, Some(&json!([["age", "=", 30]]))),
        BTreeSet::from(["u1".to_string(), "u3".to_string()])
    );
}

#[test]
fn s3_compound_rule() {
    let (db, _dir) = open_store();
    let users = db.collection("users", true).unwrap();

    for (id, age) in [("u1", 30), ("u2", 40), ("u3", 30)] {
        users.save(&json!({"id": id, "age": age})).unwrap();
    }

    assert_eq!(
        id_set(
            &users,
            Some(&json!([["or", [["age", "=", 30], ["age", "=", 40]]]]))
        ),
        BTreeSet::from(["u1".to_string(), "u2".to_string(), "u3".to_string()])
    );
}

#[test]
fn s4_sort_limit_offset() {
    let (db, _dir) = open_store();
    let nums = db.collection("nums", true).unwrap();

    for (id, v) in [("a", 3), ("b", 1), ("c", 2)] {
        nums.save(&json!({"id": id, "v": v})).unwrap();
    }

    let page = nums
        .query(
            None,
            QueryParams::new()
                .with_sort_field("v")
                .with_limit(2)
                .with_offset(0),
        )
        .unwrap();
    assert_eq!(ids(page), vec!["b", "c"]);

    let shifted = nums
        .query(
            None,
            QueryParams::new()
                .with_sort_field("v")
                .with_limit(2)
                .with_offset(1),
        )
        .unwrap();
    assert_eq!(ids(shifted), vec!["c", "a"]);

    let top = nums
        .query(
            None,
            QueryParams::new()
                .with_sort_field("v")
                .descending()
                .with_limit(1),
        )
        .unwrap();
    assert_eq!(ids(top), vec!["a"]);
}

#[test]
fn s5_transaction_rollback() {
    let (db, _dir) = open_store();
    let col = db.collection("tx", true).unwrap();

    db.start_transaction().unwrap();
    col.save(&json!({"id": "x1", "v": 1})).unwrap();
    col.save(&json!({"id": "x2", "v": 2})).unwrap();
    db.rollback_transaction().unwrap();

    assert!(matches!(col.get("x1"), Err(PersistError::NotFound(_))));
    assert!(matches!(col.get("x2"), Err(PersistError::NotFound(_))));
}

#[test]
fn s6_bulk_save_under_transaction() {
    let (db, _dir) = open_store();
    let col = db.collection("bulk", true).unwrap();

    assert!(!db.in_transaction().unwrap());
    db.start_transaction().unwrap();
    assert!(db.in_transaction().unwrap());

    col.save_many(&[
        json!({"id": "k1", "v": 1}),
        json!({"id": "k2", "v": 2}),
        json!({"id": "k3", "v": 3}),
    ])
    .unwrap();

    db.commit_transaction().unwrap();
    assert!(!db.in_transaction().unwrap());

    assert_eq!(col.count(None).unwrap(), 3);
}

#[test]
fn s7_count_with_predicate() {
    let (db, _dir) = open_store();
    let users = db.collection("users", true).unwrap();

    for (id, age) in [("u1", 30), ("u2", 40), ("u3", 30)] {
        users.save(&json!({"id": id, "age": age})).unwrap();
    }

    assert_eq!(users.count(Some(&json!([["age", "=", 30]]))).unwrap(), 2);
}

// ---------------------------------------------------------------------------
// Catalog invariants
// ---------------------------------------------------------------------------

#[test]
fn catalog_tracks_collection_lifecycle() {
    let (db, _dir) = open_store();

    assert!(!db.collection_exists("events").unwrap());
    assert!(matches!(
        db.collection("events", false),
        Err(PersistError::NotFound(_))
    ));

    db.collection("events", true).unwrap();
    assert!(db.collection_exists("events").unwrap());

    let mut seen = Vec::new();
    db.collections_apply(|name| {
        seen.push(name.to_string());
        true
    })
    .unwrap();
    assert_eq!(seen, vec!["events".to_string()]);

    db.remove_collection("events").unwrap();
    assert!(!db.collection_exists("events").unwrap());
}

#[test]
fn collections_apply_stops_early() {
    let (db, _dir) = open_store();

    for name in ["a", "b", "c"] {
        db.collection(name, true).unwrap();
    }

    let mut seen = 0;
    db.collections_apply(|_| {
        seen += 1;
        false
    })
    .unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn metadata_round_trip() {
    let (db, _dir) = open_store();
    db.collection("users", true).unwrap();

    assert_eq!(db.collection_metadata("users").unwrap(), json!({}));

    db.set_collection_metadata("users", &json!({"owner": "ann", "version": 2}))
        .unwrap();
    assert_eq!(
        db.collection_metadata("users").unwrap(),
        json!({"owner": "ann", "version": 2})
    );

    assert!(matches!(
        db.collection_metadata("missing"),
        Err(PersistError::NotFound(_))
    ));
}

#[test]
fn removed_collection_can_be_recreated_empty() {
    let (db, _dir) = open_store();

    let col = db.collection("scratch", true).unwrap();
    col.save(&json!({"id": "x", "v": 1})).unwrap();

    db.remove_collection("scratch").unwrap();

    let recreated = db.collection("scratch", true).unwrap();
    assert_eq!(recreated.count(None).unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Document invariants
// ---------------------------------------------------------------------------

#[test]
fn round_trip_preserves_payload() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    let doc = json!({
        "id": "d1",
        "title": "Zażółć gęślą jaźń",
        "count": 42,
        "ratio": 0.5,
        "nested": {"tags": ["a", "b"], "ok": true},
        "nothing": null
    });

    docs.save(&doc).unwrap();
    assert_eq!(docs.get("d1").unwrap(), doc);
}

#[test]
fn save_does_not_mutate_the_callers_document() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    let doc = json!({"id": "d1", "v": 1});
    docs.save(&doc).unwrap();
    assert_eq!(doc, json!({"id": "d1", "v": 1}));
}

#[test]
fn save_rejects_documents_without_a_string_id() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    assert!(matches!(
        docs.save(&json!({"name": "no id"})),
        Err(PersistError::InvalidArgument(_))
    ));
    assert!(matches!(
        docs.save(&json!({"id": 7})),
        Err(PersistError::InvalidArgument(_))
    ));
    assert!(matches!(
        docs.save(&json!("not a mapping")),
        Err(PersistError::InvalidArgument(_))
    ));
}

#[test]
fn delete_twice_then_get_reports_not_found() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    docs.save(&json!({"id": "d1", "v": 1})).unwrap();
    docs.delete("d1").unwrap();
    docs.delete("d1").unwrap();
    assert!(matches!(docs.get("d1"), Err(PersistError::NotFound(_))));
}

#[test]
fn unfiltered_query_returns_every_saved_id() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    let mut expected = BTreeSet::new();
    for i in 0..10 {
        let id = format!("d{i}");
        docs.save(&json!({"id": id, "v": i})).unwrap();
        expected.insert(id);
    }

    assert_eq!(id_set(&docs, None), expected);
}

// ---------------------------------------------------------------------------
// Query behavior
// ---------------------------------------------------------------------------

#[test]
fn single_parameter_caps_the_result_at_one_row() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    for i in 0..5 {
        docs.save(&json!({"id": format!("d{i}"), "v": i})).unwrap();
    }

    let rows = ids(docs
        .query(None, QueryParams::new().single().with_limit(4))
        .unwrap());
    assert_eq!(rows.len(), 1);
}

#[test]
fn count_parameter_yields_a_single_integer() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    for i in 0..5 {
        docs.save(&json!({"id": format!("d{i}"), "v": i})).unwrap();
    }

    let mut iter = docs.query(None, QueryParams::new().counting()).unwrap();
    assert_eq!(iter.next_document().unwrap(), Some(json!(5)));
    assert_eq!(iter.next_document().unwrap(), None);
}

#[test]
fn callback_false_ends_iteration_early() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    for i in 0..5 {
        docs.save(&json!({"id": format!("d{i}"), "v": i})).unwrap();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let params = QueryParams::new().with_callback(Arc::new(move |_doc: &Value| {
        counter.fetch_add(1, Ordering::SeqCst) < 1
    }));

    let mut iter = docs.query(None, params).unwrap();
    let mut yielded = 0;
    while iter.next_document().unwrap().is_some() {
        yielded += 1;
    }

    assert_eq!(yielded, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn nor_selects_the_complement() {
    let (db, _dir) = open_store();
    let users = db.collection("users", true).unwrap();

    for (id, age) in [("u1", 30), ("u2", 40), ("u3", 50)] {
        users.save(&json!({"id": id, "age": age})).unwrap();
    }

    assert_eq!(
        id_set(
            &users,
            Some(&json!([["nor", [["age", "=", 30], ["age", "=", 40]]]]))
        ),
        BTreeSet::from(["u3".to_string()])
    );
}

#[test]
fn dotted_paths_reach_nested_fields() {
    let (db, _dir) = open_store();
    let users = db.collection("users", true).unwrap();

    users
        .save(&json!({"id": "u1", "address": {"city": "Krakow"}}))
        .unwrap();
    users
        .save(&json!({"id": "u2", "address": {"city": "Gdansk"}}))
        .unwrap();

    assert_eq!(
        id_set(&users, Some(&json!([["address.city", "=", "Krakow"]]))),
        BTreeSet::from(["u1".to_string()])
    );

    let sorted = users
        .query(None, QueryParams::new().with_sort_field("address.city"))
        .unwrap();
    assert_eq!(ids(sorted), vec!["u2", "u1"]);
}

#[test]
fn malformed_rule_trees_are_rejected_whole() {
    let (db, _dir) = open_store();
    let users = db.collection("users", true).unwrap();
    users.save(&json!({"id": "u1", "age": 30})).unwrap();

    for bad in [
        json!({"age": 30}),
        json!([["age", "=", 30, 40]]),
        json!([["age", "===", 30]]),
        json!([["and", "oops"]]),
        json!([["xor", [["age", "=", 30]]]]),
    ] {
        assert!(matches!(
            users.query(Some(&bad), QueryParams::new()),
            Err(PersistError::InvalidArgument(_))
        ));
    }
}

#[test]
fn queries_work_with_a_secondary_index() {
    let (db, _dir) = open_store();
    let users = db.collection("users", true).unwrap();

    for i in 0..20 {
        users
            .save(&json!({"id": format!("u{i}"), "age": i % 4}))
            .unwrap();
    }

    users.add_index("age", "age").unwrap();
    assert_eq!(users.count(Some(&json!([["age", "=", 1]]))).unwrap(), 5);

    users.drop_index("age").unwrap();
    assert_eq!(users.count(Some(&json!([["age", "=", 1]]))).unwrap(), 5);
}

// ---------------------------------------------------------------------------
// Predicate soundness: SQL results agree with the in-memory evaluator
// ---------------------------------------------------------------------------

#[test]
fn sql_and_in_memory_evaluation_agree() {
    let (db, _dir) = open_store();
    let people = db.collection("people", true).unwrap();

    let docs: Vec<Value> = (0..12)
        .map(|i| {
            json!({
                "id": format!("p{i}"),
                "age": 20 + (i * 3) % 20,
                "name": (["Ann", "Annabel", "Bob", "Cleo"][(i % 4) as usize]),
                "score": (i as f64) / 2.0,
            })
        })
        .collect();

    for doc in &docs {
        people.save(doc).unwrap();
    }

    let trees = [
        json!([["age", "=", 26]]),
        json!([["age", ">", 26]]),
        json!([["age", "<=", 29], ["name", "!=", "Bob"]]),
        json!([["or", [["name", "=", "Ann"], ["name", "=", "Cleo"]]]]),
        json!([["nor", [["age", "<", 30], ["name", "=", "Bob"]]]]),
        json!([["name", "~", "Ann.*"]]),
        json!([["name", "match", "A*"]]),
        json!([["and", [["age", ">=", 20], ["or", [["score", "<", 2.0], ["name", "=", "Bob"]]]]]]),
    ];

    for tree in &trees {
        let via_sql = id_set(&people, Some(tree));

        let rules = Rule::parse_list(tree).unwrap();
        let via_memory: BTreeSet<String> = docs
            .iter()
            .filter(|doc| rules_match(&rules, doc).unwrap())
            .map(|doc| doc["id"].as_str().unwrap().to_string())
            .collect();

        assert_eq!(via_sql, via_memory, "rule tree {tree}");
    }
}

// ---------------------------------------------------------------------------
// Error channel
// ---------------------------------------------------------------------------

#[test]
fn open_with_unknown_driver_reports_not_found() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();

    let result = persist::open(dir.path().join("x.db"), "no-such-driver", None);
    assert!(matches!(result, Err(PersistError::NotFound(_))));

    let (code, message) = last_error().expect("error slot populated");
    assert_eq!(code, ErrorCode::NotFound);
    assert!(message.contains("no-such-driver"));
}

#[test]
fn threads_observe_only_their_own_errors() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    let a = {
        let docs = docs.clone();
        std::thread::spawn(move || {
            let _ = docs.get("missing-a");
            last_error()
        })
    };

    let b = {
        let docs = docs.clone();
        std::thread::spawn(move || {
            let _ = docs.query(Some(&json!([["age", "?", 1]])), QueryParams::new());
            last_error()
        })
    };

    let (code_a, message_a) = a.join().unwrap().expect("thread a error");
    let (code_b, message_b) = b.join().unwrap().expect("thread b error");

    assert_eq!(code_a, ErrorCode::NotFound);
    assert!(message_a.contains("missing-a"));
    assert_eq!(code_b, ErrorCode::InvalidArgument);
    assert!(message_b.contains("invalid operator"));
}

#[test]
fn last_error_tracks_the_most_recent_failure_on_a_thread() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    let _ = docs.get("first-miss");
    let (_, first) = last_error().unwrap();
    assert!(first.contains("first-miss"));

    let _ = docs.save(&json!({"no": "id"}));
    let (code, _) = last_error().unwrap();
    assert_eq!(code, ErrorCode::InvalidArgument);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn parallel_writers_land_every_document() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let docs = docs.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    docs.save(&json!({"id": format!("t{t}-{i}"), "v": i}))
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(docs.count(None).unwrap(), 100);
}

#[test]
fn committed_writes_are_visible_to_other_threads() {
    let (db, _dir) = open_store();
    let docs = db.collection("docs", true).unwrap();

    db.start_transaction().unwrap();
    docs.save(&json!({"id": "seen", "v": 1})).unwrap();
    db.commit_transaction().unwrap();

    let reader = {
        let docs = docs.clone();
        std::thread::spawn(move || docs.get("seen").unwrap())
    };

    assert_eq!(reader.join().unwrap()["v"], 1);
}
