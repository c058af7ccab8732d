//! Command surface against the in-memory store
//!
//! Run with: cargo test -p docrelay-mongodb --test test_commands

use bson::{doc, Bson};
use docrelay_mongodb::{
    Commands, ConnectionConfig, DocRelayError, IndexOptions, MemoryConnector, MemoryStore, Page,
    Supervisor, TTL_FIELD,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    commands: Commands,
    supervisor: Arc<Supervisor>,
    store: Arc<MemoryStore>,
}

fn config() -> ConnectionConfig {
    ConnectionConfig::builder()
        .user("app")
        .password("secret")
        .host("memory:27017")
        .database("test_db")
        .build()
}

async fn ready() -> Harness {
    let store = Arc::new(MemoryStore::new("test_db"));
    let connector = Arc::new(MemoryConnector::new(store.clone()));
    let supervisor = Arc::new(Supervisor::new(config(), connector));
    supervisor.spawn();
    assert_ok!(supervisor.wait_ready().await);
    Harness {
        commands: Commands::new(supervisor.clone()),
        supervisor,
        store,
    }
}

#[tokio::test]
async fn test_set_stamps_ttl_without_touching_input() {
    let h = ready().await;
    let data = doc! { "name": "alice", "visits": 1 };

    let outcome = assert_ok!(h.commands.set("users", doc! { "_id": "u1" }, &data).await);
    assert_eq!(outcome.upserted_id, Some(Bson::String("u1".to_string())));
    assert_eq!(data, doc! { "name": "alice", "visits": 1 });

    let found = assert_ok!(h.commands.find("users", doc! { "_id": "u1" }, None).await);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get_str("name").unwrap(), "alice");
    let stamped = found[0].get_datetime(TTL_FIELD).unwrap().timestamp_millis();
    let now = bson::DateTime::now().timestamp_millis();
    assert!((0..5_000).contains(&(now - stamped)), "TTL is {}ms old", now - stamped);
}

#[tokio::test]
async fn test_set_keeps_caller_ttl() {
    let h = ready().await;
    let fixed = bson::DateTime::from_millis(1_000);
    assert_ok!(
        h.commands
            .set_many("users", doc! { "_id": "u1" }, &doc! { "TTL": fixed })
            .await
    );
    let found = assert_ok!(h.commands.find("users", doc! {}, None).await);
    assert_eq!(found[0].get_datetime(TTL_FIELD).unwrap(), &fixed);
}

#[tokio::test]
async fn test_insert_and_count() {
    let h = ready().await;
    let data = doc! { "kind": "event" };
    let id = assert_ok!(h.commands.insert("events", &data).await);
    assert!(matches!(id, Bson::ObjectId(_)));
    assert!(!data.contains_key("_id"));
    assert!(!data.contains_key(TTL_FIELD));

    assert_ok!(h.commands.insert("events", &doc! { "kind": "other" }).await);
    assert_eq!(assert_ok!(h.commands.count("events", doc! {}).await), 2);
    assert_eq!(
        assert_ok!(h.commands.count("events", doc! { "kind": "event" }).await),
        1
    );
}

#[tokio::test]
async fn test_limit_and_skip_pages() {
    let h = ready().await;
    for n in 0..120 {
        assert_ok!(h.commands.insert("items", &doc! { "n": n }).await);
    }

    let first = assert_ok!(
        h.commands
            .limit("items", doc! {}, Some(doc! { "n": 1, "_id": 0 }), 50)
            .await
    );
    assert_eq!(first.len(), 50);
    assert_eq!(first[0], doc! { "n": 0 });

    let second = assert_ok!(
        h.commands
            .skip("items", doc! {}, None, Page::default())
            .await
    );
    assert_eq!(second.len(), 50);
    assert_eq!(second[0].get_i32("n").unwrap(), 50);

    let tail = assert_ok!(
        h.commands
            .skip("items", doc! {}, None, Page { limit: 50, skip: 100 })
            .await
    );
    assert_eq!(tail.len(), 20);
}

#[tokio::test]
async fn test_rep_replaces_whole_document() {
    let h = ready().await;
    assert_ok!(
        h.commands
            .set("users", doc! { "_id": "u1" }, &doc! { "a": 1, "b": 2 })
            .await
    );
    assert_ok!(
        h.commands
            .rep("users", doc! { "_id": "u1" }, &doc! { "c": 3 })
            .await
    );

    let found = assert_ok!(h.commands.find("users", doc! { "_id": "u1" }, None).await);
    assert!(!found[0].contains_key("a"));
    assert_eq!(found[0].get_i32("c").unwrap(), 3);
    assert!(found[0].get_datetime(TTL_FIELD).is_ok());
}

#[tokio::test]
async fn test_math_push_pull_unset() {
    let h = ready().await;
    let filter = doc! { "_id": "stats" };

    // math and push upsert
    assert_ok!(h.commands.math("stats", filter.clone(), &doc! { "hits": 2 }).await);
    assert_ok!(h.commands.math("stats", filter.clone(), &doc! { "hits": 3 }).await);
    assert_ok!(h.commands.push("stats", filter.clone(), &doc! { "tags": "a" }).await);
    assert_ok!(h.commands.push("stats", filter.clone(), &doc! { "tags": "b" }).await);

    let found = assert_ok!(h.commands.find("stats", filter.clone(), None).await);
    assert_eq!(found[0].get_i32("hits").unwrap(), 5);
    assert_eq!(
        found[0].get_array("tags").unwrap(),
        &vec![Bson::from("a"), Bson::from("b")]
    );

    assert_ok!(h.commands.pull("stats", filter.clone(), &doc! { "tags": "a" }).await);
    assert_ok!(h.commands.unset("stats", filter.clone(), &doc! { "hits": "" }).await);
    let found = assert_ok!(h.commands.find("stats", filter, None).await);
    assert_eq!(found[0].get_array("tags").unwrap(), &vec![Bson::from("b")]);
    assert!(!found[0].contains_key("hits"));
}

#[tokio::test]
async fn test_pull_and_unset_do_not_upsert() {
    let h = ready().await;
    let outcome = assert_ok!(
        h.commands
            .pull("stats", doc! { "_id": "missing" }, &doc! { "tags": "a" })
            .await
    );
    assert_eq!(outcome.matched_count, 0);
    assert_eq!(outcome.upserted_id, None);
    assert_ok!(
        h.commands
            .unset("stats", doc! { "_id": "missing" }, &doc! { "x": "" })
            .await
    );
    assert_eq!(assert_ok!(h.commands.count("stats", doc! {}).await), 0);
}

#[tokio::test]
async fn test_next_counts_from_one() {
    let h = ready().await;
    let filter = doc! { "_id": "orders" };
    assert_eq!(assert_ok!(h.commands.next("counters", filter.clone(), "seq").await), 1);
    assert_eq!(assert_ok!(h.commands.next("counters", filter.clone(), "seq").await), 2);
    assert_eq!(
        assert_ok!(h.commands.next("counters", doc! { "_id": "invoices" }, "seq").await),
        1
    );

    // Existing document without the counter field
    assert_ok!(
        h.commands
            .set("counters", doc! { "_id": "plain" }, &doc! { "label": "x" })
            .await
    );
    assert_eq!(
        assert_ok!(h.commands.next("counters", doc! { "_id": "plain" }, "seq").await),
        1
    );
}

#[tokio::test]
async fn test_next_is_unique_under_concurrency() {
    let h = ready().await;
    let calls = (0..50).map(|_| {
        let commands = h.commands.clone();
        tokio::spawn(async move {
            commands
                .next("counters", doc! { "_id": "orders" }, "seq")
                .await
        })
    });

    let mut seen = HashSet::new();
    for result in futures::future::join_all(calls).await {
        let value = assert_ok!(result.unwrap());
        assert!(seen.insert(value), "duplicate counter value {}", value);
    }
    assert_eq!(seen, (1..=50).collect::<HashSet<i64>>());
}

#[tokio::test]
async fn test_next_rejects_operator_field() {
    let h = ready().await;
    let err = assert_err!(h.commands.next("counters", doc! { "_id": "x" }, "$seq").await);
    assert!(matches!(err, DocRelayError::Validation(_)));
}

#[tokio::test]
async fn test_del_and_del_many() {
    let h = ready().await;
    for n in 0..4 {
        assert_ok!(h.commands.insert("jobs", &doc! { "state": "done", "n": n }).await);
    }
    assert_eq!(assert_ok!(h.commands.del("jobs", doc! { "state": "done" }).await), 1);
    assert_eq!(assert_ok!(h.commands.del_many("jobs", doc! { "state": "done" }).await), 3);
    assert_eq!(assert_ok!(h.commands.del("jobs", doc! {}).await), 0);
}

#[tokio::test]
async fn test_create_index_requires_keys() {
    let h = ready().await;
    let err = assert_err!(h.commands.create_index("users", None, IndexOptions::default()).await);
    assert!(matches!(err, DocRelayError::Validation(_)));
    let err = assert_err!(
        h.commands
            .create_index("users", Some(doc! {}), IndexOptions::default())
            .await
    );
    assert!(matches!(err, DocRelayError::Validation(_)));
}

#[tokio::test]
async fn test_create_and_list_indexes() {
    let h = ready().await;
    assert_ok!(h.commands.insert("users", &doc! { "email": "a@x" }).await);

    let options = assert_ok!(IndexOptions::from_document(doc! { "unique": true }));
    let name = assert_ok!(
        h.commands
            .create_index("users", Some(doc! { "email": 1 }), options)
            .await
    );
    assert_eq!(name, "email_1");

    let indexes = assert_ok!(h.commands.list_indexes("users").await);
    let names: Vec<&str> = indexes
        .iter()
        .filter_map(|i| i.get_str("name").ok())
        .collect();
    assert_eq!(names, vec!["_id_", "email_1"]);
    assert!(indexes[1].get_bool("background").unwrap());

    let err = assert_err!(h.commands.insert("users", &doc! { "email": "a@x" }).await);
    assert!(matches!(err, DocRelayError::Store(_)));
}

#[tokio::test]
async fn test_index_options_reject_unknown_keys() {
    let err = assert_err!(IndexOptions::from_document(doc! { "uniq": true }));
    assert!(matches!(err, DocRelayError::Validation(_)));
}

#[tokio::test]
async fn test_aggregate_prepends_match() {
    let h = ready().await;
    for (team, score) in [("red", 1), ("red", 4), ("blue", 3), ("red", 2)] {
        assert_ok!(h.commands.insert("scores", &doc! { "team": team, "score": score }).await);
    }

    let top = assert_ok!(
        h.commands
            .aggregate(
                "scores",
                Some(doc! { "team": "red" }),
                vec![doc! { "$sort": { "score": -1 } }, doc! { "$limit": 2 }],
            )
            .await
    );
    let scores: Vec<i32> = top.iter().map(|d| d.get_i32("score").unwrap()).collect();
    assert_eq!(scores, vec![4, 2]);

    let counted = assert_ok!(
        h.commands
            .aggregate("scores", None, vec![doc! { "$count": "total" }])
            .await
    );
    assert_eq!(counted, vec![doc! { "total": 4_i64 }]);
}

#[tokio::test(start_paused = true)]
async fn test_status_follows_connection() {
    let h = ready().await;
    assert!(h.commands.status());

    h.store.set_online(false);
    h.supervisor.reconnect();
    assert!(!h.commands.status());
    let err = assert_err!(h.commands.find("users", doc! {}, None).await);
    assert!(err.is_not_ready());

    // Let a few retries fail while offline
    tokio::time::sleep(std::time::Duration::from_secs(12)).await;
    assert!(!h.commands.status());

    h.store.set_online(true);
    assert_ok!(h.supervisor.wait_ready().await);
    assert!(h.commands.status());
    assert_ok!(h.commands.find("users", doc! {}, None).await);
}

#[tokio::test]
async fn test_every_command_fails_after_shutdown() {
    let h = ready().await;
    h.supervisor.shutdown();
    assert!(!h.commands.status());

    let filter = doc! { "_id": 1 };
    let data = doc! { "a": 1 };
    let c = &h.commands;
    let results = vec![
        c.find("c", filter.clone(), None).await.map(|_| ()),
        c.limit("c", filter.clone(), None, 5).await.map(|_| ()),
        c.skip("c", filter.clone(), None, Page::default()).await.map(|_| ()),
        c.count("c", filter.clone()).await.map(|_| ()),
        c.insert("c", &data).await.map(|_| ()),
        c.set("c", filter.clone(), &data).await.map(|_| ()),
        c.set_many("c", filter.clone(), &data).await.map(|_| ()),
        c.rep("c", filter.clone(), &data).await.map(|_| ()),
        c.math("c", filter.clone(), &data).await.map(|_| ()),
        c.push("c", filter.clone(), &data).await.map(|_| ()),
        c.pull("c", filter.clone(), &data).await.map(|_| ()),
        c.unset("c", filter.clone(), &data).await.map(|_| ()),
        c.next("c", filter.clone(), "seq").await.map(|_| ()),
        c.del("c", filter.clone()).await.map(|_| ()),
        c.del_many("c", filter.clone()).await.map(|_| ()),
        c.create_index("c", Some(data.clone()), IndexOptions::default()).await.map(|_| ()),
        c.list_indexes("c").await.map(|_| ()),
        c.aggregate("c", None, vec![]).await.map(|_| ()),
    ];
    for result in results {
        assert!(result.unwrap_err().is_not_ready());
    }
}
