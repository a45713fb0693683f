use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tokio::sync::watch;

use moustique_persistence::KvStore;
use moustique_utils::time;

use crate::engine::{Broker, BrokerOptions};
use crate::manager::BrokerManager;
use crate::message::Message;
use crate::topic::expand;

fn test_broker() -> (Broker, TempDir) {
    test_broker_with(BrokerOptions::default())
}

fn test_broker_with(options: BrokerOptions) -> (Broker, TempDir) {
    let dir = tempdir().unwrap();
    let db = KvStore::open(dir.path().join("moustique.db")).unwrap();
    (Broker::new(db, None, options), dir)
}

// --- topic expansion ---

#[test]
fn expand_three_level_topic() {
    assert_eq!(expand("/a/b/c"), ["/a/b/c", "/a/+/c", "/a/b/+", "/a/+/+"]);
}

#[test]
fn expand_four_level_topic() {
    assert_eq!(
        expand("/m/logs/lib/INFO"),
        [
            "/m/logs/lib/INFO",
            "/m/logs/+/INFO",
            "/m/logs/lib/+",
            "/m/+/lib/INFO",
            "/m/logs/+/+",
            "/m/+/+/+",
        ]
    );
}

#[test]
fn expand_two_level_topic() {
    assert_eq!(expand("/weather/today"), ["/weather/today", "/weather/+"]);
}

#[test]
fn expand_is_deterministic() {
    assert_eq!(expand("/a/b/c/d/e"), expand("/a/b/c/d/e"));
}

#[test]
fn expand_suppresses_duplicate_patterns() {
    // Repeated segments make the masked and substituted branches collide.
    assert_eq!(expand("/a/b/b"), ["/a/b/b", "/a/+/b", "/a/+/+"]);

    let patterns = expand("/a/b/a/b");
    let mut deduped = patterns.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(patterns.len(), deduped.len());
}

#[test]
fn expand_never_emits_global_wildcard() {
    assert!(!expand("/a/b/c").iter().any(|p| p == "#"));
}

#[test]
fn expand_topic_without_slashes_is_empty() {
    assert!(expand("plain").is_empty());
    assert!(expand("").is_empty());
}

// --- subscribe / publish / pickup ---

#[test]
fn subscribe_rejects_empty_client_name() {
    let (broker, _dir) = test_broker();
    assert!(broker.subscribe("/t", "", "127.0.0.1").is_err());
}

#[test]
fn subscribed_client_receives_matching_publish() {
    let (broker, _dir) = test_broker();
    broker.subscribe("/weather/+", "X", "127.0.0.1").unwrap();
    broker
        .publish("/weather/today", "sunny", "W1", "10.0.0.1", 100)
        .unwrap();

    let picked = broker.pickup("X", "127.0.0.1");
    assert_eq!(picked.len(), 1);
    let msgs = picked.get("/weather/+").expect("matched pattern key");
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].topic, "/weather/today");
    assert_eq!(msgs[0].message, "sunny");
    assert_eq!(msgs[0].from, "W1");
    assert_eq!(msgs[0].updated_time, 100);
}

#[test]
fn pickup_drains_only_that_client() {
    let (broker, _dir) = test_broker();
    broker.subscribe("#", "A", "127.0.0.1").unwrap();
    broker.subscribe("#", "B", "127.0.0.1").unwrap();
    for n in 0..3 {
        broker
            .publish("/t/sub", &format!("m{n}"), "P", "127.0.0.1", 100 + n)
            .unwrap();
    }

    let picked_a = broker.pickup("A", "127.0.0.1");
    let bodies: Vec<&str> = picked_a["#"].iter().map(|m| m.message.as_str()).collect();
    assert_eq!(bodies, ["m0", "m1", "m2"]);

    // B's queue is untouched by A's pickup.
    let picked_b = broker.pickup("B", "127.0.0.1");
    assert_eq!(picked_b["#"].len(), 3);
}

#[test]
fn second_pickup_is_empty() {
    let (broker, _dir) = test_broker();
    broker.subscribe("/a/+", "C", "127.0.0.1").unwrap();
    broker.publish("/a/b", "m", "P", "127.0.0.1", 1).unwrap();

    assert_eq!(broker.pickup("C", "127.0.0.1").len(), 1);
    assert!(broker.pickup("C", "127.0.0.1").is_empty());

    // Messages enqueued after a pickup arrive on the next one.
    broker.publish("/a/b", "m2", "P", "127.0.0.1", 2).unwrap();
    assert_eq!(broker.pickup("C", "127.0.0.1")["/a/+"].len(), 1);
}

#[test]
fn duplicate_subscribe_queues_messages_once() {
    let (broker, _dir) = test_broker();
    broker.subscribe("/a/+", "C", "127.0.0.1").unwrap();
    broker.subscribe("/a/+", "C", "127.0.0.1").unwrap();
    broker.publish("/a/b", "m", "P", "127.0.0.1", 1).unwrap();

    assert_eq!(broker.pickup("C", "127.0.0.1")["/a/+"].len(), 1);
}

#[test]
fn fanned_out_message_records_its_subscribers() {
    let (broker, _dir) = test_broker();
    broker.subscribe("/a/+", "C1", "127.0.0.1").unwrap();
    broker.subscribe("#", "C2", "127.0.0.1").unwrap();
    broker.publish("/a/b", "m", "P", "127.0.0.1", 1).unwrap();

    let stored = broker.get_value("/a/b").unwrap();
    let subscribers = stored.subscribers.expect("subscriber set");
    assert!(subscribers.contains_key("C1"));
    assert!(subscribers.contains_key("C2"));
}

// --- last-value store ---

#[test]
fn publish_without_subscribers_still_stores_last_value() {
    let (broker, _dir) = test_broker();
    broker.publish("/lone/topic", "v", "", "127.0.0.1", 5).unwrap();

    let stored = broker.get_value("/lone/topic").unwrap();
    assert_eq!(stored.message, "v");
    assert_eq!(stored.from, "UNKNOWN");
    assert_eq!(stored.ip, "127.0.0.1");
}

#[test]
fn last_value_tracks_latest_publish() {
    let (broker, _dir) = test_broker();
    broker.publish("/t", "first", "P", "127.0.0.1", 1).unwrap();
    broker.publish("/t", "second", "P", "127.0.0.1", 2).unwrap();

    assert_eq!(broker.get_value("/t").unwrap().message, "second");
}

#[test]
fn put_value_and_regex_lookup() {
    let (broker, _dir) = test_broker();
    broker.put_value("k1", "v1", "", "tester", 42).unwrap();

    let value = broker.get_value("k1").unwrap();
    assert_eq!(value.message, "v1");
    assert_eq!(value.from, "tester");
    assert!(value.topic.is_empty());
    assert!(value.subscribers.is_none());

    let matches = broker.get_values_by_regex("^k").unwrap();
    assert!(matches.contains_key("k1"));
}

#[test]
fn put_value_falls_back_to_message_body() {
    let (broker, _dir) = test_broker();
    broker.put_value("k2", "", "fallback", "t", 1).unwrap();
    assert_eq!(broker.get_value("k2").unwrap().message, "fallback");
}

#[test]
fn get_value_for_missing_key_is_an_error() {
    let (broker, _dir) = test_broker();
    assert!(broker.get_value("/absent").is_err());
}

#[test]
fn get_values_by_regex_rejects_malformed_pattern() {
    let (broker, _dir) = test_broker();
    assert!(broker.get_values_by_regex("(unclosed").is_err());
}

#[test]
fn get_values_by_regex_skips_undecodable_values() {
    let (broker, _dir) = test_broker();
    broker.put_value("jk", "v", "", "t", 1).unwrap();
    broker.store().put("junk", "not json");

    let matches = broker.get_values_by_regex("^j").unwrap();
    assert!(matches.contains_key("jk"));
    assert!(!matches.contains_key("junk"));
}

// --- posters ---

#[test]
fn poster_stats_accumulate() {
    let (broker, _dir) = test_broker();
    for n in 0..50 {
        broker
            .publish("/p/t", &format!("m{n}"), "P", "127.0.0.1", 100 + n)
            .unwrap();
    }

    let posters = broker.get_posters();
    assert_eq!(posters.len(), 1);
    let poster = &posters[0];
    assert_eq!(poster.name, "P");
    assert_eq!(poster.message_count, 50);
    assert_eq!(poster.first_seen, 100);
    assert_eq!(poster.latest_post_time, 149);

    let latest = poster.latest_post.as_ref().expect("latest post");
    assert_eq!(latest.message, "m49");
    assert_eq!(latest.updated_time, 149);
}

#[test]
fn poster_tracks_latest_post_per_topic() {
    let (broker, _dir) = test_broker();
    broker.publish("/t/1", "a", "P", "127.0.0.1", 1).unwrap();
    broker.publish("/t/2", "b", "P", "127.0.0.1", 2).unwrap();
    broker.publish("/t/1", "c", "P", "127.0.0.1", 3).unwrap();

    let posters = broker.get_posters();
    let by_topic = &posters[0].latest_posts_by_topic;
    assert_eq!(by_topic["/t/1"].message, "c");
    assert_eq!(by_topic["/t/2"].message, "b");
}

// --- system messages ---

#[test]
fn system_messages_delivered_once_per_client() {
    let (broker, _dir) = test_broker();
    broker.subscribe("/t", "C", "127.0.0.1").unwrap();

    // Delivery is gated by "newer than the last system pickup", in whole
    // seconds; let the clock move past the subscription timestamp.
    std::thread::sleep(Duration::from_millis(1100));
    broker.publish_system_message("/notices", "maintenance at noon");

    let first = broker.pickup("C", "127.0.0.1");
    let msgs = first.get("/notices").expect("system topic key");
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].from, "SERVER");
    assert_eq!(msgs[0].ip, "127.0.0.1");

    // Never twice.
    let second = broker.pickup("C", "127.0.0.1");
    assert!(second.get("/notices").is_none());
}

#[test]
fn unknown_client_sees_all_system_messages_without_state_change() {
    let (broker, _dir) = test_broker();
    broker.publish_system_message("/notices", "hello");

    let first = broker.pickup("ghost", "127.0.0.1");
    assert_eq!(first["/notices"].len(), 1);

    // No registry entry means nothing advances; a second pickup repeats.
    let second = broker.pickup("ghost", "127.0.0.1");
    assert_eq!(second["/notices"].len(), 1);
}

#[test]
fn system_entry_replaces_normal_entry_on_key_collision() {
    let (broker, _dir) = test_broker();
    // Subscribe to the exact string the server also uses as a system key.
    broker.subscribe("/alerts", "C", "127.0.0.1").unwrap();
    std::thread::sleep(Duration::from_millis(1100));

    broker
        .publish("/alerts", "user message", "P", "127.0.0.1", time::now())
        .unwrap();
    broker.publish_system_message("/alerts", "server message");

    let picked = broker.pickup("C", "127.0.0.1");
    let msgs = picked.get("/alerts").expect("collided key");
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].from, "SERVER");
    assert_eq!(msgs[0].message, "server message");
}

// --- stats and listings ---

#[test]
fn stats_reflect_activity() {
    let (broker, _dir) = test_broker();
    broker.subscribe("/a/+", "C", "127.0.0.1").unwrap();
    broker.publish("/a/b", "m", "P", "127.0.0.1", 1).unwrap();
    broker.pickup("C", "127.0.0.1");
    broker.note_request();

    let stats = broker.get_stats();
    assert_eq!(stats.subscription_count, 1);
    assert_eq!(stats.clients.subscribers, 1);
    assert_eq!(stats.clients.posters, 1);
    assert_eq!(stats.values, 1);
    assert_eq!(stats.requests.total, 1);
    assert_eq!(stats.requests.processed.total, 1);
    assert_eq!(stats.requests.pickups.total, 1);
    assert_eq!(stats.requests.getvals.total, 0);
}

#[test]
fn stats_survive_a_fresh_broker() {
    // Zero-denominator guards: a broker that has served nothing must not
    // divide by zero.
    let (broker, _dir) = test_broker();
    let stats = broker.get_stats();
    assert_eq!(stats.requests.total, 0);
    assert!(stats.requests.per_second.is_finite());
    assert!(stats.average_request_time_ms.is_finite());
}

#[test]
fn pickup_by_unknown_client_lists_a_name_only_record() {
    let (broker, _dir) = test_broker();
    broker.pickup("ghost", "127.0.0.1");

    let clients = broker.get_clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].name, "ghost");
    assert_eq!(clients[0].first_seen, 0);
}

#[test]
fn topics_come_from_the_store() {
    let (broker, _dir) = test_broker();
    broker.publish("/t/x", "m", "P", "127.0.0.1", 1).unwrap();
    broker.put_value("plain-key", "v", "", "t", 1).unwrap();

    let mut topics = broker.get_topics();
    topics.sort();
    assert_eq!(topics, ["/t/x", "plain-key"]);
}

// --- maintenance ---

#[test]
fn idle_clients_are_kicked() {
    let (broker, _dir) = test_broker_with(BrokerOptions {
        message_queue_timeout: Duration::from_secs(1),
        ..BrokerOptions::default()
    });

    broker.subscribe("/t/+", "sleepy", "127.0.0.1").unwrap();
    broker.subscribe("/t/+", "awake", "127.0.0.1").unwrap();

    std::thread::sleep(Duration::from_secs(2));
    broker.pickup("awake", "127.0.0.1");
    broker.kick_inactive_clients();

    let names: Vec<String> = broker.get_clients().into_iter().map(|c| c.name).collect();
    assert!(!names.contains(&"sleepy".to_string()));
    assert!(names.contains(&"awake".to_string()));

    // The surviving subscriber still receives messages.
    broker.publish("/t/x", "m", "P", "127.0.0.1", 1).unwrap();
    assert_eq!(broker.pickup("awake", "127.0.0.1")["/t/+"].len(), 1);
}

#[test]
fn kicking_last_subscriber_drops_the_pattern() {
    let (broker, _dir) = test_broker_with(BrokerOptions {
        message_queue_timeout: Duration::from_secs(1),
        ..BrokerOptions::default()
    });

    broker.subscribe("/t/+", "sleepy", "127.0.0.1").unwrap();
    assert_eq!(broker.get_stats().subscription_count, 1);

    std::thread::sleep(Duration::from_secs(2));
    broker.kick_inactive_clients();

    assert_eq!(broker.get_stats().subscription_count, 0);
    assert!(broker.get_clients().is_empty());
}

#[test]
fn stale_posters_are_cleared() {
    let (broker, _dir) = test_broker_with(BrokerOptions {
        poster_stats_timeout: Duration::from_secs(1),
        ..BrokerOptions::default()
    });

    broker
        .publish("/t", "m", "P", "127.0.0.1", time::now())
        .unwrap();
    assert_eq!(broker.get_posters().len(), 1);

    std::thread::sleep(Duration::from_secs(2));
    broker.clear_old_posters();
    assert!(broker.get_posters().is_empty());
}

#[test]
fn fresh_posters_survive_maintenance() {
    let (broker, _dir) = test_broker();
    broker
        .publish("/t", "m", "P", "127.0.0.1", time::now())
        .unwrap();
    broker.clear_old_posters();
    assert_eq!(broker.get_posters().len(), 1);
}

#[tokio::test]
async fn maintenance_task_stops_on_shutdown() {
    let (broker, _dir) = test_broker();
    let broker = Arc::new(broker);
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(Arc::clone(&broker).run_maintenance(rx));
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("maintenance task did not stop")
        .unwrap();
}

// --- tenant manager ---

#[tokio::test]
async fn tenants_are_isolated() {
    let dir = tempdir().unwrap();
    let manager = BrokerManager::new(dir.path(), BrokerOptions::default());
    let (_tx, rx) = watch::channel(false);
    manager.initialize_default(rx, true).unwrap();

    let a = manager.get_or_create("alice").unwrap();
    let b = manager.get_or_create("bob").unwrap();

    a.subscribe("/t/+", "CA", "127.0.0.1").unwrap();
    a.publish("/t/x", "m", "P", "127.0.0.1", 1).unwrap();

    // Nothing alice does is visible from bob's broker.
    assert_eq!(b.get_stats().requests.processed.total, 0);
    assert!(b.get_topics().is_empty());
    assert!(b.pickup("CA", "127.0.0.1").is_empty());

    let picked = a.pickup("CA", "127.0.0.1");
    assert_eq!(picked["/t/+"].len(), 1);
}

#[tokio::test]
async fn get_or_create_is_idempotent() {
    let dir = tempdir().unwrap();
    let manager = BrokerManager::new(dir.path(), BrokerOptions::default());
    let (_tx, rx) = watch::channel(false);
    manager.initialize_default(rx, false).unwrap();

    let first = manager.get_or_create("alice").unwrap();
    let second = manager.get_or_create("alice").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.tenant_names(), ["alice"]);
}

#[tokio::test]
async fn get_does_not_create() {
    let dir = tempdir().unwrap();
    let manager = BrokerManager::new(dir.path(), BrokerOptions::default());
    let (_tx, rx) = watch::channel(false);
    manager.initialize_default(rx, false).unwrap();

    assert!(manager.get("alice").is_none());
    manager.get_or_create("alice").unwrap();
    assert!(manager.get("alice").is_some());
}

#[tokio::test]
async fn get_or_create_requires_initialization() {
    let dir = tempdir().unwrap();
    let manager = BrokerManager::new(dir.path(), BrokerOptions::default());
    assert!(manager.get_or_create("alice").is_err());
}

#[tokio::test]
async fn initialize_default_only_builds_public_broker_when_allowed() {
    let dir = tempdir().unwrap();
    let manager = BrokerManager::new(dir.path(), BrokerOptions::default());
    let (_tx, rx) = watch::channel(false);
    manager.initialize_default(rx, false).unwrap();
    assert!(manager.default_broker().is_none());

    let dir2 = tempdir().unwrap();
    let manager2 = BrokerManager::new(dir2.path(), BrokerOptions::default());
    let (_tx2, rx2) = watch::channel(false);
    manager2.initialize_default(rx2, true).unwrap();
    assert!(manager2.default_broker().is_some());
    assert!(dir2.path().join("public").join("moustique.db").exists());
}

#[tokio::test]
async fn save_all_round_trips_through_fresh_store() {
    let dir = tempdir().unwrap();
    let manager = BrokerManager::new(dir.path(), BrokerOptions::default());
    let (_tx, rx) = watch::channel(false);
    manager.initialize_default(rx, false).unwrap();

    let alice = manager.get_or_create("alice").unwrap();
    alice.put_value("k", "v", "", "t", 9).unwrap();
    manager.save_all().unwrap();

    let store = KvStore::open(
        dir.path()
            .join("users")
            .join("alice")
            .join("moustique.db"),
    )
    .unwrap();
    store.load_all().unwrap();
    let msg: Message = serde_json::from_str(&store.get("k").unwrap()).unwrap();
    assert_eq!(msg.message, "v");
    assert_eq!(msg.from, "t");
}

#[tokio::test]
async fn tenant_log_is_written() {
    let dir = tempdir().unwrap();
    let manager = BrokerManager::new(dir.path(), BrokerOptions::default());
    let (_tx, rx) = watch::channel(false);
    manager.initialize_default(rx, false).unwrap();

    let alice = manager.get_or_create("alice").unwrap();
    alice.subscribe("/t", "C", "127.0.0.1").unwrap();

    let log_path = alice.user_log_path().expect("tenant log path");
    let content = std::fs::read_to_string(log_path).unwrap();
    assert!(content.contains("Broker initialized"));
    assert!(content.contains("New client: C"));
}
