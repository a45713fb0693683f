//! Broker engine.
//!
//! One `Broker` holds the complete in-memory state of a single tenant: the
//! subscription table, per-client message queues, client and poster
//! registries, the system-message queue, the expansion cache, counters, and
//! the tenant's last-value store. All mutation happens under one lock; the
//! public API is synchronous and designed to be held behind an `Arc` by the
//! transport layer. Everything returned is an owned copy, so no caller can
//! keep broker state borrowed across network I/O.
//!
//! The maintenance loop runs as one background task per broker and evicts
//! idle subscribers and stale posters on a timer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use moustique_persistence::KvStore;
use moustique_utils::logging::UserLog;
use moustique_utils::time;

use crate::error::BrokerError;
use crate::message::{Client, Message, Provider};
use crate::topic::{self, GLOBAL_WILDCARD};

/// Tunables for one broker instance.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub debug: bool,
    /// Subscribers idle longer than this are evicted by maintenance.
    pub message_queue_timeout: Duration,
    /// Posters whose latest post is older than this are dropped from stats.
    pub poster_stats_timeout: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            debug: false,
            message_queue_timeout: Duration::from_secs(5 * 60),
            poster_stats_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Running total plus a sliding one-minute window.
#[derive(Debug, Default)]
struct MinuteCounter {
    total: u64,
    window: u64,
    window_started: i64,
}

impl MinuteCounter {
    fn bump(&mut self, now: i64) {
        self.total += 1;
        if self.window_started == 0 || now - self.window_started > 60 {
            self.window_started = now;
            self.window = 0;
        }
        self.window += 1;
    }

    fn per_second(&self, started: i64, now: i64) -> f64 {
        let secs = (now - started).max(1);
        self.total as f64 / secs as f64
    }

    fn per_second_last_minute(&self, now: i64) -> f64 {
        let start = if self.window_started == 0 {
            now
        } else {
            self.window_started
        };
        let secs = (now - start).max(1);
        self.window as f64 / secs as f64
    }
}

#[derive(Default)]
struct BrokerState {
    /// client -> matched pattern -> messages awaiting pickup
    message_queue: HashMap<String, HashMap<String, Vec<Message>>>,
    /// topic -> broker-authored messages, kept for the tenant's lifetime
    system_message_queue: HashMap<String, Vec<Message>>,
    /// pattern -> subscribed client names, in subscription order
    subscriptions: HashMap<String, Vec<String>>,
    clients: HashMap<String, Client>,
    providers: HashMap<String, Provider>,
    /// topic -> expansion result; stable for the process lifetime
    expansion_cache: HashMap<String, Vec<String>>,
    requests: MinuteCounter,
    pickups: MinuteCounter,
    publishes: MinuteCounter,
    getvals: MinuteCounter,
    serve_time_ms: f64,
}

/// Point-in-time broker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub started: String,
    pub subscription_count: usize,
    pub average_request_time_ms: f64,
    pub values: usize,
    pub clients: ClientCounts,
    pub requests: RequestStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientCounts {
    pub subscribers: usize,
    pub posters: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestStats {
    pub per_second: f64,
    pub per_second_last_minute: f64,
    pub total: u64,
    pub pickups: RateStats,
    pub processed: RateStats,
    pub getvals: RateStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateStats {
    pub per_second: f64,
    pub per_second_last_minute: f64,
    pub total: u64,
}

/// Counters consumed by the admin user listing.
#[derive(Debug, Clone, Copy)]
pub struct UsageSummary {
    pub requests: u64,
    pub requests_last_minute: u64,
    pub messages: u64,
    pub messages_last_minute: u64,
    pub topics: usize,
    pub clients: usize,
}

pub struct Broker {
    state: RwLock<BrokerState>,
    db: KvStore,
    user_log: Option<UserLog>,
    debug: bool,
    started_time: i64,
    message_queue_timeout: Duration,
    poster_stats_timeout: Duration,
}

impl Broker {
    pub fn new(db: KvStore, user_log: Option<UserLog>, options: BrokerOptions) -> Self {
        Self {
            state: RwLock::new(BrokerState::default()),
            db,
            user_log,
            debug: options.debug,
            started_time: time::now(),
            message_queue_timeout: options.message_queue_timeout,
            poster_stats_timeout: options.poster_stats_timeout,
        }
    }

    /// The tenant's last-value store.
    pub fn store(&self) -> &KvStore {
        &self.db
    }

    /// Location of the tenant's log file, when one is attached.
    pub fn user_log_path(&self) -> Option<&Path> {
        self.user_log.as_ref().map(UserLog::path)
    }

    pub(crate) fn log_user(&self, line: &str) {
        if let Some(log) = &self.user_log {
            log.log(line);
        }
    }

    /// Register `client` for every future publish matching `pattern`.
    /// New clients are created with all timestamps set to now.
    pub fn subscribe(&self, pattern: &str, client: &str, ip: &str) -> Result<(), BrokerError> {
        if client.is_empty() {
            return Err(BrokerError::EmptyClientName);
        }

        let mut state = self.state.write();
        let now = time::now();

        if !state.clients.contains_key(client) {
            state.clients.insert(
                client.to_string(),
                Client {
                    name: client.to_string(),
                    first_seen: now,
                    first_seen_nicedatetime: time::nice_datetime(now),
                    latest_pickup: now,
                    latest_pickup_nicedatetime: time::nice_datetime(now),
                    latest_system_pickup: now,
                    request_counter: 0,
                    ip: ip.to_string(),
                },
            );
            if self.debug {
                debug!(client, ip, "new client");
            }
            self.log_user(&format!("New client: {client} from IP: {ip}"));
        }

        let subscribers = state.subscriptions.entry(pattern.to_string()).or_default();
        if !subscribers.iter().any(|name| name == client) {
            subscribers.push(client.to_string());
            self.log_user(&format!("Client {client} subscribed to topic: {pattern}"));
        }

        state.message_queue.entry(client.to_string()).or_default();

        if let Some(entry) = state.clients.get_mut(client) {
            entry.latest_pickup = now;
            entry.latest_pickup_nicedatetime = time::nice_datetime(now);
            entry.request_counter += 1;
        }

        if self.debug {
            debug!(pattern, client, "added subscription");
        }

        Ok(())
    }

    /// Publish a message: fan out to every subscriber whose pattern the
    /// topic expands to (plus `#`), and record it as the topic's last value.
    pub fn publish(
        &self,
        topic_name: &str,
        body: &str,
        from: &str,
        ip: &str,
        updated_time: i64,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.write();
        let now = time::now();

        state.publishes.bump(now);
        if state.publishes.total % 1000 == 0 {
            info!(processed = state.publishes.total, "publish progress");
        }

        let from = if from.is_empty() { "UNKNOWN" } else { from };
        self.log_user(&format!(
            "Published message to {topic_name} from {from} (IP: {ip})"
        ));

        let mut msg = Message {
            from: from.to_string(),
            topic: topic_name.to_string(),
            message: body.to_string(),
            updated_time,
            updated_nicedatetime: time::nice_datetime(updated_time),
            subscribers: Some(HashMap::new()),
            ip: ip.to_string(),
        };

        let patterns = match state.expansion_cache.get(topic_name) {
            Some(cached) => cached.clone(),
            None => {
                let expanded = topic::expand(topic_name);
                state
                    .expansion_cache
                    .insert(topic_name.to_string(), expanded.clone());
                expanded
            }
        };

        let mut recipients: Vec<(String, Vec<String>)> = Vec::new();
        for pattern in patterns.iter().map(String::as_str).chain([GLOBAL_WILDCARD]) {
            if let Some(subscribers) = state.subscriptions.get(pattern) {
                if !subscribers.is_empty() {
                    recipients.push((pattern.to_string(), subscribers.clone()));
                }
            }
        }

        if let Some(set) = msg.subscribers.as_mut() {
            for (_, subscribers) in &recipients {
                for name in subscribers {
                    set.insert(name.clone(), true);
                }
            }
        }

        for (pattern, subscribers) in recipients {
            for name in subscribers {
                state
                    .message_queue
                    .entry(name)
                    .or_default()
                    .entry(pattern.clone())
                    .or_default()
                    .push(msg.clone());
            }
        }

        // Poster bookkeeping; first_seen comes from the message timestamp,
        // not server now.
        let provider = state
            .providers
            .entry(from.to_string())
            .or_insert_with(|| Provider {
                name: from.to_string(),
                first_seen: updated_time,
                first_seen_nicedatetime: time::nice_datetime(updated_time),
                ..Provider::default()
            });
        provider
            .latest_posts_by_topic
            .insert(topic_name.to_string(), msg.clone());
        provider.latest_post = Some(msg.clone());
        provider.ip = ip.to_string();
        provider.latest_post_time = updated_time;
        provider.latest_post_nicedatetime = time::nice_datetime(updated_time);
        provider.message_count += 1;

        let json = serde_json::to_string(&msg)?;
        self.db.put(topic_name, &json);

        Ok(())
    }

    /// Queue a broker-authored message. Delivery is gated per client by the
    /// last system pickup timestamp; the queue itself is never drained.
    pub fn publish_system_message(&self, topic_name: &str, body: &str) {
        let mut state = self.state.write();
        let now = time::now();

        let msg = Message {
            from: "SERVER".to_string(),
            topic: topic_name.to_string(),
            message: body.to_string(),
            updated_time: now,
            updated_nicedatetime: time::nice_datetime(now),
            subscribers: Some(HashMap::new()),
            ip: "127.0.0.1".to_string(),
        };

        state
            .system_message_queue
            .entry(topic_name.to_string())
            .or_default()
            .push(msg);

        if self.debug {
            debug!(topic = topic_name, "published system message");
        }
        self.log_user(&format!("Published system message to topic: {topic_name}"));
    }

    /// Atomically drain the client's queue and merge in unseen system
    /// messages. System entries replace normal entries when a subscription
    /// pattern collides with a system topic key. Pickup for an unknown
    /// client is not an error: it returns pending system messages and an
    /// empty normal map, without touching the registry.
    pub fn pickup(&self, client: &str, ip: &str) -> HashMap<String, Vec<Message>> {
        let mut state = self.state.write();
        let now = time::now();

        state.pickups.bump(now);

        let mut result =
            std::mem::take(state.message_queue.entry(client.to_string()).or_default());

        for (topic_name, msgs) in self.system_messages_for(&mut state, client, now) {
            result.insert(topic_name, msgs);
        }

        if let Some(entry) = state.clients.get_mut(client) {
            entry.latest_pickup = now;
            entry.latest_pickup_nicedatetime = time::nice_datetime(now);
            entry.latest_system_pickup = now;
            entry.request_counter += 1;
            entry.ip = ip.to_string();
        } else if self.debug {
            debug!(client, "pickup for unknown client");
        }

        result
    }

    fn system_messages_for(
        &self,
        state: &mut BrokerState,
        client: &str,
        now: i64,
    ) -> HashMap<String, Vec<Message>> {
        let newer_than = match state.clients.get_mut(client) {
            Some(entry) => {
                let cutoff = entry.latest_system_pickup;
                entry.latest_system_pickup = now;
                cutoff
            }
            // Unknown clients see everything and advance nothing.
            None => return state.system_message_queue.clone(),
        };

        let mut result = HashMap::new();
        for (topic_name, messages) in &state.system_message_queue {
            let deliver: Vec<Message> = messages
                .iter()
                .filter(|msg| msg.updated_time > newer_than)
                .cloned()
                .collect();
            if !deliver.is_empty() {
                result.insert(topic_name.clone(), deliver);
            }
        }
        result
    }

    /// Fetch the stored last value for `key`.
    pub fn get_value(&self, key: &str) -> Result<Message, BrokerError> {
        {
            let mut state = self.state.write();
            let now = time::now();
            state.getvals.bump(now);
        }

        let raw = self.db.get(key)?;
        let msg = serde_json::from_str(&raw)?;
        Ok(msg)
    }

    /// Fetch every stored value whose key matches `pattern`. Stored values
    /// that no longer decode are skipped.
    pub fn get_values_by_regex(
        &self,
        pattern: &str,
    ) -> Result<HashMap<String, Message>, BrokerError> {
        let re = Regex::new(pattern)?;

        let mut result = HashMap::new();
        for key in self.db.keys_matching(&re) {
            let Ok(raw) = self.db.get(&key) else { continue };
            if let Ok(msg) = serde_json::from_str::<Message>(&raw) {
                result.insert(key, msg);
            }
        }
        Ok(result)
    }

    /// Store an arbitrary value under `name`, outside the fan-out path.
    /// `val` wins over `message` when both are given. The stored record is
    /// a minimal message: no topic, no subscriber set.
    pub fn put_value(
        &self,
        name: &str,
        val: &str,
        message: &str,
        from: &str,
        updated_time: i64,
    ) -> Result<(), BrokerError> {
        let body = if val.is_empty() { message } else { val };

        let msg = Message {
            from: from.to_string(),
            topic: String::new(),
            message: body.to_string(),
            updated_time,
            updated_nicedatetime: time::nice_datetime(updated_time),
            subscribers: None,
            ip: String::new(),
        };

        let json = serde_json::to_string(&msg)?;
        self.db.put(name, &json);
        Ok(())
    }

    /// Count one routed request against this broker.
    pub fn note_request(&self) {
        self.state.write().requests.bump(time::now());
    }

    /// Accumulate handler time for the average reported by `get_stats`.
    pub fn add_serve_time(&self, elapsed_ms: f64) {
        self.state.write().serve_time_ms += elapsed_ms;
    }

    pub fn get_stats(&self) -> BrokerStats {
        let state = self.state.read();
        let now = time::now();

        let request_total = state.requests.total.max(1);

        BrokerStats {
            started: time::nice_datetime(self.started_time),
            subscription_count: state.subscriptions.len(),
            average_request_time_ms: state.serve_time_ms / request_total as f64,
            values: self.db.count(),
            clients: ClientCounts {
                subscribers: state.message_queue.len(),
                posters: state.providers.len(),
            },
            requests: RequestStats {
                per_second: state.requests.per_second(self.started_time, now),
                per_second_last_minute: state.requests.per_second_last_minute(now),
                total: state.requests.total,
                pickups: RateStats {
                    per_second: state.pickups.per_second(self.started_time, now),
                    per_second_last_minute: state.pickups.per_second_last_minute(now),
                    total: state.pickups.total,
                },
                processed: RateStats {
                    per_second: state.publishes.per_second(self.started_time, now),
                    per_second_last_minute: state.publishes.per_second_last_minute(now),
                    total: state.publishes.total,
                },
                getvals: RateStats {
                    per_second: state.getvals.per_second(self.started_time, now),
                    per_second_last_minute: state.getvals.per_second_last_minute(now),
                    total: state.getvals.total,
                },
            },
        }
    }

    /// Counters for the admin user listing.
    pub fn usage_summary(&self) -> UsageSummary {
        let state = self.state.read();
        UsageSummary {
            requests: state.requests.total,
            requests_last_minute: state.requests.window,
            messages: state.publishes.total,
            messages_last_minute: state.publishes.window,
            topics: state.subscriptions.len(),
            clients: state.clients.len(),
        }
    }

    /// Active subscribers, keyed off the queue table. A queue entry without
    /// a registry record (possible transiently around eviction, or after an
    /// unknown-client pickup) yields a name-only record.
    pub fn get_clients(&self) -> Vec<Client> {
        let state = self.state.read();
        state
            .message_queue
            .keys()
            .map(|name| {
                state.clients.get(name).cloned().unwrap_or_else(|| Client {
                    name: name.clone(),
                    ..Client::default()
                })
            })
            .collect()
    }

    pub fn get_posters(&self) -> Vec<Provider> {
        self.state.read().providers.values().cloned().collect()
    }

    /// Topics (and plain value keys) known to the last-value store.
    pub fn get_topics(&self) -> Vec<String> {
        self.db.keys()
    }

    /// Background maintenance: every fourth 30-second tick, evict idle
    /// subscribers and drop stale posters. Returns when the shutdown signal
    /// fires.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.debug {
            debug!("starting maintenance task");
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // An interval's first tick is immediate; consume it so the cycle
        // counter only sees real 30-second ticks.
        ticker.tick().await;

        let mut counter: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if self.debug {
                        debug!("maintenance task stopping");
                    }
                    return;
                }
                _ = ticker.tick() => {
                    counter += 1;
                    if counter % 4 == 0 {
                        if self.debug {
                            debug!(cycle = counter, "running maintenance cycle");
                        }
                        self.kick_inactive_clients();
                        self.clear_old_posters();
                    }
                }
            }
        }
    }

    /// Evict every client whose last pickup is older than the queue
    /// timeout, together with its subscriptions and queue. Subscription
    /// lists left empty lose their pattern entry.
    pub fn kick_inactive_clients(&self) {
        let mut state = self.state.write();
        let now = time::now();
        let timeout = self.message_queue_timeout.as_secs() as i64;

        // Collect first; the registry cannot be mutated mid-iteration.
        let to_kick: Vec<String> = state
            .clients
            .iter()
            .filter(|(_, client)| now - client.latest_pickup > timeout)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &to_kick {
            if self.debug {
                debug!(client = %name, "kicking idle client");
            }

            state.subscriptions.retain(|_, subscribers| {
                subscribers.retain(|sub| sub != name);
                !subscribers.is_empty()
            });
            state.message_queue.remove(name);
            state.clients.remove(name);
        }

        if self.debug && !to_kick.is_empty() {
            debug!(count = to_kick.len(), "kicked idle clients");
        }
    }

    /// Drop posters whose most recent post is older than the stats window.
    pub fn clear_old_posters(&self) {
        let mut state = self.state.write();
        let now = time::now();
        let timeout = self.poster_stats_timeout.as_secs() as i64;

        state
            .providers
            .retain(|_, provider| match &provider.latest_post {
                Some(post) => now - post.updated_time <= timeout,
                None => true,
            });
    }
}
