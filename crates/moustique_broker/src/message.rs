//! Message and participant records.
//!
//! `Message` is the canonical representation used by the broker: it is what
//! sits in per-client queues, what the system channel carries, and what gets
//! serialized into the last-value store.
//!
//! Notes on fields:
//! - `from`: publisher identity; `"UNKNOWN"` when the publisher sent none
//! - `topic`: slash-separated routing key; empty for plain value puts
//! - `message`: opaque body
//! - `updated_time`: epoch seconds, client-supplied or server now
//! - `updated_nicedatetime`: `updated_time` formatted for humans
//! - `subscribers`: client names the message was fanned out to; purely
//!   observational, never used for routing
//! - `ip`: peer address recorded at publish

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    pub topic: String,
    pub message: String,
    pub updated_time: i64,
    pub updated_nicedatetime: String,
    #[serde(default)]
    pub subscribers: Option<HashMap<String, bool>>,
    pub ip: String,
}

/// A subscriber, tracked per tenant. Created on first subscribe, refreshed
/// on every subscribe and pickup, evicted by maintenance when idle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Client {
    pub name: String,
    pub first_seen: i64,
    pub first_seen_nicedatetime: String,
    pub latest_pickup: i64,
    pub latest_pickup_nicedatetime: String,
    pub latest_system_pickup: i64,
    pub request_counter: u64,
    pub ip: String,
}

/// A message poster, tracked per tenant for statistics. Dropped by
/// maintenance once its most recent post ages out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub latest_posts_by_topic: HashMap<String, Message>,
    pub latest_post: Option<Message>,
    pub ip: String,
    pub first_seen: i64,
    pub first_seen_nicedatetime: String,
    pub latest_post_time: i64,
    pub latest_post_nicedatetime: String,
    pub message_count: u64,
}
