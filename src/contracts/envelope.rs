//! The immutable envelope every published message is wrapped in (spec §3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payload::Payload;
use super::topic::Topic;

/// Generates strictly increasing sequence numbers scoped to one bus instance.
///
/// Grounded on the teacher's `AtomicU64`-backed id generators
/// (`order_actor::new`'s `next_order_id` closure); generalized from
/// per-entity ids to one sequence per bus.
#[derive(Debug, Default)]
pub struct SequenceGenerator(AtomicU64);

impl SequenceGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(1)))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Optional metadata a publisher can attach to a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishMetadata {
    pub correlation_id: Option<Uuid>,
}

/// An immutable, sequenced wrapper around a published payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub schema_version: u32,
    pub topic: String,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(
        sequence: u64,
        topic: &Topic,
        payload: Payload,
        metadata: PublishMetadata,
    ) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            correlation_id: metadata.correlation_id,
            schema_version: payload.schema_version(),
            topic: topic.as_str().to_string(),
            payload,
        }
    }
}
