//! Public cart topic.
//!
//! The message schema is separate from [`CartEvent`] so the two can evolve
//! independently; only checkouts are published.

use serde::{Deserialize, Serialize};

use keel_events::EventEnvelope;

use crate::cart::CartEvent;

pub const TOPIC_ID: &str = "shopping-cart-checkouts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartMessage {
    pub cart_id: String,
    /// RFC 3339 timestamp of the checkout event.
    pub checked_out_at: String,
}

pub fn translate(envelope: &EventEnvelope<CartEvent>) -> Option<CartMessage> {
    match envelope.payload() {
        CartEvent::CheckedOut => Some(CartMessage {
            cart_id: envelope.entity_id().to_string(),
            checked_out_at: envelope.timestamp().to_rfc3339(),
        }),
        CartEvent::ItemUpdated { .. } => None,
    }
}
