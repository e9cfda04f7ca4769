//! Cart report read side: one row per cart with its items and checkout flag.
//!
//! Rows carry the sequence number of the last event applied, so a
//! redelivered event (at-least-once) leaves the row unchanged.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_events::{AggregateEventTag, EventEnvelope};
use keel_infra::offset_store::{InMemoryReadSide, InMemoryTx};
use keel_infra::projection::{HandlerError, ReadSideHandler};

use crate::cart::CartEvent;

pub const REPORT_TABLE: &str = "shopping_cart_report";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CartReport {
    pub cart_id: String,
    pub items: BTreeMap<String, u32>,
    pub checked_out: bool,
    pub last_sequence_nr: u64,
}

impl CartReport {
    /// Row for `cart_id` as stored in `db`, if any.
    pub fn load(db: &InMemoryReadSide, cart_id: &str) -> Option<Self> {
        db.get(REPORT_TABLE, cart_id)
            .and_then(|row| serde_json::from_value(row).ok())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CartReportHandler;

#[async_trait]
impl ReadSideHandler<CartEvent, InMemoryReadSide> for CartReportHandler {
    async fn global_prepare(&self, db: &InMemoryReadSide) -> Result<(), HandlerError> {
        db.create_table(REPORT_TABLE)?;
        Ok(())
    }

    async fn prepare(&self, db: &InMemoryReadSide, tag: &AggregateEventTag) -> Result<(), HandlerError> {
        if !db.has_table(REPORT_TABLE) {
            return Err(anyhow::anyhow!("{REPORT_TABLE} missing while preparing {tag}").into());
        }
        Ok(())
    }

    fn handles(&self, event_type: &str) -> bool {
        matches!(event_type, "ItemUpdated" | "CheckedOut")
    }

    async fn handle(&self, tx: &mut InMemoryTx, envelope: &EventEnvelope<CartEvent>) -> Result<(), HandlerError> {
        let cart_id = envelope.entity_id().as_str();
        let mut report: CartReport = match tx.get(REPORT_TABLE, cart_id)? {
            Some(row) => serde_json::from_value(row).map_err(anyhow::Error::from)?,
            None => CartReport {
                cart_id: cart_id.to_string(),
                ..CartReport::default()
            },
        };
        if envelope.sequence_nr() <= report.last_sequence_nr {
            debug!(cart_id, sequence_nr = envelope.sequence_nr(), "event already in report");
            return Ok(());
        }

        match envelope.payload() {
            CartEvent::ItemUpdated { product_id, quantity: 0 } => {
                report.items.remove(product_id);
            }
            CartEvent::ItemUpdated { product_id, quantity } => {
                report.items.insert(product_id.clone(), *quantity);
            }
            CartEvent::CheckedOut => report.checked_out = true,
        }
        report.last_sequence_nr = envelope.sequence_nr();

        let row = serde_json::to_value(&report).map_err(anyhow::Error::from)?;
        tx.upsert(REPORT_TABLE, cart_id, row);
        Ok(())
    }
}
