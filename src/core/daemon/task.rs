//! In-flight task

use crate::adapters::broker::{Delivery, Receipt};
use crate::domain::ids::{CollectionId, CorrelationId};
use crate::domain::query::{peek_correlation_id, peek_reply_to};
use chrono::{DateTime, NaiveDate, Utc};

/// A unit of work taken from the task channel
///
/// Routing fields are extracted best-effort on arrival so that an error
/// result can be addressed even when the payload is malformed: the receipt
/// stands in for a missing correlation id and the polled collection for a
/// missing destination.
#[derive(Debug, Clone)]
pub struct Task {
    /// Correlation id echoed on the result
    pub correlation_id: CorrelationId,
    /// Destination of the result
    pub reply_to: CollectionId,
    /// Broker receipt used for acknowledgement
    pub receipt: Receipt,
    /// Raw inbound payload
    pub payload: Vec<u8>,
    /// Arrival time
    pub received_at: DateTime<Utc>,
}

impl Task {
    /// Builds a task from a channel delivery
    pub fn from_delivery(delivery: Delivery, default_reply_to: &CollectionId) -> Self {
        let correlation_id = peek_correlation_id(&delivery.payload)
            .or_else(|| CorrelationId::new(delivery.receipt.as_str()).ok())
            .unwrap_or_else(|| fallback_correlation_id(&delivery.receipt));
        let reply_to = peek_reply_to(&delivery.payload).unwrap_or_else(|| default_reply_to.clone());

        Self {
            correlation_id,
            reply_to,
            receipt: delivery.receipt,
            payload: delivery.payload,
            received_at: Utc::now(),
        }
    }

    /// Date the task arrived, the default reference date of its query
    pub fn received_on(&self) -> NaiveDate {
        self.received_at.date_naive()
    }
}

fn fallback_correlation_id(receipt: &Receipt) -> CorrelationId {
    let generated = CorrelationId::generate();
    tracing::warn!(receipt = %receipt, correlation_id = %generated, "Delivery has no usable id");
    generated
}
