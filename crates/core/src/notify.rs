use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pricing::QuoteBreakdown;

/// A rendered quote on its way to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuoteDelivery {
    pub destination: String,
    pub display_name: String,
    pub quote: QuoteBreakdown,
    pub body: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification channel is not configured")]
    NotConfigured,
    #[error("notification rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("notification transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait QuoteNotifier: Send + Sync {
    async fn deliver_quote(&self, delivery: &QuoteDelivery) -> Result<(), NotificationError>;
}

/// Stands in when no delivery channel is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl QuoteNotifier for DisabledNotifier {
    async fn deliver_quote(&self, _: &QuoteDelivery) -> Result<(), NotificationError> {
        Err(NotificationError::NotConfigured)
    }
}

/// Keeps every delivery in memory.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    deliveries: Arc<Mutex<Vec<QuoteDelivery>>>,
}

impl RecordingNotifier {
    pub fn deliveries(&self) -> Vec<QuoteDelivery> {
        match self.deliveries.lock() {
            Ok(deliveries) => deliveries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl QuoteNotifier for RecordingNotifier {
    async fn deliver_quote(&self, delivery: &QuoteDelivery) -> Result<(), NotificationError> {
        match self.deliveries.lock() {
            Ok(mut deliveries) => deliveries.push(delivery.clone()),
            Err(poisoned) => poisoned.into_inner().push(delivery.clone()),
        }
        Ok(())
    }
}
