use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// What an extractor reports for one turn. Values are raw and untrusted until
/// the session engine validates them against the schema.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub reply_text: String,
    pub extracted: BTreeMap<String, Value>,
    pub clarification_needed: BTreeSet<String>,
    pub is_complete: bool,
    pub escalate: bool,
    pub escalation_reason: Option<String>,
}

impl ExtractionResult {
    pub fn reply(text: impl Into<String>) -> Self {
        Self { reply_text: text.into(), ..Self::default() }
    }

    pub fn with_value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extracted.insert(field.into(), value.into());
        self
    }

    pub fn needing(mut self, field: impl Into<String>) -> Self {
        self.clarification_needed.insert(field.into());
        self
    }

    pub fn escalating(mut self, reason: impl Into<String>) -> Self {
        self.escalate = true;
        self.escalation_reason = Some(reason.into());
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExtractionFailure {
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
    #[error("extractor timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("extractor returned malformed output: {0}")]
    Malformed(String),
}

impl ExtractionFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Malformed(_) => "malformed",
        }
    }
}
