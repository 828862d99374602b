use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::field::{FieldValue, FieldValues};
use crate::errors::DomainError;
use crate::rollout::StrategyKind;
use crate::schema::{FieldSchema, FieldSpec};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Customer,
    Agent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    AwaitingExtraction,
    Complete,
    Escalated,
    Abandoned,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Escalated | Self::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingExtraction => "awaiting_extraction",
            Self::Complete => "complete",
            Self::Escalated => "escalated",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "awaiting_extraction" => Some(Self::AwaitingExtraction),
            "complete" => Some(Self::Complete),
            "escalated" => Some(Self::Escalated),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// What the conversation does after a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Continue,
    Complete,
    Escalate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub business_id: String,
    pub caller: String,
    pub called: String,
    pub strategy: StrategyKind,
    pub fields: FieldValues,
    pub transcript: Vec<TranscriptEntry>,
    pub status: SessionStatus,
    pub escalation_reason: Option<String>,
    /// Consecutive turns each field has stayed unresolved.
    pub clarification_streaks: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: SessionId,
        business_id: impl Into<String>,
        caller: impl Into<String>,
        called: impl Into<String>,
        strategy: StrategyKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            business_id: business_id.into(),
            caller: caller.into(),
            called: called.into(),
            strategy,
            fields: FieldValues::new(),
            transcript: Vec::new(),
            status: SessionStatus::Active,
            escalation_reason: None,
            clarification_streaks: BTreeMap::new(),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::{Abandoned, Active, AwaitingExtraction, Complete, Escalated};

        matches!(
            (self.status, next),
            (Active, Active)
                | (Active, AwaitingExtraction)
                | (AwaitingExtraction, Active)
                | (Active, Complete)
                | (Active, Escalated)
                | (AwaitingExtraction, Complete)
                | (AwaitingExtraction, Escalated)
                | (Active, Abandoned)
                | (AwaitingExtraction, Abandoned)
        )
    }

    pub fn transition_to(&mut self, next: SessionStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            self.status = next;
            return Ok(());
        }

        Err(DomainError::InvalidStatusTransition { from: self.status, to: next })
    }

    /// Rejects turns against a session that already reached a terminal state.
    pub fn ensure_accepts_turns(&self) -> Result<(), DomainError> {
        if self.is_terminal() {
            return Err(DomainError::InvalidSessionState {
                session_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    pub fn push_customer(&mut self, text: impl Into<String>) {
        self.push(Speaker::Customer, text.into());
    }

    pub fn push_agent(&mut self, text: impl Into<String>) {
        self.push(Speaker::Agent, text.into());
    }

    fn push(&mut self, speaker: Speaker, text: String) {
        let at = Utc::now();
        self.transcript.push(TranscriptEntry { speaker, text, at });
        self.last_activity_at = at;
    }

    pub fn recent_history(&self, turns: usize) -> &[TranscriptEntry] {
        let start = self.transcript.len().saturating_sub(turns);
        &self.transcript[start..]
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn missing_required<'a>(&self, schema: &'a FieldSchema) -> Vec<&'a FieldSpec> {
        schema.required_fields().filter(|field| !self.fields.contains_key(&field.name)).collect()
    }

    pub fn has_all_required(&self, schema: &FieldSchema) -> bool {
        schema.required_fields().all(|field| self.fields.contains_key(&field.name))
    }
}
