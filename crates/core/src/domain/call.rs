use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::field::FieldValues;
use crate::domain::session::{Session, SessionId, SessionStatus, TranscriptEntry};
use crate::pricing::QuoteBreakdown;
use crate::rollout::StrategyKind;

/// Persisted outcome of a session that reached a terminal state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub session_id: SessionId,
    pub business_id: String,
    pub caller: String,
    pub strategy: StrategyKind,
    pub status: SessionStatus,
    pub fields: FieldValues,
    pub transcript: Vec<TranscriptEntry>,
    pub escalation_reason: Option<String>,
    pub quote: Option<QuoteBreakdown>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn from_session(session: &Session, quote: Option<QuoteBreakdown>) -> Self {
        Self {
            session_id: session.id.clone(),
            business_id: session.business_id.clone(),
            caller: session.caller.clone(),
            strategy: session.strategy,
            status: session.status,
            fields: session.fields.clone(),
            transcript: session.transcript.clone(),
            escalation_reason: session.escalation_reason.clone(),
            quote,
            started_at: session.created_at,
            ended_at: Utc::now(),
        }
    }
}
