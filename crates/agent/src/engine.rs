//! Per-turn conversation state machine.
//!
//! One call to [`ConversationEngine::advance`] consumes one customer
//! utterance: it asks an extractor for candidate values, validates them
//! against the business schema, merges the survivors into the session and
//! decides whether to keep listening, hand off to a person or price the job.
//! The engine never computes prices and never trusts extractor output
//! without validation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use callquote_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use callquote_core::business::BusinessProfile;
use callquote_core::config::AppConfig;
use callquote_core::domain::extraction::{ExtractionFailure, ExtractionResult};
use callquote_core::domain::session::{NextAction, Session, SessionStatus};
use callquote_core::errors::DomainError;
use callquote_core::rollout::StrategyKind;
use callquote_core::validation::{validate_value, ValidationRejected};
use tracing::{debug, info, warn};

use crate::extractor::{ExtractionRequest, Extractor};
use crate::guardrails::{EscalationDecision, EscalationPolicy};
use crate::keyword::{reprompt, KeywordExtractor};

const ACTOR: &str = "session-engine";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub history_turns: usize,
    pub extractor_timeout: Duration,
    pub stuck_loop_threshold: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { history_turns: 10, extractor_timeout: Duration::from_secs(8), stuck_loop_threshold: 2 }
    }
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            history_turns: config.conversation.history_turns,
            extractor_timeout: Duration::from_secs(config.llm.timeout_secs),
            stuck_loop_threshold: config.conversation.stuck_loop_threshold,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub result: ExtractionResult,
    pub next_action: NextAction,
    pub used_fallback: bool,
    pub rejected: Vec<ValidationRejected>,
    pub failure: Option<ExtractionFailure>,
}

pub struct ConversationEngine {
    agent: Option<Arc<dyn Extractor>>,
    fallback: KeywordExtractor,
    policy: EscalationPolicy,
    settings: EngineSettings,
    audit: Arc<dyn AuditSink>,
}

impl ConversationEngine {
    pub fn new(
        agent: Option<Arc<dyn Extractor>>,
        settings: EngineSettings,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            agent,
            fallback: KeywordExtractor::new(),
            policy: EscalationPolicy::new(settings.stuck_loop_threshold),
            settings,
            audit,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn audit_context(session: &Session) -> AuditContext {
        AuditContext::new(
            Some(session.id.clone()),
            Some(session.business_id.clone()),
            session.id.to_string(),
            ACTOR,
        )
    }

    pub async fn advance(
        &self,
        session: &mut Session,
        profile: &BusinessProfile,
        utterance: &str,
    ) -> Result<TurnOutcome, DomainError> {
        session.ensure_accepts_turns()?;
        let context = Self::audit_context(session);
        let utterance = utterance.trim();

        if utterance.is_empty() && session.transcript.is_empty() {
            session.push_agent(&profile.greeting);
            self.audit.emit(
                context
                    .event("conversation.greeted", AuditCategory::Conversation, AuditOutcome::Success)
                    .with_metadata("strategy", session.strategy.as_str()),
            );
            info!(
                event_name = "conversation.greeted",
                correlation_id = %session.id,
                business_id = %session.business_id,
                strategy = session.strategy.as_str(),
                "session opened with greeting"
            );
            return Ok(TurnOutcome {
                result: ExtractionResult::reply(&profile.greeting),
                next_action: NextAction::Continue,
                used_fallback: false,
                rejected: Vec::new(),
                failure: None,
            });
        }

        // The extractor call can be cancelled mid-await, so the stored
        // session only changes once it has returned.
        let mut staged = session.clone();
        staged.push_customer(utterance);
        staged.transition_to(SessionStatus::AwaitingExtraction)?;
        let (mut result, used_fallback, failure) = self.extract(&staged, profile, utterance).await;
        staged.transition_to(SessionStatus::Active)?;
        *session = staged;

        if let Some(failure) = &failure {
            self.audit.emit(
                context
                    .event("extraction.fallback_used", AuditCategory::Extraction, AuditOutcome::Failed)
                    .with_metadata("failure", failure.kind())
                    .with_metadata("detail", failure.to_string()),
            );
        }

        let (merged, rejected) = self.merge(session, profile, &mut result);
        for rejection in &rejected {
            self.audit.emit(
                context
                    .event("extraction.value_rejected", AuditCategory::Extraction, AuditOutcome::Rejected)
                    .with_metadata("field", rejection.field())
                    .with_metadata("reason", rejection.reason_code()),
            );
        }
        if let Some(spec) = rejected.first().and_then(|rejection| profile.schema.field(rejection.field())) {
            result.reply_text = reprompt(spec);
        }

        let unresolved: BTreeSet<String> = result
            .clarification_needed
            .iter()
            .filter(|field| profile.schema.field(field).is_some() && !merged.contains(*field))
            .cloned()
            .collect();
        self.policy.record_turn(&mut session.clarification_streaks, &unresolved);

        let next_action = match self.policy.evaluate(&result, &session.clarification_streaks, profile) {
            EscalationDecision::Escalate { reason_code, reason, user_message } => {
                session.escalation_reason = Some(reason.clone());
                result.reply_text = user_message;
                self.audit.emit(
                    context
                        .event("conversation.escalated", AuditCategory::Conversation, AuditOutcome::Success)
                        .with_metadata("reason_code", reason_code)
                        .with_metadata("reason", reason),
                );
                NextAction::Escalate
            }
            EscalationDecision::Proceed if session.has_all_required(&profile.schema) => {
                self.audit.emit(
                    context
                        .event("conversation.completed", AuditCategory::Conversation, AuditOutcome::Success)
                        .with_metadata("fields", session.fields.len().to_string()),
                );
                NextAction::Complete
            }
            EscalationDecision::Proceed => {
                if result.is_complete {
                    if let Some(spec) = session.missing_required(&profile.schema).first() {
                        result.reply_text = spec.prompt_text();
                    }
                }
                NextAction::Continue
            }
        };
        result.is_complete = next_action == NextAction::Complete;

        session.push_agent(&result.reply_text);
        match next_action {
            NextAction::Continue => {}
            NextAction::Complete => session.transition_to(SessionStatus::Complete)?,
            NextAction::Escalate => session.transition_to(SessionStatus::Escalated)?,
        }

        self.audit.emit(
            context
                .event("conversation.turn_advanced", AuditCategory::Conversation, AuditOutcome::Success)
                .with_metadata("next_action", next_action_name(next_action))
                .with_metadata("strategy", session.strategy.as_str())
                .with_metadata("used_fallback", used_fallback.to_string())
                .with_metadata("merged", merged.len().to_string()),
        );
        info!(
            event_name = "conversation.turn_advanced",
            correlation_id = %session.id,
            business_id = %session.business_id,
            next_action = next_action_name(next_action),
            used_fallback,
            merged = merged.len(),
            rejected = rejected.len(),
            "turn processed"
        );

        Ok(TurnOutcome { result, next_action, used_fallback, rejected, failure })
    }

    /// Runs the session's strategy under the extractor timeout, dropping to
    /// the keyword strategy when it fails.
    async fn extract(
        &self,
        session: &Session,
        profile: &BusinessProfile,
        utterance: &str,
    ) -> (ExtractionResult, bool, Option<ExtractionFailure>) {
        let request = ExtractionRequest {
            utterance,
            history: session.recent_history(self.settings.history_turns),
            fields: &session.fields,
            profile,
        };

        let agent = match (&self.agent, session.strategy) {
            (Some(agent), StrategyKind::Agent) => agent,
            _ => return (self.fallback.respond(&request), false, None),
        };

        let timeout = self.settings.extractor_timeout;
        let failure = match tokio::time::timeout(timeout, agent.extract(&request)).await {
            Ok(Ok(result)) => {
                debug!(
                    event_name = "extraction.completed",
                    correlation_id = %session.id,
                    extractor = agent.name(),
                    values = result.extracted.len(),
                    "extractor returned"
                );
                return (result, false, None);
            }
            Ok(Err(failure)) => failure,
            Err(_) => ExtractionFailure::Timeout { after_ms: timeout.as_millis() as u64 },
        };

        warn!(
            event_name = "extraction.fallback_used",
            correlation_id = %session.id,
            extractor = agent.name(),
            failure = failure.kind(),
            error = %failure,
            "extractor failed, answering with keyword strategy"
        );
        (self.fallback.respond(&request), true, Some(failure))
    }

    /// Validates every reported value. Accepted values overwrite the session
    /// and stay in `result.extracted`; rejected ones are dropped and flagged
    /// for clarification.
    fn merge(
        &self,
        session: &mut Session,
        profile: &BusinessProfile,
        result: &mut ExtractionResult,
    ) -> (BTreeSet<String>, Vec<ValidationRejected>) {
        let mut merged = BTreeSet::new();
        let mut rejected = Vec::new();

        for (name, raw) in &result.extracted {
            if raw.is_null() {
                continue;
            }
            let Some(spec) = profile.schema.field(name) else {
                debug!(
                    event_name = "extraction.unknown_field",
                    correlation_id = %session.id,
                    field = %name,
                    "ignoring value for a field outside the schema"
                );
                continue;
            };
            match validate_value(spec, raw) {
                Ok(value) => {
                    session.fields.insert(name.clone(), value);
                    merged.insert(name.clone());
                }
                Err(rejection) => {
                    warn!(
                        event_name = "extraction.value_rejected",
                        correlation_id = %session.id,
                        field = %name,
                        reason = rejection.reason_code(),
                        "extracted value failed validation"
                    );
                    rejected.push(rejection);
                }
            }
        }

        result.extracted.retain(|name, _| merged.contains(name));
        for rejection in &rejected {
            result.clarification_needed.insert(rejection.field().to_string());
        }
        (merged, rejected)
    }
}

fn next_action_name(action: NextAction) -> &'static str {
    match action {
        NextAction::Continue => "continue",
        NextAction::Complete => "complete",
        NextAction::Escalate => "escalate",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use callquote_core::audit::InMemoryAuditSink;
    use callquote_core::business::piano_moving_profile;
    use callquote_core::domain::extraction::{ExtractionFailure, ExtractionResult};
    use callquote_core::domain::field::FieldValue;
    use callquote_core::domain::session::{NextAction, Session, SessionId, SessionStatus};
    use callquote_core::errors::DomainError;
    use callquote_core::rollout::StrategyKind;
    use serde_json::json;

    use super::{ConversationEngine, EngineSettings};
    use crate::extractor::{ExtractionRequest, Extractor};

    struct Scripted(Mutex<VecDeque<Result<ExtractionResult, ExtractionFailure>>>);

    impl Scripted {
        fn new(replies: Vec<Result<ExtractionResult, ExtractionFailure>>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(replies.into())))
        }
    }

    #[async_trait]
    impl Extractor for Scripted {
        async fn extract(
            &self,
            _: &ExtractionRequest<'_>,
        ) -> Result<ExtractionResult, ExtractionFailure> {
            self.0
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Err(ExtractionFailure::Unavailable("script exhausted".to_string())))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn engine(agent: Arc<dyn Extractor>, audit: InMemoryAuditSink) -> ConversationEngine {
        let settings =
            EngineSettings { extractor_timeout: Duration::from_millis(200), ..EngineSettings::default() };
        ConversationEngine::new(Some(agent), settings, Arc::new(audit))
    }

    fn session() -> Session {
        Session::new(
            SessionId("CA-engine".to_string()),
            "piano_moving_001",
            "+15551230000",
            "+12299223706",
            StrategyKind::Agent,
        )
    }

    #[tokio::test]
    async fn empty_first_turn_greets_without_extraction() {
        let profile = piano_moving_profile().expect("profile");
        let audit = InMemoryAuditSink::default();
        let engine = engine(Scripted::new(Vec::new()), audit.clone());
        let mut session = session();

        let outcome = engine.advance(&mut session, &profile, "").await.expect("greeting");

        assert_eq!(outcome.result.reply_text, profile.greeting);
        assert_eq!(outcome.next_action, NextAction::Continue);
        assert_eq!(session.transcript.len(), 1);
        assert_eq!(audit.event_types(), vec!["conversation.greeted".to_string()]);
    }

    struct Stalled;

    #[async_trait]
    impl Extractor for Stalled {
        async fn extract(
            &self,
            _: &ExtractionRequest<'_>,
        ) -> Result<ExtractionResult, ExtractionFailure> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ExtractionResult::reply("too late"))
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn cancelled_turn_leaves_session_ready_for_the_next_one() {
        let profile = piano_moving_profile().expect("profile");
        let settings =
            EngineSettings { extractor_timeout: Duration::from_secs(10), ..EngineSettings::default() };
        let stalled =
            ConversationEngine::new(Some(Arc::new(Stalled)), settings, Arc::new(InMemoryAuditSink::default()));
        let mut session = session();
        stalled.advance(&mut session, &profile, "").await.expect("greeting");

        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            stalled.advance(&mut session, &profile, "an upright"),
        )
        .await;
        assert!(dropped.is_err(), "turn is still waiting on the extractor");
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.transcript.len(), 1, "only the greeting is recorded");

        let keyword_only =
            ConversationEngine::new(None, EngineSettings::default(), Arc::new(InMemoryAuditSink::default()));
        let outcome =
            keyword_only.advance(&mut session, &profile, "an upright").await.expect("next turn");

        assert_eq!(outcome.next_action, NextAction::Continue);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.field("piano_type"), Some(&FieldValue::Text("upright".to_string())));
        assert_eq!(session.transcript.len(), 3);
    }

    #[tokio::test]
    async fn invalid_values_are_dropped_and_reasked() {
        let profile = piano_moving_profile().expect("profile");
        let agent = Scripted::new(vec![Ok(ExtractionResult::reply("Great, a spinet! Where from?")
            .with_value("piano_type", "spinet")
            .with_value("stairs_count", 4))]);
        let engine = engine(agent, InMemoryAuditSink::default());
        let mut session = session();

        let outcome = engine.advance(&mut session, &profile, "a spinet with four stairs").await.expect("turn");

        assert_eq!(session.field("piano_type"), None);
        assert_eq!(session.field("stairs_count"), Some(&FieldValue::Integer(4)));
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.result.clarification_needed.contains("piano_type"));
        assert!(outcome.result.reply_text.starts_with("Sorry, I didn't catch that."));
        assert_eq!(outcome.result.extracted.get("piano_type"), None);
        assert_eq!(outcome.result.extracted.get("stairs_count"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn extractor_claiming_completion_early_keeps_asking() {
        let profile = piano_moving_profile().expect("profile");
        let mut premature =
            ExtractionResult::reply("Let me calculate that for you now.").with_value("piano_type", "grand");
        premature.is_complete = true;
        let engine = engine(Scripted::new(vec![Ok(premature)]), InMemoryAuditSink::default());
        let mut session = session();

        let outcome = engine.advance(&mut session, &profile, "a grand").await.expect("turn");

        assert_eq!(outcome.next_action, NextAction::Continue);
        assert!(!outcome.result.is_complete);
        assert!(outcome.result.reply_text.contains("picking it up"));
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn terminal_sessions_reject_further_turns() {
        let profile = piano_moving_profile().expect("profile");
        let engine = engine(Scripted::new(Vec::new()), InMemoryAuditSink::default());
        let mut session = session();
        session.transition_to(SessionStatus::Escalated).expect("escalate");

        let error = engine.advance(&mut session, &profile, "hello?").await.expect_err("terminal");
        assert!(matches!(
            error,
            DomainError::InvalidSessionState { status: SessionStatus::Escalated, .. }
        ));
        assert!(session.transcript.is_empty());
    }
}
