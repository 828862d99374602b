//! Call-level orchestration on top of the conversation engine.
//!
//! The telephony layer hands every webhook to [`AgentRuntime::respond`] and
//! turns the returned [`CallResponse`] into carrier markup. The runtime owns
//! session lookup, business resolution, pricing on completion and quote
//! delivery; it never speaks transport formats itself.

use std::sync::Arc;
use std::time::Duration;

use callquote_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use callquote_core::business::{BusinessProfile, SchemaSource};
use callquote_core::config::AppConfig;
use callquote_core::domain::call::CallRecord;
use callquote_core::domain::session::{NextAction, Session, SessionId};
use callquote_core::errors::{ApplicationError, DomainError};
use callquote_core::notify::{NotificationError, QuoteDelivery, QuoteNotifier};
use callquote_core::pricing::{self, DistanceLookup, QuoteBreakdown};
use callquote_core::rollout::{choose_strategy, RolloutConfig};
use tracing::{error, info, warn};

use crate::engine::ConversationEngine;
use crate::store::SessionStore;
use crate::summary::QuoteSummaries;

const ACTOR: &str = "agent-runtime";
const NO_TRANSFER_MESSAGE: &str = "Please call our main office for assistance. Thank you.";
const PRICING_FAILED_MESSAGE: &str =
    "I'm sorry, I couldn't put your quote together. Someone from our team will call you back.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundTurn {
    pub session_id: SessionId,
    pub caller: String,
    pub called: String,
    /// Transcribed speech; `None` on the first webhook of a call.
    pub utterance: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallDirective {
    ContinueListening,
    TransferToHuman(String),
    EndCall,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallResponse {
    pub prompt: String,
    pub directive: CallDirective,
    pub quote: Option<QuoteBreakdown>,
    /// Set when this turn closed the session and it should be persisted.
    pub record: Option<CallRecord>,
}

impl CallResponse {
    fn listening(prompt: String) -> Self {
        Self { prompt, directive: CallDirective::ContinueListening, quote: None, record: None }
    }

    fn ending(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), directive: CallDirective::EndCall, quote: None, record: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub rollout: RolloutConfig,
    /// Start over when a turn arrives for a closed session id.
    pub allow_session_reset: bool,
    /// Used when the business profile has no escalation number.
    pub fallback_transfer_number: Option<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            rollout: RolloutConfig::default(),
            allow_session_reset: false,
            fallback_transfer_number: None,
        }
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            rollout: RolloutConfig { agent_rollout_pct: config.conversation.agent_rollout_pct },
            allow_session_reset: config.conversation.allow_session_reset,
            fallback_transfer_number: config.telephony.transfer_number.clone(),
        }
    }
}

pub struct RuntimeParts {
    pub engine: ConversationEngine,
    pub businesses: Arc<dyn SchemaSource>,
    pub distance: Arc<dyn DistanceLookup>,
    pub notifier: Arc<dyn QuoteNotifier>,
    pub audit: Arc<dyn AuditSink>,
    pub settings: RuntimeSettings,
}

pub struct AgentRuntime {
    engine: ConversationEngine,
    store: Arc<SessionStore>,
    businesses: Arc<dyn SchemaSource>,
    distance: Arc<dyn DistanceLookup>,
    notifier: Arc<dyn QuoteNotifier>,
    audit: Arc<dyn AuditSink>,
    summaries: QuoteSummaries,
    settings: RuntimeSettings,
}

impl AgentRuntime {
    pub fn new(parts: RuntimeParts) -> Result<Self, ApplicationError> {
        let summaries = QuoteSummaries::new()
            .map_err(|error| ApplicationError::Configuration(format!("quote templates: {error}")))?;
        Ok(Self {
            engine: parts.engine,
            store: Arc::new(SessionStore::new()),
            businesses: parts.businesses,
            distance: parts.distance,
            notifier: parts.notifier,
            audit: parts.audit,
            summaries,
            settings: parts.settings,
        })
    }

    pub fn store(&self) -> Arc<SessionStore> {
        self.store.clone()
    }

    /// Handles one webhook and never fails: errors become a spoken apology
    /// followed by hangup.
    pub async fn respond(&self, turn: InboundTurn) -> CallResponse {
        let correlation_id = turn.session_id.to_string();
        match self.handle_turn(turn).await {
            Ok(response) => response,
            Err(failure) => {
                let interface = failure.into_interface(&correlation_id);
                error!(
                    event_name = "runtime.turn_failed",
                    correlation_id = %correlation_id,
                    error = %interface,
                    "turn failed, ending call with an apology"
                );
                CallResponse::ending(interface.user_message())
            }
        }
    }

    pub async fn handle_turn(&self, turn: InboundTurn) -> Result<CallResponse, ApplicationError> {
        let mut lease = self.store.acquire(&turn.session_id).await;

        if let Some(status) = lease.closed_status() {
            if !self.settings.allow_session_reset {
                return Err(DomainError::InvalidSessionState {
                    session_id: turn.session_id.clone(),
                    status,
                }
                .into());
            }
            info!(
                event_name = "session.reset",
                correlation_id = %turn.session_id,
                previous_status = status.as_str(),
                "turn for a closed session starts a new conversation"
            );
        }

        let profile = match lease.session() {
            Some(session) => self.businesses.load_profile(&session.business_id).await?,
            None => {
                let business_id = self.businesses.resolve_business(&turn.called).await?;
                let profile = self.businesses.load_profile(&business_id).await?;
                let strategy = choose_strategy(&turn.session_id.0, &self.settings.rollout);
                lease.insert(Session::new(
                    turn.session_id.clone(),
                    business_id.clone(),
                    &turn.caller,
                    &turn.called,
                    strategy,
                ));
                self.audit.emit(
                    AuditContext::new(
                        Some(turn.session_id.clone()),
                        Some(business_id),
                        turn.session_id.to_string(),
                        ACTOR,
                    )
                    .event("session.created", AuditCategory::Ingress, AuditOutcome::Success)
                    .with_metadata("strategy", strategy.as_str()),
                );
                profile
            }
        };

        let session = lease.session_mut().ok_or_else(|| {
            DomainError::InvariantViolation(format!("session {} vanished mid-turn", turn.session_id))
        })?;
        let utterance = turn.utterance.as_deref().unwrap_or("");
        let outcome = self.engine.advance(session, &profile, utterance).await?;
        let reply = outcome.result.reply_text;

        match outcome.next_action {
            NextAction::Continue => Ok(CallResponse::listening(reply)),
            NextAction::Escalate => {
                let session = self.closed(lease.close(), &turn.session_id)?;
                let fallback = self.settings.fallback_transfer_number.as_deref();
                let (prompt, directive) = match profile.transfer_target(fallback) {
                    Some(number) => (reply, CallDirective::TransferToHuman(number.to_string())),
                    None => {
                        warn!(
                            event_name = "runtime.transfer_unavailable",
                            correlation_id = %session.id,
                            business_id = %session.business_id,
                            "no escalation number configured, ending call"
                        );
                        (format!("{reply} {NO_TRANSFER_MESSAGE}"), CallDirective::EndCall)
                    }
                };
                Ok(CallResponse {
                    prompt,
                    directive,
                    quote: None,
                    record: Some(CallRecord::from_session(&session, None)),
                })
            }
            NextAction::Complete => {
                let session = self.closed(lease.close(), &turn.session_id)?;
                Ok(self.finish_with_quote(&session, &profile, reply).await)
            }
        }
    }

    fn closed(&self, session: Option<Session>, id: &SessionId) -> Result<Session, ApplicationError> {
        session.ok_or_else(|| {
            DomainError::InvariantViolation(format!("session {id} closed without a live session"))
                .into()
        })
    }

    async fn finish_with_quote(
        &self,
        session: &Session,
        profile: &BusinessProfile,
        reply: String,
    ) -> CallResponse {
        let context = AuditContext::new(
            Some(session.id.clone()),
            Some(session.business_id.clone()),
            session.id.to_string(),
            ACTOR,
        );

        let quote = match pricing::quote(&session.fields, &profile.pricing, self.distance.as_ref()).await {
            Ok(quote) => quote,
            Err(failure) => {
                error!(
                    event_name = "pricing.quote_failed",
                    correlation_id = %session.id,
                    error = %failure,
                    "completed session could not be priced"
                );
                self.audit.emit(
                    context
                        .event("quote.failed", AuditCategory::Pricing, AuditOutcome::Failed)
                        .with_metadata("error", failure.to_string()),
                );
                return CallResponse {
                    prompt: format!("{reply} {PRICING_FAILED_MESSAGE}"),
                    directive: CallDirective::EndCall,
                    quote: None,
                    record: Some(CallRecord::from_session(session, None)),
                };
            }
        };
        self.audit.emit(
            context
                .event("quote.calculated", AuditCategory::Pricing, AuditOutcome::Success)
                .with_metadata("total", quote.total.to_string())
                .with_metadata("distance_source", format!("{:?}", quote.distance_source).to_lowercase()),
        );

        let spoken = self
            .summaries
            .voice(profile, &session.fields, &quote)
            .unwrap_or_else(|_| format!("Your quote is ${}.", quote.total));
        self.deliver(session, profile, &quote, &context).await;

        CallResponse {
            prompt: format!("{reply} {spoken}"),
            directive: CallDirective::EndCall,
            quote: Some(quote.clone()),
            record: Some(CallRecord::from_session(session, Some(quote))),
        }
    }

    /// Sends the written quote to the caller. Failure is logged and audited
    /// but never changes the call outcome.
    async fn deliver(
        &self,
        session: &Session,
        profile: &BusinessProfile,
        quote: &QuoteBreakdown,
        context: &AuditContext,
    ) {
        let body = match self.summaries.sms(profile, &session.fields, quote) {
            Ok(body) => body,
            Err(failure) => {
                warn!(
                    event_name = "notification.render_failed",
                    correlation_id = %session.id,
                    error = %failure,
                    "quote text could not be rendered"
                );
                return;
            }
        };
        let delivery = QuoteDelivery {
            destination: session.caller.clone(),
            display_name: profile.display_name.clone(),
            quote: quote.clone(),
            body,
        };

        match self.notifier.deliver_quote(&delivery).await {
            Ok(()) => {
                info!(
                    event_name = "notification.quote_sent",
                    correlation_id = %session.id,
                    "quote text delivered"
                );
                self.audit.emit(context.event(
                    "notification.quote_sent",
                    AuditCategory::Notification,
                    AuditOutcome::Success,
                ));
            }
            Err(NotificationError::NotConfigured) => {
                warn!(
                    event_name = "notification.skipped",
                    correlation_id = %session.id,
                    "text messaging not configured, quote not sent"
                );
            }
            Err(failure) => {
                warn!(
                    event_name = "notification.failed",
                    correlation_id = %session.id,
                    error = %failure,
                    "quote text could not be delivered"
                );
                self.audit.emit(
                    context
                        .event("notification.failed", AuditCategory::Notification, AuditOutcome::Failed)
                        .with_metadata("error", failure.to_string()),
                );
            }
        }
    }

    /// Carrier hangup before the conversation finished.
    pub async fn hang_up(&self, session_id: &SessionId) -> Option<CallRecord> {
        let session = self.store.abandon(session_id).await?;
        self.audit.emit(
            AuditContext::new(
                Some(session.id.clone()),
                Some(session.business_id.clone()),
                session.id.to_string(),
                ACTOR,
            )
            .event("conversation.abandoned", AuditCategory::Conversation, AuditOutcome::Success),
        );
        Some(CallRecord::from_session(&session, None))
    }

    /// Abandons idle sessions and returns their records for persistence.
    pub async fn sweep_idle(&self, max_idle: Duration) -> Vec<CallRecord> {
        let report = self.store.sweep_idle(max_idle).await;
        report.abandoned.iter().map(|session| CallRecord::from_session(session, None)).collect()
    }
}
