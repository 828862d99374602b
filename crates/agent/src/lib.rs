//! Conversation runtime for inbound quote calls.
//!
//! A call moves through three layers:
//! 1. **Extraction** (`extractor`, `keyword`) - turn an utterance into raw
//!    candidate field values, by LLM or by keyword matching
//! 2. **Session engine** (`engine`, `guardrails`) - validate and merge values,
//!    detect stuck loops, decide continue / complete / escalate
//! 3. **Runtime** (`runtime`, `store`, `summary`) - session lookup, pricing on
//!    completion and quote delivery
//!
//! The LLM only proposes values. Validation, completion and prices are
//! decided deterministically.

pub mod engine;
pub mod extractor;
pub mod guardrails;
pub mod keyword;
pub mod llm;
pub mod prompt;
pub mod runtime;
pub mod store;
pub mod summary;

use std::sync::Arc;

use callquote_core::audit::AuditSink;
use callquote_core::config::AppConfig;
use tracing::info;

pub use engine::{ConversationEngine, EngineSettings, TurnOutcome};
pub use extractor::{ExtractionRequest, Extractor, LlmExtractor};
pub use keyword::KeywordExtractor;
pub use runtime::{AgentRuntime, CallDirective, CallResponse, InboundTurn, RuntimeParts, RuntimeSettings};
pub use store::SessionStore;

/// Builds the engine for a configuration. With a zero rollout no LLM client
/// is created and every session uses keyword matching.
pub fn engine_from_config(
    config: &AppConfig,
    audit: Arc<dyn AuditSink>,
) -> anyhow::Result<ConversationEngine> {
    let agent: Option<Arc<dyn Extractor>> = if config.conversation.agent_rollout_pct == 0 {
        info!(event_name = "agent.disabled", "agent rollout is 0%, using keyword strategy only");
        None
    } else {
        let client = llm::client_from_config(&config.llm)?;
        info!(
            event_name = "agent.llm_configured",
            provider = client.provider_name(),
            model = client.model_name(),
            rollout_pct = config.conversation.agent_rollout_pct,
            "llm extractor ready"
        );
        Some(Arc::new(LlmExtractor::new(client)))
    };

    Ok(ConversationEngine::new(agent, EngineSettings::from_config(config), audit))
}
