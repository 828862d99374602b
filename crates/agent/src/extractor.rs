//! Extractor capability: turns one utterance into candidate field values.

use std::sync::Arc;

use async_trait::async_trait;
use callquote_core::business::BusinessProfile;
use callquote_core::domain::extraction::{ExtractionFailure, ExtractionResult};
use callquote_core::domain::field::FieldValues;
use callquote_core::domain::session::{Speaker, TranscriptEntry};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::llm::{ChatMessage, LlmClient};
use crate::prompt;

#[derive(Clone, Copy, Debug)]
pub struct ExtractionRequest<'a> {
    pub utterance: &'a str,
    /// Most recent transcript entries, oldest first, ending with `utterance`.
    pub history: &'a [TranscriptEntry],
    pub fields: &'a FieldValues,
    pub profile: &'a BusinessProfile,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        request: &ExtractionRequest<'_>,
    ) -> Result<ExtractionResult, ExtractionFailure>;

    fn name(&self) -> &'static str;
}

pub struct LlmExtractor {
    client: Arc<dyn LlmClient>,
}

impl LlmExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(
        &self,
        request: &ExtractionRequest<'_>,
    ) -> Result<ExtractionResult, ExtractionFailure> {
        let system = prompt::system_prompt(request.profile, request.fields, request.history);
        let messages = chat_messages(request);

        let raw = self
            .client
            .complete(&system, &messages)
            .await
            .map_err(|error| ExtractionFailure::Unavailable(error.to_string()))?;

        parse_agent_reply(&raw)
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}

fn chat_messages(request: &ExtractionRequest<'_>) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = request
        .history
        .iter()
        .map(|entry| match entry.speaker {
            Speaker::Customer => ChatMessage::user(&entry.text),
            Speaker::Agent => ChatMessage::assistant(&entry.text),
        })
        .collect();

    let ends_with_utterance = request
        .history
        .last()
        .map(|entry| entry.speaker == Speaker::Customer && entry.text == request.utterance)
        .unwrap_or(false);
    if !ends_with_utterance {
        messages.push(ChatMessage::user(request.utterance));
    }
    messages
}

#[derive(Debug, Deserialize)]
struct AgentReply {
    #[serde(alias = "reply_text", alias = "message")]
    response: Option<String>,
    #[serde(default)]
    extracted: Option<Map<String, Value>>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default, alias = "clarification_needed")]
    needs_clarification: Option<Vec<String>>,
    #[serde(default)]
    is_complete: Option<bool>,
    #[serde(default, alias = "escalate")]
    should_transfer_to_human: Option<bool>,
    #[serde(default, alias = "escalation_reason")]
    transfer_reason: Option<String>,
}

/// Removes a surrounding markdown code fence and any prose around the
/// outermost JSON object.
fn json_body(raw: &str) -> &str {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        body = body.trim_end().strip_suffix("```").unwrap_or(body).trim();
    }
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body,
    }
}

pub fn parse_agent_reply(raw: &str) -> Result<ExtractionResult, ExtractionFailure> {
    let reply: AgentReply = serde_json::from_str(json_body(raw))
        .map_err(|error| ExtractionFailure::Malformed(error.to_string()))?;

    let reply_text = reply.response.map(|text| text.trim().to_string()).unwrap_or_default();
    if reply_text.is_empty() {
        return Err(ExtractionFailure::Malformed("reply has no response text".to_string()));
    }
    if let Some(thinking) = &reply.thinking {
        debug!(event_name = "extraction.agent_thinking", thinking = %thinking, "agent reasoning");
    }

    let escalate = reply.should_transfer_to_human.unwrap_or(false);
    Ok(ExtractionResult {
        reply_text,
        extracted: reply.extracted.unwrap_or_default().into_iter().collect(),
        clarification_needed: reply.needs_clarification.unwrap_or_default().into_iter().collect(),
        is_complete: reply.is_complete.unwrap_or(false),
        escalate,
        escalation_reason: if escalate { reply.transfer_reason } else { None },
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use callquote_core::business::piano_moving_profile;
    use callquote_core::domain::extraction::ExtractionFailure;
    use callquote_core::domain::field::FieldValues;
    use serde_json::json;

    use super::{parse_agent_reply, ExtractionRequest, Extractor, LlmExtractor};
    use crate::llm::{ChatMessage, LlmClient};

    #[test]
    fn parses_reply_with_original_key_names() {
        let result = parse_agent_reply(
            r#"{"response":"Got it, a baby grand. Where are we picking it up?",
                "extracted":{"piano_type":"baby_grand","stairs_count":null},
                "thinking":"caller said baby grand",
                "needs_clarification":[],
                "is_complete":false,
                "should_transfer_to_human":false,
                "transfer_reason":null}"#,
        )
        .expect("valid reply");

        assert!(result.reply_text.starts_with("Got it"));
        assert_eq!(result.extracted.get("piano_type"), Some(&json!("baby_grand")));
        assert_eq!(result.extracted.get("stairs_count"), Some(&json!(null)));
        assert!(!result.escalate);
    }

    #[test]
    fn accepts_code_fences_and_alias_keys() {
        let result = parse_agent_reply(
            "```json\n{\"reply_text\":\"Connecting you now.\",\"escalate\":true,\"escalation_reason\":\"asked for a person\"}\n```",
        )
        .expect("fenced reply");

        assert!(result.escalate);
        assert_eq!(result.escalation_reason.as_deref(), Some("asked for a person"));
    }

    #[test]
    fn prose_or_empty_replies_are_malformed() {
        assert!(matches!(
            parse_agent_reply("Sure! The piano is an upright."),
            Err(ExtractionFailure::Malformed(_))
        ));
        assert!(matches!(
            parse_agent_reply(r#"{"response":"   ","extracted":{}}"#),
            Err(ExtractionFailure::Malformed(_))
        ));
    }

    struct CannedClient {
        reply: Result<String, String>,
        seen: Mutex<Vec<ChatMessage>>,
    }

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn complete(&self, _system: &str, messages: &[ChatMessage]) -> Result<String> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.extend_from_slice(messages);
            }
            self.reply.clone().map_err(|message| anyhow!(message))
        }

        fn model_name(&self) -> &str {
            "canned"
        }

        fn provider_name(&self) -> &str {
            "test"
        }
    }

    #[tokio::test]
    async fn client_errors_map_to_unavailable() {
        let profile = piano_moving_profile().expect("profile");
        let fields = FieldValues::new();
        let client =
            Arc::new(CannedClient { reply: Err("connection refused".to_string()), seen: Mutex::default() });
        let extractor = LlmExtractor::new(client.clone());

        let request =
            ExtractionRequest { utterance: "an upright", history: &[], fields: &fields, profile: &profile };
        let error = extractor.extract(&request).await.expect_err("client failure");

        assert!(matches!(error, ExtractionFailure::Unavailable(ref message) if message.contains("refused")));
        let seen = client.seen.lock().expect("seen lock");
        assert_eq!(seen.len(), 1, "utterance is sent even without history");
    }
}
