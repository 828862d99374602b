//! Twilio voice webhooks.
//!
//! `POST /voice` receives every speech turn and answers with TwiML.
//! `POST /voice/status` receives call progress callbacks; a finished call
//! abandons whatever session is still open.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Form, Router,
};
use callquote_agent::{AgentRuntime, CallDirective, CallResponse, InboundTurn};
use callquote_core::config::TelephonyConfig;
use callquote_core::domain::call::CallRecord;
use callquote_core::domain::session::SessionId;
use callquote_db::CallRecordRepository;
use serde::Deserialize;
use tera::{Context, Tera};
use tracing::{error, info, warn};

const NO_SPEECH_MESSAGE: &str = "I didn't hear anything. Please call back when you're ready.";
const TRANSFER_NOTICE: &str = "Transferring you now...";
const FINISHED_CALL_STATUSES: &[&str] = &["completed", "busy", "failed", "no-answer", "canceled"];
const RESPONSE_TEMPLATE: &str = "response.xml";
const RENDER_FAILED_TWIML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>\
<Say>Sorry, we can't take this call right now. Please call our main office.</Say><Hangup/></Response>";

/// Carrier voice settings applied to every rendered response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TwimlSettings {
    pub voice: String,
    pub language: String,
    pub gather_timeout_secs: u32,
    pub speech_timeout_secs: u32,
}

impl TwimlSettings {
    pub fn from_config(config: &TelephonyConfig) -> Self {
        Self {
            voice: config.voice.clone(),
            language: config.language.clone(),
            gather_timeout_secs: config.gather_timeout_secs,
            speech_timeout_secs: config.speech_timeout_secs,
        }
    }
}

#[derive(Clone)]
pub struct VoiceState {
    pub runtime: Arc<AgentRuntime>,
    pub records: Arc<dyn CallRecordRepository>,
    pub twiml: Arc<TwimlRenderer>,
}

#[derive(Debug, Deserialize)]
pub struct VoiceWebhook {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "SpeechResult", default)]
    pub speech_result: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusWebhook {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus", default)]
    pub call_status: String,
}

pub fn router(state: VoiceState) -> Router {
    Router::new()
        .route("/voice", post(voice_turn))
        .route("/voice/status", post(call_status))
        .with_state(state)
}

/// Renders `<Response>` documents. The template is registered under an
/// `.xml` name so tera escapes every interpolated value.
pub struct TwimlRenderer {
    tera: Tera,
    settings: TwimlSettings,
}

impl TwimlRenderer {
    pub fn new(settings: TwimlSettings) -> Result<Self, tera::Error> {
        let mut tera = Tera::default();
        tera.add_raw_template(RESPONSE_TEMPLATE, include_str!("../templates/twiml/response.xml"))?;
        Ok(Self { tera, settings })
    }

    pub fn render(&self, response: &CallResponse) -> Result<String, tera::Error> {
        let mut context = Context::new();
        context.insert("voice", &self.settings.voice);
        context.insert("language", &self.settings.language);
        context.insert("gather_timeout_secs", &self.settings.gather_timeout_secs);
        context.insert("speech_timeout_secs", &self.settings.speech_timeout_secs);
        context.insert("prompt", &response.prompt);
        context.insert("no_speech_message", NO_SPEECH_MESSAGE);
        context.insert("transfer_notice", TRANSFER_NOTICE);
        let directive = match &response.directive {
            CallDirective::ContinueListening => "gather",
            CallDirective::TransferToHuman(number) => {
                context.insert("transfer_number", number);
                "transfer"
            }
            CallDirective::EndCall => "end",
        };
        context.insert("directive", directive);

        Ok(self.tera.render(RESPONSE_TEMPLATE, &context)?.trim().to_string())
    }
}

fn twiml_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml; charset=utf-8")], body).into_response()
}

pub(crate) async fn persist_record(records: &dyn CallRecordRepository, record: &CallRecord) {
    match records.save(record).await {
        Ok(()) => info!(
            event_name = "call_record.saved",
            correlation_id = %record.session_id,
            business_id = %record.business_id,
            status = record.status.as_str(),
            "call record persisted"
        ),
        Err(error) => error!(
            event_name = "call_record.save_failed",
            correlation_id = %record.session_id,
            error = %error,
            "call record could not be persisted"
        ),
    }
}

async fn voice_turn(State(state): State<VoiceState>, Form(webhook): Form<VoiceWebhook>) -> Response {
    let call_sid = webhook.call_sid.trim();
    if call_sid.is_empty() {
        warn!(event_name = "voice.webhook_rejected", reason = "missing_call_sid", "voice webhook without CallSid");
        return (StatusCode::BAD_REQUEST, "CallSid is required").into_response();
    }

    let response = state
        .runtime
        .respond(InboundTurn {
            session_id: SessionId(call_sid.to_string()),
            caller: webhook.from,
            called: webhook.to,
            utterance: webhook.speech_result,
        })
        .await;

    if let Some(record) = &response.record {
        persist_record(state.records.as_ref(), record).await;
    }
    match state.twiml.render(&response) {
        Ok(body) => twiml_response(body),
        Err(error) => {
            error!(
                event_name = "voice.render_failed",
                correlation_id = %call_sid,
                error = %error,
                "twiml response could not be rendered"
            );
            twiml_response(RENDER_FAILED_TWIML.to_string())
        }
    }
}

async fn call_status(State(state): State<VoiceState>, Form(webhook): Form<StatusWebhook>) -> StatusCode {
    let status = webhook.call_status.trim().to_ascii_lowercase();
    if !FINISHED_CALL_STATUSES.contains(&status.as_str()) {
        return StatusCode::NO_CONTENT;
    }

    let session_id = SessionId(webhook.call_sid.trim().to_string());
    if let Some(record) = state.runtime.hang_up(&session_id).await {
        info!(
            event_name = "voice.call_ended",
            correlation_id = %session_id,
            call_status = %status,
            "carrier ended the call before the conversation finished"
        );
        persist_record(state.records.as_ref(), &record).await;
    }
    StatusCode::NO_CONTENT
}
