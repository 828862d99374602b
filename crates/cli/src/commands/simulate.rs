use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use callquote_agent::{
    AgentRuntime, CallDirective, CallResponse, ConversationEngine, EngineSettings, InboundTurn,
    RuntimeParts, RuntimeSettings,
};
use callquote_core::audit::InMemoryAuditSink;
use callquote_core::business::{BusinessProfile, StaticSchemaSource};
use callquote_core::domain::call::CallRecord;
use callquote_core::domain::session::SessionId;
use callquote_core::notify::RecordingNotifier;
use callquote_core::pricing::{DistanceLookup, FixedDistance, NoDistanceLookup};
use callquote_core::rollout::RolloutConfig;

use crate::commands::{current_thread_runtime, load_business, load_config, CommandResult};

const SIMULATED_CALLER: &str = "+10000000000";

#[derive(Debug, Clone, Default)]
pub struct SimulateArgs {
    pub business: String,
    pub utterances: Vec<String>,
    pub script: Option<PathBuf>,
    pub distance_km: Option<f64>,
}

pub fn run(args: &SimulateArgs) -> CommandResult {
    let config = match load_config("simulate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match current_thread_runtime("simulate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    let profile = match load_business("simulate", &config, &runtime, &args.business) {
        Ok(profile) => profile,
        Err(failure) => return failure,
    };

    let mut utterances = args.utterances.clone();
    if let Some(path) = &args.script {
        match fs::read_to_string(path) {
            Ok(raw) => utterances.extend(
                raw.lines().map(str::trim).filter(|line| !line.is_empty()).map(str::to_string),
            ),
            Err(error) => {
                return CommandResult::failure(
                    "simulate",
                    "script_read",
                    format!("could not read `{}`: {error}", path.display()),
                    6,
                );
            }
        }
    }

    let distance: Arc<dyn DistanceLookup> = match args.distance_km {
        Some(km) => Arc::new(FixedDistance(km)),
        None => Arc::new(NoDistanceLookup),
    };
    let settings = EngineSettings {
        history_turns: config.conversation.history_turns,
        stuck_loop_threshold: config.conversation.stuck_loop_threshold,
        ..EngineSettings::default()
    };

    match runtime.block_on(simulate_call(&profile, settings, distance, &utterances)) {
        Ok(transcript) => CommandResult::success("simulate", transcript),
        Err(message) => CommandResult::failure("simulate", "simulation", message, 7),
    }
}

/// A scripted call played through a keyword-only runtime.
pub(crate) struct PlayedCall {
    pub lines: Vec<String>,
    pub caller_turns: usize,
    pub last: CallResponse,
    /// Terminal record; an unfinished call is hung up to produce one.
    pub record: Option<CallRecord>,
    pub notifier: RecordingNotifier,
}

pub(crate) async fn play_call(
    profile: &BusinessProfile,
    settings: EngineSettings,
    distance: Arc<dyn DistanceLookup>,
    session_id: SessionId,
    utterances: &[String],
) -> Result<PlayedCall, String> {
    let called = profile
        .phone_numbers
        .first()
        .cloned()
        .ok_or_else(|| format!("business `{}` has no phone number to call", profile.business_id))?;
    let businesses =
        StaticSchemaSource::new().with_profile(profile.clone()).map_err(|error| error.to_string())?;
    let audit = Arc::new(InMemoryAuditSink::default());
    let notifier = RecordingNotifier::default();
    let runtime = AgentRuntime::new(RuntimeParts {
        engine: ConversationEngine::new(None, settings, audit.clone()),
        businesses: Arc::new(businesses),
        distance,
        notifier: Arc::new(notifier.clone()),
        audit,
        settings: RuntimeSettings {
            rollout: RolloutConfig { agent_rollout_pct: 0 },
            ..RuntimeSettings::default()
        },
    })
    .map_err(|error| error.to_string())?;

    let turn = |utterance: Option<&str>| InboundTurn {
        session_id: session_id.clone(),
        caller: SIMULATED_CALLER.to_string(),
        called: called.clone(),
        utterance: utterance.map(str::to_string),
    };

    let mut lines = Vec::new();
    let mut caller_turns = 0;
    let mut last: CallResponse = runtime.respond(turn(None)).await;
    lines.push(format!("agent: {}", last.prompt));
    for utterance in utterances {
        if last.directive != CallDirective::ContinueListening {
            break;
        }
        caller_turns += 1;
        lines.push(format!("caller: {utterance}"));
        last = runtime.respond(turn(Some(utterance))).await;
        lines.push(format!("agent: {}", last.prompt));
    }

    let record = match (&last.directive, &last.record) {
        (CallDirective::ContinueListening, _) => runtime.hang_up(&session_id).await,
        (_, record) => record.clone(),
    };
    Ok(PlayedCall { lines, caller_turns, last, record, notifier })
}

/// Plays the utterances through a keyword-only runtime and renders the call.
pub(crate) async fn simulate_call(
    profile: &BusinessProfile,
    settings: EngineSettings,
    distance: Arc<dyn DistanceLookup>,
    utterances: &[String],
) -> Result<String, String> {
    let call = play_call(profile, settings, distance, SessionId("SIM-1".to_string()), utterances).await?;

    let mut lines = call.lines;
    let outcome = match &call.last.directive {
        CallDirective::ContinueListening => "call left unfinished".to_string(),
        CallDirective::TransferToHuman(number) => format!("transferred to {number}"),
        CallDirective::EndCall => match &call.record {
            Some(record) => format!("ended with status {}", record.status.as_str()),
            None => "ended".to_string(),
        },
    };
    lines.push(format!("outcome: {outcome}"));
    if let Some(quote) = &call.last.quote {
        lines.push(format!("quote total: {} {}", quote.currency, quote.total));
    }
    for delivery in call.notifier.deliveries() {
        lines.push(format!("sms to {}:\n{}", delivery.destination, delivery.body));
    }
    Ok(lines.join("\n"))
}
