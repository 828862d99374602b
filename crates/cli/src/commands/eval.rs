//! Scripted scenario evaluation.
//!
//! Each scenario plays caller utterances through the keyword runtime and is
//! scored on the fields it collected, the status it ended in, the number of
//! caller turns it needed and the fields it must have left unanswered.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use callquote_agent::EngineSettings;
use callquote_core::business::BusinessProfile;
use callquote_core::domain::session::{SessionId, SessionStatus};
use callquote_core::pricing::{DistanceLookup, FixedDistance, NoDistanceLookup};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::commands::simulate::play_call;
use crate::commands::{current_thread_runtime, load_business, load_config, CommandResult};

/// Share of checks a scenario must pass, and share of scenarios a suite must pass.
pub const PASS_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Default)]
pub struct EvalArgs {
    pub business: String,
    pub suite: Option<PathBuf>,
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalScenario {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub utterances: Vec<String>,
    #[serde(default)]
    pub expect: ScenarioExpectation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioExpectation {
    /// Values the call must end with, in their JSON form.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Fields that must stay unanswered.
    #[serde(default)]
    pub absent: Vec<String>,
    #[serde(default)]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub max_turns: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct EvalSuite {
    scenarios: Vec<EvalScenario>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioResult {
    pub id: String,
    pub name: String,
    pub passed: bool,
    pub score: f64,
    pub extraction_accuracy: f64,
    pub caller_turns: usize,
    pub status: Option<SessionStatus>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
    pub avg_score: f64,
    pub results: Vec<ScenarioResult>,
}

impl EvalSummary {
    pub fn is_passing(&self) -> bool {
        self.total > 0 && self.pass_rate >= PASS_THRESHOLD
    }
}

pub fn run(args: &EvalArgs) -> CommandResult {
    let config = match load_config("eval") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match current_thread_runtime("eval") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    let profile = match load_business("eval", &config, &runtime, &args.business) {
        Ok(profile) => profile,
        Err(failure) => return failure,
    };

    let scenarios = match &args.suite {
        Some(path) => match read_suite(path) {
            Ok(scenarios) => scenarios,
            Err(message) => return CommandResult::failure("eval", "suite_read", message, 6),
        },
        None => default_suite(),
    };

    let distance: Arc<dyn DistanceLookup> = match args.distance_km {
        Some(km) => Arc::new(FixedDistance(km)),
        None => Arc::new(NoDistanceLookup),
    };
    let settings = EngineSettings {
        history_turns: config.conversation.history_turns,
        stuck_loop_threshold: config.conversation.stuck_loop_threshold,
        ..EngineSettings::default()
    };

    let summary = match runtime.block_on(evaluate(&profile, settings, distance, &scenarios)) {
        Ok(summary) => summary,
        Err(message) => return CommandResult::failure("eval", "evaluation", message, 7),
    };
    let report = match serde_json::to_string(&summary) {
        Ok(report) => report,
        Err(error) => return CommandResult::failure("eval", "serialization", error.to_string(), 7),
    };

    if summary.is_passing() {
        CommandResult::success("eval", report)
    } else {
        CommandResult::failure("eval", "eval_failed", report, 8)
    }
}

fn read_suite(path: &Path) -> Result<Vec<EvalScenario>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("could not read `{}`: {error}", path.display()))?;
    let suite: EvalSuite = serde_json::from_str(&raw)
        .map_err(|error| format!("`{}` is not a scenario suite: {error}", path.display()))?;
    if suite.scenarios.is_empty() {
        return Err(format!("`{}` declares no scenarios", path.display()));
    }
    Ok(suite.scenarios)
}

pub async fn evaluate(
    profile: &BusinessProfile,
    settings: EngineSettings,
    distance: Arc<dyn DistanceLookup>,
    scenarios: &[EvalScenario],
) -> Result<EvalSummary, String> {
    let mut results = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        let session_id = SessionId(format!("EVAL-{}", scenario.id));
        let call =
            play_call(profile, settings.clone(), distance.clone(), session_id, &scenario.utterances).await?;
        let fields = call
            .record
            .as_ref()
            .map(|record| {
                record.fields.iter().map(|(name, value)| (name.clone(), value.to_json())).collect()
            })
            .unwrap_or_default();
        let status = call.record.as_ref().map(|record| record.status);
        results.push(score(scenario, &fields, status, call.caller_turns));
    }

    let total = results.len();
    let passed = results.iter().filter(|result| result.passed).count();
    let ratio = |value: f64| if total == 0 { 0.0 } else { value / total as f64 };
    Ok(EvalSummary {
        total,
        passed,
        failed: total - passed,
        pass_rate: ratio(passed as f64),
        avg_score: ratio(results.iter().map(|result| result.score).sum()),
        results,
    })
}

/// Scores one played scenario against its expectations.
pub fn score(
    scenario: &EvalScenario,
    fields: &BTreeMap<String, Value>,
    status: Option<SessionStatus>,
    caller_turns: usize,
) -> ScenarioResult {
    let expect = &scenario.expect;
    let mut checks = 0usize;
    let mut passed_checks = 0usize;
    let mut failures = Vec::new();
    let mut check = |failures_before: usize, failures: &[String]| {
        checks += 1;
        if failures.len() == failures_before {
            passed_checks += 1;
        }
    };

    let correct = expect
        .fields
        .iter()
        .filter(|(name, expected)| fields.get(*name) == Some(*expected))
        .count();
    let extraction_accuracy =
        if expect.fields.is_empty() { 1.0 } else { correct as f64 / expect.fields.len() as f64 };
    if !expect.fields.is_empty() {
        let before = failures.len();
        for (name, expected) in &expect.fields {
            match fields.get(name) {
                Some(actual) if actual == expected => {}
                Some(actual) => failures.push(format!("field `{name}`: expected {expected}, got {actual}")),
                None => failures.push(format!("field `{name}`: expected {expected}, never collected")),
            }
        }
        check(before, &failures);
    }
    if !expect.absent.is_empty() {
        let before = failures.len();
        for name in &expect.absent {
            if let Some(actual) = fields.get(name) {
                failures.push(format!("field `{name}` should stay unanswered, got {actual}"));
            }
        }
        check(before, &failures);
    }
    if let Some(expected) = expect.status {
        let before = failures.len();
        if status != Some(expected) {
            let actual = status.map(|status| status.as_str()).unwrap_or("none");
            failures.push(format!("status: expected {}, got {actual}", expected.as_str()));
        }
        check(before, &failures);
    }
    if let Some(max_turns) = expect.max_turns {
        let before = failures.len();
        if caller_turns > max_turns {
            failures.push(format!("took {caller_turns} caller turns, limit {max_turns}"));
        }
        check(before, &failures);
    }

    let score = if checks == 0 {
        failures.push("scenario declares no expectations".to_string());
        0.0
    } else {
        passed_checks as f64 / checks as f64
    };

    ScenarioResult {
        id: scenario.id.clone(),
        name: scenario.name.clone(),
        passed: score >= PASS_THRESHOLD,
        score,
        extraction_accuracy,
        caller_turns,
        status,
        failures,
    }
}

fn utterances(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|line| (*line).to_string()).collect()
}

fn expected_fields(values: &[(&str, Value)]) -> BTreeMap<String, Value> {
    values.iter().map(|(name, value)| ((*name).to_string(), value.clone())).collect()
}

/// Built-in suite for the piano-moving profile.
pub fn default_suite() -> Vec<EvalScenario> {
    vec![
        EvalScenario {
            id: "happy_path".to_string(),
            name: "Linear conversation".to_string(),
            description: Some("Caller answers each question in order.".to_string()),
            utterances: utterances(&[
                "I need to move my piano",
                "It's an upright",
                "56 Turnip Street, Brisbane QLD",
                "56 Tring Street, Gold Coast QLD",
                "No stairs",
                "Yes to insurance",
            ]),
            expect: ScenarioExpectation {
                fields: expected_fields(&[
                    ("piano_type", json!("upright")),
                    ("pickup_address", json!("56 Turnip Street, Brisbane QLD")),
                    ("delivery_address", json!("56 Tring Street, Gold Coast QLD")),
                    ("stairs_count", json!(0)),
                    ("has_insurance", json!(true)),
                ]),
                absent: Vec::new(),
                status: Some(SessionStatus::Complete),
                max_turns: Some(6),
            },
        },
        EvalScenario {
            id: "unanswered_insurance".to_string(),
            name: "Undecided caller".to_string(),
            description: Some("An unclear yes/no answer must not default to either.".to_string()),
            utterances: utterances(&["a grand", "1 Main St", "2 Oak Rd", "3 stairs", "hmm let me think"]),
            expect: ScenarioExpectation {
                fields: expected_fields(&[("piano_type", json!("grand")), ("stairs_count", json!(3))]),
                absent: vec!["has_insurance".to_string()],
                status: Some(SessionStatus::Abandoned),
                max_turns: None,
            },
        },
        EvalScenario {
            id: "stuck_loop".to_string(),
            name: "Caller never answers".to_string(),
            description: Some("Two unresolved turns on one field hand the call to a person.".to_string()),
            utterances: utterances(&["umm", "hmm", "still here"]),
            expect: ScenarioExpectation {
                fields: BTreeMap::new(),
                absent: vec!["piano_type".to_string()],
                status: Some(SessionStatus::Escalated),
                max_turns: Some(2),
            },
        },
    ]
}
