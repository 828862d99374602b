use std::collections::{BTreeMap, BTreeSet};

use callquote_core::business::BusinessProfile;
use callquote_core::domain::extraction::ExtractionResult;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationDecision {
    Proceed,
    Escalate { reason_code: &'static str, reason: String, user_message: String },
}

impl EscalationDecision {
    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::Escalate { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Consecutive unresolved turns on one field before handing off.
    pub stuck_loop_threshold: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self { stuck_loop_threshold: 2 }
    }
}

impl EscalationPolicy {
    pub fn new(stuck_loop_threshold: u32) -> Self {
        Self { stuck_loop_threshold: stuck_loop_threshold.max(1) }
    }

    /// Bumps the streak of every unresolved field and clears the rest.
    pub fn record_turn(&self, streaks: &mut BTreeMap<String, u32>, unresolved: &BTreeSet<String>) {
        streaks.retain(|field, _| unresolved.contains(field));
        for field in unresolved {
            *streaks.entry(field.clone()).or_insert(0) += 1;
        }
    }

    pub fn evaluate(
        &self,
        result: &ExtractionResult,
        streaks: &BTreeMap<String, u32>,
        profile: &BusinessProfile,
    ) -> EscalationDecision {
        if result.escalate {
            let reason = result
                .escalation_reason
                .clone()
                .filter(|reason| !reason.trim().is_empty())
                .unwrap_or_else(|| "caller asked for a person".to_string());
            let user_message = if result.reply_text.trim().is_empty() {
                profile.escalation_message.clone()
            } else {
                result.reply_text.clone()
            };
            return EscalationDecision::Escalate {
                reason_code: "extractor_requested",
                reason,
                user_message,
            };
        }

        let stuck = streaks.iter().find(|(_, attempts)| **attempts >= self.stuck_loop_threshold);
        if let Some((field, attempts)) = stuck {
            return EscalationDecision::Escalate {
                reason_code: "stuck_loop",
                reason: format!("field `{field}` unresolved after {attempts} attempts"),
                user_message: profile.escalation_message.clone(),
            };
        }

        EscalationDecision::Proceed
    }
}
