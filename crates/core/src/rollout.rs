//! Strategy selection for new sessions.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// LLM extractor, with the keyword matcher as per-turn fallback.
    Agent,
    /// Keyword matcher only.
    Keyword,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Keyword => "keyword",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "agent" => Some(Self::Agent),
            "keyword" => Some(Self::Keyword),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RolloutConfig {
    /// Share of sessions, 0..=100, that get the agent strategy.
    pub agent_rollout_pct: u8,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self { agent_rollout_pct: 100 }
    }
}

/// Stable bucket in `0..100` for an identifier.
pub fn rollout_bucket(identifier: &str) -> u8 {
    let hash = blake3::hash(identifier.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % 100) as u8
}

pub fn choose_strategy(identifier: &str, rollout: &RolloutConfig) -> StrategyKind {
    if rollout_bucket(identifier) < rollout.agent_rollout_pct.min(100) {
        StrategyKind::Agent
    } else {
        StrategyKind::Keyword
    }
}

#[cfg(test)]
mod tests {
    use super::{choose_strategy, rollout_bucket, RolloutConfig, StrategyKind};

    #[test]
    fn selection_is_stable_per_identifier() {
        let rollout = RolloutConfig { agent_rollout_pct: 50 };
        let first = choose_strategy("CA1234567890", &rollout);
        for _ in 0..10 {
            assert_eq!(choose_strategy("CA1234567890", &rollout), first);
        }
    }

    #[test]
    fn bounds_route_everything_to_one_strategy() {
        let all = RolloutConfig { agent_rollout_pct: 100 };
        let none = RolloutConfig { agent_rollout_pct: 0 };
        for index in 0..200 {
            let id = format!("CA{index:032}");
            assert_eq!(choose_strategy(&id, &all), StrategyKind::Agent);
            assert_eq!(choose_strategy(&id, &none), StrategyKind::Keyword);
        }
    }

    #[test]
    fn partial_rollout_splits_traffic() {
        let rollout = RolloutConfig { agent_rollout_pct: 50 };
        let agents = (0..1000)
            .filter(|index| {
                choose_strategy(&format!("call-{index}"), &rollout) == StrategyKind::Agent
            })
            .count();
        assert!((350..=650).contains(&agents), "agent share was {agents}/1000");
        assert!(rollout_bucket("anything") < 100);
    }
}
