//! Rollout plans — the ordered traffic steps each strategy walks through.

use std::time::Duration;

use rampart_core::{ConfigError, ConfigResult, RampartConfig, field_duration};
use rampart_state::{Strategy, TrafficSplit};
use serde::{Deserialize, Serialize};

/// Which instance groups a failed rolling release reports as reverted.
///
/// The router only takes a stable/candidate split, so both scopes command
/// the same revert to stable 100 / candidate 0. The scope decides which
/// groups land in `RollbackResult::reverted_groups` and the postmortem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertScope {
    /// Only the groups already updated.
    Partial,
    /// Every group in the fleet.
    Full,
}

impl std::str::FromStr for RevertScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partial" => Ok(RevertScope::Partial),
            "full" => Ok(RevertScope::Full),
            other => Err(ConfigError::Invalid {
                field: "rolling.revert_scope".to_string(),
                reason: format!("unknown revert scope {other:?}"),
            }),
        }
    }
}

/// One traffic change followed by an observation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stage name, e.g. `canary_5pct`, `group_2_of_4`, `switch_traffic`.
    pub stage: String,
    pub split: TrafficSplit,
    pub observation: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub strategy: Strategy,
    pub steps: Vec<PlanStep>,
    /// Hold at the current step when the window ends DEGRADED.
    pub hold_on_degraded: bool,
    /// Pause after each healthy window until promoted.
    pub manual_promotion: bool,
    /// Roll back when a DEGRADED hold lasts longer than this.
    pub degraded_timeout: Option<Duration>,
    pub auto_resume_on_recovery: bool,
    /// Instance groups, for rolling releases.
    pub groups: Option<u32>,
    pub revert_scope: RevertScope,
}

impl RolloutPlan {
    pub fn step(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 >= self.steps.len()
    }

    /// Instance groups recorded as reverted after a failure at step `index`.
    pub fn groups_to_revert(&self, index: usize) -> Vec<u32> {
        match (self.groups, self.revert_scope) {
            (None, _) => Vec::new(),
            (Some(total), RevertScope::Full) => (1..=total).collect(),
            (Some(total), RevertScope::Partial) => (1..=(index as u32 + 1).min(total)).collect(),
        }
    }
}

/// Plans and timing derived from `rampart.toml`.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutSettings {
    pub canary_steps: Vec<u8>,
    pub canary_base_observation: Duration,
    pub canary_max_observation: Duration,
    pub canary_auto_promote: bool,
    pub degraded_timeout: Option<Duration>,
    pub auto_resume_on_recovery: bool,
    pub blue_green_observation: Duration,
    pub direct_observation: Duration,
    pub rolling_groups: u32,
    pub rolling_observation: Duration,
    pub revert_scope: RevertScope,
    pub rollback_timeout: Duration,
}

impl RolloutSettings {
    pub fn from_config(config: &RampartConfig) -> ConfigResult<Self> {
        let degraded_timeout = config
            .canary
            .degraded_timeout
            .as_deref()
            .map(|t| field_duration("canary.degraded_timeout", t))
            .transpose()?;
        Ok(Self {
            canary_steps: config.canary.steps.clone(),
            canary_base_observation: field_duration(
                "canary.base_observation",
                &config.canary.base_observation,
            )?,
            canary_max_observation: field_duration(
                "canary.max_observation",
                &config.canary.max_observation,
            )?,
            canary_auto_promote: config.canary.auto_promote,
            degraded_timeout,
            auto_resume_on_recovery: config.canary.auto_resume_on_recovery,
            blue_green_observation: field_duration(
                "blue_green.observation",
                &config.blue_green.observation,
            )?,
            direct_observation: field_duration("direct.observation", &config.direct.observation)?,
            rolling_groups: config.rolling.groups,
            rolling_observation: field_duration("rolling.observation", &config.rolling.observation)?,
            revert_scope: config.rolling.revert_scope.parse()?,
            rollback_timeout: field_duration("rollback.timeout", &config.rollback.timeout)?,
        })
    }

    /// Observation for canary step `index` (0-based): `base × (index + 1)`,
    /// capped at the maximum.
    pub fn canary_observation(&self, index: usize) -> Duration {
        self.canary_base_observation
            .saturating_mul(index as u32 + 1)
            .min(self.canary_max_observation)
    }

    /// Build the plan for a release. `auto_promote` overrides the canary
    /// default when set.
    pub fn plan(&self, strategy: Strategy, auto_promote: Option<bool>) -> RolloutPlan {
        let single = |stage: &str, observation: Duration| {
            vec![PlanStep {
                stage: stage.to_string(),
                split: TrafficSplit::candidate(100),
                observation,
            }]
        };

        let (steps, groups) = match strategy {
            Strategy::BlueGreen => (single("switch_traffic", self.blue_green_observation), None),
            Strategy::Direct => (single("deploy", self.direct_observation), None),
            Strategy::Canary => {
                let steps = self
                    .canary_steps
                    .iter()
                    .enumerate()
                    .map(|(i, &pct)| PlanStep {
                        stage: format!("canary_{pct}pct"),
                        split: TrafficSplit::candidate(pct),
                        observation: self.canary_observation(i),
                    })
                    .collect();
                (steps, None)
            }
            Strategy::Rolling => {
                let total = self.rolling_groups.max(1);
                let steps = (1..=total)
                    .map(|g| PlanStep {
                        stage: format!("group_{g}_of_{total}"),
                        split: TrafficSplit::candidate(group_percent(g, total)),
                        observation: self.rolling_observation,
                    })
                    .collect();
                (steps, Some(total))
            }
        };

        let canary = strategy == Strategy::Canary;
        RolloutPlan {
            strategy,
            steps,
            hold_on_degraded: canary,
            manual_promotion: canary && !auto_promote.unwrap_or(self.canary_auto_promote),
            degraded_timeout: if canary { self.degraded_timeout } else { None },
            auto_resume_on_recovery: canary && self.auto_resume_on_recovery,
            groups,
            revert_scope: self.revert_scope,
        }
    }
}

impl Default for RolloutSettings {
    fn default() -> Self {
        let mins = |m: u64| Duration::from_secs(m * 60);
        Self {
            canary_steps: vec![1, 5, 25, 100],
            canary_base_observation: mins(5),
            canary_max_observation: mins(10),
            canary_auto_promote: true,
            degraded_timeout: None,
            auto_resume_on_recovery: false,
            blue_green_observation: mins(2),
            direct_observation: mins(2),
            rolling_groups: 4,
            rolling_observation: mins(2),
            revert_scope: RevertScope::Partial,
            rollback_timeout: mins(3),
        }
    }
}

/// Share of traffic served by the first `group` of `total` groups.
fn group_percent(group: u32, total: u32) -> u8 {
    ((group * 100 + total / 2) / total).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mins(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[test]
    fn canary_plan_uses_proportional_observation() {
        let settings = RolloutSettings::default();
        let plan = settings.plan(Strategy::Canary, None);
        let pcts: Vec<u8> = plan.steps.iter().map(|s| s.split.candidate).collect();
        assert_eq!(pcts, vec![1, 5, 25, 100]);
        let windows: Vec<Duration> = plan.steps.iter().map(|s| s.observation).collect();
        assert_eq!(windows, vec![mins(5), mins(10), mins(10), mins(10)]);
        assert_eq!(plan.steps[1].stage, "canary_5pct");
        assert!(plan.hold_on_degraded);
        assert!(!plan.manual_promotion);
        assert!(plan.steps.iter().all(|s| s.split.is_valid()));
    }

    #[test]
    fn auto_promote_override() {
        let settings = RolloutSettings::default();
        assert!(settings.plan(Strategy::Canary, Some(false)).manual_promotion);
        assert!(!settings.plan(Strategy::BlueGreen, Some(false)).manual_promotion);
    }

    #[test]
    fn blue_green_and_direct_are_single_step() {
        let settings = RolloutSettings::default();
        let bg = settings.plan(Strategy::BlueGreen, None);
        assert_eq!(bg.steps.len(), 1);
        assert_eq!(bg.steps[0].stage, "switch_traffic");
        assert_eq!(bg.steps[0].split, TrafficSplit { stable: 0, candidate: 100 });
        assert_eq!(bg.steps[0].observation, mins(2));
        assert!(!bg.hold_on_degraded);

        let direct = settings.plan(Strategy::Direct, None);
        assert_eq!(direct.steps[0].stage, "deploy");
    }

    #[test]
    fn rolling_groups_and_revert_scope() {
        let mut settings = RolloutSettings::default();
        settings.rolling_groups = 3;
        let plan = settings.plan(Strategy::Rolling, None);
        let pcts: Vec<u8> = plan.steps.iter().map(|s| s.split.candidate).collect();
        assert_eq!(pcts, vec![33, 67, 100]);
        assert_eq!(plan.steps[0].stage, "group_1_of_3");
        assert_eq!(plan.groups_to_revert(1), vec![1, 2]);

        settings.revert_scope = RevertScope::Full;
        let plan = settings.plan(Strategy::Rolling, None);
        assert_eq!(plan.groups_to_revert(0), vec![1, 2, 3]);
    }

    #[test]
    fn default_settings_match_default_config() {
        let from_config = RolloutSettings::from_config(&RampartConfig::default()).unwrap();
        assert_eq!(from_config, RolloutSettings::default());
    }

    #[test]
    fn settings_from_config() {
        let mut config = RampartConfig::default();
        config.canary.degraded_timeout = Some("15m".to_string());
        config.rolling.revert_scope = "full".to_string();
        let settings = RolloutSettings::from_config(&config).unwrap();
        assert_eq!(settings.degraded_timeout, Some(mins(15)));
        assert_eq!(settings.revert_scope, RevertScope::Full);
        assert_eq!(settings.rollback_timeout, mins(3));
    }
}
