//! Release risk scoring.
//!
//! The score is the mean of three factors on a 1–10 scale: how much of the
//! fleet the strategy exposes at once, how critical the target environment
//! is, and whether the release lands during peak hours.

use std::fmt;

use rampart_state::Strategy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 8.0 {
            RiskLevel::Critical
        } else if score >= 6.0 {
            RiskLevel::High
        } else if score >= 4.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
    pub strategy_risk: f64,
    pub environment_risk: f64,
    pub time_risk: f64,
    /// Strategy that keeps exposure proportionate to the score.
    pub suggested_strategy: Strategy,
}

fn strategy_risk(strategy: Strategy) -> f64 {
    match strategy {
        Strategy::Direct => 8.0,
        Strategy::Rolling => 5.0,
        Strategy::BlueGreen => 3.0,
        Strategy::Canary => 1.0,
    }
}

fn environment_risk(environment: &str) -> f64 {
    match environment.to_ascii_lowercase().as_str() {
        "development" | "dev" => 1.0,
        "staging" => 3.0,
        "production" | "prod" => 8.0,
        _ => 5.0,
    }
}

fn time_risk(hour_utc: u32) -> f64 {
    match hour_utc {
        9..=17 => 6.0,
        18..=22 => 3.0,
        _ => 1.0,
    }
}

/// Hour of day (UTC) for an epoch-millis timestamp.
pub fn hour_of_day_utc(epoch_ms: u64) -> u32 {
    ((epoch_ms / 3_600_000) % 24) as u32
}

pub fn suggest_strategy(score: f64) -> Strategy {
    if score >= 8.0 {
        Strategy::Canary
    } else if score >= 6.0 {
        Strategy::BlueGreen
    } else if score >= 4.0 {
        Strategy::Rolling
    } else {
        Strategy::Direct
    }
}

pub fn assess(strategy: Strategy, environment: &str, hour_utc: u32) -> RiskAssessment {
    let strategy_risk = strategy_risk(strategy);
    let environment_risk = environment_risk(environment);
    let time_risk = time_risk(hour_utc);
    let score = ((strategy_risk + environment_risk + time_risk) / 3.0).min(10.0);
    RiskAssessment {
        score,
        level: RiskLevel::from_score(score),
        strategy_risk,
        environment_risk,
        time_risk,
        suggested_strategy: suggest_strategy(score),
    }
}

pub fn risk_score(strategy: Strategy, environment: &str, hour_utc: u32) -> f64 {
    assess(strategy, environment, hour_utc).score
}
