//! Task classification: (task_type, prompt, routing policy) to
//! (route_class, risk_level).
//!
//! Deterministic and case-insensitive. The policy supplies defaults,
//! per-task-type overrides, and keyword rules that can only upgrade a
//! task (route to HEAVY, risk to high) -- never downgrade.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use marshal_db::models::{RiskLevel, RouteClass};

use crate::error::{CoreError, Result};

/// Default classification applied before overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteDefaults {
    pub route_class: Option<RouteClass>,
    pub risk_level: Option<RiskLevel>,
}

/// Per-task-type replacement of either classification field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteOverride {
    pub route_class: Option<RouteClass>,
    pub risk_level: Option<RiskLevel>,
}

/// Prompt keyword rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeywordRules {
    /// Any match upgrades the route class to HEAVY.
    #[serde(default)]
    pub heavy: Vec<String>,
    /// Any match upgrades the risk level to high.
    #[serde(default)]
    pub high_risk: Vec<String>,
}

/// The routing policy file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub default: RouteDefaults,
    #[serde(default)]
    pub task_type_overrides: BTreeMap<String, RouteOverride>,
    #[serde(default)]
    pub keyword_rules: KeywordRules,
}

impl RoutingPolicy {
    /// Load from a TOML file. A missing file yields the built-in defaults;
    /// an unparsable file is an error rather than a silent fallback.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| {
            CoreError::InvalidArgument(format!("routing policy {}: {e}", path.display()))
        })
    }
}

/// Result of classifying a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Classification {
    pub route_class: RouteClass,
    pub risk_level: RiskLevel,
}

/// Classify a task. Pure and deterministic.
pub fn classify(task_type: &str, prompt: &str, policy: &RoutingPolicy) -> Classification {
    let task_type = task_type.trim().to_lowercase();
    let prompt = prompt.to_lowercase();

    let mut route_class = policy.default.route_class.unwrap_or(RouteClass::Light);
    let mut risk_level = policy.default.risk_level.unwrap_or(RiskLevel::Low);

    if let Some(overrides) = policy.task_type_overrides.get(&task_type) {
        if let Some(route) = overrides.route_class {
            route_class = route;
        }
        if let Some(risk) = overrides.risk_level {
            risk_level = risk;
        }
    }

    if policy
        .keyword_rules
        .heavy
        .iter()
        .any(|word| prompt.contains(&word.to_lowercase()))
    {
        route_class = RouteClass::Heavy;
    }

    if policy
        .keyword_rules
        .high_risk
        .iter()
        .any(|word| prompt.contains(&word.to_lowercase()))
    {
        risk_level = RiskLevel::High;
    }

    Classification {
        route_class,
        risk_level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RoutingPolicy {
        toml::from_str(
            r#"
            [default]
            route_class = "LIGHT"
            risk_level = "low"

            [task_type_overrides.code_refactor]
            route_class = "HEAVY"
            risk_level = "medium"

            [keyword_rules]
            heavy = ["migrate", "full rebuild"]
            high_risk = ["production", "delete"]
            "#,
        )
        .expect("policy parses")
    }

    #[test]
    fn defaults_apply_for_unknown_type() {
        let c = classify("ping", "hello", &policy());
        assert_eq!(c.route_class, RouteClass::Light);
        assert_eq!(c.risk_level, RiskLevel::Low);
    }

    #[test]
    fn task_type_override_replaces_both_fields() {
        let c = classify("code_refactor", "tidy the parser", &policy());
        assert_eq!(c.route_class, RouteClass::Heavy);
        assert_eq!(c.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn task_type_match_is_case_insensitive() {
        let c = classify("  Code_Refactor ", "tidy", &policy());
        assert_eq!(c.route_class, RouteClass::Heavy);
    }

    #[test]
    fn keywords_upgrade_route_and_risk() {
        let c = classify("ping", "please MIGRATE the Production schema", &policy());
        assert_eq!(c.route_class, RouteClass::Heavy);
        assert_eq!(c.risk_level, RiskLevel::High);
    }

    #[test]
    fn keywords_never_downgrade() {
        let c = classify("code_refactor", "small tweak", &policy());
        // Override already set HEAVY/medium; no keyword can lower it.
        assert_eq!(c.route_class, RouteClass::Heavy);
        assert_eq!(c.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn empty_policy_falls_back_to_light_low() {
        let c = classify("anything", "anything", &RoutingPolicy::default());
        assert_eq!(c.route_class, RouteClass::Light);
        assert_eq!(c.risk_level, RiskLevel::Low);
    }
}
