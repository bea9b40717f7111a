//! Execution policy evaluation.
//!
//! A pure function over (task_type, prompt, route_class, autonomy_mode,
//! execution policy). Rules apply in order: readonly mode always denies;
//! under strict enforcement the task type must appear in the route-class
//! allowlist; configured prompt keywords and path substrings deny; under
//! warn enforcement violations are reported but allowed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use marshal_db::models::RouteClass;

use crate::config::{AutonomyMode, Enforcement};
use crate::error::{CoreError, Result};

/// Why the evaluator allowed or denied a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyReason {
    Allowed,
    ReadonlyMode,
    UnknownTaskType,
    BlockedPromptKeyword,
    BlockedPathPattern,
}

impl fmt::Display for PolicyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Allowed => "allowed",
            Self::ReadonlyMode => "readonly_mode",
            Self::UnknownTaskType => "unknown_task_type",
            Self::BlockedPromptKeyword => "blocked_prompt_keyword",
            Self::BlockedPathPattern => "blocked_path_pattern",
        };
        f.write_str(s)
    }
}

/// The execution policy file.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionPolicy {
    /// File-configured enforcement level; the `ZHC_POLICY_ENFORCEMENT`
    /// environment override wins when present.
    #[serde(default = "default_enforcement")]
    pub enforcement: Enforcement,
    /// Allowed task types per route class ("LIGHT"/"HEAVY"). A missing
    /// entry means the route class is unrestricted.
    #[serde(default)]
    pub allowlist: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub blocked_prompt_keywords: Vec<String>,
    #[serde(default)]
    pub blocked_path_patterns: Vec<String>,
}

fn default_enforcement() -> Enforcement {
    Enforcement::Strict
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            enforcement: Enforcement::Strict,
            allowlist: BTreeMap::new(),
            blocked_prompt_keywords: Vec::new(),
            blocked_path_patterns: Vec::new(),
        }
    }
}

impl ExecutionPolicy {
    /// Load from a TOML file; a missing file yields the permissive default.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| {
            CoreError::InvalidArgument(format!("execution policy {}: {e}", path.display()))
        })
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: PolicyReason,
    pub enforcement: Enforcement,
}

/// Evaluate the execution policy for a task. Pure.
///
/// `enforcement_override` is the environment-level override; when `None`
/// the file-configured level applies.
pub fn evaluate(
    task_type: &str,
    prompt: &str,
    route_class: RouteClass,
    autonomy_mode: AutonomyMode,
    policy: &ExecutionPolicy,
    enforcement_override: Option<Enforcement>,
) -> PolicyDecision {
    let enforcement = enforcement_override.unwrap_or(policy.enforcement);

    // Readonly denies regardless of enforcement level.
    if autonomy_mode == AutonomyMode::Readonly {
        return PolicyDecision {
            allowed: false,
            reason: PolicyReason::ReadonlyMode,
            enforcement,
        };
    }

    let violation = first_violation(task_type, prompt, route_class, policy);
    match violation {
        None => PolicyDecision {
            allowed: true,
            reason: PolicyReason::Allowed,
            enforcement,
        },
        Some(reason) => PolicyDecision {
            // Warn mode reports the violation but allows execution.
            allowed: enforcement == Enforcement::Warn,
            reason,
            enforcement,
        },
    }
}

fn first_violation(
    task_type: &str,
    prompt: &str,
    route_class: RouteClass,
    policy: &ExecutionPolicy,
) -> Option<PolicyReason> {
    let task_type = task_type.trim().to_lowercase();
    let prompt_l = prompt.to_lowercase();

    if let Some(allowed_types) = policy.allowlist.get(&route_class.to_string()) {
        let known = allowed_types.iter().any(|t| t.to_lowercase() == task_type);
        if !known {
            return Some(PolicyReason::UnknownTaskType);
        }
    }

    if policy
        .blocked_prompt_keywords
        .iter()
        .any(|kw| !kw.is_empty() && prompt_l.contains(&kw.to_lowercase()))
    {
        return Some(PolicyReason::BlockedPromptKeyword);
    }

    if policy
        .blocked_path_patterns
        .iter()
        .any(|p| !p.is_empty() && prompt_l.contains(&p.to_lowercase()))
    {
        return Some(PolicyReason::BlockedPathPattern);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ExecutionPolicy {
        toml::from_str(
            r#"
            enforcement = "strict"
            blocked_prompt_keywords = ["rm -rf", "drop table"]
            blocked_path_patterns = ["/etc/", "~/.ssh"]

            [allowlist]
            LIGHT = ["ping", "summarize"]
            HEAVY = ["code_refactor", "deploy"]
            "#,
        )
        .expect("policy parses")
    }

    #[test]
    fn readonly_denies_everything() {
        let d = evaluate(
            "ping",
            "hello",
            RouteClass::Light,
            AutonomyMode::Readonly,
            &policy(),
            None,
        );
        assert!(!d.allowed);
        assert_eq!(d.reason, PolicyReason::ReadonlyMode);
    }

    #[test]
    fn readonly_denies_even_in_warn_mode() {
        let d = evaluate(
            "ping",
            "hello",
            RouteClass::Light,
            AutonomyMode::Readonly,
            &policy(),
            Some(Enforcement::Warn),
        );
        assert!(!d.allowed);
    }

    #[test]
    fn allowlisted_type_passes() {
        let d = evaluate(
            "ping",
            "hello",
            RouteClass::Light,
            AutonomyMode::Supervised,
            &policy(),
            None,
        );
        assert!(d.allowed);
        assert_eq!(d.reason, PolicyReason::Allowed);
    }

    #[test]
    fn unknown_type_denied_under_strict() {
        let d = evaluate(
            "mystery",
            "hello",
            RouteClass::Light,
            AutonomyMode::Supervised,
            &policy(),
            None,
        );
        assert!(!d.allowed);
        assert_eq!(d.reason, PolicyReason::UnknownTaskType);
    }

    #[test]
    fn allowlist_is_per_route_class() {
        // deploy is HEAVY-allowlisted only.
        let d = evaluate(
            "deploy",
            "ship it",
            RouteClass::Light,
            AutonomyMode::Supervised,
            &policy(),
            None,
        );
        assert!(!d.allowed);
        assert_eq!(d.reason, PolicyReason::UnknownTaskType);
    }

    #[test]
    fn blocked_keyword_denies() {
        let d = evaluate(
            "ping",
            "please RM -RF the cache",
            RouteClass::Light,
            AutonomyMode::Supervised,
            &policy(),
            None,
        );
        assert!(!d.allowed);
        assert_eq!(d.reason, PolicyReason::BlockedPromptKeyword);
    }

    #[test]
    fn blocked_path_denies() {
        let d = evaluate(
            "ping",
            "touch /etc/passwd",
            RouteClass::Light,
            AutonomyMode::Supervised,
            &policy(),
            None,
        );
        assert!(!d.allowed);
        assert_eq!(d.reason, PolicyReason::BlockedPathPattern);
    }

    #[test]
    fn warn_mode_reports_but_allows() {
        let d = evaluate(
            "mystery",
            "hello",
            RouteClass::Light,
            AutonomyMode::Supervised,
            &policy(),
            Some(Enforcement::Warn),
        );
        assert!(d.allowed);
        assert_eq!(d.reason, PolicyReason::UnknownTaskType);
    }

    #[test]
    fn missing_allowlist_means_unrestricted() {
        let open = ExecutionPolicy::default();
        let d = evaluate(
            "anything",
            "anything",
            RouteClass::Heavy,
            AutonomyMode::Auto,
            &open,
            None,
        );
        assert!(d.allowed);
    }
}
