//! Environment-driven control-plane configuration.
//!
//! Every knob has a safe default; the recognized variables are listed in
//! the repository README. Policy files are separate structured values
//! loaded by `classify` and `policy`.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

/// Operator-configured permission level for execution side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    Readonly,
    Supervised,
    Auto,
}

impl fmt::Display for AutonomyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Readonly => "readonly",
            Self::Supervised => "supervised",
            Self::Auto => "auto",
        };
        f.write_str(s)
    }
}

impl FromStr for AutonomyMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readonly" => Ok(Self::Readonly),
            "supervised" => Ok(Self::Supervised),
            "auto" => Ok(Self::Auto),
            other => Err(CoreError::InvalidArgument(format!(
                "invalid autonomy mode: {other:?}"
            ))),
        }
    }
}

/// Policy enforcement level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    Strict,
    Warn,
}

impl fmt::Display for Enforcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
        };
        f.write_str(s)
    }
}

impl FromStr for Enforcement {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            other => Err(CoreError::InvalidArgument(format!(
                "invalid policy enforcement: {other:?}"
            ))),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

/// Cost-estimation configuration.
#[derive(Debug, Clone)]
pub struct CostConfig {
    /// Whether the external pricing lookup may run at all.
    pub lookup_enabled: bool,
    /// Wall-clock budget for one pricing lookup.
    pub lookup_timeout_ms: u64,
    /// Model used for pricing when no route-specific model is configured.
    pub model_default: String,
    pub default_provider: String,
    pub default_model: String,
    pub fallback_provider: String,
    pub fallback_model: String,
    pub api_key: Option<String>,
    /// Pricing API base; overridable so tests can point at a local server.
    pub api_base: String,
}

impl CostConfig {
    pub fn from_env() -> Self {
        Self {
            lookup_enabled: env::var("ZHC_COST_LOOKUP_ENABLED")
                .map(|v| v.trim() == "1" || v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            lookup_timeout_ms: env_or("ZHC_COST_LOOKUP_TIMEOUT_MS", 800),
            model_default: env::var("ZHC_COST_MODEL_DEFAULT")
                .unwrap_or_else(|_| "anthropic/claude-sonnet-4".to_owned()),
            default_provider: env::var("ZHC_DEFAULT_PROVIDER").unwrap_or_else(|_| "openrouter".to_owned()),
            default_model: env::var("ZHC_DEFAULT_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-sonnet-4".to_owned()),
            fallback_provider: env::var("ZHC_FALLBACK_PROVIDER").unwrap_or_else(|_| "openrouter".to_owned()),
            fallback_model: env::var("ZHC_FALLBACK_MODEL")
                .unwrap_or_else(|_| "meta-llama/llama-3.1-70b-instruct".to_owned()),
            api_key: env::var("OPENROUTER_API_KEY").ok().filter(|v| !v.trim().is_empty()),
            api_base: "https://openrouter.ai/api/v1".to_owned(),
        }
    }
}

/// Control-plane configuration shared by the router and the CLI.
#[derive(Debug, Clone)]
pub struct PlaneConfig {
    /// Root for per-task artifact directories, memory files, the audit
    /// log, and the ingress lock/offset files.
    pub storage_root: PathBuf,
    pub routing_policy_path: PathBuf,
    pub approval_policy_path: PathBuf,
    pub execution_policy_path: PathBuf,
    /// Enforcement override from the environment; `None` defers to the
    /// execution policy file.
    pub policy_enforcement: Option<Enforcement>,
    pub autonomy_mode: AutonomyMode,
    pub runtime_mode: String,
    /// Explicit dispatch owner; defaults to `host:pid`.
    pub dispatch_owner: Option<String>,
    pub lease_seconds: i64,
    pub retry_max: u32,
    pub retry_backoff_seconds: f64,
    pub retry_jitter_seconds: f64,
    pub dispatch_timeout: Duration,
    pub context_token_budget: usize,
    pub context_token_budget_heavy: usize,
    /// Compaction quality target: compacted/input token ratio the plane
    /// aims for; reported, not enforced.
    pub context_target_ratio: f64,
    pub cost: CostConfig,
    /// Worker wrapper commands. The light tier falls back to a built-in
    /// stub when unset; the heavy tier must be configured to dispatch.
    pub worker_light_cmd: Option<String>,
    pub worker_heavy_cmd: Option<String>,
}

impl PlaneConfig {
    pub fn from_env() -> Self {
        Self {
            storage_root: env_path("ZHC_STORAGE_ROOT", "storage"),
            routing_policy_path: env_path("ZHC_ROUTING_POLICY", "shared/policies/routing.toml"),
            approval_policy_path: env_path("ZHC_APPROVAL_POLICY", "shared/policies/approvals.toml"),
            execution_policy_path: env_path("ZHC_EXECUTION_POLICY", "shared/policies/execution.toml"),
            policy_enforcement: env::var("ZHC_POLICY_ENFORCEMENT")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            autonomy_mode: env::var("ZHC_AUTONOMY_MODE")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(AutonomyMode::Supervised),
            runtime_mode: env::var("ZHC_RUNTIME_MODE").unwrap_or_else(|_| "single_node".to_owned()),
            dispatch_owner: env::var("ZHC_DISPATCH_OWNER").ok().filter(|v| !v.trim().is_empty()),
            lease_seconds: env_or("ZHC_DISPATCH_LEASE_SECONDS", 120),
            retry_max: env_or("ZHC_DISPATCH_RETRY_MAX", 1),
            retry_backoff_seconds: env_or("ZHC_DISPATCH_RETRY_BACKOFF_SECONDS", 2.0),
            retry_jitter_seconds: env_or("ZHC_DISPATCH_RETRY_JITTER_SECONDS", 1.0),
            dispatch_timeout: Duration::from_secs(env_or("ZHC_DISPATCH_TIMEOUT_SECONDS", 900)),
            context_token_budget: env_or("ZHC_CONTEXT_TOKEN_BUDGET", 1500),
            context_token_budget_heavy: env_or("ZHC_CONTEXT_TOKEN_BUDGET_HEAVY", 6000),
            context_target_ratio: env_or("ZHC_CONTEXT_TARGET_RATIO", 0.6),
            cost: CostConfig::from_env(),
            worker_light_cmd: env::var("ZHC_WORKER_LIGHT_CMD").ok().filter(|v| !v.trim().is_empty()),
            worker_heavy_cmd: env::var("ZHC_WORKER_HEAVY_CMD").ok().filter(|v| !v.trim().is_empty()),
        }
    }

    /// The dispatch owner identity: configured value or `host:pid`.
    pub fn owner(&self) -> String {
        if let Some(owner) = &self.dispatch_owner {
            return owner.clone();
        }
        let host = env::var("HOSTNAME").unwrap_or_else(|_| "local".to_owned());
        format!("{host}:{}", std::process::id())
    }

    /// Per-task directory under the storage root.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.storage_root.join("tasks").join(task_id)
    }

    /// Artifact directory (planner.md, reviewer.json, context, cost) for a
    /// task.
    pub fn artifact_dir(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("artifacts")
    }

    /// Directory holding operator memory files used for retrieval.
    pub fn memory_dir(&self) -> PathBuf {
        self.storage_root.join("memory")
    }

    /// Token budget for a route class.
    pub fn token_budget(&self, route: marshal_db::models::RouteClass) -> usize {
        match route {
            marshal_db::models::RouteClass::Light => self.context_token_budget,
            marshal_db::models::RouteClass::Heavy => self.context_token_budget_heavy,
        }
    }
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_db::models::RouteClass;

    fn test_config() -> PlaneConfig {
        PlaneConfig {
            storage_root: PathBuf::from("/tmp/marshal-test"),
            routing_policy_path: PathBuf::from("routing.toml"),
            approval_policy_path: PathBuf::from("approvals.toml"),
            execution_policy_path: PathBuf::from("execution.toml"),
            policy_enforcement: None,
            autonomy_mode: AutonomyMode::Supervised,
            runtime_mode: "single_node".to_owned(),
            dispatch_owner: Some("test-owner".to_owned()),
            lease_seconds: 120,
            retry_max: 1,
            retry_backoff_seconds: 0.01,
            retry_jitter_seconds: 0.0,
            dispatch_timeout: Duration::from_secs(5),
            context_token_budget: 100,
            context_token_budget_heavy: 400,
            context_target_ratio: 0.6,
            cost: CostConfig {
                lookup_enabled: false,
                lookup_timeout_ms: 100,
                model_default: "m".to_owned(),
                default_provider: "p".to_owned(),
                default_model: "m".to_owned(),
                fallback_provider: "p".to_owned(),
                fallback_model: "m".to_owned(),
                api_key: None,
                api_base: "http://127.0.0.1:1".to_owned(),
            },
            worker_light_cmd: None,
            worker_heavy_cmd: None,
        }
    }

    #[test]
    fn owner_prefers_configured_value() {
        let cfg = test_config();
        assert_eq!(cfg.owner(), "test-owner");
    }

    #[test]
    fn budgets_differ_by_route() {
        let cfg = test_config();
        assert_eq!(cfg.token_budget(RouteClass::Light), 100);
        assert_eq!(cfg.token_budget(RouteClass::Heavy), 400);
    }

    #[test]
    fn artifact_dir_nests_under_task() {
        let cfg = test_config();
        assert_eq!(
            cfg.artifact_dir("task-1"),
            PathBuf::from("/tmp/marshal-test/tasks/task-1/artifacts")
        );
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("auto".parse::<AutonomyMode>().unwrap(), AutonomyMode::Auto);
        assert!("yolo".parse::<AutonomyMode>().is_err());
        assert_eq!("warn".parse::<Enforcement>().unwrap(), Enforcement::Warn);
        assert!("loose".parse::<Enforcement>().is_err());
    }
}
