//! Router/dispatcher: classification, policy, artifact gating, approval
//! gating, lease acquisition, idempotent dispatch with bounded retry, and
//! telemetry recording.
//!
//! The dispatch invariant is at-most-once side effect per
//! (task_id, attempt_count): the lease serializes owners, and the
//! idempotency key `dispatch:{task_id}:{attempt_count}` serializes retries
//! of the same logical attempt.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use marshal_db::models::{
    ApprovalStatus, IdempotencyScope, IdempotencyStatus, LeaseStatus, RiskLevel, RouteClass, Task,
    TaskStatus,
};
use marshal_db::pool::DbPool;
use marshal_db::queries::{approvals, idempotency, leases, tasks};

use crate::classify::{classify, Classification, RoutingPolicy};
use crate::config::PlaneConfig;
use crate::context::{self, RetrievalBlock};
use crate::cost::{self, PricingCache};
use crate::error::{CoreError, Result};
use crate::gate::{self, ReviewerArtifact, CHECKLIST_KEYS, REVIEW_REASON_CODES};
use crate::policy::{self, ExecutionPolicy, PolicyReason};
use crate::worker;

/// Approval category used when no task-type-specific gate applies.
pub const DEFAULT_APPROVAL_CATEGORY: &str = "supervised_heavy_execution";

/// Approval-policy gates that map directly from task types.
fn gate_name_for_task_type(task_type: &str) -> Option<&'static str> {
    match task_type.trim().to_lowercase().as_str() {
        "deploy" => Some("deploy_restart"),
        "delete" => Some("delete_files"),
        "scheduler_change" => Some("scheduler_change"),
        "compliance_finalize" => Some("compliance_finalize"),
        "customer_outbound" => Some("customer_outbound"),
        _ => None,
    }
}

/// The approval policy file: named gates with a human-approval switch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalPolicy {
    #[serde(default)]
    pub gates: BTreeMap<String, ApprovalGate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalGate {
    #[serde(default)]
    pub require_human_approval: bool,
}

impl ApprovalPolicy {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| {
            CoreError::InvalidArgument(format!("approval policy {}: {e}", path.display()))
        })
    }

    /// Whether a task needs human approval: high risk always does; other
    /// tasks only when their task type maps to a gate that demands it.
    pub fn requires_approval(&self, risk_level: RiskLevel, task_type: &str) -> bool {
        if risk_level == RiskLevel::High {
            return true;
        }
        gate_name_for_task_type(task_type)
            .and_then(|gate| self.gates.get(gate))
            .map(|gate| gate.require_human_approval)
            .unwrap_or(false)
    }
}

/// The approval category a task's human gate lives under.
pub fn approval_category(task_type: &str) -> String {
    gate_name_for_task_type(task_type)
        .unwrap_or(DEFAULT_APPROVAL_CATEGORY)
        .to_owned()
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of a route/approve/resume call, surfaced to the CLI and the
/// chat ingress.
#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub route_class: RouteClass,
    pub risk_level: RiskLevel,
    pub approval_required: bool,
    pub policy_status: String,
    pub policy_reason: String,
    /// Reasons dispatch has not happened yet (blockers or in-flight work).
    pub pending: Vec<String>,
    pub message: String,
}

/// Result of `classify` without side effects.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifyOutcome {
    pub route_class: RouteClass,
    pub risk_level: RiskLevel,
    pub approval_required: bool,
}

/// Result of recording a planner artifact.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    pub task_id: String,
    pub artifact_path: String,
    pub message: String,
}

/// Result of recording a reviewer artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub task_id: String,
    pub verdict: String,
    pub reason_code: String,
    pub artifact_path: String,
    pub next_action: String,
}

fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

fn payload_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn new_task_id() -> String {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("task-{stamp}-{}", &suffix[..8])
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// The router. Holds the registry pool, the plane configuration, the
/// pricing cache, and a cancellation token propagated to in-flight
/// workers.
pub struct Router {
    db: DbPool,
    config: PlaneConfig,
    pricing: PricingCache,
    cancel: CancellationToken,
}

impl Router {
    pub fn new(db: DbPool, config: PlaneConfig) -> Self {
        Self::with_cancellation(db, config, CancellationToken::new())
    }

    pub fn with_cancellation(db: DbPool, config: PlaneConfig, cancel: CancellationToken) -> Self {
        Self {
            db,
            config,
            pricing: PricingCache::new(),
            cancel,
        }
    }

    pub fn config(&self) -> &PlaneConfig {
        &self.config
    }

    /// Classify a task without creating anything.
    pub fn classify_only(&self, task_type: &str, prompt: &str) -> Result<ClassifyOutcome> {
        let routing = RoutingPolicy::load(&self.config.routing_policy_path)?;
        let approval_policy = ApprovalPolicy::load(&self.config.approval_policy_path)?;
        let Classification {
            route_class,
            risk_level,
        } = classify(task_type, prompt, &routing);
        Ok(ClassifyOutcome {
            route_class,
            risk_level,
            approval_required: approval_policy.requires_approval(risk_level, task_type),
        })
    }

    /// Create, classify, policy-check, gate, and (when clear) dispatch a
    /// new task. Exactly one task row is created; zero or one dispatch
    /// attempt runs.
    pub async fn route(
        &self,
        task_type: &str,
        prompt: &str,
        trace_id: Option<&str>,
    ) -> Result<RouteOutcome> {
        let routing = RoutingPolicy::load(&self.config.routing_policy_path)?;
        let approval_policy = ApprovalPolicy::load(&self.config.approval_policy_path)?;
        let execution = ExecutionPolicy::load(&self.config.execution_policy_path)?;

        let Classification {
            route_class,
            risk_level,
        } = classify(task_type, prompt, &routing);
        let approval_required = approval_policy.requires_approval(risk_level, task_type);

        let task_id = new_task_id();
        let mut metadata = json!({
            "source": "router",
            "approval_required": approval_required,
            "autonomy_mode": self.config.autonomy_mode.to_string(),
        });
        if let Some(trace) = trace_id {
            metadata["trace_id"] = Value::String(trace.to_owned());
        }

        tasks::create_task(
            &self.db,
            &tasks::NewTask {
                task_id: task_id.clone(),
                task_type: task_type.to_owned(),
                prompt: prompt.to_owned(),
                route_class,
                status: TaskStatus::Pending,
                requires_approval: approval_required,
                risk_level,
                assigned_worker: None,
                metadata,
            },
        )
        .await?;

        let trace_suffix = trace_id.map(|t| format!(" trace={t}")).unwrap_or_default();
        tasks::append_router_event(
            &self.db,
            &task_id,
            &format!("classification route={route_class} risk={risk_level}{trace_suffix}"),
        )
        .await?;

        let decision = policy::evaluate(
            task_type,
            prompt,
            route_class,
            self.config.autonomy_mode,
            &execution,
            self.config.policy_enforcement,
        );

        if !decision.allowed {
            tasks::append_router_event(
                &self.db,
                &task_id,
                &format!("policy_block reason={}", decision.reason),
            )
            .await?;
            tasks::update_task(
                &self.db,
                &task_id,
                TaskStatus::Blocked,
                &format!("policy_block reason={}", decision.reason),
                false,
            )
            .await?;
            info!(task_id = %task_id, reason = %decision.reason, "policy denied task");
            return Ok(RouteOutcome {
                task_id,
                status: TaskStatus::Blocked,
                route_class,
                risk_level,
                approval_required,
                policy_status: "denied".to_owned(),
                policy_reason: decision.reason.to_string(),
                pending: vec!["policy".to_owned()],
                message: format!("Task blocked by execution policy ({})", decision.reason),
            });
        }

        let (policy_status, policy_reason) = if decision.reason == PolicyReason::Allowed {
            ("allowed".to_owned(), decision.reason.to_string())
        } else {
            tasks::append_router_event(
                &self.db,
                &task_id,
                &format!("policy_warn reason={}", decision.reason),
            )
            .await?;
            ("warned".to_owned(), decision.reason.to_string())
        };

        if approval_required {
            approvals::request_approval(
                &self.db,
                &task_id,
                &approval_category(task_type),
                "router",
                "required by approval policy",
            )
            .await?;
        }

        let mut outcome = self.try_dispatch(&task_id).await?;
        outcome.policy_status = policy_status;
        outcome.policy_reason = policy_reason;
        Ok(outcome)
    }

    /// Record a planner artifact for a HEAVY task.
    pub async fn record_plan(
        &self,
        task_id: &str,
        author: &str,
        summary: &str,
    ) -> Result<PlanOutcome> {
        let task = tasks::get_task_row(&self.db, task_id).await?;
        if task.route_class != RouteClass::Heavy {
            return Err(CoreError::InvalidArgument(format!(
                "planner artifacts apply to HEAVY tasks only; {task_id} is {}",
                task.route_class
            )));
        }

        let artifact_dir = self.config.artifact_dir(task_id);
        std::fs::create_dir_all(&artifact_dir)?;
        let path = artifact_dir.join(gate::PLANNER_FILE);
        let content = format!(
            "# Plan: {task_id}\n\n- Author: {author}\n- Recorded: {}\n\n{summary}\n",
            marshal_db::models::utc_now()
        );
        std::fs::write(&path, content)?;

        tasks::append_router_event(
            &self.db,
            task_id,
            &format!("planner_artifact_recorded author={author}"),
        )
        .await?;

        Ok(PlanOutcome {
            task_id: task_id.to_owned(),
            artifact_path: path.display().to_string(),
            message: format!("Planner artifact saved for {task_id}"),
        })
    }

    /// Record a reviewer artifact for a HEAVY task.
    ///
    /// A fail verdict requires a reason code from the closed set; a pass
    /// verdict requires every checklist item present, boolean, and true.
    /// Re-recording overrides the previous artifact (latest wins) while
    /// the event log keeps both.
    pub async fn record_review(
        &self,
        task_id: &str,
        reviewer: &str,
        verdict: &str,
        reason_code: &str,
        checklist: &Value,
        notes: &str,
    ) -> Result<ReviewOutcome> {
        let task = tasks::get_task_row(&self.db, task_id).await?;
        if task.route_class != RouteClass::Heavy {
            return Err(CoreError::InvalidArgument(format!(
                "reviewer artifacts apply to HEAVY tasks only; {task_id} is {}",
                task.route_class
            )));
        }

        let verdict = verdict.trim().to_lowercase();
        if verdict != "pass" && verdict != "fail" {
            return Err(CoreError::InvalidArgument(format!(
                "verdict must be pass or fail, got {verdict:?}"
            )));
        }

        let reason_code = reason_code.trim().to_lowercase();
        if verdict == "fail" && !REVIEW_REASON_CODES.contains(&reason_code.as_str()) {
            return Err(CoreError::InvalidArgument(format!(
                "fail review requires a reason code from {REVIEW_REASON_CODES:?}"
            )));
        }

        let checklist_map = checklist.as_object().ok_or_else(|| {
            CoreError::InvalidArgument("checklist must be a JSON object".to_owned())
        })?;
        for key in CHECKLIST_KEYS {
            match checklist_map.get(*key) {
                Some(Value::Bool(value)) => {
                    if verdict == "pass" && !value {
                        return Err(CoreError::InvalidArgument(format!(
                            "pass review requires checklist item {key} to be true"
                        )));
                    }
                }
                _ => {
                    return Err(CoreError::InvalidArgument(format!(
                        "checklist item {key} must be present and boolean"
                    )));
                }
            }
        }

        let artifact_dir = self.config.artifact_dir(task_id);
        std::fs::create_dir_all(&artifact_dir)?;
        let path = artifact_dir.join(gate::REVIEWER_FILE);
        let artifact = ReviewerArtifact {
            reviewer: reviewer.to_owned(),
            verdict: verdict.clone(),
            reason_code: reason_code.clone(),
            checklist: checklist_map.clone(),
            notes: notes.to_owned(),
            recorded_at: marshal_db::models::utc_now(),
        };
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&artifact)
                .map_err(|e| CoreError::InvalidArgument(format!("reviewer artifact: {e}")))?,
        )?;

        tasks::append_router_event(
            &self.db,
            task_id,
            &format!("reviewer_artifact_recorded verdict={verdict} reason={reason_code} by={reviewer}"),
        )
        .await?;

        let next_action = if verdict == "pass" {
            format!("Review gate open. Approve if required, then /resume {task_id}.")
        } else {
            "Fix issues then submit /review pass.".to_owned()
        };

        Ok(ReviewOutcome {
            task_id: task_id.to_owned(),
            verdict,
            reason_code,
            artifact_path: path.display().to_string(),
            next_action,
        })
    }

    /// Record an approval decision, then dispatch unless deferred.
    pub async fn approve(
        &self,
        task_id: &str,
        action_category: &str,
        decided_by: &str,
        note: &str,
        decision: ApprovalStatus,
        defer_dispatch: bool,
    ) -> Result<RouteOutcome> {
        approvals::decide_approval(&self.db, task_id, action_category, decision, decided_by, note)
            .await?;

        let task = tasks::get_task_row(&self.db, task_id).await?;

        if decision == ApprovalStatus::Rejected {
            return Ok(self.outcome_for(
                &task,
                vec!["human_approval".to_owned()],
                format!("Approval rejected for {task_id} ({action_category})"),
            ));
        }

        if defer_dispatch {
            tasks::append_router_event(
                &self.db,
                task_id,
                &format!("approval_recorded_deferred category={action_category} by={decided_by}"),
            )
            .await?;
            return Ok(self.outcome_for(
                &task,
                Vec::new(),
                format!("Approval recorded for {task_id}; dispatch deferred"),
            ));
        }

        self.try_dispatch(task_id).await
    }

    /// Reconcile leases, then dispatch a task whose blockers have cleared.
    /// No-op on terminal or in-progress tasks.
    pub async fn resume(&self, task_id: &str, requested_by: &str) -> Result<RouteOutcome> {
        let task = tasks::get_task_row(&self.db, task_id).await?;

        if task.status.is_terminal() {
            return Ok(self.outcome_for(
                &task,
                Vec::new(),
                format!("Task {task_id} already terminal: {}", task.status),
            ));
        }
        if task.status == TaskStatus::Running {
            return Ok(self.outcome_for(
                &task,
                vec!["dispatch_in_progress".to_owned()],
                format!("Task {task_id} already in progress"),
            ));
        }

        let reclaimed = leases::reconcile_dispatch_leases(&self.db, &self.config.owner()).await?;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reconciled expired leases before resume");
        }
        tasks::append_router_event(
            &self.db,
            task_id,
            &format!("resume_requested by={requested_by}"),
        )
        .await?;

        self.try_dispatch(task_id).await
    }

    fn outcome_for(&self, task: &Task, pending: Vec<String>, message: String) -> RouteOutcome {
        RouteOutcome {
            task_id: task.task_id.clone(),
            status: task.status,
            route_class: task.route_class,
            risk_level: task.risk_level,
            approval_required: task.requires_approval,
            policy_status: "allowed".to_owned(),
            policy_reason: PolicyReason::Allowed.to_string(),
            pending,
            message,
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Compute blockers and, when none remain, run the dispatch algorithm.
    async fn try_dispatch(&self, task_id: &str) -> Result<RouteOutcome> {
        let task = tasks::get_task_row(&self.db, task_id).await?;

        // 1. Blockers.
        let mut pending: Vec<String> = Vec::new();

        if task.route_class == RouteClass::Heavy {
            let report = gate::evaluate_artifacts(&self.config.artifact_dir(task_id));
            if !report.gate_passed {
                pending.push("planner_reviewer_gate".to_owned());
                tasks::append_router_event(&self.db, task_id, "review_gate_pending").await?;
            }
        }

        if task.requires_approval {
            let category = approval_category(&task.task_type);
            let approved = approvals::latest_approval(&self.db, task_id, &category)
                .await?
                .map(|a| a.status == ApprovalStatus::Approved)
                .unwrap_or(false);
            if !approved {
                pending.push("human_approval".to_owned());
                tasks::append_router_event(&self.db, task_id, "approval_required before execution")
                    .await?;
            }
        }

        if !pending.is_empty() {
            let detail = if pending.iter().any(|p| p == "human_approval") {
                "awaiting_human_approval"
            } else {
                "awaiting_review_gate"
            };
            if task.status != TaskStatus::Blocked && !task.status.is_terminal() {
                tasks::update_task(&self.db, task_id, TaskStatus::Blocked, detail, false).await?;
            }
            let task = tasks::get_task_row(&self.db, task_id).await?;
            let message = format!("Task {} blocked pending {}", task_id, pending.join(", "));
            return Ok(self.outcome_for(&task, pending, message));
        }

        // 2. Context payload, compacted to the token budget.
        let payload = self.build_context(&task).await?;
        let artifact_dir = self.config.artifact_dir(task_id);
        std::fs::create_dir_all(&artifact_dir)?;
        std::fs::write(artifact_dir.join("context_compacted.txt"), &payload.text)?;

        // 3. Cost estimate.
        let tokens_out = match task.route_class {
            RouteClass::Light => 400,
            RouteClass::Heavy => 1600,
        };
        let estimate = self
            .pricing
            .estimate(&self.config.cost, task.route_class, payload.compacted_tokens, tokens_out)
            .await;
        cost::write_cost_artifact(&artifact_dir, task_id, &estimate)?;

        // 4. Lease.
        let owner = self.config.owner();
        leases::enqueue_dispatch_lease(&self.db, task_id, &owner, self.config.lease_seconds)
            .await?;
        let claim =
            leases::claim_dispatch_lease(&self.db, task_id, &owner, self.config.lease_seconds)
                .await?;
        if !claim.claimed {
            let message = format!(
                "Dispatch lease for {task_id} held by {}",
                claim.lease.owner_id
            );
            let mut outcome = self.outcome_for(&task, vec!["lease_held_by_other_owner".to_owned()], message);
            outcome.status = TaskStatus::Running;
            return Ok(outcome);
        }
        let attempt = claim.lease.attempt_count;

        // 5. Idempotency.
        let key = format!("dispatch:{task_id}:{attempt}");
        let attempt_str = attempt.to_string();
        let hash = payload_hash(&[
            task_id,
            &task.task_type,
            &task.prompt,
            &task.route_class.to_string(),
            &self.config.autonomy_mode.to_string(),
            &self.config.runtime_mode,
            &owner,
            &attempt_str,
        ]);
        let begin =
            idempotency::begin_idempotency(&self.db, &key, IdempotencyScope::Dispatch, &hash, Some(task_id))
                .await?;
        if begin.exists {
            if begin.conflict {
                tasks::append_router_event(&self.db, task_id, &format!("idempotency_conflict key={key}"))
                    .await?;
                warn!(task_id, key = %key, "dispatch idempotency conflict");
                let message = format!(
                    "Dispatch idempotency conflict for {task_id}; operator inspection required"
                );
                let mut outcome =
                    self.outcome_for(&task, vec!["idempotency_conflict".to_owned()], message);
                outcome.status = TaskStatus::Blocked;
                return Ok(outcome);
            }
            match begin.status {
                IdempotencyStatus::Processing => {
                    let message = format!("Dispatch for {task_id} attempt {attempt} already in flight");
                    let mut outcome =
                        self.outcome_for(&task, vec!["dispatch_inflight".to_owned()], message);
                    outcome.status = TaskStatus::Running;
                    return Ok(outcome);
                }
                IdempotencyStatus::Completed => {
                    let result = begin.result.unwrap_or_else(|| json!({}));
                    let cached_status = result
                        .get("dispatch_status")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse::<TaskStatus>().ok())
                        .unwrap_or(task.status);
                    let cached_detail = result
                        .get("dispatch_detail")
                        .and_then(Value::as_str)
                        .unwrap_or("dispatch replay")
                        .to_owned();
                    let mut outcome =
                        self.outcome_for(&task, vec!["idempotent_replay".to_owned()], cached_detail);
                    outcome.status = cached_status;
                    return Ok(outcome);
                }
                IdempotencyStatus::Conflict => unreachable!("conflict handled above"),
            }
        }

        // 6. queued -> running.
        tasks::update_task(
            &self.db,
            task_id,
            TaskStatus::Queued,
            &format!("dispatch_queued owner={owner} attempt={attempt}"),
            false,
        )
        .await?;
        tasks::update_task(
            &self.db,
            task_id,
            TaskStatus::Running,
            &format!("dispatch_started attempt={attempt}"),
            false,
        )
        .await?;

        // 7. Worker invocation with bounded retry.
        let (dispatch_status, dispatch_detail, duration_ms) = self.run_worker(&task).await?;

        // 8. Finalize the idempotency record.
        idempotency::complete_idempotency(
            &self.db,
            &key,
            IdempotencyStatus::Completed,
            Some(&json!({
                "dispatch_status": dispatch_status.to_string(),
                "dispatch_detail": dispatch_detail,
                "dispatch_duration_ms": duration_ms,
            })),
        )
        .await?;

        // 9. Lease terminal state.
        let lease_status = match dispatch_status {
            TaskStatus::Succeeded => LeaseStatus::Succeeded,
            TaskStatus::Cancelled => LeaseStatus::Cancelled,
            _ => LeaseStatus::Failed,
        };
        let last_error = (dispatch_status != TaskStatus::Succeeded).then_some(dispatch_detail.as_str());
        leases::finish_dispatch_lease(&self.db, task_id, &owner, lease_status, last_error).await?;

        // 10. Terminal status and telemetry.
        tasks::update_task(&self.db, task_id, dispatch_status, &dispatch_detail, false).await?;
        tasks::append_router_event(&self.db, task_id, &dispatch_detail).await?;

        let estimated_total = payload.compacted_tokens + tokens_out;
        tasks::merge_metadata(
            &self.db,
            task_id,
            &json!({
                "dispatch_duration_ms": duration_ms,
                "estimated_tokens_in": payload.compacted_tokens,
                "estimated_tokens_out": tokens_out,
                "estimated_total_tokens": estimated_total,
                "compression_ratio": payload.compression_ratio,
                "estimated_cost_usd": estimate.estimated_cost_usd,
                "cost_source": estimate.cost_source,
                "retrieval_sources": payload.retrieval_sources,
                "pricing_model": estimate.pricing_model,
                "provider": self.config.cost.default_provider,
                "model": self.config.cost.default_model,
            }),
            "dispatch telemetry",
        )
        .await?;

        let task = tasks::get_task_row(&self.db, task_id).await?;
        Ok(self.outcome_for(&task, Vec::new(), dispatch_detail))
    }

    /// Invoke the route-appropriate worker with transient-marker retry.
    ///
    /// Returns the terminal dispatch status, its detail line, and the
    /// total wall-clock duration across attempts.
    async fn run_worker(&self, task: &Task) -> Result<(TaskStatus, String, u64)> {
        let started = Instant::now();

        let command = match task.route_class {
            RouteClass::Heavy => match &self.config.worker_heavy_cmd {
                Some(cmd) => cmd.clone(),
                None => {
                    return Ok((
                        TaskStatus::Failed,
                        "dispatch_failed: heavy_worker_not_configured".to_owned(),
                        started.elapsed().as_millis() as u64,
                    ));
                }
            },
            RouteClass::Light => match &self.config.worker_light_cmd {
                Some(cmd) => cmd.clone(),
                None => return self.run_light_stub(task, started),
            },
        };

        let args = vec![
            "--task-type".to_owned(),
            task.task_type.clone(),
            "--prompt".to_owned(),
            task.prompt.clone(),
            "--task-id".to_owned(),
            task.task_id.clone(),
        ];

        let mut tries: u32 = 0;
        loop {
            tries += 1;
            let result = worker::invoke(&command, &args, self.config.dispatch_timeout, &self.cancel)
                .await;

            let transient_text = match result {
                Ok(out) if out.success() => {
                    let worker_ref = out
                        .stdout
                        .lines()
                        .rev()
                        .map(str::trim)
                        .find(|l| !l.is_empty())
                        .unwrap_or(&task.task_id)
                        .to_owned();
                    let detail = format!(
                        "dispatch_succeeded route={} worker_ref={worker_ref}",
                        task.route_class
                    );
                    return Ok((TaskStatus::Succeeded, detail, started.elapsed().as_millis() as u64));
                }
                Ok(out) => {
                    let text = if out.stderr.trim().is_empty() {
                        out.stdout.trim().to_owned()
                    } else {
                        out.stderr.trim().to_owned()
                    };
                    if !worker::is_transient_error(&text) {
                        let detail = format!("dispatch_failed: {}", truncate_snippet(&text, 400));
                        return Ok((TaskStatus::Failed, detail, started.elapsed().as_millis() as u64));
                    }
                    text
                }
                Err(CoreError::Timeout { seconds }) => {
                    if tries > self.config.retry_max {
                        let detail = format!("dispatch_timeout after {seconds}s");
                        return Ok((TaskStatus::Failed, detail, started.elapsed().as_millis() as u64));
                    }
                    format!("worker timed out after {seconds}s")
                }
                Err(CoreError::DispatchFailed(_)) if self.cancel.is_cancelled() => {
                    return Ok((
                        TaskStatus::Cancelled,
                        "dispatch_cancelled".to_owned(),
                        started.elapsed().as_millis() as u64,
                    ));
                }
                Err(e) => {
                    let detail = format!("dispatch_failed: {e}");
                    return Ok((TaskStatus::Failed, detail, started.elapsed().as_millis() as u64));
                }
            };

            if tries > self.config.retry_max {
                let detail = format!(
                    "dispatch_failed: retries_exhausted after {tries} attempts: {}",
                    truncate_snippet(&transient_text, 200)
                );
                return Ok((TaskStatus::Failed, detail, started.elapsed().as_millis() as u64));
            }

            tasks::append_router_event(
                &self.db,
                &task.task_id,
                &format!(
                    "dispatch_retry attempt={tries} transient={}",
                    truncate_snippet(&transient_text, 120)
                ),
            )
            .await?;

            let delay = worker::retry_delay(
                tries,
                self.config.retry_backoff_seconds,
                self.config.retry_jitter_seconds,
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    return Ok((
                        TaskStatus::Cancelled,
                        "dispatch_cancelled".to_owned(),
                        started.elapsed().as_millis() as u64,
                    ));
                }
            }
        }
    }

    /// Built-in LIGHT-tier stub used when no light worker is configured:
    /// writes a stub log under the task directory and succeeds.
    fn run_light_stub(&self, task: &Task, started: Instant) -> Result<(TaskStatus, String, u64)> {
        let task_dir = self.config.task_dir(&task.task_id);
        std::fs::create_dir_all(&task_dir)?;
        std::fs::write(
            task_dir.join("light_worker_stub.log"),
            "[STUB] light worker executed\n",
        )?;
        Ok((
            TaskStatus::Succeeded,
            "light_stub_executed".to_owned(),
            started.elapsed().as_millis() as u64,
        ))
    }

    /// Build the compacted context payload for a dispatch: essential task
    /// identity lines first, then recent same-type task prompts and
    /// memory snippets until the route's token budget is reached.
    async fn build_context(&self, task: &Task) -> Result<context::ContextPayload> {
        let essential = vec![
            format!("task_id: {}", task.task_id),
            format!("task_type: {}", task.task_type),
            format!("route_class: {}", task.route_class),
            format!("risk_level: {}", task.risk_level),
            format!("prompt: {}", task.prompt),
        ];

        let mut retrieval: Vec<RetrievalBlock> = Vec::new();
        let recent = tasks::list_recent_by_type(&self.db, &task.task_type, 4).await?;
        for prior in recent.iter().filter(|t| t.task_id != task.task_id).take(3) {
            retrieval.push(RetrievalBlock {
                source: format!("recent_task:{}", prior.task_id),
                lines: vec![format!(
                    "[{} {}] {}",
                    prior.task_id,
                    prior.status,
                    truncate_snippet(&prior.prompt, 200)
                )],
            });
        }
        retrieval.extend(context::memory_retrieval(&self.config.memory_dir(), 3, 20));

        let budget = self.config.token_budget(task.route_class);
        Ok(context::build_payload(&essential, &retrieval, budget))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_hash_is_order_sensitive() {
        let a = payload_hash(&["x", "y"]);
        let b = payload_hash(&["y", "x"]);
        assert_ne!(a, b);
        assert_eq!(a, payload_hash(&["x", "y"]));
    }

    #[test]
    fn payload_hash_separates_fields() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(payload_hash(&["ab", "c"]), payload_hash(&["a", "bc"]));
    }

    #[test]
    fn task_ids_are_unique_and_prefixed() {
        let a = new_task_id();
        let b = new_task_id();
        assert!(a.starts_with("task-"));
        assert_ne!(a, b);
    }

    #[test]
    fn approval_category_maps_known_types() {
        assert_eq!(approval_category("deploy"), "deploy_restart");
        assert_eq!(approval_category("DELETE"), "delete_files");
        assert_eq!(approval_category("ping"), DEFAULT_APPROVAL_CATEGORY);
    }

    #[test]
    fn high_risk_always_requires_approval() {
        let policy = ApprovalPolicy::default();
        assert!(policy.requires_approval(RiskLevel::High, "ping"));
        assert!(!policy.requires_approval(RiskLevel::Low, "ping"));
    }

    #[test]
    fn gated_task_type_requires_approval_when_configured() {
        let policy: ApprovalPolicy = toml::from_str(
            r#"
            [gates.deploy_restart]
            require_human_approval = true
            "#,
        )
        .unwrap();
        assert!(policy.requires_approval(RiskLevel::Low, "deploy"));
        assert!(!policy.requires_approval(RiskLevel::Low, "summarize"));
    }

    #[test]
    fn truncate_keeps_char_boundaries() {
        let s = "héllo wörld, this is a long line";
        let t = truncate_snippet(s, 8);
        assert!(t.ends_with("..."));
        assert!(t.len() <= 11);
    }
}
