//! Chat command parsing and handlers.
//!
//! Each handler maps a parsed command to typed registry or router
//! operations and returns the reply text plus a structured result for the
//! audit line.

use serde_json::{json, Value};

use marshal_db::models::{ApprovalStatus, TaskStatus, TaskSummary};
use marshal_db::pool::DbPool;
use marshal_db::queries::tasks;

use crate::error::{CoreError, Result};
use crate::gate::{CHECKLIST_KEYS, REVIEW_REASON_CODES};
use crate::router::Router;

/// Split a chat message into a lowercase command and its arguments.
/// The `@botname` suffix on the command is stripped.
pub fn parse_command(text: &str) -> (String, Vec<String>) {
    let mut parts = text.split_whitespace();
    let Some(first) = parts.next() else {
        return (String::new(), Vec::new());
    };
    let cmd = first.split('@').next().unwrap_or(first).to_lowercase();
    (cmd, parts.map(str::to_owned).collect())
}

pub fn help_text() -> String {
    [
        "marshal commands:",
        "/start - show quick start",
        "/help - show command help",
        "/newtask <task_type> <prompt>",
        "/status <task_id>",
        "/list [limit]",
        "/approve <task_id> <action_category> [note]",
        "/plan <task_id> <summary>",
        "/review <task_id> <pass|fail> [reason_code_if_fail] [notes]",
        "/resume <task_id>",
        "/stop <task_id>",
        "/board",
    ]
    .join("\n")
}

fn format_task_short(task: &TaskSummary) -> String {
    format!(
        "{} | {} | {} | type={} | risk={}",
        task.task_id, task.status, task.route_class, task.task_type, task.risk_level
    )
}

/// Derive the reviewer checklist from a fail reason code, mirroring how
/// reviewers fill the form: the failing dimension goes false, the rest
/// stay true.
fn checklist_for(verdict: &str, reason_code: &str) -> Value {
    let mut checklist = serde_json::Map::new();
    for key in CHECKLIST_KEYS {
        let ok = if verdict == "pass" {
            true
        } else {
            match *key {
                "policy_safety" => !matches!(reason_code, "policy_conflict" | "high_risk_unmitigated"),
                "correctness" => reason_code != "insufficient_plan",
                "tests" => reason_code != "missing_tests",
                "rollback" => reason_code != "artifact_incomplete",
                "approval_constraints" => reason_code != "policy_conflict",
                _ => true,
            }
        };
        checklist.insert((*key).to_owned(), Value::Bool(ok));
    }
    Value::Object(checklist)
}

/// Execute one chat command. Returns (reply text, structured result).
pub async fn handle_command(
    db: &DbPool,
    router: &Router,
    actor: &str,
    text: &str,
    trace_id: &str,
) -> Result<(String, Value)> {
    let (cmd, args) = parse_command(text);

    match cmd.as_str() {
        "/start" | "/help" => Ok((help_text(), json!({"command": cmd, "ok": true}))),

        "/newtask" => {
            if args.len() < 2 {
                return Err(CoreError::InvalidArgument(
                    "Usage: /newtask <task_type> <prompt>".to_owned(),
                ));
            }
            let task_type = &args[0];
            let prompt = args[1..].join(" ");
            let outcome = router.route(task_type, &prompt, Some(trace_id)).await?;
            let reply = format!(
                "Task: {}\nStatus: {}\nRoute: {}\nPolicy: {} ({})",
                outcome.task_id,
                outcome.status,
                outcome.route_class,
                outcome.policy_status,
                outcome.policy_reason
            );
            let result = serde_json::to_value(&outcome).expect("outcome serializes");
            Ok((reply, result))
        }

        "/status" => {
            if args.len() != 1 {
                return Err(CoreError::InvalidArgument("Usage: /status <task_id>".to_owned()));
            }
            let detail = tasks::get_task(db, &args[0]).await?;
            let approval_status = detail
                .approvals
                .last()
                .map(|a| a.status.to_string())
                .unwrap_or_else(|| "none".to_owned());
            let reply = format!(
                "{} | {} | {} | type={} | risk={}\napproval={}\nevents={}",
                detail.task.task_id,
                detail.task.status,
                detail.task.route_class,
                detail.task.task_type,
                detail.task.risk_level,
                approval_status,
                detail.events.len()
            );
            let result = serde_json::to_value(&detail).expect("detail serializes");
            Ok((reply, result))
        }

        "/list" => {
            let limit = match args.first() {
                Some(raw) => raw
                    .parse::<i64>()
                    .map_err(|_| CoreError::InvalidArgument("Usage: /list [limit]".to_owned()))?
                    .clamp(1, 50),
                None => 10,
            };
            let list = tasks::list_tasks(db, limit).await?;
            if list.is_empty() {
                return Ok(("No tasks found".to_owned(), json!({"tasks": []})));
            }
            let lines: Vec<String> = list.iter().take(20).map(format_task_short).collect();
            let result = json!({"tasks": list});
            Ok((lines.join("\n"), result))
        }

        "/approve" => {
            if args.len() < 2 {
                return Err(CoreError::InvalidArgument(
                    "Usage: /approve <task_id> <action_category> [note]".to_owned(),
                ));
            }
            let task_id = &args[0];
            let action_category = &args[1];
            let note = if args.len() > 2 {
                args[2..].join(" ")
            } else {
                "approved via chat".to_owned()
            };
            // Chat approvals always defer; the operator resumes explicitly.
            let outcome = router
                .approve(task_id, action_category, actor, &note, ApprovalStatus::Approved, true)
                .await?;
            let reply = format!("Approved {task_id}: {}. Use /resume {task_id}", outcome.message);
            let result = serde_json::to_value(&outcome).expect("outcome serializes");
            Ok((reply, result))
        }

        "/plan" => {
            if args.len() < 2 {
                return Err(CoreError::InvalidArgument(
                    "Usage: /plan <task_id> <summary>".to_owned(),
                ));
            }
            let task_id = &args[0];
            let summary = args[1..].join(" ");
            let outcome = router.record_plan(task_id, actor, &summary).await?;
            let result = serde_json::to_value(&outcome).expect("outcome serializes");
            Ok((format!("Planner artifact saved for {task_id}"), result))
        }

        "/review" => {
            if args.len() < 2 {
                return Err(CoreError::InvalidArgument(
                    "Usage: /review <task_id> <pass|fail> [reason_code_if_fail] [notes]".to_owned(),
                ));
            }
            let task_id = &args[0];
            let verdict = args[1].to_lowercase();
            let (reason_code, notes_start) = if verdict == "fail" {
                if args.len() < 3 {
                    return Err(CoreError::InvalidArgument(format!(
                        "Fail review requires reason code: {}",
                        REVIEW_REASON_CODES.join("|")
                    )));
                }
                (args[2].to_lowercase(), 3)
            } else {
                (String::new(), 2)
            };
            let notes = if args.len() > notes_start {
                args[notes_start..].join(" ")
            } else {
                String::new()
            };
            let checklist = checklist_for(&verdict, &reason_code);
            let outcome = router
                .record_review(task_id, actor, &verdict, &reason_code, &checklist, &notes)
                .await?;
            let reply = if verdict == "fail" {
                format!(
                    "Review recorded for {task_id}: fail ({reason_code}). {}",
                    outcome.next_action
                )
            } else {
                format!("Review recorded for {task_id}: pass. {}", outcome.next_action)
            };
            let result = serde_json::to_value(&outcome).expect("outcome serializes");
            Ok((reply, result))
        }

        "/resume" => {
            if args.len() != 1 {
                return Err(CoreError::InvalidArgument("Usage: /resume <task_id>".to_owned()));
            }
            let outcome = router.resume(&args[0], actor).await?;
            let reply = format!("Resume {}: {} ({})", args[0], outcome.status, outcome.message);
            let result = serde_json::to_value(&outcome).expect("outcome serializes");
            Ok((reply, result))
        }

        "/stop" => {
            if args.len() != 1 {
                return Err(CoreError::InvalidArgument("Usage: /stop <task_id>".to_owned()));
            }
            let task = tasks::get_task_row(db, &args[0]).await?;
            if task.status.is_terminal() {
                let result = serde_json::to_value(&task).expect("task serializes");
                return Ok((
                    format!("Task {} already terminal: {}", args[0], task.status),
                    result,
                ));
            }
            let updated = tasks::update_task(
                db,
                &args[0],
                TaskStatus::Cancelled,
                &format!("chat_stop_requested by={actor}"),
                false,
            )
            .await?;
            let result = serde_json::to_value(&updated).expect("task serializes");
            Ok((format!("Task {} cancelled", args[0]), result))
        }

        "/board" => {
            let list = tasks::list_tasks(db, 50).await?;
            let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
            for task in &list {
                *counts.entry(task.status.to_string()).or_insert(0) += 1;
            }
            let reply = format!(
                "Board\nrunning={} blocked={} failed={} pending={}",
                counts.get("running").copied().unwrap_or(0),
                counts.get("blocked").copied().unwrap_or(0),
                counts.get("failed").copied().unwrap_or(0),
                counts.get("pending").copied().unwrap_or(0),
            );
            Ok((reply, json!({"counts": counts})))
        }

        _ => Err(CoreError::InvalidArgument(
            "Unknown command. Use /newtask, /status, /list, /approve, /plan, /review, /resume, /stop, /board"
                .to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_bot_suffix_and_lowercases() {
        let (cmd, args) = parse_command("/NewTask@marshal_bot ping hello world");
        assert_eq!(cmd, "/newtask");
        assert_eq!(args, vec!["ping".to_owned(), "hello".to_owned(), "world".to_owned()]);
    }

    #[test]
    fn parse_empty_text() {
        let (cmd, args) = parse_command("   ");
        assert!(cmd.is_empty());
        assert!(args.is_empty());
    }

    #[test]
    fn pass_checklist_is_all_true() {
        let checklist = checklist_for("pass", "");
        for key in CHECKLIST_KEYS {
            assert_eq!(checklist[*key], Value::Bool(true));
        }
    }

    #[test]
    fn fail_checklist_flips_the_failing_dimension() {
        let checklist = checklist_for("fail", "missing_tests");
        assert_eq!(checklist["tests"], Value::Bool(false));
        assert_eq!(checklist["correctness"], Value::Bool(true));

        let checklist = checklist_for("fail", "policy_conflict");
        assert_eq!(checklist["policy_safety"], Value::Bool(false));
        assert_eq!(checklist["approval_constraints"], Value::Bool(false));
        assert_eq!(checklist["tests"], Value::Bool(true));
    }

    #[test]
    fn help_text_lists_every_command() {
        let help = help_text();
        for cmd in [
            "/newtask", "/status", "/list", "/approve", "/plan", "/review", "/resume", "/stop",
            "/board",
        ] {
            assert!(help.contains(cmd), "help should mention {cmd}");
        }
    }
}
