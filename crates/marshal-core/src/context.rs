//! Context payload construction and token-budget compaction.
//!
//! The payload starts from essential lines (task identity and prompt),
//! then appends retrieval lines (recent same-type task prompts, recent
//! memory files) until the budget is reached. The compacted output never
//! exceeds the budget; the heuristic token count is ceil(chars / 4).

use std::path::Path;

use serde::Serialize;

/// Heuristic token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(4)
}

/// A retrieval source with its contributed lines.
#[derive(Debug, Clone)]
pub struct RetrievalBlock {
    /// Human-readable source tag, e.g. `recent_task:task-...` or
    /// `memory:notes.md`.
    pub source: String,
    pub lines: Vec<String>,
}

/// A compacted context payload plus its compaction telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPayload {
    pub text: String,
    pub input_tokens: usize,
    pub compacted_tokens: usize,
    /// compacted/input; 1.0 when nothing was dropped.
    pub compression_ratio: f64,
    pub retrieval_sources: Vec<String>,
    pub truncated: bool,
}

/// Build a payload from essential and retrieval lines under a token
/// budget.
///
/// Essential lines fill first; once a line no longer fits, packing stops
/// (no later line is squeezed in out of order, so the payload reads
/// top-down).
pub fn build_payload(
    essential_lines: &[String],
    retrieval: &[RetrievalBlock],
    token_budget: usize,
) -> ContextPayload {
    let mut all_lines: Vec<&str> = Vec::new();
    for line in essential_lines {
        all_lines.push(line);
    }
    for block in retrieval {
        for line in &block.lines {
            all_lines.push(line);
        }
    }
    let input_tokens: usize = all_lines
        .iter()
        .map(|l| estimate_tokens(l) + 1)
        .sum::<usize>()
        .max(1);

    let mut text = String::new();
    let mut used_tokens = 0usize;
    let mut truncated = false;
    let mut used_sources: Vec<String> = Vec::new();

    let mut push_lines = |lines: &[String],
                          text: &mut String,
                          used_tokens: &mut usize,
                          truncated: &mut bool|
     -> bool {
        for line in lines {
            let cost = estimate_tokens(line) + 1;
            if *used_tokens + cost > token_budget {
                *truncated = true;
                return false;
            }
            text.push_str(line);
            text.push('\n');
            *used_tokens += cost;
        }
        true
    };

    let essential_ok = push_lines(essential_lines, &mut text, &mut used_tokens, &mut truncated);
    if essential_ok {
        for block in retrieval {
            let before = used_tokens;
            let fit = push_lines(&block.lines, &mut text, &mut used_tokens, &mut truncated);
            if used_tokens > before {
                used_sources.push(block.source.clone());
            }
            if !fit {
                break;
            }
        }
    }

    let compacted_tokens = estimate_tokens(&text);
    ContextPayload {
        compression_ratio: compacted_tokens as f64 / input_tokens as f64,
        text,
        input_tokens,
        compacted_tokens,
        retrieval_sources: used_sources,
        truncated,
    }
}

/// Read up to `max_files` memory files (newest first by name) as
/// retrieval blocks, taking at most `max_lines` lines from each.
pub fn memory_retrieval(memory_dir: &Path, max_files: usize, max_lines: usize) -> Vec<RetrievalBlock> {
    let Ok(entries) = std::fs::read_dir(memory_dir) else {
        return Vec::new();
    };
    let mut names: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "md").unwrap_or(false))
        .collect();
    names.sort();
    names.reverse();

    names
        .into_iter()
        .take(max_files)
        .filter_map(|path| {
            let content = std::fs::read_to_string(&path).ok()?;
            let name = path.file_name()?.to_string_lossy().into_owned();
            let lines: Vec<String> = content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .take(max_lines)
                .map(str::to_owned)
                .collect();
            if lines.is_empty() {
                return None;
            }
            Some(RetrievalBlock {
                source: format!("memory:{name}"),
                lines,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn payload_never_exceeds_budget() {
        let essential = lines(&["task: t-1", "prompt: do the thing"]);
        let retrieval = vec![RetrievalBlock {
            source: "memory:a.md".to_owned(),
            lines: lines(&["a very long retrieval line that should use tokens"; 50]),
        }];
        for budget in [1usize, 5, 10, 25, 100] {
            let payload = build_payload(&essential, &retrieval, budget);
            assert!(
                payload.compacted_tokens <= budget,
                "budget {budget} exceeded: {}",
                payload.compacted_tokens
            );
        }
    }

    #[test]
    fn essential_lines_come_first() {
        let essential = lines(&["task: t-1"]);
        let retrieval = vec![RetrievalBlock {
            source: "memory:a.md".to_owned(),
            lines: lines(&["retrieved"]),
        }];
        let payload = build_payload(&essential, &retrieval, 1000);
        assert!(payload.text.starts_with("task: t-1\n"));
        assert!(payload.text.contains("retrieved"));
        assert!(!payload.truncated);
        assert_eq!(payload.retrieval_sources, vec!["memory:a.md".to_owned()]);
    }

    #[test]
    fn tight_budget_drops_retrieval_and_reports_sources_used() {
        let essential = lines(&["task identity line"]);
        let retrieval = vec![
            RetrievalBlock {
                source: "recent_task:t-9".to_owned(),
                lines: lines(&["short"]),
            },
            RetrievalBlock {
                source: "memory:big.md".to_owned(),
                lines: lines(&[
                    "an enormous line of retrieval text that cannot possibly fit the budget",
                ]),
            },
        ];
        let payload = build_payload(&essential, &retrieval, 10);
        assert!(payload.truncated);
        assert_eq!(payload.retrieval_sources, vec!["recent_task:t-9".to_owned()]);
        assert!(payload.compression_ratio < 1.0);
    }

    #[test]
    fn memory_retrieval_reads_markdown_only() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("notes.md"), "line one\n\nline two\n").unwrap();
        std::fs::write(tmp.path().join("skip.txt"), "nope").unwrap();

        let blocks = memory_retrieval(tmp.path(), 3, 10);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].source, "memory:notes.md");
        assert_eq!(blocks[0].lines, vec!["line one".to_owned(), "line two".to_owned()]);
    }

    #[test]
    fn memory_retrieval_missing_dir_is_empty() {
        let blocks = memory_retrieval(Path::new("/nonexistent/memory"), 3, 10);
        assert!(blocks.is_empty());
    }
}
