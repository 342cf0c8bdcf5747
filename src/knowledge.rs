//! Auto-merge for the append-only tables in `CLAUDE.md`'s knowledge section.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

pub const BEGIN_MARKER: &str = "<!-- orc:knowledge:begin -->";
pub const END_MARKER: &str = "<!-- orc:knowledge:end -->";

/// The three append-only tables this crate knows how to auto-merge.
pub const KNOWN_TABLES: &[&str] = &["Patterns Learned", "Known Gotchas", "Decisions"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnowledgeMergeError {
    /// At least one conflict marker survived auto-merge; the caller should
    /// fall back to manual resolution. Output is never handed back
    /// half-merged.
    UnresolvedConflicts { count: usize },
}

impl std::fmt::Display for KnowledgeMergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvedConflicts { count } => {
                write!(f, "{count} conflict(s) could not be auto-resolved")
            }
        }
    }
}

impl std::error::Error for KnowledgeMergeError {}

static CONFLICT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<<<<<<<[^\n]*\n(.*?)\n=======\n(.*?)\n>>>>>>>[^\n]*\n?").unwrap()
});

static TASK_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"TASK-(\d+)").unwrap());

/// Auto-merge the conflict markers in `content`. Succeeds only if every
/// conflict block was a disjoint row-insertion into one of
/// [`KNOWN_TABLES`] inside the bracketed knowledge section; anything else
/// leaves markers in place and the whole merge is rejected.
pub fn merge_knowledge_file(content: &str) -> Result<String, KnowledgeMergeError> {
    let section_range = knowledge_section_range(content);

    let mut result = String::with_capacity(content.len());
    let mut last_end = 0;
    let mut unresolved = 0;

    for m in CONFLICT_BLOCK.find_iter(content) {
        result.push_str(&content[last_end..m.start()]);
        let caps = CONFLICT_BLOCK.captures(&content[m.start()..m.end()]).unwrap();
        let ours = &caps[1];
        let theirs = &caps[2];

        let in_section = section_range
            .map(|(s, e)| m.start() >= s && m.end() <= e)
            .unwrap_or(false);
        let in_known_table = in_section
            && enclosing_heading(content, m.start())
                .is_some_and(|h| KNOWN_TABLES.contains(&h.as_str()));

        match in_known_table.then(|| try_merge_rows(ours, theirs)).flatten() {
            Some(merged) => result.push_str(&merged),
            None => {
                unresolved += 1;
                result.push_str(&content[m.start()..m.end()]);
            }
        }
        last_end = m.end();
    }
    result.push_str(&content[last_end..]);

    if unresolved > 0 || result.contains("<<<<<<<") {
        return Err(KnowledgeMergeError::UnresolvedConflicts {
            count: unresolved.max(1),
        });
    }
    Ok(result)
}

fn knowledge_section_range(content: &str) -> Option<(usize, usize)> {
    let start = content.find(BEGIN_MARKER)?;
    let end = content[start..].find(END_MARKER).map(|i| start + i)?;
    Some((start, end))
}

/// The nearest `##` heading text preceding byte offset `pos`, trimmed. A
/// conflict block belongs to whichever heading last appeared above it.
fn enclosing_heading(content: &str, pos: usize) -> Option<String> {
    content[..pos]
        .lines()
        .rev()
        .find_map(|l| l.trim_start().strip_prefix("##").map(|h| h.trim().to_string()))
}

/// A line is a table row if, once trimmed, it starts with `|`.
fn is_row(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

fn normalize_row(line: &str) -> String {
    line.split('|')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("|")
}

fn task_id_of(line: &str) -> Option<u64> {
    TASK_ID.captures(line).and_then(|c| c[1].parse().ok())
}

/// Try to auto-resolve a conflict block as a disjoint union of table-row
/// insertions. Returns `None` if either side has a non-row line, or if the
/// same task id's row differs between the two sides (a shared row being
/// changed, not a disjoint add).
fn try_merge_rows(ours: &str, theirs: &str) -> Option<String> {
    let ours_lines: Vec<&str> = ours.lines().filter(|l| !l.trim().is_empty()).collect();
    let theirs_lines: Vec<&str> = theirs.lines().filter(|l| !l.trim().is_empty()).collect();

    if !ours_lines.iter().chain(theirs_lines.iter()).all(|l| is_row(l)) {
        return None;
    }

    let mut by_normalized: BTreeMap<String, (String, Option<u64>)> = BTreeMap::new();
    for line in ours_lines.iter().chain(theirs_lines.iter()) {
        let normalized = normalize_row(line);
        let id = task_id_of(line);
        match by_normalized.get(&normalized) {
            None => {
                by_normalized.insert(normalized, (line.to_string(), id));
            }
            Some(_) => {}
        }
    }

    // Detect a shared row being changed: same task id, different normalized text.
    let mut seen_ids: BTreeMap<u64, &str> = BTreeMap::new();
    for (normalized, (_, id)) in &by_normalized {
        if let Some(id) = id {
            if let Some(existing) = seen_ids.insert(*id, normalized.as_str()) {
                if existing != normalized.as_str() {
                    return None;
                }
            }
        }
    }

    let mut rows: Vec<(Option<u64>, String)> = by_normalized
        .into_values()
        .map(|(line, id)| (id, line))
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    let merged = rows
        .into_iter()
        .map(|(_, line)| line)
        .collect::<Vec<_>>()
        .join("\n");
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(conflict: &str) -> String {
        format!(
            "# CLAUDE.md\n\n{BEGIN_MARKER}\n## Patterns Learned\n\n| Task | Pattern |\n|------|---------|\n{conflict}\n{END_MARKER}\n"
        )
    }

    #[test]
    fn merges_disjoint_row_insertions_ordered_by_task_id() {
        let conflict = "<<<<<<< ours\n| TASK-001 | use builder pattern |\n=======\n\
| TASK-002 | prefer composition |\n>>>>>>> theirs";
        let content = sample(conflict);
        let merged = merge_knowledge_file(&content).expect("should auto-merge");
        assert!(!merged.contains("<<<<<<<"));
        let t1 = merged.find("TASK-001").unwrap();
        let t2 = merged.find("TASK-002").unwrap();
        assert!(t1 < t2);
        assert!(merged.contains(BEGIN_MARKER));
        assert!(merged.contains(END_MARKER));
    }

    #[test]
    fn is_idempotent_on_its_own_output() {
        let conflict = "<<<<<<< ours\n| TASK-001 | use builder pattern |\n=======\n\
| TASK-002 | prefer composition |\n>>>>>>> theirs";
        let content = sample(conflict);
        let merged_once = merge_knowledge_file(&content).unwrap();
        let merged_twice = merge_knowledge_file(&merged_once).unwrap();
        assert_eq!(merged_once, merged_twice);
    }

    #[test]
    fn leaves_conflicts_outside_section_unresolved() {
        let content = format!(
            "{BEGIN_MARKER}\n{END_MARKER}\n\n<<<<<<< ours\nsome prose\n=======\nother prose\n>>>>>>> theirs\n"
        );
        assert!(merge_knowledge_file(&content).is_err());
    }

    #[test]
    fn leaves_shared_row_changes_unresolved() {
        let conflict = "<<<<<<< ours\n| TASK-001 | version A |\n=======\n\
| TASK-001 | version B |\n>>>>>>> theirs";
        let content = sample(conflict);
        assert!(merge_knowledge_file(&content).is_err());
    }

    #[test]
    fn leaves_conflicts_under_unknown_heading_unresolved() {
        let content = format!(
            "# CLAUDE.md\n\n{BEGIN_MARKER}\n## Scratch Notes\n\n\
             | Task | Note |\n|------|------|\n\
             <<<<<<< ours\n| TASK-001 | use builder pattern |\n=======\n\
             | TASK-002 | prefer composition |\n>>>>>>> theirs\n{END_MARKER}\n"
        );
        assert!(merge_knowledge_file(&content).is_err());
    }
}
