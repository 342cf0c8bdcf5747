//! Branch and worktree-directory naming.
//!
//! Pure functions, no I/O. Construction, its left inverse (parsing), and
//! validation all live here so the rest of the engine never builds a branch
//! name by hand.

use once_cell::sync::Lazy;
use regex::Regex;

/// Default branch prefix used when a task has no initiative prefix of its own.
pub const DEFAULT_PREFIX: &str = "orc/";

static EXECUTOR_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]{2,3}$").unwrap());
static ALL_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").unwrap());
static VALID_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9/._-]+$").unwrap());

/// Build a branch name for `task_id`, optionally tagged by `executor_tag`,
/// under the default `"orc/"` prefix.
pub fn branch_name(task_id: &str, executor_tag: &str) -> String {
    branch_name_with_prefix(task_id, executor_tag, DEFAULT_PREFIX)
}

/// Build a branch name for `task_id` under an explicit prefix (e.g. an
/// initiative prefix like `"feature/auth-"`). `executor_tag` is lowercased
/// and appended as `-<tag>` when non-empty.
pub fn branch_name_with_prefix(task_id: &str, executor_tag: &str, prefix: &str) -> String {
    if executor_tag.is_empty() {
        format!("{prefix}{task_id}")
    } else {
        format!("{prefix}{task_id}-{}", executor_tag.to_lowercase())
    }
}

/// Worktree directory name for a task under the default prefix: the branch
/// name with every `/` replaced by `-`.
pub fn worktree_dir_name(task_id: &str, executor_tag: &str) -> String {
    dir_safe(&branch_name(task_id, executor_tag))
}

/// Worktree directory name for a task under an explicit prefix.
pub fn worktree_dir_name_with_prefix(task_id: &str, executor_tag: &str, prefix: &str) -> String {
    dir_safe(&branch_name_with_prefix(task_id, executor_tag, prefix))
}

/// Replace `/` with `-`. Case is preserved exactly.
fn dir_safe(branch: &str) -> String {
    branch.replace('/', "-")
}

/// Parse a branch name built under the default `"orc/"` prefix back into its
/// task id and executor tag.
///
/// Returns `(task_id, executor_tag, matched)`. `matched` is `false` when
/// `branch` doesn't start with [`DEFAULT_PREFIX`] at all (e.g. `"main"`); in
/// that case `task_id` and `executor_tag` are both empty.
pub fn parse_branch_name(branch: &str) -> (String, String, bool) {
    let Some(rest) = branch.strip_prefix(DEFAULT_PREFIX) else {
        return (String::new(), String::new(), false);
    };

    let segments: Vec<&str> = rest.split('-').collect();
    if segments.len() >= 2 {
        let last = segments[segments.len() - 1];
        let prev = segments[segments.len() - 2];
        if EXECUTOR_TAG.is_match(last) && ALL_DIGITS.is_match(prev) {
            let task_id = segments[..segments.len() - 1].join("-");
            return (task_id, last.to_string(), true);
        }
    }
    (rest.to_string(), String::new(), true)
}

/// Why a branch name failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidBranchName {
    Empty,
    TooLong { len: usize },
    DoesNotStartAlphanumeric,
    IllegalCharacters,
    ContainsDoubleDot,
    TrailingLock,
    TrailingDot,
    TrailingSlash,
    DoubleSlash,
    ContainsAtBrace,
    IsBareAt,
    IsHead,
    ComponentStartsOrEndsWithDot { component: String },
}

impl std::fmt::Display for InvalidBranchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "branch name is empty"),
            Self::TooLong { len } => write!(f, "branch name is {len} characters, max is 256"),
            Self::DoesNotStartAlphanumeric => {
                write!(f, "branch name must start with an alphanumeric character")
            }
            Self::IllegalCharacters => write!(
                f,
                "branch name contains characters outside [A-Za-z0-9/._-]"
            ),
            Self::ContainsDoubleDot => write!(f, "branch name contains '..'"),
            Self::TrailingLock => write!(f, "branch name ends with '.lock'"),
            Self::TrailingDot => write!(f, "branch name ends with '.'"),
            Self::TrailingSlash => write!(f, "branch name ends with '/'"),
            Self::DoubleSlash => write!(f, "branch name contains '//'"),
            Self::ContainsAtBrace => write!(f, "branch name contains '@{{'"),
            Self::IsBareAt => write!(f, "branch name is exactly '@'"),
            Self::IsHead => write!(f, "branch name is 'HEAD' (case-insensitive)"),
            Self::ComponentStartsOrEndsWithDot { component } => write!(
                f,
                "path component {component:?} starts or ends with '.'"
            ),
        }
    }
}

impl std::error::Error for InvalidBranchName {}

/// Validate a branch name against the rules in the naming specification.
/// Returns the first violated rule, if any.
pub fn validate_branch_name(name: &str) -> Result<(), InvalidBranchName> {
    if name.is_empty() {
        return Err(InvalidBranchName::Empty);
    }
    if name.len() > 256 {
        return Err(InvalidBranchName::TooLong { len: name.len() });
    }
    if !name.chars().next().unwrap().is_ascii_alphanumeric() {
        return Err(InvalidBranchName::DoesNotStartAlphanumeric);
    }
    if !VALID_CHARS.is_match(name) {
        return Err(InvalidBranchName::IllegalCharacters);
    }
    if name.contains("..") {
        return Err(InvalidBranchName::ContainsDoubleDot);
    }
    if name.ends_with(".lock") {
        return Err(InvalidBranchName::TrailingLock);
    }
    if name.ends_with('.') {
        return Err(InvalidBranchName::TrailingDot);
    }
    if name.ends_with('/') {
        return Err(InvalidBranchName::TrailingSlash);
    }
    if name.contains("//") {
        return Err(InvalidBranchName::DoubleSlash);
    }
    if name.contains("@{") {
        return Err(InvalidBranchName::ContainsAtBrace);
    }
    if name == "@" {
        return Err(InvalidBranchName::IsBareAt);
    }
    if name.eq_ignore_ascii_case("HEAD") {
        return Err(InvalidBranchName::IsHead);
    }
    for component in name.split('/') {
        if component.starts_with('.') || component.ends_with('.') {
            return Err(InvalidBranchName::ComponentStartsOrEndsWithDot {
                component: component.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn construction_scenarios() {
        assert_eq!(branch_name("TASK-001", ""), "orc/TASK-001");
        assert_eq!(branch_name("TASK-001", "AM"), "orc/TASK-001-am");
        assert_eq!(
            branch_name_with_prefix("TASK-001", "am", "feature/auth-"),
            "feature/auth-TASK-001-am"
        );
        assert_eq!(
            worktree_dir_name_with_prefix("TASK-001", "am", "feature/auth-"),
            "feature-auth-TASK-001-am"
        );
    }

    #[test]
    fn parsing_scenarios() {
        assert_eq!(
            parse_branch_name("orc/TASK-AM-001-bj"),
            ("TASK-AM-001".to_string(), "bj".to_string(), true)
        );
        assert_eq!(
            parse_branch_name("orc/TASK-001"),
            ("TASK-001".to_string(), String::new(), true)
        );
        assert_eq!(
            parse_branch_name("main"),
            (String::new(), String::new(), false)
        );
    }

    #[rstest]
    #[case("TASK-001", "")]
    #[case("TASK-001", "am")]
    #[case("my-init-TASK-42", "zz")]
    fn round_trip_under_default_prefix(#[case] task_id: &str, #[case] tag: &str) {
        let branch = branch_name(task_id, tag);
        let (parsed_id, parsed_tag, matched) = parse_branch_name(&branch);
        assert!(matched);
        assert_eq!(parsed_id, task_id);
        assert_eq!(parsed_tag, tag.to_lowercase());
        validate_branch_name(&branch).expect("constructed names must validate");
    }

    #[test]
    fn dir_name_preserves_case_and_only_replaces_slash() {
        assert_eq!(worktree_dir_name("TASK-001", "AM"), "orc-TASK-001-am");
    }

    #[test]
    fn validation_rejects_head_case_insensitively() {
        assert_eq!(validate_branch_name("head"), Err(InvalidBranchName::IsHead));
        assert_eq!(validate_branch_name("HEAD"), Err(InvalidBranchName::IsHead));
    }

    #[test]
    fn validation_rejects_trailing_lock() {
        assert_eq!(
            validate_branch_name("orc/TASK-001.lock"),
            Err(InvalidBranchName::TrailingLock)
        );
    }

    #[test]
    fn validation_rejects_double_slash_and_dotdot() {
        assert_eq!(
            validate_branch_name("orc//TASK-001"),
            Err(InvalidBranchName::DoubleSlash)
        );
        assert_eq!(
            validate_branch_name("orc/../TASK-001"),
            Err(InvalidBranchName::ContainsDoubleDot)
        );
    }

    #[test]
    fn validation_rejects_dot_component() {
        assert_eq!(
            validate_branch_name("orc/.hidden/TASK-001"),
            Err(InvalidBranchName::ComponentStartsOrEndsWithDot {
                component: ".hidden".to_string()
            })
        );
    }
}
