//! Branch naming.

use crate::types::{IssueClass, RunId};

/// Maximum words kept from the issue title in a branch slug.
const SLUG_MAX_WORDS: usize = 5;

/// Maximum slug length in characters.
const SLUG_MAX_LEN: usize = 40;

/// Create a slug (lowercase, alphanumeric, hyphens).
pub fn slugify(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        // Collapse multiple hyphens.
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Short slug from an issue title: at most five words and 40 characters.
pub fn title_slug(title: &str) -> String {
    let slug = slugify(title);
    let mut out = String::new();
    for word in slug.split('-').take(SLUG_MAX_WORDS) {
        let extra = if out.is_empty() { word.len() } else { word.len() + 1 };
        if out.len() + extra > SLUG_MAX_LEN {
            break;
        }
        if !out.is_empty() {
            out.push('-');
        }
        out.push_str(word);
    }
    if out.is_empty() {
        "work".to_string()
    } else {
        out
    }
}

/// `<feat|bug|chore>-issue-<n>-adw-<run_id>-<slug>`.
pub fn branch_name(class: IssueClass, issue_number: u64, run_id: &RunId, title: &str) -> String {
    format!(
        "{}-issue-{}-adw-{}-{}",
        class.branch_prefix(),
        issue_number,
        run_id,
        title_slug(title)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_follows_convention() {
        let run = RunId::parse("abc12345").unwrap();
        assert_eq!(
            branch_name(IssueClass::Feature, 123, &run, "Add user login page!"),
            "feat-issue-123-adw-abc12345-add-user-login-page"
        );
        assert_eq!(
            branch_name(IssueClass::Bug, 9, &run, "Crash on empty query"),
            "bug-issue-9-adw-abc12345-crash-on-empty-query"
        );
    }

    #[test]
    fn title_slug_is_bounded() {
        assert_eq!(
            title_slug("one two three four five six seven"),
            "one-two-three-four-five"
        );
        let long = "a".repeat(60);
        assert_eq!(title_slug(&format!("short {long}")), "short");
        assert_eq!(title_slug("!!!"), "work");
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Fix: SQL -- injection  (urgent)"), "fix-sql-injection-urgent");
    }
}
