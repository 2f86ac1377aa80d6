//! Review prompt assembly.
//!
//! The prompt names the output contract version it expects; the validator
//! gates responses against the same configuration.

use crate::external::ChangeSet;
use crate::redact;

/// Build the model prompt and the redacted diff body for a changelist.
///
/// Diff content is scrubbed before it can leave the process; the model client
/// must never receive unredacted content.
pub fn build_review_request(
    changelist_id: i64,
    change_set: &ChangeSet,
    schema_version: &str,
    prompt_version: &str,
) -> (String, String) {
    let prompt = format!(
        "You are reviewing changelist {changelist_id} ({} files).\n\
         Respond with a single JSON object: schema_version \"{schema_version}\", \
         prompt_version \"{prompt_version}\", and a findings array. Each finding \
         needs id, severity, category, title, file, line, and message. Only \
         reference files present in the diff.",
        change_set.changed_files.len()
    );

    let mut diff = String::new();
    for file_diff in &change_set.diffs {
        diff.push_str("--- ");
        diff.push_str(&file_diff.path);
        diff.push('\n');
        diff.push_str(&redact::scrub(&file_diff.patch));
        diff.push('\n');
    }
    (prompt, diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::FileDiff;

    #[test]
    fn diff_body_is_scrubbed() {
        let change_set = ChangeSet {
            changed_files: vec!["src/config.py".to_string()],
            diffs: vec![FileDiff {
                path: "src/config.py".to_string(),
                patch: "+DATABASE_URL = \"postgres://svc:hunter2@db:5432/app\"".to_string(),
            }],
        };
        let (prompt, diff) = build_review_request(42, &change_set, "1.0", "1.0");
        assert!(prompt.contains("changelist 42"));
        assert!(diff.contains("postgres://[REDACTED]@db:5432/app"));
        assert!(!diff.contains("hunter2"));
    }
}
