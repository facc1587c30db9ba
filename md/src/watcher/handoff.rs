//! HANDOFF.md - the handoff ledger in the mission workspace
//!
//! Successive handoffs append numbered sections. Writers append only;
//! the section count is a first-class observable for tests and the
//! dashboard.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::debug;

/// Conventional handoff file name
pub const HANDOFF_FILE: &str = "HANDOFF.md";

const SECTION_PREFIX: &str = "## Handoff #";

/// One handoff section
#[derive(Clone, Debug)]
pub struct HandoffEntry {
    pub mission_id: String,
    pub stage: String,
    pub progress_note: String,
    pub timestamp: DateTime<Utc>,
}

impl HandoffEntry {
    pub fn new(mission_id: impl Into<String>, stage: impl Into<String>, progress_note: impl Into<String>) -> Self {
        Self {
            mission_id: mission_id.into(),
            stage: stage.into(),
            progress_note: progress_note.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append a numbered handoff section, returning its section number
///
/// The whole file is rewritten through a temp-file rename so a crash
/// mid-write cannot corrupt earlier sections.
pub fn append_handoff(workspace: &Path, entry: &HandoffEntry) -> std::io::Result<usize> {
    let path = workspace.join(HANDOFF_FILE);
    let existing = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let number = count_in(&existing) + 1;
    let section = format!(
        "{SECTION_PREFIX}{number} — {}\n\n- mission: {}\n- stage: {}\n\n{}\n\n",
        entry.timestamp.to_rfc3339(),
        entry.mission_id,
        entry.stage,
        entry.progress_note
    );

    std::fs::create_dir_all(workspace)?;
    let tmp = workspace.join(format!("{HANDOFF_FILE}.tmp"));
    std::fs::write(&tmp, format!("{existing}{section}"))?;
    std::fs::rename(&tmp, &path)?;

    debug!(path = %path.display(), number, "Handoff section appended");
    Ok(number)
}

/// Count handoff sections already recorded in the workspace
pub fn count_sections(workspace: &Path) -> usize {
    match std::fs::read_to_string(workspace.join(HANDOFF_FILE)) {
        Ok(content) => count_in(&content),
        Err(_) => 0,
    }
}

fn count_in(content: &str) -> usize {
    content.lines().filter(|l| l.starts_with(SECTION_PREFIX)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_numbers_sections() {
        let temp = tempdir().unwrap();
        let ws = temp.path();

        let n1 = append_handoff(ws, &HandoffEntry::new("m1", "BUILDING", "halfway through the parser")).unwrap();
        assert_eq!(n1, 1);
        let n2 = append_handoff(ws, &HandoffEntry::new("m1", "BUILDING", "parser done, tests next")).unwrap();
        assert_eq!(n2, 2);

        assert_eq!(count_sections(ws), 2);

        let content = std::fs::read_to_string(ws.join(HANDOFF_FILE)).unwrap();
        assert!(content.contains("## Handoff #1"));
        assert!(content.contains("## Handoff #2"));
        assert!(content.contains("- mission: m1"));
        assert!(content.contains("- stage: BUILDING"));
        assert!(content.contains("halfway through the parser"));
    }

    #[test]
    fn test_append_preserves_earlier_sections() {
        let temp = tempdir().unwrap();
        append_handoff(temp.path(), &HandoffEntry::new("m1", "PLANNING", "first")).unwrap();
        append_handoff(temp.path(), &HandoffEntry::new("m1", "BUILDING", "second")).unwrap();

        let content = std::fs::read_to_string(temp.path().join(HANDOFF_FILE)).unwrap();
        let first_at = content.find("first").unwrap();
        let second_at = content.find("second").unwrap();
        assert!(first_at < second_at);
    }

    #[test]
    fn test_count_on_missing_file() {
        let temp = tempdir().unwrap();
        assert_eq!(count_sections(temp.path()), 0);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let temp = tempdir().unwrap();
        append_handoff(temp.path(), &HandoffEntry::new("m1", "BUILDING", "note")).unwrap();
        assert!(!temp.path().join(format!("{HANDOFF_FILE}.tmp")).exists());
    }
}
