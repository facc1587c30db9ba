//! Per-session transcript tailing

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, warn};

use super::HandoffCallback;
use super::tokens::{ExhaustionThresholds, HandoffLevel, TokenState};

/// State of one watched session
///
/// Owns the file cursor for its transcript directory. Cursors are only
/// touched by the watcher's poll loop; timers look sessions up by id
/// rather than holding references here.
pub(crate) struct SessionMonitor {
    pub(crate) id: String,
    pub(crate) workspace: PathBuf,
    pub(crate) transcript_dir: PathBuf,
    pub(crate) callback: HandoffCallback,
    /// (current file, byte offset of the next unread line)
    cursor: Option<(PathBuf, u64)>,
    pub(crate) last_activity: Instant,
    pub(crate) started_at: Instant,
    pub(crate) peak: TokenState,
    /// Token-based signal is one-shot per session
    pub(crate) signal_fired: bool,
    pub(crate) timer: Option<tokio::task::JoinHandle<()>>,
}

impl SessionMonitor {
    pub(crate) fn new(id: String, workspace: PathBuf, transcript_dir: PathBuf, callback: HandoffCallback) -> Self {
        let now = Instant::now();
        Self {
            id,
            workspace,
            transcript_dir,
            callback,
            cursor: None,
            last_activity: now,
            started_at: now,
            peak: TokenState::default(),
            signal_fired: false,
            timer: None,
        }
    }

    /// Read newly appended transcript lines and score them
    ///
    /// Returns the strongest exhaustion level observed in the new lines.
    /// IO errors are logged and retried on the next tick.
    pub(crate) fn poll(&mut self, thresholds: &ExhaustionThresholds) -> Option<HandoffLevel> {
        let current = match newest_transcript(&self.transcript_dir) {
            Ok(Some(path)) => path,
            Ok(None) => return None,
            Err(e) => {
                warn!(dir = %self.transcript_dir.display(), error = %e, "Failed to list transcript dir, will retry");
                return None;
            }
        };

        // File rotation resets the cursor
        let offset = match &self.cursor {
            Some((path, offset)) if *path == current => *offset,
            _ => {
                debug!(session = %self.id, file = %current.display(), "Tailing new transcript file");
                0
            }
        };

        let (lines, new_offset) = match read_complete_lines(&current, offset) {
            Ok(read) => read,
            Err(e) => {
                warn!(file = %current.display(), error = %e, "Failed to read transcript, will retry");
                return None;
            }
        };

        if new_offset != offset {
            self.last_activity = Instant::now();
        }
        self.cursor = Some((current, new_offset));

        let mut strongest: Option<HandoffLevel> = None;
        for line in lines {
            let Some(tokens) = TokenState::from_transcript_line(&line) else {
                continue;
            };
            if tokens.total_context() > self.peak.total_context() {
                self.peak = tokens.clone();
            }
            match thresholds.evaluate(&tokens) {
                Some(HandoffLevel::Emergency) => strongest = Some(HandoffLevel::Emergency),
                Some(level) if strongest.is_none() => strongest = Some(level),
                _ => {}
            }
        }
        strongest
    }
}

/// The newest `.jsonl` file in the transcript directory
fn newest_transcript(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        match &newest {
            Some((ts, _)) if *ts >= modified => {}
            _ => newest = Some((modified, path)),
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Read complete lines appended past `offset`
///
/// A trailing partial line (no newline yet) is left for the next tick;
/// the returned offset points just past the last complete line.
fn read_complete_lines(path: &Path, offset: u64) -> std::io::Result<(Vec<String>, u64)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    // Truncated or rewritten file: start over
    let offset = if offset > len { 0 } else { offset };

    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
        return Ok((Vec::new(), offset));
    };

    let complete = &buf[..=last_newline];
    let lines = String::from_utf8_lossy(complete)
        .lines()
        .map(|l| l.to_string())
        .collect();

    Ok((lines, offset + last_newline as u64 + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn monitor(dir: &Path) -> SessionMonitor {
        SessionMonitor::new(
            "s1".to_string(),
            PathBuf::from("ws"),
            dir.to_path_buf(),
            Arc::new(|_| {}),
        )
    }

    fn assistant_line(cache_creation: u64, cache_read: u64) -> String {
        format!(
            r#"{{"type":"assistant","requestId":"r","message":{{"usage":{{"input_tokens":1,"output_tokens":1,"cache_read_input_tokens":{cache_read},"cache_creation_input_tokens":{cache_creation}}}}}}}"#
        )
    }

    #[test]
    fn test_poll_empty_dir() {
        let temp = tempdir().unwrap();
        let mut m = monitor(temp.path());
        assert_eq!(m.poll(&ExhaustionThresholds::default()), None);
    }

    #[test]
    fn test_poll_reads_appended_lines_incrementally() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("session.jsonl");
        std::fs::write(&path, format!("{}\n", assistant_line(1000, 0))).unwrap();

        let mut m = monitor(temp.path());
        assert_eq!(m.poll(&ExhaustionThresholds::default()), None);
        assert_eq!(m.peak.cache_creation_input_tokens, 1000);

        // Append a line that crosses the graceful threshold
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{}", assistant_line(135_000, 100)).unwrap();
        drop(file);

        assert_eq!(m.poll(&ExhaustionThresholds::default()), Some(HandoffLevel::Graceful));
    }

    #[test]
    fn test_poll_ignores_partial_trailing_line() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("session.jsonl");
        // No trailing newline - the line is still being written
        std::fs::write(&path, assistant_line(135_000, 0)).unwrap();

        let mut m = monitor(temp.path());
        assert_eq!(m.poll(&ExhaustionThresholds::default()), None);

        // Newline arrives, the line becomes complete
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file).unwrap();
        drop(file);
        assert_eq!(m.poll(&ExhaustionThresholds::default()), Some(HandoffLevel::Graceful));
    }

    #[test]
    fn test_poll_skips_malformed_lines() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("session.jsonl");
        let content = format!(
            "not json\n{{\"type\":\"user\"}}\n{}\n",
            assistant_line(145_000, 10)
        );
        std::fs::write(&path, content).unwrap();

        let mut m = monitor(temp.path());
        assert_eq!(m.poll(&ExhaustionThresholds::default()), Some(HandoffLevel::Emergency));
    }

    #[test]
    fn test_newest_file_wins() {
        let temp = tempdir().unwrap();
        let old = temp.path().join("old.jsonl");
        std::fs::write(&old, format!("{}\n", assistant_line(1, 0))).unwrap();
        // Make sure mtimes differ
        std::thread::sleep(std::time::Duration::from_millis(20));
        let new = temp.path().join("new.jsonl");
        std::fs::write(&new, format!("{}\n", assistant_line(2, 0))).unwrap();

        let mut m = monitor(temp.path());
        m.poll(&ExhaustionThresholds::default());
        assert_eq!(m.peak.cache_creation_input_tokens, 2);
    }

    #[test]
    fn test_truncated_file_resets_cursor() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("session.jsonl");
        std::fs::write(&path, format!("{}\n{}\n", assistant_line(1, 0), assistant_line(2, 0))).unwrap();

        let mut m = monitor(temp.path());
        m.poll(&ExhaustionThresholds::default());

        // Rewrite shorter than the cursor
        std::fs::write(&path, format!("{}\n", assistant_line(3, 0))).unwrap();
        m.poll(&ExhaustionThresholds::default());
        assert_eq!(m.peak.cache_creation_input_tokens, 3);
    }
}
