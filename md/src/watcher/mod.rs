//! Context watcher - real-time transcript monitoring for early handoffs
//!
//! Tails the live LLM transcript per session and signals the conductor
//! before the context window is exhausted, so one mission can span many
//! physical LLM invocations. Also arms a per-session wall-clock timer
//! for time-based handoffs.

mod handoff;
mod session;
mod tokens;

pub use handoff::{HANDOFF_FILE, HandoffEntry, append_handoff, count_sections};
pub use tokens::{ExhaustionThresholds, HandoffLevel, HandoffSignal, TokenState};

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use session::SessionMonitor;

/// Callback invoked with a handoff signal
///
/// Runs on the watcher's poll or timer task; keep it short and
/// non-panicking (panics are caught and logged).
pub type HandoffCallback = Arc<dyn Fn(HandoffSignal) + Send + Sync>;

/// Maps a workspace to its transcript directory
///
/// The mapping is owned outside the engine; a lookup may fail, in which
/// case the session is not monitored.
pub trait TranscriptResolver: Send + Sync {
    fn resolve(&self, workspace: &Path) -> Option<PathBuf>;
}

/// Resolver for the conventional per-workspace transcript layout:
/// `<root>/<workspace path with separators flattened to '-'>`
pub struct ProjectsDirResolver {
    root: PathBuf,
}

impl ProjectsDirResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TranscriptResolver for ProjectsDirResolver {
    fn resolve(&self, workspace: &Path) -> Option<PathBuf> {
        let flattened: String = workspace
            .to_string_lossy()
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == '.' { '-' } else { c })
            .collect();
        let dir = self.root.join(flattened);
        if dir.is_dir() { Some(dir) } else { None }
    }
}

/// Watcher configuration
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    pub thresholds: ExhaustionThresholds,
    pub poll_interval: Duration,
    pub time_handoff: Duration,
    pub time_handoff_enabled: bool,
    pub stale_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            thresholds: ExhaustionThresholds::default(),
            poll_interval: Duration::from_secs(1),
            time_handoff: Duration::from_secs(55 * 60),
            time_handoff_enabled: true,
            stale_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Watcher metrics snapshot
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct WatcherMetrics {
    pub sessions_started: u64,
    pub sessions_cleaned: u64,
    pub graceful_signals: u64,
    pub emergency_signals: u64,
    pub time_signals: u64,
    pub timers_cancelled: u64,
}

#[derive(Default)]
struct Counters {
    sessions_started: AtomicU64,
    sessions_cleaned: AtomicU64,
    graceful_signals: AtomicU64,
    emergency_signals: AtomicU64,
    time_signals: AtomicU64,
    timers_cancelled: AtomicU64,
}

/// Monitors live transcripts and signals handoffs
///
/// One watcher serves many sessions; the session table is guarded by a
/// mutex and file cursors are touched only by the poll loop.
pub struct ContextWatcher {
    config: WatcherConfig,
    resolver: Arc<dyn TranscriptResolver>,
    sessions: Mutex<HashMap<String, SessionMonitor>>,
    counters: Counters,
}

impl ContextWatcher {
    pub fn new(config: WatcherConfig, resolver: Arc<dyn TranscriptResolver>) -> Arc<Self> {
        Arc::new(Self {
            config,
            resolver,
            sessions: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionMonitor>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start monitoring a workspace's transcript
    ///
    /// Returns None when no transcript directory can be resolved for
    /// the workspace. Otherwise registers a session, optionally arms the
    /// time-based timer, and returns the fresh session id.
    pub fn start_watching(
        self: &Arc<Self>,
        workspace: &Path,
        callback: HandoffCallback,
        enable_time_handoff: bool,
    ) -> Option<String> {
        let transcript_dir = match self.resolver.resolve(workspace) {
            Some(dir) => dir,
            None => {
                warn!(workspace = %workspace.display(), "No transcript directory for workspace, not watching");
                return None;
            }
        };

        let id = Uuid::now_v7().to_string();
        let monitor = SessionMonitor::new(id.clone(), workspace.to_path_buf(), transcript_dir, callback);
        self.sessions().insert(id.clone(), monitor);
        self.counters.sessions_started.fetch_add(1, Ordering::Relaxed);

        if enable_time_handoff && self.config.time_handoff_enabled {
            self.arm_timer(&id);
        }

        info!(session = %id, workspace = %workspace.display(), "Watching session");
        Some(id)
    }

    fn arm_timer(self: &Arc<Self>, session_id: &str) {
        let weak = Arc::downgrade(self);
        let id = session_id.to_string();
        let delay = self.config.time_handoff;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The session may be long gone; never signal a cleaned-up
            // session (zombie-timer check).
            if let Some(watcher) = weak.upgrade() {
                watcher.fire_time_signal(&id);
            }
        });

        if let Some(session) = self.sessions().get_mut(session_id) {
            session.timer = Some(handle);
        } else {
            handle.abort();
        }
    }

    fn fire_time_signal(&self, session_id: &str) {
        let fired = {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(session_id) else {
                debug!(session = %session_id, "Timer fired for unknown session, ignoring");
                return;
            };
            if session.signal_fired {
                debug!(session = %session_id, "Session already signalled, timer ignored");
                return;
            }
            session.signal_fired = true;
            session.timer = None;

            let elapsed = session.started_at.elapsed().as_secs_f64() / 60.0;
            let signal = HandoffSignal {
                level: HandoffLevel::TimeBased,
                session_id: session_id.to_string(),
                workspace_path: session.workspace.clone(),
                tokens_used: session.peak.total_context(),
                cache_read: session.peak.cache_read_input_tokens,
                cache_creation: session.peak.cache_creation_input_tokens,
                elapsed_minutes: Some(elapsed),
                timestamp: Utc::now(),
            };
            (session.callback.clone(), signal)
        };

        self.counters.time_signals.fetch_add(1, Ordering::Relaxed);
        info!(session = %session_id, "Time-based handoff signal");
        Self::invoke(fired.0, fired.1);
    }

    /// One tick of the poll loop: tail every session, fire due signals,
    /// and clean up stale sessions.
    pub fn poll_once(&self) {
        let mut due: Vec<(HandoffCallback, HandoffSignal)> = Vec::new();
        let mut stale: Vec<String> = Vec::new();

        {
            let mut sessions = self.sessions();
            for (id, session) in sessions.iter_mut() {
                let level = session.poll(&self.config.thresholds);

                if let Some(level) = level
                    && !session.signal_fired
                {
                    session.signal_fired = true;
                    // A token signal supersedes the time-based timer
                    if let Some(timer) = session.timer.take() {
                        timer.abort();
                        self.counters.timers_cancelled.fetch_add(1, Ordering::Relaxed);
                    }

                    let signal = HandoffSignal {
                        level,
                        session_id: id.clone(),
                        workspace_path: session.workspace.clone(),
                        tokens_used: session.peak.total_context(),
                        cache_read: session.peak.cache_read_input_tokens,
                        cache_creation: session.peak.cache_creation_input_tokens,
                        elapsed_minutes: None,
                        timestamp: Utc::now(),
                    };
                    match level {
                        HandoffLevel::Emergency => {
                            self.counters.emergency_signals.fetch_add(1, Ordering::Relaxed)
                        }
                        _ => self.counters.graceful_signals.fetch_add(1, Ordering::Relaxed),
                    };
                    due.push((session.callback.clone(), signal));
                }

                if session.last_activity.elapsed() > self.config.stale_timeout {
                    stale.push(id.clone());
                }
            }
        }

        for id in stale {
            info!(session = %id, "Session stale, cleaning up");
            self.cleanup_session(&id);
        }

        for (callback, signal) in due {
            info!(session = %signal.session_id, level = signal.level.as_str(), "Context handoff signal");
            Self::invoke(callback, signal);
        }
    }

    fn invoke(callback: HandoffCallback, signal: HandoffSignal) {
        let session = signal.session_id.clone();
        if catch_unwind(AssertUnwindSafe(|| callback(signal))).is_err() {
            warn!(%session, "Handoff callback panicked");
        }
    }

    /// Spawn the background poll loop
    pub fn spawn_poll_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.config.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(watcher) = weak.upgrade() else {
                    break;
                };
                watcher.poll_once();
            }
        })
    }

    /// Stop monitoring a session
    pub fn stop_watching(&self, session_id: &str) -> bool {
        debug!(session = %session_id, "stop_watching");
        self.teardown(session_id)
    }

    /// Internal cleanup for stale sessions
    ///
    /// Shares the teardown path with [`ContextWatcher::stop_watching`];
    /// parity of the two is a correctness property.
    pub fn cleanup_session(&self, session_id: &str) -> bool {
        debug!(session = %session_id, "cleanup_session");
        self.teardown(session_id)
    }

    fn teardown(&self, session_id: &str) -> bool {
        let removed = self.sessions().remove(session_id);
        match removed {
            Some(session) => {
                if let Some(timer) = session.timer {
                    timer.abort();
                    self.counters.timers_cancelled.fetch_add(1, Ordering::Relaxed);
                }
                self.counters.sessions_cleaned.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, session_id: &str) -> bool {
        self.sessions().contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn metrics(&self) -> WatcherMetrics {
        WatcherMetrics {
            sessions_started: self.counters.sessions_started.load(Ordering::Relaxed),
            sessions_cleaned: self.counters.sessions_cleaned.load(Ordering::Relaxed),
            graceful_signals: self.counters.graceful_signals.load(Ordering::Relaxed),
            emergency_signals: self.counters.emergency_signals.load(Ordering::Relaxed),
            time_signals: self.counters.time_signals.load(Ordering::Relaxed),
            timers_cancelled: self.counters.timers_cancelled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    /// Resolver that maps every workspace to one fixed directory
    struct FixedResolver(Option<PathBuf>);
    impl TranscriptResolver for FixedResolver {
        fn resolve(&self, _workspace: &Path) -> Option<PathBuf> {
            self.0.clone()
        }
    }

    fn collecting_callback() -> (HandoffCallback, Arc<StdMutex<Vec<HandoffSignal>>>) {
        let signals = Arc::new(StdMutex::new(Vec::new()));
        let sink = signals.clone();
        let callback: HandoffCallback = Arc::new(move |signal| {
            sink.lock().unwrap().push(signal);
        });
        (callback, signals)
    }

    fn assistant_line(cache_creation: u64, cache_read: u64) -> String {
        format!(
            r#"{{"type":"assistant","requestId":"r","message":{{"usage":{{"input_tokens":1,"output_tokens":1,"cache_read_input_tokens":{cache_read},"cache_creation_input_tokens":{cache_creation}}}}}}}"#
        )
    }

    fn watcher_with(config: WatcherConfig, dir: &Path) -> Arc<ContextWatcher> {
        ContextWatcher::new(config, Arc::new(FixedResolver(Some(dir.to_path_buf()))))
    }

    #[tokio::test]
    async fn test_unresolvable_workspace_returns_none() {
        let watcher = ContextWatcher::new(WatcherConfig::default(), Arc::new(FixedResolver(None)));
        let (callback, _signals) = collecting_callback();
        assert!(watcher.start_watching(Path::new("/ws"), callback, false).is_none());
        assert_eq!(watcher.session_count(), 0);
    }

    #[tokio::test]
    async fn test_graceful_signal_fires_exactly_once() {
        let temp = tempdir().unwrap();
        let watcher = watcher_with(WatcherConfig::default(), temp.path());
        let (callback, signals) = collecting_callback();
        let id = watcher.start_watching(Path::new("/ws"), callback, false).unwrap();

        let path = temp.path().join("session.jsonl");
        std::fs::write(&path, format!("{}\n", assistant_line(135_000, 100))).unwrap();
        watcher.poll_once();

        {
            let seen = signals.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].level, HandoffLevel::Graceful);
            assert_eq!(seen[0].session_id, id);
            assert_eq!(seen[0].cache_creation, 135_000);
        }

        // A later, even stronger observation does not re-fire
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{}", assistant_line(145_000, 200)).unwrap();
        drop(file);
        watcher.poll_once();

        assert_eq!(signals.lock().unwrap().len(), 1);
        assert_eq!(watcher.metrics().graceful_signals, 1);
        assert_eq!(watcher.metrics().emergency_signals, 0);
    }

    #[tokio::test]
    async fn test_emergency_signal_level() {
        let temp = tempdir().unwrap();
        let watcher = watcher_with(WatcherConfig::default(), temp.path());
        let (callback, signals) = collecting_callback();
        watcher.start_watching(Path::new("/ws"), callback, false).unwrap();

        std::fs::write(
            temp.path().join("session.jsonl"),
            format!("{}\n", assistant_line(141_000, 0)),
        )
        .unwrap();
        watcher.poll_once();

        let seen = signals.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, HandoffLevel::Emergency);
    }

    #[tokio::test]
    async fn test_cache_hits_never_fire() {
        let temp = tempdir().unwrap();
        let watcher = watcher_with(WatcherConfig::default(), temp.path());
        let (callback, signals) = collecting_callback();
        watcher.start_watching(Path::new("/ws"), callback, false).unwrap();

        let mut content = String::new();
        for _ in 0..20 {
            content.push_str(&assistant_line(200_000, 150_000));
            content.push('\n');
        }
        std::fs::write(temp.path().join("session.jsonl"), content).unwrap();
        watcher.poll_once();

        assert!(signals.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_based_handoff_fires_once() {
        let temp = tempdir().unwrap();
        let config = WatcherConfig {
            time_handoff: Duration::from_secs(60),
            ..Default::default()
        };
        let watcher = watcher_with(config, temp.path());
        let (callback, signals) = collecting_callback();
        watcher.start_watching(Path::new("/ws"), callback, true).unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        let seen = signals.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, HandoffLevel::TimeBased);
        assert!(seen[0].elapsed_minutes.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_cancels_timer() {
        let temp = tempdir().unwrap();
        let config = WatcherConfig {
            time_handoff: Duration::from_secs(1),
            ..Default::default()
        };
        let watcher = watcher_with(config, temp.path());
        let (callback, signals) = collecting_callback();
        let id = watcher.start_watching(Path::new("/ws"), callback, true).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(watcher.cleanup_session(&id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        // The callback has not been invoked, the session is gone, and
        // the timer reports cancelled
        assert!(signals.lock().unwrap().is_empty());
        assert!(!watcher.is_watching(&id));
        assert_eq!(watcher.metrics().timers_cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_watching_matches_cleanup_teardown() {
        let temp = tempdir().unwrap();
        let config = WatcherConfig {
            time_handoff: Duration::from_secs(1),
            ..Default::default()
        };
        let watcher = watcher_with(config, temp.path());
        let (callback, signals) = collecting_callback();
        let id = watcher.start_watching(Path::new("/ws"), callback, true).unwrap();

        assert!(watcher.stop_watching(&id));
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert!(signals.lock().unwrap().is_empty());
        assert!(!watcher.is_watching(&id));
        let metrics = watcher.metrics();
        assert_eq!(metrics.timers_cancelled, 1);
        assert_eq!(metrics.sessions_cleaned, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_signal_supersedes_timer() {
        let temp = tempdir().unwrap();
        let config = WatcherConfig {
            time_handoff: Duration::from_secs(60),
            ..Default::default()
        };
        let watcher = watcher_with(config, temp.path());
        let (callback, signals) = collecting_callback();
        watcher.start_watching(Path::new("/ws"), callback, true).unwrap();

        std::fs::write(
            temp.path().join("session.jsonl"),
            format!("{}\n", assistant_line(135_000, 0)),
        )
        .unwrap();
        watcher.poll_once();

        // The timer was cancelled by the token signal; waiting past it
        // produces no second signal
        tokio::time::sleep(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;

        let seen = signals.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, HandoffLevel::Graceful);
        assert_eq!(watcher.metrics().timers_cancelled, 1);
    }

    #[tokio::test]
    async fn test_stale_session_cleaned_up() {
        let temp = tempdir().unwrap();
        let config = WatcherConfig {
            stale_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let watcher = watcher_with(config, temp.path());
        let (callback, _signals) = collecting_callback();
        let id = watcher.start_watching(Path::new("/ws"), callback, false).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        watcher.poll_once();

        assert!(!watcher.is_watching(&id));
        assert_eq!(watcher.metrics().sessions_cleaned, 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let temp = tempdir().unwrap();
        let watcher = watcher_with(WatcherConfig::default(), temp.path());
        let callback: HandoffCallback = Arc::new(|_| panic!("callback bug"));
        let id = watcher.start_watching(Path::new("/ws"), callback, false).unwrap();

        std::fs::write(
            temp.path().join("session.jsonl"),
            format!("{}\n", assistant_line(135_000, 0)),
        )
        .unwrap();
        // Must not propagate the panic
        watcher.poll_once();
        assert!(watcher.is_watching(&id));
    }

    #[test]
    fn test_projects_dir_resolver() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("-home-user-ws");
        std::fs::create_dir_all(&dir).unwrap();

        let resolver = ProjectsDirResolver::new(temp.path());
        assert_eq!(resolver.resolve(Path::new("/home/user/ws")), Some(dir));
        assert_eq!(resolver.resolve(Path::new("/missing/ws")), None);
    }
}
