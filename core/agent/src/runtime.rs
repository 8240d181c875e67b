//! One monitoring session: startup, the tick loop and teardown.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Local;
use rand::Rng;
use tracing::{debug, info, warn};
use warden_core::analysis::VerdictSource;
use warden_core::capture::CaptureSource;
use warden_core::effectors::{default_notifier, DesktopThread, Notifier};
use warden_core::escalation::countdown::{self, CountdownOutcome, TerminalTiming};
use warden_core::escalation::level_message;
use warden_core::{
    AnalysisPipeline, CommandCapture, CoordinationStore, Effect, EffectorSet, EscalationEngine,
    FileLease, MonitoringWindow, RuleSet, ScoreInput, ScoringPolicy, StopSignal, Transition, Tuning, Verdict,
};
use warden_protocol::{AgentConfig, ErrorInfo};

use crate::commands;

const CONFIG_RETRY: Duration = Duration::from_secs(5);
const NOTICE_TITLE: &str = "Warden";

/// State shared by the tick loop, the command worker and countdowns.
///
/// Every score change goes through [`Session::apply`], which holds the
/// engine lock while the transition is applied and published.
pub struct Session {
    store: CoordinationStore,
    engine: Mutex<EscalationEngine>,
    stop: StopSignal,
    timing: TerminalTiming,
    lease: Arc<Mutex<Option<FileLease>>>,
}

impl Session {
    pub fn new(
        store: CoordinationStore,
        engine: EscalationEngine,
        stop: StopSignal,
        timing: TerminalTiming,
    ) -> Self {
        Self {
            store,
            engine: Mutex::new(engine),
            stop,
            timing,
            lease: Arc::new(Mutex::new(None)),
        }
    }

    /// Keeps the config lease until the session ends.
    pub fn hold_lease(&self, lease: FileLease) {
        *lock(&self.lease) = Some(lease);
    }

    pub fn release_lease(&self) {
        lock(&self.lease).take();
    }

    pub fn store(&self) -> &CoordinationStore {
        &self.store
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn engine(&self) -> MutexGuard<'_, EscalationEngine> {
        lock(&self.engine)
    }

    /// Applies one score input and publishes the result.
    pub fn apply(&self, input: ScoreInput) -> Transition {
        let mut engine = self.engine();
        let transition = engine.apply(input);
        self.publish(&transition, engine.effectors());
        transition
    }

    /// Restores a previous score after a restart. A session resumed at the
    /// shutdown tier runs the shutdown countdown again.
    pub fn resume(&self, points: u32) -> Transition {
        let mut engine = self.engine();
        let transition = engine.resume(points);
        if let Err(err) = self.store.write_status(transition.score, transition.level) {
            warn!(error = %err, "Failed to write status");
        }
        if points > 0 {
            self.audit(&format!(
                "Resumed with {} points (level {})",
                transition.score, transition.level
            ));
        }
        if let Some(effect) = transition.terminal {
            self.start_countdown(effect, engine.effectors().clone());
        }
        transition
    }

    pub fn audit(&self, message: &str) {
        if let Err(err) = self.store.audit(message) {
            warn!(error = %err, "Failed to append audit log");
        }
    }

    fn publish(&self, transition: &Transition, effectors: &EffectorSet) {
        if let Err(err) = self.store.write_status(transition.score, transition.level) {
            warn!(error = %err, "Failed to write status");
        }
        self.audit(&format!(
            "Points: {} -> {} (level {})",
            transition.previous_score, transition.score, transition.level
        ));
        if transition.level_changed() || transition.reset {
            self.audit(level_message(transition.level));
        }
        for (effect, details) in &transition.failures {
            self.audit(&format!("Intervention {} failed: {}", effect, details));
        }
        if let Some(effect) = transition.terminal {
            self.start_countdown(effect, effectors.clone());
        }
    }

    fn start_countdown(&self, effect: Effect, effectors: EffectorSet) {
        let store = self.store.clone();
        let stop = self.stop.clone();
        let lease = Arc::clone(&self.lease);
        let on_done = move |outcome: CountdownOutcome| match outcome {
            CountdownOutcome::Completed(Effect::ForceShutdown) => {
                let _ = store.audit("Forced shutdown issued; session ends");
                close_session(&store, &lease);
                stop.stop();
            }
            CountdownOutcome::Completed(effect) => {
                let _ = store.audit(&format!("{} completed", effect));
            }
            CountdownOutcome::Cancelled(effect) => {
                debug!(%effect, "Countdown cancelled");
            }
        };
        if let Err(err) = countdown::spawn(
            effect,
            self.timing,
            effectors,
            self.stop.clone(),
            on_done,
        ) {
            warn!(error = %err, %effect, "Failed to start countdown");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ends the window on disk whether or not the shutdown took effect, so
/// neither the guard nor a relaunched agent monitors this session again.
/// The lease goes first: on Windows the config cannot be replaced while it
/// is open.
fn close_session(store: &CoordinationStore, lease: &Mutex<Option<FileLease>>) {
    lock(lease).take();
    match store.close_window(Local::now()) {
        Ok(true) => {
            let _ = store.audit("Monitoring window closed");
        }
        Ok(false) => debug!("No config to close"),
        Err(err) => warn!(error = %err, "Failed to close monitoring window"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Startup
// ─────────────────────────────────────────────────────────────────────────────

/// Waits for a config that is sufficient to monitor and for its window to
/// open. Returns `None` when stopped or when the window has already ended.
pub fn wait_for_config(
    store: &CoordinationStore,
    notifier: &dyn Notifier,
    stop: &StopSignal,
) -> Option<(AgentConfig, MonitoringWindow)> {
    let mut notified = false;
    let mut announced_start = false;
    loop {
        let mut retry = CONFIG_RETRY;
        match store.load_config() {
            Ok(config) => match monitorable(&config) {
                Ok(window) => {
                    let now = Local::now();
                    if window.has_ended(now) {
                        info!("Monitoring window already ended");
                        return None;
                    }
                    if window.contains(now) {
                        return Some((config, window));
                    }
                    if !announced_start {
                        info!(start = %window.start.format("%H:%M:%S"), "Waiting for the window to open");
                        announced_start = true;
                    }
                    if let Ok(until_start) = (window.start - now).to_std() {
                        retry = retry.min(until_start);
                    }
                }
                Err(info) => {
                    if !notified {
                        let message = format!("Configuration insufficient: {}", info.message);
                        warn!(code = %info.code, "{}", message);
                        if let Err(err) = notifier.notify(NOTICE_TITLE, &message) {
                            warn!(error = %err, "Failed to show notification");
                        }
                        let _ = store.audit(&message);
                        notified = true;
                    }
                }
            },
            Err(err) => debug!(error = %err, "Config not ready"),
        }
        if stop.wait(retry) {
            return None;
        }
    }
}

/// A config can be monitored only when it validates and names a window.
fn monitorable(config: &AgentConfig) -> Result<MonitoringWindow, ErrorInfo> {
    config.validate()?;
    MonitoringWindow::from_config(config)
        .ok_or_else(|| ErrorInfo::new("missing_window", "no monitoring window is set"))
}

/// Runs a whole session. Returns when the session ends.
pub fn run(store: CoordinationStore, tuning: Tuning, stop: StopSignal) -> Result<(), String> {
    store.ensure_dir().map_err(|err| err.to_string())?;
    let _ = store.audit("=== Agent Started ===");
    store.discard_stale_claims();

    let notifier = default_notifier();
    let Some((config, window)) = wait_for_config(&store, notifier.as_ref(), &stop) else {
        let _ = store.audit("=== Agent Stopped ===");
        return Ok(());
    };
    info!(
        remaining_mins = window.remaining(Local::now()).num_minutes(),
        "Monitoring window open"
    );

    let rules = RuleSet::from_config(&config);
    let points = store.resume_points(Some(&window));

    let desktop = DesktopThread::spawn().map_err(|err| err.to_string())?;
    let effectors = EffectorSet::from_tuning(&tuning, Some(&desktop.handle()));
    let engine = EscalationEngine::new(
        ScoringPolicy::from_tuning(&tuning.scoring),
        effectors,
        notifier,
        rules.goal_summary(),
    );
    let session = Arc::new(Session::new(
        store.clone(),
        engine,
        stop.clone(),
        TerminalTiming::from_tuning(&tuning.terminal),
    ));
    match store.lease_config() {
        Ok(lease) => session.hold_lease(lease),
        Err(err) => warn!(error = %err, "Failed to lease config; continuing without"),
    }
    session.resume(points);

    let mut pipeline = AnalysisPipeline::from_config(&config, &tuning.analysis, store.paths().captures());
    info!(
        strategies = pipeline.strategy_count(),
        use_api = config.use_api,
        model = %config.model,
        "Analysis pipeline ready"
    );
    let capture = CommandCapture::from_tuning(&tuning.capture);

    let worker = commands::spawn(Arc::clone(&session), &tuning.cycle)
        .map_err(|err| warn!(error = %err, "Command worker unavailable"))
        .ok();

    tick_loop(&session, &mut pipeline, &capture, &rules, &window, &tuning);

    stop.stop();
    if let Some(worker) = worker {
        let _ = worker.join();
    }
    let transition = session.engine().shutdown();
    for (effect, details) in &transition.failures {
        session.audit(&format!("Intervention {} failed to stop: {}", effect, details));
    }
    pipeline.shutdown();
    session.release_lease();
    desktop.shutdown();
    session.audit("=== Agent Stopped ===");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tick loop
// ─────────────────────────────────────────────────────────────────────────────

fn first_wait(tuning: &Tuning) -> Duration {
    let tick = tuning.cycle.tick();
    let min = Duration::from_secs(tuning.cycle.min_first_wait_secs);
    let max = tick.saturating_sub(Duration::from_secs(1));
    if min >= max {
        return min.min(tick);
    }
    rand::thread_rng().gen_range(min..max)
}

fn tick_loop(
    session: &Session,
    pipeline: &mut AnalysisPipeline,
    capture: &dyn CaptureSource,
    rules: &RuleSet,
    window: &MonitoringWindow,
    tuning: &Tuning,
) {
    let stop = session.stop_signal();
    loop {
        if stop.is_stopped() {
            break;
        }
        if !window.contains(Local::now()) {
            session.audit("Monitoring window ended");
            break;
        }

        let tick = tuning.cycle.tick();
        let started = Instant::now();
        if stop.wait(first_wait(tuning)) {
            break;
        }
        run_tick(session, pipeline, capture, rules);
        if stop.wait(tick.saturating_sub(started.elapsed())) {
            break;
        }
    }
}

/// Capture, judge, score. The engine lock is held only for the score step.
pub fn run_tick(
    session: &Session,
    pipeline: &mut AnalysisPipeline,
    capture: &dyn CaptureSource,
    rules: &RuleSet,
) -> Option<Transition> {
    let folder = session.store().paths().captures();
    if let Err(err) = fs_err::create_dir_all(&folder) {
        warn!(error = %err, "Failed to create capture folder");
        return None;
    }
    let batch = match capture.capture(&folder) {
        Ok(batch) => batch,
        Err(err) => {
            warn!(error = %err, "Capture failed; skipping tick");
            session.audit(&format!("Capture failed: {}", err));
            return None;
        }
    };

    let verdict = pipeline.analyze(&batch, rules);
    batch.discard();
    session.audit(&describe(&verdict));
    if session.stop_signal().is_stopped() {
        return None;
    }
    Some(session.apply(ScoreInput::Verdict(verdict.is_violation)))
}

fn describe(verdict: &Verdict) -> String {
    if verdict.source == VerdictSource::None {
        let first = verdict.raw_text.lines().next().unwrap_or_default();
        return format!("Analysis unavailable ({}); treated as compliant", first);
    }
    let outcome = if verdict.is_violation { "Violation" } else { "Compliant" };
    if verdict.reason.is_empty() {
        format!("Judgement ({}): {}", verdict.source, outcome)
    } else {
        format!("Judgement ({}): {} - {}", verdict.source, outcome, verdict.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::path::Path;
    use std::thread;
    use tempfile::TempDir;
    use warden_core::analysis::{Prompt, Strategy};
    use warden_core::effectors::{EffectorCall, RecordingEffectors};
    use warden_core::{CaptureBatch, Paths};

    fn session(dir: &TempDir, recorder: &RecordingEffectors) -> Session {
        let store = CoordinationStore::new(Paths::new(dir.path()));
        store.ensure_dir().unwrap();
        let engine = EscalationEngine::new(
            ScoringPolicy::default(),
            recorder.effector_set(),
            recorder.notifier(),
            "Goal: read",
        );
        Session::new(
            store,
            engine,
            StopSignal::new(),
            TerminalTiming {
                lock_grace: Duration::from_millis(5),
                lock_hold: Duration::from_millis(20),
                lock_repeat: Duration::from_millis(10),
                shutdown_grace: Duration::from_millis(5),
            },
        )
    }

    struct OneShot;

    impl CaptureSource for OneShot {
        fn capture(&self, folder: &Path) -> warden_core::Result<CaptureBatch> {
            let path = folder.join("Screenshot_20260101_120000_desktop.png");
            fs_err::write(&path, b"png").unwrap();
            Ok(CaptureBatch::new(vec![path], Local::now()))
        }
    }

    struct Judge(&'static str);

    impl Strategy for Judge {
        fn source(&self) -> VerdictSource {
            VerdictSource::Cli
        }
        fn available(&mut self) -> bool {
            true
        }
        fn analyze(&mut self, _batch: &CaptureBatch, _prompt: &Prompt) -> warden_core::Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn tick_scores_publishes_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let recorder = RecordingEffectors::new();
        let session = session(&dir, &recorder);
        let mut pipeline = AnalysisPipeline::new(vec![Box::new(Judge("[Verdict]\nNG\nReason: game"))]);

        let transition = run_tick(&session, &mut pipeline, &OneShot, &RuleSet::new("Goal: read")).unwrap();
        assert_eq!(transition.score, 15);

        let status = session.store().read_status().unwrap();
        assert_eq!(status.points, 15);
        let log = session.store().tail_log(4096).unwrap();
        assert!(log.contains("Judgement (CLI): Violation - game"));
        assert!(log.contains("Points: 0 -> 15"));

        let leftovers = fs_err::read_dir(session.store().paths().captures()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn judge_outage_counts_as_compliant() {
        let dir = TempDir::new().unwrap();
        let recorder = RecordingEffectors::new();
        let session = session(&dir, &recorder);
        session.apply(ScoreInput::Delta(20));
        let mut pipeline = AnalysisPipeline::new(Vec::new());

        let transition = run_tick(&session, &mut pipeline, &OneShot, &RuleSet::new("x")).unwrap();
        assert_eq!(transition.score, 15);
        assert!(session
            .store()
            .tail_log(4096)
            .unwrap()
            .contains("treated as compliant"));
    }

    #[test]
    fn lock_level_runs_countdown_off_the_lock() {
        let dir = TempDir::new().unwrap();
        let recorder = RecordingEffectors::new();
        let session = session(&dir, &recorder);
        let transition = session.apply(ScoreInput::Delta(270));
        assert_eq!(transition.terminal, Some(Effect::ForceLock));

        // The engine stays usable while the countdown runs.
        session.apply(ScoreInput::Verdict(false));
        thread::sleep(Duration::from_millis(200));
        assert!(recorder
            .calls()
            .contains(&EffectorCall::Activate(Effect::ForceLock)));
        assert!(!session.stop_signal().is_stopped());
    }

    #[test]
    fn shutdown_countdown_ends_the_session() {
        let dir = TempDir::new().unwrap();
        let recorder = RecordingEffectors::new();
        let session = session(&dir, &recorder);
        session.apply(ScoreInput::Delta(400));
        assert!(session.stop_signal().wait(Duration::from_secs(5)));
        assert!(recorder
            .calls()
            .contains(&EffectorCall::Activate(Effect::ForceShutdown)));
    }

    #[test]
    fn insufficient_config_notifies_once_and_keeps_waiting() {
        let dir = TempDir::new().unwrap();
        let store = CoordinationStore::new(Paths::new(dir.path()));
        store.ensure_dir().unwrap();
        store.write_config(&AgentConfig::default()).unwrap();

        let recorder = RecordingEffectors::new();
        let stop = StopSignal::new();
        let waiter = {
            let store = store.clone();
            let stop = stop.clone();
            let notifier = recorder.notifier();
            thread::spawn(move || wait_for_config(&store, notifier.as_ref(), &stop))
        };
        thread::sleep(Duration::from_millis(100));
        stop.stop();
        assert!(waiter.join().unwrap().is_none());
        assert_eq!(recorder.notifications().len(), 1);
    }

    fn window_config(start: chrono::DateTime<Local>, end: chrono::DateTime<Local>) -> AgentConfig {
        AgentConfig {
            rules: "Goal: read".to_string(),
            start_time: Some(start),
            end_time: Some(end),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn valid_config_is_returned() {
        let dir = TempDir::new().unwrap();
        let store = CoordinationStore::new(Paths::new(dir.path()));
        store.ensure_dir().unwrap();
        let now = Local::now();
        let config = window_config(now - ChronoDuration::minutes(1), now + ChronoDuration::hours(1));
        store.write_config(&config).unwrap();

        let recorder = RecordingEffectors::new();
        let (loaded, window) =
            wait_for_config(&store, recorder.notifier().as_ref(), &StopSignal::new()).unwrap();
        assert_eq!(loaded.rules, "Goal: read");
        assert_eq!(window, MonitoringWindow::from_config(&config).unwrap());
        assert!(recorder.notifications().is_empty());
    }

    #[test]
    fn config_without_window_is_never_monitored() {
        let dir = TempDir::new().unwrap();
        let store = CoordinationStore::new(Paths::new(dir.path()));
        store.ensure_dir().unwrap();
        store
            .write_config(&AgentConfig {
                rules: "Goal: read".to_string(),
                ..AgentConfig::default()
            })
            .unwrap();

        let recorder = RecordingEffectors::new();
        let stop = StopSignal::new();
        let waiter = {
            let store = store.clone();
            let stop = stop.clone();
            let notifier = recorder.notifier();
            thread::spawn(move || wait_for_config(&store, notifier.as_ref(), &stop))
        };
        thread::sleep(Duration::from_millis(100));
        stop.stop();
        assert!(waiter.join().unwrap().is_none());
        assert_eq!(recorder.notifications().len(), 1);
        assert!(store.tail_log(4096).unwrap().contains("no monitoring window"));
    }

    #[test]
    fn future_window_is_awaited_before_monitoring() {
        let dir = TempDir::new().unwrap();
        let store = CoordinationStore::new(Paths::new(dir.path()));
        store.ensure_dir().unwrap();
        let start = Local::now() + ChronoDuration::milliseconds(300);
        store
            .write_config(&window_config(start, start + ChronoDuration::hours(1)))
            .unwrap();

        let recorder = RecordingEffectors::new();
        let (_, window) =
            wait_for_config(&store, recorder.notifier().as_ref(), &StopSignal::new()).unwrap();
        assert!(Local::now() >= start);
        assert!(window.contains(Local::now()));
        assert!(recorder.notifications().is_empty());
    }

    #[test]
    fn stop_while_awaiting_window_returns_nothing() {
        let dir = TempDir::new().unwrap();
        let store = CoordinationStore::new(Paths::new(dir.path()));
        store.ensure_dir().unwrap();
        let start = Local::now() + ChronoDuration::hours(1);
        store
            .write_config(&window_config(start, start + ChronoDuration::hours(1)))
            .unwrap();

        let recorder = RecordingEffectors::new();
        let stop = StopSignal::new();
        stop.stop();
        assert!(wait_for_config(&store, recorder.notifier().as_ref(), &stop).is_none());
    }

    #[test]
    fn restart_after_forced_shutdown_stays_down() {
        let dir = TempDir::new().unwrap();
        let recorder = RecordingEffectors::new();
        recorder.fail(Effect::ForceShutdown);
        let session = session(&dir, &recorder);
        let store = session.store().clone();
        let now = Local::now();
        store
            .write_config(&window_config(now - ChronoDuration::minutes(5), now + ChronoDuration::hours(1)))
            .unwrap();

        let transition = session.apply(ScoreInput::Delta(320));
        assert_eq!(transition.terminal, Some(Effect::ForceShutdown));
        assert!(session.stop_signal().wait(Duration::from_secs(5)));

        // The shutdown command failed, yet the session is over on disk.
        let config = store.load_config().unwrap();
        assert!(config.end_time.unwrap() <= Local::now());
        let relaunched = RecordingEffectors::new();
        assert!(wait_for_config(&store, relaunched.notifier().as_ref(), &StopSignal::new()).is_none());
        assert!(store.tail_log(8192).unwrap().contains("Monitoring window closed"));
    }

    #[test]
    fn resume_at_shutdown_tier_runs_the_countdown_again() {
        let dir = TempDir::new().unwrap();
        let recorder = RecordingEffectors::new();
        let session = session(&dir, &recorder);
        let now = Local::now();
        session
            .store()
            .write_config(&window_config(now - ChronoDuration::minutes(5), now + ChronoDuration::hours(1)))
            .unwrap();

        let transition = session.resume(320);
        assert_eq!(transition.level, 7);
        assert_eq!(transition.terminal, Some(Effect::ForceShutdown));
        assert!(session.stop_signal().wait(Duration::from_secs(5)));
        assert!(recorder
            .calls()
            .contains(&EffectorCall::Activate(Effect::ForceShutdown)));
        let window = MonitoringWindow::from_config(&session.store().load_config().unwrap()).unwrap();
        assert!(window.has_ended(Local::now()));
    }
}
