pub mod hooks;
pub mod screensaver;

pub use hooks::{MonitorHooks, NullHooks, RefreshRateStats, SystemHooks, VrrStatus};
pub use screensaver::{ExecutionStateSink, ScreensaverController, SystemExecutionState};

use crate::change_tracker::ChangeTracker;
use crate::display::{DisplayCache, DisplayEnumerator};
use crate::error::VrrError;
use crate::fps_limiter::FpsLimiterArbiter;
use crate::perf::PerfStats;
use crate::state::StateManager;
use crate::{log_debug, log_error, log_info, log_warn};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const LOOP_QUANTUM: Duration = Duration::from_nanos(1_000_000_000 / 120);
pub const HIGH_FREQUENCY_INTERVAL: Duration = LOOP_QUANTUM;
pub const PER_SECOND_INTERVAL: Duration = Duration::from_secs(1);
pub const DISPLAY_REFRESH_INTERVAL: Duration = Duration::from_secs(2);
pub const VRR_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const REFLEX_AUTO_CONFIGURE_DELAY: Duration = Duration::from_secs(10);

/// What the loop last observed, for UI threads.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MonitorSnapshot {
    pub foreground: bool,
    pub vrr: Option<Result<VrrStatus, VrrError>>,
    pub audio_volume: Option<f32>,
    pub refresh_rate: Option<RefreshRateStats>,
    pub auto_apply_done: bool,
}

pub struct MonitorOutputs {
    snapshot: ArcSwap<MonitorSnapshot>,
}

impl MonitorOutputs {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(MonitorSnapshot::default()),
        }
    }

    pub fn load(&self) -> Arc<MonitorSnapshot> {
        self.snapshot.load_full()
    }

    fn publish(&self, snapshot: &MonitorSnapshot) {
        if **self.snapshot.load() != *snapshot {
            self.snapshot.store(Arc::new(snapshot.clone()));
        }
    }
}

impl Default for MonitorOutputs {
    fn default() -> Self {
        Self::new()
    }
}

/// Which task groups a tick ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    pub display_refreshed: bool,
    pub high_frequency: bool,
    pub per_second: bool,
}

/// Everything the loop reads or drives.
pub struct MonitorContext {
    pub state: Arc<StateManager>,
    pub displays: Arc<DisplayCache>,
    pub enumerator: Arc<dyn DisplayEnumerator>,
    pub change_tracker: Arc<ChangeTracker>,
    pub arbiter: Arc<FpsLimiterArbiter>,
    pub perf: Arc<PerfStats>,
    pub hooks: Arc<dyn MonitorHooks>,
    pub execution_state: Arc<dyn ExecutionStateSink>,
    pub outputs: Arc<MonitorOutputs>,
}

/// Time-sliced scheduler behind the monitoring thread.
///
/// `tick` is the whole loop body: it compares `now` against the last-run
/// timestamp of each task group and runs the ones that are due, the
/// high-frequency group before the per-second group.
pub struct MonitoringLoop {
    ctx: MonitorContext,
    screensaver: ScreensaverController,
    started: Instant,
    last_display_refresh: Option<Instant>,
    last_high_frequency: Option<Instant>,
    last_per_second: Option<Instant>,
    last_vrr_poll: Option<Instant>,
    applied_cpu_cores: u32,
    foreground: Option<bool>,
    auto_apply_done: bool,
    snapshot: MonitorSnapshot,
}

fn due(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
    last.map_or(true, |last| now.saturating_duration_since(last) >= interval)
}

impl MonitoringLoop {
    pub fn new(ctx: MonitorContext, started: Instant) -> Self {
        let screensaver = ScreensaverController::new(Arc::clone(&ctx.execution_state));
        Self {
            ctx,
            screensaver,
            started,
            last_display_refresh: None,
            last_high_frequency: None,
            last_per_second: None,
            last_vrr_poll: None,
            applied_cpu_cores: 0,
            foreground: None,
            auto_apply_done: false,
            snapshot: MonitorSnapshot::default(),
        }
    }

    pub fn outputs(&self) -> Arc<MonitorOutputs> {
        Arc::clone(&self.ctx.outputs)
    }

    pub fn tick(&mut self, now: Instant) -> TickReport {
        let settings = self.ctx.state.snapshot();
        let mut report = TickReport::default();

        self.ctx.arbiter.set_reflex_enabled(settings.reflex_fps_limiter);

        if due(self.last_display_refresh, now, DISPLAY_REFRESH_INTERVAL) {
            self.last_display_refresh = Some(now);
            self.refresh_displays();
            report.display_refreshed = true;
        }

        if settings.cpu_cores != self.applied_cpu_cores {
            match self.ctx.hooks.apply_cpu_affinity(settings.cpu_cores) {
                Ok(()) => log_info!("CPU affinity set to {} cores", settings.cpu_cores),
                Err(e) => log_error!("Failed to apply CPU affinity ({} cores): {:#}", settings.cpu_cores, e),
            }
            self.applied_cpu_cores = settings.cpu_cores;
        }

        if due(self.last_high_frequency, now, HIGH_FREQUENCY_INTERVAL) {
            self.last_high_frequency = Some(now);
            self.run_high_frequency(&settings);
            report.high_frequency = true;
        }

        if due(self.last_per_second, now, PER_SECOND_INTERVAL) {
            self.last_per_second = Some(now);
            self.run_per_second(&settings, now);
            report.per_second = true;
        }

        self.ctx.outputs.publish(&self.snapshot);
        report
    }

    fn refresh_displays(&self) {
        if self.ctx.displays.refresh(self.ctx.enumerator.as_ref()).is_err() {
            return;
        }
        // First sight of a device records its pre-session mode.
        for display in self.ctx.displays.all().iter() {
            self.ctx
                .change_tracker
                .mark_original(&display.device_name, &self.ctx.displays);
        }
    }

    fn run_high_frequency(&mut self, settings: &crate::state::Settings) {
        let hooks = &self.ctx.hooks;

        let foreground = hooks.is_game_in_foreground();
        if self.foreground != Some(foreground) {
            log_debug!("Game {} foreground", if foreground { "entered" } else { "left" });
            hooks.apply_focus_state(foreground);
            self.foreground = Some(foreground);
        }
        self.snapshot.foreground = foreground;

        hooks.update_adhd_multi_monitor(settings.adhd_multi_monitor, foreground);
        hooks.update_keyboard_state();
        if settings.hotkeys_enabled {
            hooks.process_hotkeys();
        }
        hooks.reset_frame_state();
    }

    fn run_per_second(&mut self, settings: &crate::state::Settings, now: Instant) {
        let foreground = self.foreground.unwrap_or(true);
        self.screensaver.reconcile(settings.screensaver_mode, foreground);

        self.ctx.perf.aggregate();

        let hooks = Arc::clone(&self.ctx.hooks);
        self.snapshot.audio_volume = hooks.poll_audio_volume();
        self.snapshot.refresh_rate = hooks.refresh_rate_snapshot();

        if settings.vrr_polling && due(self.last_vrr_poll, now, VRR_POLL_INTERVAL) {
            self.last_vrr_poll = Some(now);
            let result = poll_vrr(hooks.as_ref());
            if let Some(error) = new_vrr_failure(self.snapshot.vrr.as_ref(), &result) {
                log_warn!("VRR status query failed: {}", error);
            }
            self.snapshot.vrr = Some(result);
        }

        hooks.refresh_exclusive_key_groups();

        if settings.discord_overlay_auto_hide {
            hooks.scan_discord_overlay();
        }

        if settings.reflex_auto_configure
            && now.saturating_duration_since(self.started) >= REFLEX_AUTO_CONFIGURE_DELAY
        {
            hooks.auto_configure_reflex();
        }

        if settings.auto_apply_on_start && !self.auto_apply_done {
            let delay = Duration::from_secs(settings.auto_apply_delay_secs as u64);
            if now.saturating_duration_since(self.started) >= delay {
                self.auto_apply_done = true;
                match hooks.auto_apply_display_settings() {
                    Ok(()) => log_info!("Auto-apply on start completed after {:?}", delay),
                    Err(e) => log_warn!("Auto-apply on start failed: {:#}", e),
                }
            }
        }
        self.snapshot.auto_apply_done = self.auto_apply_done;
    }

    fn shutdown(&mut self) {
        self.screensaver.release();
    }
}

/// One VRR query, retried once if NVAPI dropped out underneath us.
fn poll_vrr(hooks: &dyn MonitorHooks) -> Result<VrrStatus, VrrError> {
    match hooks.query_vrr_status() {
        Err(VrrError::NotInitialized) => {
            log_debug!("NVAPI not initialized during VRR query; reinitializing");
            if hooks.reinitialize_nvapi() {
                hooks.query_vrr_status()
            } else {
                Err(VrrError::NotInitialized)
            }
        }
        other => other,
    }
}

// Returns the error only when it differs from the previously published one.
fn new_vrr_failure<'a>(
    previous: Option<&Result<VrrStatus, VrrError>>,
    current: &'a Result<VrrStatus, VrrError>,
) -> Option<&'a VrrError> {
    let error = current.as_ref().err()?;
    match previous {
        Some(Err(prev)) if prev == error => None,
        _ => Some(error),
    }
}

/// Handle for the background thread running a [`MonitoringLoop`].
pub struct ContinuousMonitoring {
    running: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ContinuousMonitoring {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&self, mut monitor: MonitoringLoop) -> Result<()> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            log_warn!("Continuous monitoring already running");
            return Ok(());
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("dc-monitoring".to_string())
            .spawn(move || {
                log_info!("Continuous monitoring thread started");
                while running.load(Ordering::Acquire) {
                    spin_sleep::sleep(LOOP_QUANTUM);
                    if !run_guarded(&mut monitor, Instant::now()) {
                        running.store(false, Ordering::Release);
                        break;
                    }
                }
                monitor.shutdown();
                log_info!("Continuous monitoring thread ended");
            });

        match handle {
            Ok(handle) => {
                *thread_slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e).context("Failed to spawn monitoring thread")
            }
        }
    }

    /// Clears the run flag and blocks until the thread exits.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log_error!("Monitoring thread terminated abnormally");
            }
        }
    }
}

impl Default for ContinuousMonitoring {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ContinuousMonitoring {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "loop-guard")]
fn run_guarded(monitor: &mut MonitoringLoop, now: Instant) -> bool {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| monitor.tick(now)));
    match result {
        Ok(_) => true,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log_error!("Monitoring loop panicked, stopping thread: {}", message);
            false
        }
    }
}

#[cfg(not(feature = "loop-guard"))]
fn run_guarded(monitor: &mut MonitoringLoop, now: Instant) -> bool {
    monitor.tick(now);
    true
}
