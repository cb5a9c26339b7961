use crate::change_tracker::{ChangeTracker, RestoreReport};
use crate::display::{
    DisplayCache, DisplayEnumerator, DisplayModeApplier, OriginalMode, SystemDisplays,
    SystemModeApplier,
};
use crate::error::DisplayError;
use crate::etw::{self, EtwEngine, TraceBackend};
use crate::fps_limiter::FpsLimiterArbiter;
use crate::monitoring::{
    ContinuousMonitoring, ExecutionStateSink, MonitorContext, MonitorHooks, MonitorOutputs,
    MonitoringLoop, SystemExecutionState, SystemHooks,
};
use crate::perf::PerfStats;
use crate::state::StateManager;
use crate::{log_info, log_warn};
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;

/// Platform seams the runtime is built on.
pub struct Services {
    pub enumerator: Arc<dyn DisplayEnumerator>,
    pub applier: Arc<dyn DisplayModeApplier>,
    pub hooks: Arc<dyn MonitorHooks>,
    pub execution_state: Arc<dyn ExecutionStateSink>,
    pub trace_backend: Arc<dyn TraceBackend>,
}

impl Services {
    pub fn system() -> Self {
        Self {
            enumerator: Arc::new(SystemDisplays),
            applier: Arc::new(SystemModeApplier),
            hooks: Arc::new(SystemHooks),
            execution_state: Arc::new(SystemExecutionState),
            trace_backend: etw::system_backend(),
        }
    }
}

/// Process-wide context, built once at host attach and torn down at detach.
pub struct AddonRuntime {
    state: Arc<StateManager>,
    displays: Arc<DisplayCache>,
    change_tracker: Arc<ChangeTracker>,
    arbiter: Arc<FpsLimiterArbiter>,
    perf: Arc<PerfStats>,
    outputs: Arc<MonitorOutputs>,
    etw: Option<Arc<EtwEngine>>,
    monitoring: ContinuousMonitoring,
    applier: Arc<dyn DisplayModeApplier>,
}

impl AddonRuntime {
    pub fn attach(state: Arc<StateManager>) -> Result<Self> {
        Self::with_services(state, Services::system())
    }

    pub fn with_services(state: Arc<StateManager>, services: Services) -> Result<Self> {
        let displays = Arc::new(DisplayCache::new());
        let change_tracker = Arc::new(ChangeTracker::new());
        let arbiter = Arc::new(FpsLimiterArbiter::new());
        let perf = Arc::new(PerfStats::new());
        let outputs = Arc::new(MonitorOutputs::new());

        // Initial enumeration so originals exist before anything applies a mode.
        if displays.refresh(services.enumerator.as_ref()).is_ok() {
            for display in displays.all().iter() {
                change_tracker.mark_original(&display.device_name, &displays);
            }
        }

        let etw = if state.read(|s| s.etw_enabled) {
            let engine = Arc::new(EtwEngine::for_current_process(Arc::clone(&services.trace_backend)));
            if let Err(e) = engine.start_worker() {
                log_warn!("ETW ingestion unavailable: {}", e);
            }
            Some(engine)
        } else {
            log_info!("ETW ingestion disabled in settings");
            None
        };

        let monitor = MonitoringLoop::new(
            MonitorContext {
                state: Arc::clone(&state),
                displays: Arc::clone(&displays),
                enumerator: services.enumerator,
                change_tracker: Arc::clone(&change_tracker),
                arbiter: Arc::clone(&arbiter),
                perf: Arc::clone(&perf),
                hooks: services.hooks,
                execution_state: services.execution_state,
                outputs: Arc::clone(&outputs),
            },
            Instant::now(),
        );
        let monitoring = ContinuousMonitoring::new();
        monitoring.start(monitor)?;

        log_info!("Display Commander runtime attached ({} displays)", displays.all().len());
        Ok(Self {
            state,
            displays,
            change_tracker,
            arbiter,
            perf,
            outputs,
            etw,
            monitoring,
            applier: services.applier,
        })
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn displays(&self) -> &Arc<DisplayCache> {
        &self.displays
    }

    pub fn change_tracker(&self) -> &Arc<ChangeTracker> {
        &self.change_tracker
    }

    pub fn arbiter(&self) -> &Arc<FpsLimiterArbiter> {
        &self.arbiter
    }

    pub fn perf(&self) -> &Arc<PerfStats> {
        &self.perf
    }

    pub fn outputs(&self) -> &Arc<MonitorOutputs> {
        &self.outputs
    }

    pub fn etw(&self) -> Option<&Arc<EtwEngine>> {
        self.etw.as_ref()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.is_running()
    }

    /// Applies `mode` to `device_key`, recording the original first so
    /// detach can put it back.
    pub fn apply_display_mode(&self, device_key: &str, mode: &OriginalMode) -> Result<(), DisplayError> {
        self.change_tracker.mark_original(device_key, &self.displays);

        let result = self
            .applier
            .apply_dxgi(device_key, mode)
            .or_else(|e| {
                log_warn!("DXGI mode apply failed for {} ({}), trying legacy path", device_key, e);
                self.applier.apply_legacy(device_key, mode)
            });

        // Marked either way: a rejected change may still have partially applied.
        self.change_tracker.mark_changed(device_key, &self.displays);

        if result.is_ok() {
            self.change_tracker.note_mode_applied();
            log_info!("Applied {} to {}", mode, device_key);
        }
        result
    }

    /// Stops the background threads and restores displays when enabled.
    pub fn detach(&self) -> Option<RestoreReport> {
        self.monitoring.stop();
        if let Some(etw) = &self.etw {
            etw.stop_worker();
        }

        let auto_restore = self.state.read(|s| s.auto_restore_on_close);
        let report = self
            .change_tracker
            .restore_all_if_enabled(auto_restore, self.applier.as_ref());
        log_info!("Display Commander runtime detached");
        report
    }
}

impl Drop for AddonRuntime {
    fn drop(&mut self) {
        self.monitoring.stop();
        if let Some(etw) = &self.etw {
            etw.stop_worker();
        }
    }
}
