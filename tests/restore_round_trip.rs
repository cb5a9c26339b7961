use display_commander::display::{DisplayEnumerator, DisplayInfo, DisplayModeApplier, OriginalMode};
use display_commander::error::DisplayError;
use display_commander::etw::UnsupportedBackend;
use display_commander::monitoring::{ExecutionStateSink, NullHooks};
use display_commander::{AddonRuntime, Services, Settings, StateManager};
use parking_lot::Mutex;
use std::sync::Arc;

const DEVICE: &str = r"\\.\DISPLAY1";

struct OneDisplay;

impl DisplayEnumerator for OneDisplay {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>, DisplayError> {
        Ok(vec![DisplayInfo {
            device_name: DEVICE.to_string(),
            width: 2560,
            height: 1440,
            refresh_numerator: 143_912,
            refresh_denominator: 1000,
            monitor_handle: 7,
            simple_device_id: "DISPLAY1".to_string(),
            is_primary: true,
        }])
    }
}

#[derive(Default)]
struct RecordingApplier {
    dxgi_fails: bool,
    legacy_fails: bool,
    calls: Mutex<Vec<(&'static str, String, OriginalMode)>>,
}

impl DisplayModeApplier for RecordingApplier {
    fn apply_dxgi(&self, device_name: &str, mode: &OriginalMode) -> Result<(), DisplayError> {
        self.calls.lock().push(("dxgi", device_name.to_string(), *mode));
        if self.dxgi_fails {
            Err(DisplayError::Unavailable("no matching output".to_string()))
        } else {
            Ok(())
        }
    }

    fn apply_legacy(&self, device_name: &str, mode: &OriginalMode) -> Result<(), DisplayError> {
        self.calls.lock().push(("legacy", device_name.to_string(), *mode));
        if self.legacy_fails {
            Err(DisplayError::Unavailable("mode rejected".to_string()))
        } else {
            Ok(())
        }
    }
}

struct IgnoreExecutionState;

impl ExecutionStateSink for IgnoreExecutionState {
    fn set_execution_state(&self, flags: u32) -> u32 {
        flags
    }
}

fn runtime(settings: Settings, applier: Arc<RecordingApplier>) -> AddonRuntime {
    let services = Services {
        enumerator: Arc::new(OneDisplay),
        applier,
        hooks: Arc::new(NullHooks),
        execution_state: Arc::new(IgnoreExecutionState),
        trace_backend: Arc::new(UnsupportedBackend),
    };
    AddonRuntime::with_services(Arc::new(StateManager::in_memory(settings)), services).unwrap()
}

fn original() -> OriginalMode {
    OriginalMode {
        width: 2560,
        height: 1440,
        refresh_numerator: 143_912,
        refresh_denominator: 1000,
    }
}

#[test]
fn detach_restores_the_recorded_original() {
    let applier = Arc::new(RecordingApplier::default());
    let runtime = runtime(Settings { etw_enabled: false, ..Default::default() }, applier.clone());
    assert!(runtime.is_monitoring());
    assert_eq!(runtime.change_tracker().original(DEVICE), Some(original()));

    let target = OriginalMode {
        width: 1920,
        height: 1080,
        refresh_numerator: 60_000,
        refresh_denominator: 1000,
    };
    runtime.apply_display_mode(DEVICE, &target).unwrap();
    // Re-marking after the change must not replace the original.
    runtime.change_tracker().mark_original(DEVICE, runtime.displays());

    let report = runtime.detach().unwrap();
    assert_eq!(report.restored, vec![DEVICE.to_string()]);
    assert!(report.failed.is_empty());
    assert!(!runtime.is_monitoring());

    let calls = applier.calls.lock();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], ("dxgi", DEVICE.to_string(), target));
    assert_eq!(calls[1], ("dxgi", DEVICE.to_string(), original()));
}

#[test]
fn restore_falls_back_to_legacy_path() {
    let applier = Arc::new(RecordingApplier { dxgi_fails: true, ..Default::default() });
    let runtime = runtime(Settings { etw_enabled: false, ..Default::default() }, applier.clone());
    runtime.apply_display_mode(DEVICE, &original()).unwrap();

    let report = runtime.detach().unwrap();
    assert_eq!(report.restored.len(), 1);
    let calls = applier.calls.lock();
    assert_eq!(calls.last().map(|c| c.0), Some("legacy"));
    assert_eq!(calls.last().map(|c| c.2), Some(original()));
}

#[test]
fn nothing_restored_when_disabled_or_untouched() {
    let applier = Arc::new(RecordingApplier::default());
    let untouched = runtime(Settings::default(), applier.clone());
    assert!(untouched.detach().is_none());

    let disabled = runtime(
        Settings { auto_restore_on_close: false, ..Default::default() },
        applier.clone(),
    );
    disabled.apply_display_mode(DEVICE, &original()).unwrap();
    assert!(disabled.detach().is_none());
    assert_eq!(applier.calls.lock().len(), 1);
}

#[test]
fn rejected_mode_does_not_arm_restore() {
    let applier = Arc::new(RecordingApplier {
        dxgi_fails: true,
        legacy_fails: true,
        ..Default::default()
    });
    let runtime = runtime(Settings { etw_enabled: false, ..Default::default() }, applier.clone());
    let target = OriginalMode {
        width: 1280,
        height: 720,
        refresh_numerator: 60_000,
        refresh_denominator: 1000,
    };
    assert!(runtime.apply_display_mode(DEVICE, &target).is_err());
    assert!(!runtime.change_tracker().mode_applied());

    assert!(runtime.detach().is_none());
    assert_eq!(applier.calls.lock().len(), 2);
}
