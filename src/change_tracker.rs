use crate::display::{DisplayCache, DisplayModeApplier, OriginalMode};
use crate::error::DisplayError;
use crate::{log_debug, log_error, log_info, log_warn};
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Immutable view of what the session has recorded so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeTrackerSnapshot {
    pub originals: BTreeMap<String, OriginalMode>,
    pub changed: BTreeSet<String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub failed: Vec<(String, DisplayError)>,
}

/// Remembers the desktop mode of every display before this process touched
/// it, so each changed display can be put back exactly as found.
///
/// Every mutation clones the current snapshot and swaps the clone in, so
/// readers never lock. Originals are only ever inserted; a second capture
/// for the same device is ignored.
pub struct ChangeTracker {
    snapshot: ArcSwap<ChangeTrackerSnapshot>,
    mode_applied: AtomicBool,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(ChangeTrackerSnapshot::default()),
            mode_applied: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Arc<ChangeTrackerSnapshot> {
        self.snapshot.load_full()
    }

    pub fn original(&self, device_key: &str) -> Option<OriginalMode> {
        self.snapshot.load().originals.get(device_key).copied()
    }

    /// Returns true when this call recorded the original.
    pub fn mark_original(&self, device_key: &str, cache: &DisplayCache) -> bool {
        if self.snapshot.load().originals.contains_key(device_key) {
            return false;
        }

        let Some(display) = cache.find(device_key) else {
            log_warn!("Cannot record original mode: {} not in display cache", device_key);
            return false;
        };

        let inserted = self.insert_original(device_key, display.current_mode());
        if inserted {
            log_info!("Recorded original mode for {}: {}", device_key, display.current_mode());
        }
        inserted
    }

    fn insert_original(&self, device_key: &str, mode: OriginalMode) -> bool {
        let mut inserted = false;
        self.snapshot.rcu(|current| {
            if current.originals.contains_key(device_key) {
                inserted = false;
                return Arc::clone(current);
            }
            inserted = true;
            let mut next = ChangeTrackerSnapshot::clone(current);
            next.originals.insert(device_key.to_string(), mode);
            Arc::new(next)
        });
        inserted
    }

    pub fn mark_changed(&self, device_key: &str, cache: &DisplayCache) {
        if !self.snapshot.load().originals.contains_key(device_key) {
            match cache.find(device_key) {
                Some(display) => {
                    log_warn!(
                        "{} changed without a recorded original; using current mode {} as original",
                        device_key,
                        display.current_mode()
                    );
                    self.insert_original(device_key, display.current_mode());
                }
                None => {
                    log_warn!("{} changed without a recorded original and is not in display cache", device_key);
                }
            }
        }

        self.snapshot.rcu(|current| {
            if current.changed.contains(device_key) {
                return Arc::clone(current);
            }
            let mut next = ChangeTrackerSnapshot::clone(current);
            next.changed.insert(device_key.to_string());
            Arc::new(next)
        });
    }

    /// Arms [`restore_all_if_enabled`](Self::restore_all_if_enabled).
    pub fn note_mode_applied(&self) {
        self.mode_applied.store(true, Ordering::Release);
    }

    pub fn mode_applied(&self) -> bool {
        self.mode_applied.load(Ordering::Acquire)
    }

    pub fn restore_all(&self, applier: &dyn DisplayModeApplier) -> RestoreReport {
        let snapshot = self.snapshot();
        let mut report = RestoreReport::default();

        for device_key in &snapshot.changed {
            let Some(mode) = snapshot.originals.get(device_key) else {
                log_error!("No original mode recorded for {}; skipping restore", device_key);
                report
                    .failed
                    .push((device_key.clone(), DisplayError::DeviceNotFound(device_key.clone())));
                continue;
            };

            let result = applier.apply_dxgi(device_key, mode).or_else(|e| {
                log_debug!("DXGI restore for {} failed ({}), trying ChangeDisplaySettingsEx", device_key, e);
                applier.apply_legacy(device_key, mode)
            });

            match result {
                Ok(()) => {
                    log_info!("Restored {} to {}", device_key, mode);
                    report.restored.push(device_key.clone());
                }
                Err(e) => {
                    log_error!("Failed to restore {}: {}", device_key, e);
                    report.failed.push((device_key.clone(), e));
                }
            }
        }

        report
    }

    pub fn restore_all_if_enabled(
        &self,
        auto_restore_on_close: bool,
        applier: &dyn DisplayModeApplier,
    ) -> Option<RestoreReport> {
        if !auto_restore_on_close || !self.mode_applied() {
            return None;
        }
        Some(self.restore_all(applier))
    }

    pub fn clear(&self) {
        self.snapshot.store(Arc::new(ChangeTrackerSnapshot::default()));
        self.mode_applied.store(false, Ordering::Release);
    }
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::tests::display;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingApplier {
        dxgi_available: bool,
        fail_device: Option<String>,
        calls: Mutex<Vec<(String, OriginalMode, &'static str)>>,
    }

    impl DisplayModeApplier for RecordingApplier {
        fn apply_dxgi(&self, device_name: &str, mode: &OriginalMode) -> Result<(), DisplayError> {
            if !self.dxgi_available {
                return Err(DisplayError::Unavailable("no dxgi".to_string()));
            }
            self.calls.lock().push((device_name.to_string(), *mode, "dxgi"));
            Ok(())
        }

        fn apply_legacy(&self, device_name: &str, mode: &OriginalMode) -> Result<(), DisplayError> {
            self.calls.lock().push((device_name.to_string(), *mode, "legacy"));
            if self.fail_device.as_deref() == Some(device_name) {
                return Err(DisplayError::ChangeRejected { device: device_name.to_string(), code: -1 });
            }
            Ok(())
        }
    }

    const D1: &str = r"\\.\DISPLAY1";
    const D2: &str = r"\\.\DISPLAY2";

    #[test]
    fn original_is_captured_once() {
        let tracker = ChangeTracker::new();
        let cache = DisplayCache::with_displays(vec![display(D1, 2560, 1440, 144)]);
        assert!(tracker.mark_original(D1, &cache));
        let first = tracker.original(D1).unwrap();

        for hz in [60, 120, 240] {
            let cache = DisplayCache::with_displays(vec![display(D1, 1920, 1080, hz)]);
            assert!(!tracker.mark_original(D1, &cache));
        }
        assert_eq!(tracker.original(D1), Some(first));
        assert_eq!(first.width, 2560);
    }

    #[test]
    fn unknown_device_is_not_recorded() {
        let tracker = ChangeTracker::new();
        let cache = DisplayCache::new();
        assert!(!tracker.mark_original(D1, &cache));
        assert!(tracker.snapshot().originals.is_empty());
    }

    #[test]
    fn restore_applies_recorded_original() {
        let tracker = ChangeTracker::new();
        let cache = DisplayCache::with_displays(vec![display(D1, 2560, 1440, 144)]);
        tracker.mark_original(D1, &cache);
        let original = tracker.original(D1).unwrap();

        let changed = DisplayCache::with_displays(vec![display(D1, 1920, 1080, 60)]);
        tracker.mark_changed(D1, &changed);

        let applier = RecordingApplier { dxgi_available: true, ..Default::default() };
        let report = tracker.restore_all(&applier);
        assert_eq!(report.restored, vec![D1.to_string()]);
        assert_eq!(*applier.calls.lock(), vec![(D1.to_string(), original, "dxgi")]);
    }

    #[test]
    fn legacy_fallback_and_independent_failures() {
        let tracker = ChangeTracker::new();
        let cache = DisplayCache::with_displays(vec![
            display(D1, 2560, 1440, 144),
            display(D2, 1920, 1080, 60),
        ]);
        tracker.mark_original(D1, &cache);
        tracker.mark_original(D2, &cache);
        tracker.mark_changed(D1, &cache);
        tracker.mark_changed(D2, &cache);

        let applier = RecordingApplier { fail_device: Some(D1.to_string()), ..Default::default() };
        let report = tracker.restore_all(&applier);
        assert_eq!(report.restored, vec![D2.to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, D1);
        assert!(applier.calls.lock().iter().all(|c| c.2 == "legacy"));
        assert_eq!(applier.calls.lock().len(), 2);
    }

    #[test]
    fn changed_without_original_uses_current_mode() {
        let tracker = ChangeTracker::new();
        let cache = DisplayCache::with_displays(vec![display(D2, 1280, 720, 60)]);
        tracker.mark_changed(D2, &cache);
        let snapshot = tracker.snapshot();
        assert!(snapshot.changed.contains(D2));
        assert_eq!(snapshot.originals.get(D2).map(|m| m.width), Some(1280));
    }

    #[test]
    fn guarded_restore_and_clear() {
        let tracker = ChangeTracker::new();
        let cache = DisplayCache::with_displays(vec![display(D1, 2560, 1440, 144)]);
        tracker.mark_original(D1, &cache);
        tracker.mark_changed(D1, &cache);

        let applier = RecordingApplier { dxgi_available: true, ..Default::default() };
        assert!(tracker.restore_all_if_enabled(true, &applier).is_none());
        tracker.note_mode_applied();
        assert!(tracker.restore_all_if_enabled(false, &applier).is_none());
        assert_eq!(tracker.restore_all_if_enabled(true, &applier).map(|r| r.restored.len()), Some(1));

        let before = tracker.snapshot();
        tracker.clear();
        assert!(tracker.snapshot().originals.is_empty());
        assert!(!tracker.mode_applied());
        // Readers holding the old generation keep a consistent view.
        assert!(before.changed.contains(D1));
    }
}
