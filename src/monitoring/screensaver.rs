// Screensaver and sleep suppression via the thread execution state
use crate::log_debug;
use crate::state::ScreensaverMode;
use std::sync::Arc;

pub const ES_SYSTEM_REQUIRED: u32 = 0x0000_0001;
pub const ES_DISPLAY_REQUIRED: u32 = 0x0000_0002;
pub const ES_CONTINUOUS: u32 = 0x8000_0000;

const KEEP_AWAKE: u32 = ES_CONTINUOUS | ES_DISPLAY_REQUIRED | ES_SYSTEM_REQUIRED;

pub fn desired_execution_state(mode: ScreensaverMode, foreground: bool) -> u32 {
    match mode {
        ScreensaverMode::Default => ES_CONTINUOUS,
        ScreensaverMode::DisableWhenFocused if foreground => KEEP_AWAKE,
        ScreensaverMode::DisableWhenFocused => ES_CONTINUOUS,
        ScreensaverMode::Disable => KEEP_AWAKE,
    }
}

pub trait ExecutionStateSink: Send + Sync {
    /// Returns the previous state, 0 on failure.
    fn set_execution_state(&self, flags: u32) -> u32;
}

#[derive(Debug, Default)]
pub struct SystemExecutionState;

#[cfg(windows)]
impl ExecutionStateSink for SystemExecutionState {
    fn set_execution_state(&self, flags: u32) -> u32 {
        use windows::Win32::System::Power::{SetThreadExecutionState, EXECUTION_STATE};
        unsafe { SetThreadExecutionState(EXECUTION_STATE(flags)).0 }
    }
}

#[cfg(not(windows))]
impl ExecutionStateSink for SystemExecutionState {
    fn set_execution_state(&self, _flags: u32) -> u32 {
        ES_CONTINUOUS
    }
}

/// Applies the desired flags only when they differ from the last ones set.
pub struct ScreensaverController {
    sink: Arc<dyn ExecutionStateSink>,
    last_applied: u32,
}

impl ScreensaverController {
    pub fn new(sink: Arc<dyn ExecutionStateSink>) -> Self {
        Self {
            sink,
            last_applied: ES_CONTINUOUS,
        }
    }

    pub fn last_applied(&self) -> u32 {
        self.last_applied
    }

    /// Returns true when the sink was called.
    pub fn reconcile(&mut self, mode: ScreensaverMode, foreground: bool) -> bool {
        let desired = desired_execution_state(mode, foreground);
        if desired == self.last_applied {
            return false;
        }
        if self.sink.set_execution_state(desired) == 0 {
            log_debug!("SetThreadExecutionState(0x{:08X}) failed", desired);
        }
        self.last_applied = desired;
        true
    }

    /// Drops any keep-awake request held by this thread.
    pub fn release(&mut self) {
        if self.last_applied != ES_CONTINUOUS {
            self.sink.set_execution_state(ES_CONTINUOUS);
            self.last_applied = ES_CONTINUOUS;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_flags_per_mode() {
        assert_eq!(desired_execution_state(ScreensaverMode::Default, true), ES_CONTINUOUS);
        assert_eq!(desired_execution_state(ScreensaverMode::DisableWhenFocused, true), KEEP_AWAKE);
        assert_eq!(desired_execution_state(ScreensaverMode::DisableWhenFocused, false), ES_CONTINUOUS);
        assert_eq!(desired_execution_state(ScreensaverMode::Disable, false), KEEP_AWAKE);
    }
}
