// Collaborators the monitoring loop fans out to. Each call has a no-op
// default so hosts only implement the features they actually provide.
use crate::error::VrrError;
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VrrStatus {
    pub supported: bool,
    pub enabled: bool,
    pub requested: bool,
    pub possible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RefreshRateStats {
    pub current_hz: f64,
    pub min_hz: f64,
    pub max_hz: f64,
    pub samples: u64,
}

pub trait MonitorHooks: Send + Sync {
    fn is_game_in_foreground(&self) -> bool {
        true
    }

    /// Cursor clip and window reconciliation after a focus change.
    fn apply_focus_state(&self, _foreground: bool) {}

    fn update_adhd_multi_monitor(&self, _enabled: bool, _foreground: bool) {}
    fn update_keyboard_state(&self) {}
    fn process_hotkeys(&self) {}
    fn reset_frame_state(&self) {}

    /// Restricts the process to the first `cores` logical processors, 0 lifts the restriction.
    fn apply_cpu_affinity(&self, _cores: u32) -> Result<()> {
        Ok(())
    }

    fn poll_audio_volume(&self) -> Option<f32> {
        None
    }

    fn refresh_rate_snapshot(&self) -> Option<RefreshRateStats> {
        None
    }

    fn query_vrr_status(&self) -> Result<VrrStatus, VrrError> {
        Err(VrrError::Unavailable("no NVAPI on this host".to_string()))
    }

    /// Returns true when NVAPI came back and the query is worth retrying.
    fn reinitialize_nvapi(&self) -> bool {
        false
    }

    fn refresh_exclusive_key_groups(&self) {}
    fn scan_discord_overlay(&self) {}
    fn auto_configure_reflex(&self) {}

    fn auto_apply_display_settings(&self) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHooks;

impl MonitorHooks for NullHooks {}

/// Host OS hooks: foreground detection and CPU affinity.
#[derive(Debug, Default)]
pub struct SystemHooks;

#[cfg(windows)]
impl MonitorHooks for SystemHooks {
    fn is_game_in_foreground(&self) -> bool {
        use windows::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

        unsafe {
            let hwnd = GetForegroundWindow();
            if hwnd.0.is_null() {
                return false;
            }
            let mut pid = 0u32;
            GetWindowThreadProcessId(hwnd, Some(&mut pid));
            pid == std::process::id()
        }
    }

    fn apply_cpu_affinity(&self, cores: u32) -> Result<()> {
        use anyhow::Context;
        use windows::Win32::System::Threading::{GetCurrentProcess, GetProcessAffinityMask, SetProcessAffinityMask};

        unsafe {
            let process = GetCurrentProcess();
            let mut process_mask = 0usize;
            let mut system_mask = 0usize;
            GetProcessAffinityMask(process, &mut process_mask, &mut system_mask)
                .context("GetProcessAffinityMask failed")?;

            let mask = if cores == 0 || cores as usize >= usize::BITS as usize {
                system_mask
            } else {
                ((1usize << cores) - 1) & system_mask
            };
            if mask == 0 {
                anyhow::bail!("no processors left in affinity mask for {} cores", cores);
            }
            SetProcessAffinityMask(process, mask).context("SetProcessAffinityMask failed")?;
        }
        Ok(())
    }
}

#[cfg(not(windows))]
impl MonitorHooks for SystemHooks {}
