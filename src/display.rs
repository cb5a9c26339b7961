use crate::error::DisplayError;
use crate::log_warn;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(windows)]
use windows::{
    core::{BOOL, PCWSTR},
    Win32::{
        Foundation::{LPARAM, RECT},
        Graphics::Dxgi::{Common::*, *},
        Graphics::Gdi::*,
    },
};

/// Exact display mode, refresh rate kept as a rational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginalMode {
    pub width: u32,
    pub height: u32,
    pub refresh_numerator: u32,
    pub refresh_denominator: u32,
}

impl OriginalMode {
    pub fn refresh_hz(&self) -> f64 {
        if self.refresh_denominator == 0 {
            0.0
        } else {
            self.refresh_numerator as f64 / self.refresh_denominator as f64
        }
    }
}

impl std::fmt::Display for OriginalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} @ {:.3} Hz", self.width, self.height, self.refresh_hz())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayInfo {
    /// Windows device name, e.g. `\\.\DISPLAY1`.
    pub device_name: String,
    pub width: u32,
    pub height: u32,
    pub refresh_numerator: u32,
    pub refresh_denominator: u32,
    pub monitor_handle: isize,
    pub simple_device_id: String,
    pub is_primary: bool,
}

impl DisplayInfo {
    pub fn current_mode(&self) -> OriginalMode {
        OriginalMode {
            width: self.width,
            height: self.height,
            refresh_numerator: self.refresh_numerator,
            refresh_denominator: self.refresh_denominator,
        }
    }
}

pub trait DisplayEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>, DisplayError>;
}

pub trait DisplayModeApplier: Send + Sync {
    fn apply_dxgi(&self, device_name: &str, mode: &OriginalMode) -> Result<(), DisplayError>;
    fn apply_legacy(&self, device_name: &str, mode: &OriginalMode) -> Result<(), DisplayError>;
}

/// Last enumerated set of displays, swapped in whole on every refresh.
pub struct DisplayCache {
    displays: ArcSwap<Vec<DisplayInfo>>,
    refreshes: AtomicU64,
}

impl DisplayCache {
    pub fn new() -> Self {
        Self {
            displays: ArcSwap::from_pointee(Vec::new()),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn with_displays(displays: Vec<DisplayInfo>) -> Self {
        let cache = Self::new();
        cache.displays.store(Arc::new(displays));
        cache
    }

    /// Keeps the previous contents when enumeration fails.
    pub fn refresh(&self, enumerator: &dyn DisplayEnumerator) -> Result<usize, DisplayError> {
        match enumerator.enumerate() {
            Ok(displays) => {
                let count = displays.len();
                self.displays.store(Arc::new(displays));
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                Ok(count)
            }
            Err(e) => {
                log_warn!("Display cache refresh failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn all(&self) -> Arc<Vec<DisplayInfo>> {
        self.displays.load_full()
    }

    pub fn get(&self, index: usize) -> Option<DisplayInfo> {
        self.displays.load().get(index).cloned()
    }

    pub fn find(&self, device_name: &str) -> Option<DisplayInfo> {
        self.displays
            .load()
            .iter()
            .find(|d| d.device_name.eq_ignore_ascii_case(device_name))
            .cloned()
    }

    pub fn primary(&self) -> Option<DisplayInfo> {
        self.displays.load().iter().find(|d| d.is_primary).cloned()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

impl Default for DisplayCache {
    fn default() -> Self {
        Self::new()
    }
}

/// GDI monitor enumeration.
pub struct SystemDisplays;

#[cfg(windows)]
impl DisplayEnumerator for SystemDisplays {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>, DisplayError> {
        let mut monitors = Vec::<DisplayInfo>::new();

        let ok = unsafe {
            EnumDisplayMonitors(
                None,
                None,
                Some(monitor_enum_proc),
                LPARAM(&mut monitors as *mut Vec<DisplayInfo> as isize),
            )
        };
        if !ok.as_bool() {
            return Err(DisplayError::Enumeration("EnumDisplayMonitors failed".to_string()));
        }

        Ok(monitors)
    }
}

#[cfg(windows)]
unsafe extern "system" fn monitor_enum_proc(
    hmonitor: HMONITOR,
    _hdc: HDC,
    _rect: *mut RECT,
    lparam: LPARAM,
) -> BOOL {
    let monitors = &mut *(lparam.0 as *mut Vec<DisplayInfo>);

    let mut info: MONITORINFOEXW = std::mem::zeroed();
    info.monitorInfo.cbSize = std::mem::size_of::<MONITORINFOEXW>() as u32;

    if GetMonitorInfoW(hmonitor, &mut info as *mut _ as *mut _).as_bool() {
        let rect = info.monitorInfo.rcMonitor;
        let device_name = wide_to_string(&info.szDevice);

        let mut dev_mode: DEVMODEW = std::mem::zeroed();
        dev_mode.dmSize = std::mem::size_of::<DEVMODEW>() as u16;

        let (width, height, refresh) = if EnumDisplaySettingsW(
            PCWSTR(info.szDevice.as_ptr()),
            ENUM_CURRENT_SETTINGS,
            &mut dev_mode,
        )
        .as_bool()
        {
            (dev_mode.dmPelsWidth, dev_mode.dmPelsHeight, dev_mode.dmDisplayFrequency)
        } else {
            (
                (rect.right - rect.left) as u32,
                (rect.bottom - rect.top) as u32,
                60,
            )
        };

        let simple_device_id = device_name
            .trim_start_matches(r"\\.\")
            .to_string();

        monitors.push(DisplayInfo {
            device_name,
            width,
            height,
            refresh_numerator: refresh,
            refresh_denominator: 1,
            monitor_handle: hmonitor.0 as isize,
            simple_device_id,
            is_primary: info.monitorInfo.dwFlags & MONITORINFOF_PRIMARY != 0,
        });
    }

    true.into()
}

#[cfg(windows)]
fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

#[cfg(not(windows))]
impl DisplayEnumerator for SystemDisplays {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>, DisplayError> {
        // Fallback for non-Windows platforms
        Ok(vec![DisplayInfo {
            device_name: r"\\.\DISPLAY1".to_string(),
            width: 1920,
            height: 1080,
            refresh_numerator: 60,
            refresh_denominator: 1,
            monitor_handle: 0,
            simple_device_id: "DISPLAY1".to_string(),
            is_primary: true,
        }])
    }
}

/// Applies modes through DXGI mode matching, or straight through
/// `ChangeDisplaySettingsExW`.
pub struct SystemModeApplier;

#[cfg(windows)]
impl SystemModeApplier {
    unsafe fn find_output(device_name: &str) -> Option<IDXGIOutput> {
        let factory: IDXGIFactory1 = CreateDXGIFactory1().ok()?;
        let mut adapter_index = 0;
        while let Ok(adapter) = factory.EnumAdapters1(adapter_index) {
            let mut output_index = 0;
            while let Ok(output) = adapter.EnumOutputs(output_index) {
                if let Ok(desc) = output.GetDesc() {
                    if wide_to_string(&desc.DeviceName).eq_ignore_ascii_case(device_name) {
                        return Some(output);
                    }
                }
                output_index += 1;
            }
            adapter_index += 1;
        }
        None
    }

    unsafe fn change_settings(device_name: &str, width: u32, height: u32, hz: u32) -> Result<(), DisplayError> {
        let wide: Vec<u16> = device_name.encode_utf16().chain(std::iter::once(0)).collect();

        let mut dev_mode: DEVMODEW = std::mem::zeroed();
        dev_mode.dmSize = std::mem::size_of::<DEVMODEW>() as u16;
        dev_mode.dmPelsWidth = width;
        dev_mode.dmPelsHeight = height;
        dev_mode.dmDisplayFrequency = hz;
        dev_mode.dmFields = DM_PELSWIDTH | DM_PELSHEIGHT | DM_DISPLAYFREQUENCY;

        let result = ChangeDisplaySettingsExW(
            PCWSTR(wide.as_ptr()),
            Some(&dev_mode as *const DEVMODEW),
            None,
            CDS_TYPE(0),
            None,
        );

        if result == DISP_CHANGE_SUCCESSFUL {
            Ok(())
        } else {
            Err(DisplayError::ChangeRejected {
                device: device_name.to_string(),
                code: result.0,
            })
        }
    }
}

#[cfg(windows)]
impl DisplayModeApplier for SystemModeApplier {
    fn apply_dxgi(&self, device_name: &str, mode: &OriginalMode) -> Result<(), DisplayError> {
        unsafe {
            let output = Self::find_output(device_name)
                .ok_or_else(|| DisplayError::Unavailable(format!("no DXGI output for {}", device_name)))?;

            let wanted = DXGI_MODE_DESC {
                Width: mode.width,
                Height: mode.height,
                RefreshRate: DXGI_RATIONAL {
                    Numerator: mode.refresh_numerator,
                    Denominator: mode.refresh_denominator.max(1),
                },
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                ..Default::default()
            };
            let mut closest = DXGI_MODE_DESC::default();
            output
                .FindClosestMatchingMode(&wanted, &mut closest, None)
                .map_err(|e| DisplayError::Unavailable(format!("FindClosestMatchingMode: {}", e)))?;

            if closest.Width != mode.width || closest.Height != mode.height {
                return Err(DisplayError::Unavailable(format!(
                    "closest DXGI mode {}x{} does not match {}",
                    closest.Width, closest.Height, mode
                )));
            }

            let hz = (closest.RefreshRate.Numerator as f64
                / closest.RefreshRate.Denominator.max(1) as f64)
                .round() as u32;
            Self::change_settings(device_name, closest.Width, closest.Height, hz)
        }
    }

    fn apply_legacy(&self, device_name: &str, mode: &OriginalMode) -> Result<(), DisplayError> {
        unsafe {
            Self::change_settings(
                device_name,
                mode.width,
                mode.height,
                mode.refresh_hz().round() as u32,
            )
        }
    }
}

#[cfg(not(windows))]
impl DisplayModeApplier for SystemModeApplier {
    fn apply_dxgi(&self, _device_name: &str, _mode: &OriginalMode) -> Result<(), DisplayError> {
        Err(DisplayError::Unavailable("DXGI is only available on Windows".to_string()))
    }

    fn apply_legacy(&self, _device_name: &str, _mode: &OriginalMode) -> Result<(), DisplayError> {
        Err(DisplayError::Unavailable("display mode changes are only available on Windows".to_string()))
    }
}
