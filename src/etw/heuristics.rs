// Best-effort interpretation of undocumented DXGI/DWM event layouts.
// These names and ids were observed on shipping Windows builds and may
// change between releases without notice.
use super::schema::{EventDescriptor, PropertyValue};

pub const DWM_FLIP_COMPAT_EVENT_ID: u16 = 291;
pub const DWM_FLIP_COMPAT_TASK: u16 = 207;

pub const PRESENT_MODE_PROPERTIES: [&str; 5] = [
    "PresentMode",
    "presentMode",
    "Present_Mode",
    "CompositionMode",
    "compositionMode",
];

pub const SURFACE_LUID_PROPERTIES: [&str; 3] = ["surfaceLuid", "SurfaceLuid", "luidSurface"];
pub const HWND_PROPERTIES: [&str; 4] = ["hwnd", "hWnd", "Hwnd", "hWindow"];

const INTERESTING_SUBSTRINGS: [&str; 6] = ["present", "flip", "composition", "overlay", "tearing", "sync"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlipMode {
    #[default]
    Unknown,
    Composed,
    Overlay,
    IndependentFlip,
}

impl FlipMode {
    pub fn label(self) -> &'static str {
        match self {
            FlipMode::Unknown => "Unknown",
            FlipMode::Composed => "Composed",
            FlipMode::Overlay => "Hardware Overlay (MPO)",
            FlipMode::IndependentFlip => "Independent Flip",
        }
    }
}

pub fn flip_mode_from_text(value: &str) -> FlipMode {
    let lower = value.to_ascii_lowercase();
    if lower.contains("overlay") || lower.contains("mpo") {
        FlipMode::Overlay
    } else if lower.contains("independent") {
        FlipMode::IndependentFlip
    } else if lower.contains("composed") {
        FlipMode::Composed
    } else {
        FlipMode::Unknown
    }
}

/// Property names worth showing in the per-provider debug summary.
pub fn is_interesting_property(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    INTERESTING_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

pub fn is_flip_compat_event(descriptor: &EventDescriptor) -> bool {
    descriptor.id == DWM_FLIP_COMPAT_EVENT_ID && descriptor.task == DWM_FLIP_COMPAT_TASK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlipCompatibility {
    pub surface_luid: u64,
    pub surface_width: u32,
    pub surface_height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub color_space: u32,
    pub is_direct_flip_compatible: bool,
    pub is_advanced_direct_flip_compatible: bool,
    pub is_overlay_compatible: bool,
    pub is_overlay_required: bool,
    pub no_overlapping_content: bool,
    pub last_update_ms: u64,
}

impl FlipCompatibility {
    /// Fast path the compositor could use for this surface.
    pub fn best_path(&self) -> FlipMode {
        if self.is_overlay_compatible {
            FlipMode::Overlay
        } else if self.is_direct_flip_compatible || self.is_advanced_direct_flip_compatible {
            FlipMode::IndependentFlip
        } else {
            FlipMode::Composed
        }
    }

    pub fn same_flags(&self, other: &FlipCompatibility) -> bool {
        self.is_direct_flip_compatible == other.is_direct_flip_compatible
            && self.is_advanced_direct_flip_compatible == other.is_advanced_direct_flip_compatible
            && self.is_overlay_compatible == other.is_overlay_compatible
            && self.is_overlay_required == other.is_overlay_required
            && self.no_overlapping_content == other.no_overlapping_content
    }
}

/// Pulls the DWM flip-compatibility fields out of an event. Requires at
/// least `surfaceLuid`; missing fields read as zero/false.
pub fn extract_flip_compatibility(
    mut lookup: impl FnMut(&str) -> Option<PropertyValue>,
    now_ms: u64,
) -> Option<FlipCompatibility> {
    let surface_luid = lookup("surfaceLuid")?.as_u64()?;
    let mut number = |name: &str| lookup(name).and_then(|v| v.as_u64()).unwrap_or(0);
    let surface_width = number("SurfaceWidth") as u32;
    let surface_height = number("SurfaceHeight") as u32;
    let pixel_format = number("PixelFormat") as u32;
    let flags = number("Flags") as u32;
    let color_space = number("ColorSpace") as u32;
    let is_direct_flip_compatible = number("IsDirectFlipCompatible") != 0;
    let is_advanced_direct_flip_compatible = number("IsAdvancedDirectFlipCompatible") != 0;
    let is_overlay_compatible = number("IsOverlayCompatible") != 0;
    let is_overlay_required = number("IsOverlayRequired") != 0;
    let no_overlapping_content = number("fNoOverlappingContent") != 0;

    Some(FlipCompatibility {
        surface_luid,
        surface_width,
        surface_height,
        pixel_format,
        flags,
        color_space,
        is_direct_flip_compatible,
        is_advanced_direct_flip_compatible,
        is_overlay_compatible,
        is_overlay_required,
        no_overlapping_content,
        last_update_ms: now_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_mode_mapping_is_substring_based() {
        assert_eq!(flip_mode_from_text("Hardware: Independent Flip"), FlipMode::IndependentFlip);
        assert_eq!(flip_mode_from_text("Composed: Flip"), FlipMode::Composed);
        assert_eq!(flip_mode_from_text("Hardware Composed: Independent Flip"), FlipMode::IndependentFlip);
        assert_eq!(flip_mode_from_text("MPO"), FlipMode::Overlay);
        assert_eq!(flip_mode_from_text("overlay independent"), FlipMode::Overlay);
        assert_eq!(flip_mode_from_text("Blt"), FlipMode::Unknown);
    }

    #[test]
    fn interesting_names_are_case_insensitive() {
        assert!(is_interesting_property("SyncInterval"));
        assert!(is_interesting_property("IsOverlayRequired"));
        assert!(is_interesting_property("allowTearing"));
        assert!(!is_interesting_property("ProcessId"));
    }

    #[test]
    fn flip_compat_requires_surface() {
        assert!(extract_flip_compatibility(|_| None, 0).is_none());

        let compat = extract_flip_compatibility(
            |name| match name {
                "surfaceLuid" => Some(PropertyValue::Unsigned(0x42)),
                "SurfaceWidth" => Some(PropertyValue::Unsigned(2560)),
                "IsDirectFlipCompatible" => Some(PropertyValue::Bool(true)),
                _ => None,
            },
            12,
        )
        .unwrap();
        assert_eq!(compat.surface_luid, 0x42);
        assert_eq!(compat.surface_width, 2560);
        assert_eq!(compat.surface_height, 0);
        assert_eq!(compat.best_path(), FlipMode::IndependentFlip);
        assert_eq!(compat.last_update_ms, 12);
    }
}
