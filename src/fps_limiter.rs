use crate::log_info;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A site hit older than this many frames no longer counts as live.
pub const ELIGIBILITY_WINDOW_FRAMES: u64 = 3;

const NO_DECISION: u64 = u64::MAX;
// Decisions pack `frame_id << 8 | site` so both are published together.
const FRAME_MASK: u64 = u64::MAX >> 8;

fn pack(frame_id: u64, site: FrameTimingSite) -> u64 {
    (frame_id & FRAME_MASK) << 8 | site as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameTimingSite {
    ReflexMarker = 0,
    DxgiSwapchain = 1,
    ReshadeAddonEvent = 2,
    DxgiFactoryWrapper = 3,
}

impl FrameTimingSite {
    pub const ALL: [FrameTimingSite; 4] = [
        FrameTimingSite::ReflexMarker,
        FrameTimingSite::DxgiSwapchain,
        FrameTimingSite::ReshadeAddonEvent,
        FrameTimingSite::DxgiFactoryWrapper,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FrameTimingSite::ReflexMarker => "reflex_marker",
            FrameTimingSite::DxgiSwapchain => "dxgi_swapchain",
            FrameTimingSite::ReshadeAddonEvent => "reshade_addon_event",
            FrameTimingSite::DxgiFactoryWrapper => "dxgi_factory_wrapper",
        }
    }

    fn from_index(index: u8) -> Self {
        match index {
            0 => FrameTimingSite::ReflexMarker,
            1 => FrameTimingSite::DxgiSwapchain,
            3 => FrameTimingSite::DxgiFactoryWrapper,
            _ => FrameTimingSite::ReshadeAddonEvent,
        }
    }
}

impl std::fmt::Display for FrameTimingSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Picks the single hook that applies the frame limiter each frame.
///
/// Hooks report the frame they observed with [`record_site_hit`]; the first
/// [`decide_for_frame`] call for a new frame id walks the priority order and
/// caches the winner until the next frame id.
///
/// [`record_site_hit`]: FpsLimiterArbiter::record_site_hit
/// [`decide_for_frame`]: FpsLimiterArbiter::decide_for_frame
pub struct FpsLimiterArbiter {
    last_hit: [AtomicU64; 4],
    decision: AtomicU64,
    reflex_enabled: AtomicBool,
    transitions: AtomicU64,
}

impl FpsLimiterArbiter {
    pub fn new() -> Self {
        Self {
            last_hit: Default::default(),
            decision: AtomicU64::new(NO_DECISION),
            reflex_enabled: AtomicBool::new(false),
            transitions: AtomicU64::new(0),
        }
    }

    pub fn set_reflex_enabled(&self, enabled: bool) {
        self.reflex_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record_site_hit(&self, site: FrameTimingSite, frame_id: u64) {
        self.last_hit[site as usize].store(frame_id, Ordering::Relaxed);
    }

    pub fn last_hit(&self, site: FrameTimingSite) -> u64 {
        self.last_hit[site as usize].load(Ordering::Relaxed)
    }

    pub fn is_eligible(&self, site: FrameTimingSite, frame_id: u64) -> bool {
        let last = self.last_hit(site);
        last != 0 && frame_id.saturating_sub(last) <= ELIGIBILITY_WINDOW_FRAMES
    }

    pub fn decide_for_frame(&self, frame_id: u64) -> FrameTimingSite {
        let mut current = self.decision.load(Ordering::Acquire);
        loop {
            if current != NO_DECISION && current >> 8 == frame_id & FRAME_MASK {
                return FrameTimingSite::from_index(current as u8);
            }

            let decision = self.select(frame_id);
            match self.decision.compare_exchange(
                current,
                pack(frame_id, decision),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let previous = Self::site_of(current);
                    if previous != decision {
                        self.transitions.fetch_add(1, Ordering::Relaxed);
                        log_info!("FPS limiter source: {} -> {} (frame {})", previous, decision, frame_id);
                    }
                    return decision;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn site_of(packed: u64) -> FrameTimingSite {
        if packed == NO_DECISION {
            FrameTimingSite::ReshadeAddonEvent
        } else {
            FrameTimingSite::from_index(packed as u8)
        }
    }

    fn select(&self, frame_id: u64) -> FrameTimingSite {
        if self.reflex_enabled.load(Ordering::Relaxed)
            && self.is_eligible(FrameTimingSite::ReflexMarker, frame_id)
        {
            return FrameTimingSite::ReflexMarker;
        }
        [FrameTimingSite::DxgiSwapchain, FrameTimingSite::DxgiFactoryWrapper]
            .into_iter()
            .find(|&site| self.is_eligible(site, frame_id))
            .unwrap_or(FrameTimingSite::ReshadeAddonEvent)
    }

    pub fn chosen(&self) -> FrameTimingSite {
        Self::site_of(self.decision.load(Ordering::Acquire))
    }

    pub fn is_chosen(&self, site: FrameTimingSite) -> bool {
        self.chosen() == site
    }

    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }
}

impl Default for FpsLimiterArbiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use FrameTimingSite::*;

    #[test]
    fn reflex_wins_only_when_enabled() {
        let arbiter = FpsLimiterArbiter::new();
        for site in FrameTimingSite::ALL {
            arbiter.record_site_hit(site, 10);
        }
        assert_eq!(arbiter.decide_for_frame(10), DxgiSwapchain);

        arbiter.set_reflex_enabled(true);
        assert_eq!(arbiter.decide_for_frame(11), ReflexMarker);
        assert!(arbiter.is_chosen(ReflexMarker));
        assert!(!arbiter.is_chosen(DxgiSwapchain));
    }

    #[test]
    fn concurrent_deciders_agree_on_each_frame() {
        let arbiter = Arc::new(FpsLimiterArbiter::new());
        arbiter.record_site_hit(DxgiSwapchain, 1);
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let arbiter = Arc::clone(&arbiter);
                thread::spawn(move || (1..=2000).map(|f| arbiter.decide_for_frame(f)).collect::<Vec<_>>())
            })
            .collect();
        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0][0], DxgiSwapchain);
        assert_eq!(*results[0].last().unwrap(), ReshadeAddonEvent);
    }

    #[test]
    fn swapchain_preferred_over_addon_event() {
        let arbiter = FpsLimiterArbiter::new();
        arbiter.record_site_hit(ReshadeAddonEvent, 5);
        arbiter.record_site_hit(DxgiSwapchain, 5);
        assert_eq!(arbiter.decide_for_frame(5), DxgiSwapchain);
    }

    #[test]
    fn stale_site_fails_over_after_window() {
        let arbiter = FpsLimiterArbiter::new();
        arbiter.record_site_hit(DxgiSwapchain, 100);
        for frame in 100..=110 {
            arbiter.record_site_hit(ReshadeAddonEvent, frame);
            let chosen = arbiter.decide_for_frame(frame);
            if frame <= 100 + ELIGIBILITY_WINDOW_FRAMES {
                assert_eq!(chosen, DxgiSwapchain, "frame {}", frame);
            } else {
                assert_eq!(chosen, ReshadeAddonEvent, "frame {}", frame);
            }
        }
        assert_eq!(arbiter.transition_count(), 2);
    }

    #[test]
    fn factory_wrapper_sits_between_swapchain_and_fallback() {
        let arbiter = FpsLimiterArbiter::new();
        arbiter.record_site_hit(ReshadeAddonEvent, 1);
        arbiter.record_site_hit(DxgiFactoryWrapper, 1);
        assert_eq!(arbiter.decide_for_frame(1), DxgiFactoryWrapper);
        arbiter.record_site_hit(DxgiSwapchain, 2);
        assert_eq!(arbiter.decide_for_frame(2), DxgiSwapchain);
    }

    #[test]
    fn decision_is_idempotent_per_frame() {
        let arbiter = FpsLimiterArbiter::new();
        arbiter.record_site_hit(DxgiSwapchain, 7);
        assert_eq!(arbiter.decide_for_frame(7), DxgiSwapchain);
        let transitions = arbiter.transition_count();

        // A late hit for the same frame does not trigger a second decision.
        arbiter.set_reflex_enabled(true);
        arbiter.record_site_hit(ReflexMarker, 7);
        assert_eq!(arbiter.decide_for_frame(7), DxgiSwapchain);
        assert_eq!(arbiter.transition_count(), transitions);
    }

    #[test]
    fn always_some_site_once_anything_fired() {
        let arbiter = FpsLimiterArbiter::new();
        assert!(!arbiter.is_eligible(ReshadeAddonEvent, 1));
        arbiter.record_site_hit(ReshadeAddonEvent, 1);
        for frame in 1..=4 {
            assert!(arbiter.is_eligible(ReshadeAddonEvent, frame));
            assert_eq!(arbiter.decide_for_frame(frame), ReshadeAddonEvent);
        }
        assert!(FrameTimingSite::ALL.contains(&arbiter.decide_for_frame(50)));
    }
}
