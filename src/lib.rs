pub mod logger;
pub mod error;
pub mod state;
pub mod ring_buffer;
pub mod perf;
pub mod fps_limiter;
pub mod display;
pub mod change_tracker;
pub mod etw;
pub mod monitoring;
pub mod runtime;

pub use logger::*;
pub use error::{DisplayError, EtwError, VrrError};
pub use state::{ScreensaverMode, Settings, StateManager};
pub use ring_buffer::RingBuffer;
pub use perf::{FrameStats, PerfStats};
pub use fps_limiter::{FpsLimiterArbiter, FrameTimingSite};
pub use display::{DisplayCache, DisplayInfo, OriginalMode};
pub use change_tracker::{ChangeTracker, ChangeTrackerSnapshot, RestoreReport};
pub use etw::EtwEngine;
pub use monitoring::{ContinuousMonitoring, MonitoringLoop};
pub use runtime::{AddonRuntime, Services};
