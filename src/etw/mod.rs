pub mod engine;
pub mod hash_table;
pub mod heuristics;
pub mod schema;
pub mod session;
#[cfg(windows)]
pub mod win32;

pub use engine::{
    EtwCounters, EtwEngine, EtwState, EventTypeId, EventTypeSummary, FlipState, HistoryMarker,
    ProviderClass, ProviderDebug, ProviderSet, SurfaceSummary, TraceBackend,
};
pub use heuristics::{FlipCompatibility, FlipMode};
pub use schema::{EventDescriptor, EventRecordView, EventSchema, PropertyValue, ProviderGuid};
pub use session::{close_orphaned_sessions, session_name, SessionControl};

use crate::error::EtwError;
use std::sync::Arc;

/// Backend for hosts without ETW. Starting a session always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBackend;

impl SessionControl for UnsupportedBackend {
    fn list_sessions(&self) -> Result<Vec<String>, EtwError> {
        Ok(Vec::new())
    }

    fn stop_session(&self, _name: &str) -> Result<(), EtwError> {
        Ok(())
    }
}

impl TraceBackend for UnsupportedBackend {
    fn run_realtime(&self, _session_name: &str, _engine: &Arc<EtwEngine>) -> Result<(), EtwError> {
        Err(EtwError::Unsupported)
    }

    fn stop_realtime(&self, _session_name: &str) -> Result<(), EtwError> {
        Ok(())
    }

    fn is_process_alive(&self, _pid: u32) -> bool {
        true
    }
}

#[cfg(windows)]
pub fn system_backend() -> Arc<dyn TraceBackend> {
    Arc::new(win32::Win32TraceBackend::new())
}

#[cfg(not(windows))]
pub fn system_backend() -> Arc<dyn TraceBackend> {
    Arc::new(UnsupportedBackend)
}
