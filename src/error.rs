use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EtwError {
    #[error("ETW tracing is only available on Windows")]
    Unsupported,
    #[error("StartTraceW failed for '{session}' (error {code})")]
    SessionStart { session: String, code: u32 },
    #[error("ETW session '{0}' already exists and could not be reused")]
    SessionExists(String),
    #[error("provider '{0}' not found")]
    ProviderNotFound(String),
    #[error("EnableTraceEx2 failed for '{provider}' (error {code})")]
    EnableProvider { provider: String, code: u32 },
    #[error("OpenTraceW failed (error {0})")]
    OpenTrace(u32),
    #[error("ProcessTrace returned error {0}")]
    ProcessTrace(u32),
    #[error("QueryAllTracesW failed (error {0})")]
    QuerySessions(u32),
    #[error("ControlTraceW stop failed for '{session}' (error {code})")]
    StopSession { session: String, code: u32 },
    #[error("failed to spawn {0} thread")]
    ThreadSpawn(&'static str),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisplayError {
    #[error("display device '{0}' not found in display cache")]
    DeviceNotFound(String),
    #[error("display mode apply path unavailable: {0}")]
    Unavailable(String),
    #[error("display mode change rejected for '{device}' (code {code})")]
    ChangeRejected { device: String, code: i32 },
    #[error("display enumeration failed: {0}")]
    Enumeration(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VrrError {
    #[error("NVAPI not initialized")]
    NotInitialized,
    #[error("VRR status not available: {0}")]
    Unavailable(String),
}
