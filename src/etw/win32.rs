// Real-time ETW consumer on top of the Win32 trace and TDH APIs
use super::engine::{
    EtwEngine, ProviderSet, TraceBackend, DWM_PROVIDER, DXGI_PROVIDER, DXGKRNL_PROVIDER,
};
use super::schema::{
    decode_property_bytes, EventDescriptor, EventRecordView, EventSchema, PropertyInfo,
    PropertyValue, ProviderGuid,
};
use super::session::SessionControl;
use crate::error::EtwError;
use crate::{log_debug, log_error, log_info, log_warn};
use parking_lot::Mutex;
use std::ffi::c_void;
use std::mem::size_of;
use std::sync::Arc;
use std::time::Instant;

use windows::{
    core::{GUID, PCWSTR, PWSTR},
    Win32::{
        Foundation::*,
        System::Diagnostics::Etw::*,
        System::Threading::{GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION},
    },
};

const MAX_SESSION_NAME: usize = 1024;
const MAX_QUERY_SESSIONS: usize = 64;
const STILL_ACTIVE: u32 = 259;

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Reads a NUL-terminated UTF-16 string at `offset` inside a TDH buffer.
unsafe fn wide_at(base: *const u8, len: usize, offset: u32) -> String {
    let offset = offset as usize;
    if offset == 0 || offset >= len {
        return String::new();
    }
    let start = base.add(offset) as *const u16;
    let max = (len - offset) / 2;
    let mut units = Vec::new();
    for i in 0..max {
        let unit = start.add(i).read_unaligned();
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    String::from_utf16_lossy(&units)
}

/// `EVENT_TRACE_PROPERTIES` followed by room for the logger name.
struct TraceProperties {
    buffer: Vec<u64>,
}

impl TraceProperties {
    fn new(session_name: Option<&str>) -> Self {
        let bytes = size_of::<EVENT_TRACE_PROPERTIES>() + MAX_SESSION_NAME * 2 * 2;
        let mut props = Self { buffer: vec![0u64; bytes.div_ceil(8)] };
        let header = props.as_mut();
        header.Wnode.BufferSize = bytes as u32;
        header.Wnode.Flags = WNODE_FLAG_TRACED_GUID;
        header.Wnode.ClientContext = 1;
        header.LogFileMode = EVENT_TRACE_REAL_TIME_MODE;
        header.LoggerNameOffset = size_of::<EVENT_TRACE_PROPERTIES>() as u32;
        header.LogFileNameOffset = 0;

        if let Some(name) = session_name {
            let name = wide(name);
            let len = name.len().min(MAX_SESSION_NAME);
            unsafe {
                let dst = (props.buffer.as_mut_ptr() as *mut u8)
                    .add(size_of::<EVENT_TRACE_PROPERTIES>()) as *mut u16;
                std::ptr::copy_nonoverlapping(name.as_ptr(), dst, len);
            }
        }
        props
    }

    fn as_mut(&mut self) -> &mut EVENT_TRACE_PROPERTIES {
        unsafe { &mut *(self.buffer.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES) }
    }

    fn as_mut_ptr(&mut self) -> *mut EVENT_TRACE_PROPERTIES {
        self.buffer.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES
    }

    fn logger_name(&self) -> String {
        let len = self.buffer.len() * 8;
        let header = unsafe { &*(self.buffer.as_ptr() as *const EVENT_TRACE_PROPERTIES) };
        unsafe { wide_at(self.buffer.as_ptr() as *const u8, len, header.LoggerNameOffset) }
    }
}

fn control_stop(session_name: &str) -> Result<(), EtwError> {
    let name = wide(session_name);
    let mut props = TraceProperties::new(None);
    let status = unsafe {
        ControlTraceW(
            CONTROLTRACE_HANDLE::default(),
            PCWSTR(name.as_ptr()),
            props.as_mut_ptr(),
            EVENT_TRACE_CONTROL_STOP,
        )
    };
    match status {
        ERROR_SUCCESS | ERROR_WMI_INSTANCE_NOT_FOUND => Ok(()),
        other => Err(EtwError::StopSession {
            session: session_name.to_string(),
            code: other.0,
        }),
    }
}

fn start_session(session_name: &str) -> Result<CONTROLTRACE_HANDLE, EtwError> {
    let name = wide(session_name);
    let mut handle = CONTROLTRACE_HANDLE::default();
    let mut props = TraceProperties::new(Some(session_name));
    let status = unsafe { StartTraceW(&mut handle, PCWSTR(name.as_ptr()), props.as_mut_ptr()) };
    if status == ERROR_SUCCESS {
        return Ok(handle);
    }
    if status != ERROR_ALREADY_EXISTS {
        return Err(EtwError::SessionStart {
            session: session_name.to_string(),
            code: status.0,
        });
    }

    // A session under our own name survived a crash. Reuse it if it is a
    // real-time session, otherwise stop it and start fresh.
    let mut query = TraceProperties::new(None);
    let queried = unsafe {
        ControlTraceW(
            CONTROLTRACE_HANDLE::default(),
            PCWSTR(name.as_ptr()),
            query.as_mut_ptr(),
            EVENT_TRACE_CONTROL_QUERY,
        )
    };
    if queried == ERROR_SUCCESS && query.as_mut().LogFileMode & EVENT_TRACE_REAL_TIME_MODE != 0 {
        log_info!("Reusing existing ETW session {}", session_name);
        return Ok(CONTROLTRACE_HANDLE { Value: query.as_mut().Wnode.Anonymous1.HistoricalContext });
    }

    control_stop(session_name)?;
    let mut props = TraceProperties::new(Some(session_name));
    let status = unsafe { StartTraceW(&mut handle, PCWSTR(name.as_ptr()), props.as_mut_ptr()) };
    if status == ERROR_SUCCESS {
        Ok(handle)
    } else {
        Err(EtwError::SessionExists(session_name.to_string()))
    }
}

/// Looks providers up by their registered names.
fn resolve_providers() -> ProviderSet {
    let mut size = 0u32;
    let status = unsafe { TdhEnumerateProviders(None, &mut size) };
    if status != ERROR_INSUFFICIENT_BUFFER.0 || size == 0 {
        log_warn!("TdhEnumerateProviders size query failed ({})", status);
        return ProviderSet::default();
    }

    let mut buffer = vec![0u64; (size as usize).div_ceil(8)];
    let info = buffer.as_mut_ptr() as *mut PROVIDER_ENUMERATION_INFO;
    let status = unsafe { TdhEnumerateProviders(Some(info), &mut size) };
    if status != ERROR_SUCCESS.0 {
        log_warn!("TdhEnumerateProviders failed ({})", status);
        return ProviderSet::default();
    }

    let mut set = ProviderSet::default();
    unsafe {
        let count = (*info).NumberOfProviders as usize;
        let entries = (*info).TraceProviderInfoArray.as_ptr();
        let base = buffer.as_ptr() as *const u8;
        for i in 0..count {
            let entry = &*entries.add(i);
            let name = wide_at(base, size as usize, entry.ProviderNameOffset);
            let guid = Some(ProviderGuid(entry.ProviderGuid.to_u128()));
            if name.eq_ignore_ascii_case(DXGKRNL_PROVIDER) {
                set.dxgkrnl = guid;
            } else if name.eq_ignore_ascii_case(DXGI_PROVIDER) {
                set.dxgi = guid;
            } else if name.eq_ignore_ascii_case(DWM_PROVIDER) {
                set.dwm = guid;
            }
        }
    }
    set
}

/// Union of every keyword the provider advertises, or all bits when the
/// manifest exposes none.
fn provider_keyword_mask(guid: &GUID) -> u64 {
    let mut size = 0u32;
    let status = unsafe {
        TdhEnumerateProviderFieldInformation(guid, EventKeywordInformation, None, &mut size)
    };
    if status != ERROR_INSUFFICIENT_BUFFER.0 || size == 0 {
        return u64::MAX;
    }

    let mut buffer = vec![0u64; (size as usize).div_ceil(8)];
    let info = buffer.as_mut_ptr() as *mut PROVIDER_FIELD_INFOARRAY;
    let status = unsafe {
        TdhEnumerateProviderFieldInformation(guid, EventKeywordInformation, Some(info), &mut size)
    };
    if status != ERROR_SUCCESS.0 {
        return u64::MAX;
    }

    let mask = unsafe {
        let count = (*info).NumberOfElements as usize;
        let fields = (*info).FieldInfoArray.as_ptr();
        (0..count).fold(0u64, |mask, i| mask | (*fields.add(i)).Value)
    };
    if mask == 0 {
        u64::MAX
    } else {
        mask
    }
}

fn enable_provider(handle: CONTROLTRACE_HANDLE, name: &str, guid: ProviderGuid) -> Result<(), EtwError> {
    let guid = GUID::from_u128(guid.0);
    let keywords = provider_keyword_mask(&guid);
    let status = unsafe {
        EnableTraceEx2(
            handle,
            &guid,
            EVENT_CONTROL_CODE_ENABLE_PROVIDER.0,
            TRACE_LEVEL_VERBOSE as u8,
            keywords,
            0,
            0,
            None,
        )
    };
    if status == ERROR_SUCCESS {
        log_info!("Enabled ETW provider {} (keywords 0x{:X})", name, keywords);
        Ok(())
    } else {
        Err(EtwError::EnableProvider {
            provider: name.to_string(),
            code: status.0,
        })
    }
}

/// Borrowed view over a record delivered to the event callback.
struct Win32Record<'a> {
    record: &'a EVENT_RECORD,
}

impl EventRecordView for Win32Record<'_> {
    fn provider_id(&self) -> ProviderGuid {
        ProviderGuid(self.record.EventHeader.ProviderId.to_u128())
    }

    fn descriptor(&self) -> EventDescriptor {
        let d = &self.record.EventHeader.EventDescriptor;
        EventDescriptor {
            id: d.Id,
            version: d.Version,
            opcode: d.Opcode,
            task: d.Task,
            level: d.Level,
            keyword: d.Keyword,
        }
    }

    fn decode_schema(&self) -> Option<EventSchema> {
        let mut size = 0u32;
        let status = unsafe { TdhGetEventInformation(self.record, None, None, &mut size) };
        if status != ERROR_INSUFFICIENT_BUFFER.0 || size == 0 {
            return None;
        }

        let mut buffer = vec![0u64; (size as usize).div_ceil(8)];
        let info = buffer.as_mut_ptr() as *mut TRACE_EVENT_INFO;
        let status = unsafe { TdhGetEventInformation(self.record, None, Some(info), &mut size) };
        if status != ERROR_SUCCESS.0 {
            return None;
        }

        let len = size as usize;
        let base = buffer.as_ptr() as *const u8;
        unsafe {
            let info = &*info;
            let props = info.EventPropertyInfoArray.as_ptr();
            let properties = (0..info.TopLevelPropertyCount as usize)
                .map(|i| {
                    let prop = &*props.add(i);
                    PropertyInfo {
                        name: wide_at(base, len, prop.NameOffset),
                        in_type: prop.Anonymous1.nonStructType.InType,
                    }
                })
                .filter(|p| !p.name.is_empty())
                .collect();

            Some(EventSchema {
                provider_name: wide_at(base, len, info.ProviderNameOffset),
                event_name: wide_at(base, len, info.Anonymous1.EventNameOffset),
                task_name: wide_at(base, len, info.TaskNameOffset),
                properties,
            })
        }
    }

    fn property(&self, property: &PropertyInfo) -> Option<PropertyValue> {
        let name = wide(&property.name);
        let descriptor = [PROPERTY_DATA_DESCRIPTOR {
            PropertyName: name.as_ptr() as u64,
            ArrayIndex: u32::MAX,
            Reserved: 0,
        }];

        let mut size = 0u32;
        let status = unsafe { TdhGetPropertySize(self.record, None, &descriptor, &mut size) };
        if status != ERROR_SUCCESS.0 || size == 0 {
            return None;
        }

        let mut bytes = vec![0u8; size as usize];
        let status = unsafe { TdhGetProperty(self.record, None, &descriptor, &mut bytes) };
        if status != ERROR_SUCCESS.0 {
            return None;
        }
        Some(decode_property_bytes(property.in_type, &bytes))
    }
}

unsafe extern "system" fn event_record_callback(record: *mut EVENT_RECORD) {
    let Some(record) = record.as_ref() else {
        return;
    };
    let engine = record.UserContext as *const EtwEngine;
    let Some(engine) = engine.as_ref() else {
        return;
    };
    // Unwinding across the OS callback boundary would abort the host.
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        engine.handle_event(&Win32Record { record }, Instant::now());
    }));
}

unsafe extern "system" fn buffer_callback(logfile: *mut EVENT_TRACE_LOGFILEW) -> u32 {
    let engine = logfile
        .as_ref()
        .and_then(|l| (l.Context as *const EtwEngine).as_ref());
    match engine {
        Some(engine) if engine.stop_requested() => 0,
        _ => 1,
    }
}

/// System ETW backend. Needs administrator rights for real-time sessions.
#[derive(Default)]
pub struct Win32TraceBackend {
    consumer: Mutex<Option<PROCESSTRACE_HANDLE>>,
}

impl Win32TraceBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionControl for Win32TraceBackend {
    fn list_sessions(&self) -> Result<Vec<String>, EtwError> {
        let mut storage: Vec<TraceProperties> =
            (0..MAX_QUERY_SESSIONS).map(|_| TraceProperties::new(None)).collect();
        let mut pointers: Vec<*mut EVENT_TRACE_PROPERTIES> =
            storage.iter_mut().map(|p| p.as_mut_ptr()).collect();
        let mut count = 0u32;

        let status = unsafe { QueryAllTracesW(&mut pointers, &mut count) };
        if status != ERROR_SUCCESS && status != ERROR_MORE_DATA {
            return Err(EtwError::QuerySessions(status.0));
        }
        Ok(storage
            .iter()
            .take(count as usize)
            .map(TraceProperties::logger_name)
            .filter(|name| !name.is_empty())
            .collect())
    }

    fn stop_session(&self, name: &str) -> Result<(), EtwError> {
        control_stop(name)
    }
}

impl TraceBackend for Win32TraceBackend {
    fn run_realtime(&self, session_name: &str, engine: &Arc<EtwEngine>) -> Result<(), EtwError> {
        let handle = start_session(session_name)?;

        let providers = resolve_providers();
        engine.set_providers(providers);
        let wanted = [
            (DXGKRNL_PROVIDER, providers.dxgkrnl),
            (DXGI_PROVIDER, providers.dxgi),
            (DWM_PROVIDER, providers.dwm),
        ];
        let mut enabled = 0;
        for (name, guid) in wanted {
            let Some(guid) = guid else {
                log_warn!("{}", EtwError::ProviderNotFound(name.to_string()));
                continue;
            };
            match enable_provider(handle, name, guid) {
                Ok(()) => enabled += 1,
                Err(e) => log_warn!("{}", e),
            }
        }
        if enabled == 0 {
            let _ = control_stop(session_name);
            return Err(EtwError::ProviderNotFound(DXGI_PROVIDER.to_string()));
        }

        let mut name = wide(session_name);
        let mut logfile = EVENT_TRACE_LOGFILEW::default();
        logfile.LoggerName = PWSTR(name.as_mut_ptr());
        logfile.Anonymous1.ProcessTraceMode = PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
        logfile.Anonymous2.EventRecordCallback = Some(event_record_callback);
        logfile.BufferCallback = Some(buffer_callback);
        logfile.Context = Arc::as_ptr(engine) as *mut c_void;

        let consumer = unsafe { OpenTraceW(&mut logfile) };
        if consumer.Value == u64::MAX {
            let code = unsafe { GetLastError() }.0;
            let _ = control_stop(session_name);
            return Err(EtwError::OpenTrace(code));
        }
        *self.consumer.lock() = Some(consumer);

        engine.mark_running();
        log_info!("ETW session {} consuming ({} providers)", session_name, enabled);

        // Blocks until the session stops or the buffer callback declines.
        let status = unsafe { ProcessTrace(&[consumer], None, None) };

        if let Some(consumer) = self.consumer.lock().take() {
            unsafe {
                let _ = CloseTrace(consumer);
            }
        }
        let _ = control_stop(session_name);

        match status {
            ERROR_SUCCESS | ERROR_CANCELLED => Ok(()),
            other if engine.stop_requested() => {
                log_debug!("ProcessTrace ended with {} during shutdown", other.0);
                Ok(())
            }
            other => {
                log_error!("ProcessTrace failed with {}", other.0);
                Err(EtwError::ProcessTrace(other.0))
            }
        }
    }

    fn stop_realtime(&self, session_name: &str) -> Result<(), EtwError> {
        if let Some(consumer) = self.consumer.lock().take() {
            unsafe {
                let _ = CloseTrace(consumer);
            }
        }
        control_stop(session_name)
    }

    fn is_process_alive(&self, pid: u32) -> bool {
        unsafe {
            let handle = match OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) {
                Ok(handle) => handle,
                // Access denied means the process exists under another user.
                Err(e) => return e.code() == ERROR_ACCESS_DENIED.to_hresult(),
            };
            let mut code = 0u32;
            let alive = GetExitCodeProcess(handle, &mut code).is_ok() && code == STILL_ACTIVE;
            let _ = CloseHandle(handle);
            alive
        }
    }
}
