use super::hash_table::{fnv1a64, HashSlotTable};
use super::heuristics::{
    extract_flip_compatibility, flip_mode_from_text, is_flip_compat_event, is_interesting_property,
    FlipCompatibility, FlipMode, HWND_PROPERTIES, PRESENT_MODE_PROPERTIES, SURFACE_LUID_PROPERTIES,
};
use super::schema::{EventDescriptor, EventRecordView, EventSchema, PropertyValue, ProviderGuid};
use super::session::{close_orphaned_sessions, session_name, SessionControl, PRESENTMON_LABEL};
use crate::error::EtwError;
use crate::{log_debug, log_error, log_info, log_warn};
use arc_swap::{ArcSwap, ArcSwapOption};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DXGKRNL_PROVIDER: &str = "Microsoft-Windows-DxgKrnl";
pub const DXGI_PROVIDER: &str = "Microsoft-Windows-DXGI";
pub const DWM_PROVIDER: &str = "Microsoft-Windows-Dwm-Core";

pub const EVENT_TYPE_SLOTS: usize = 256;
pub const SURFACE_SLOTS: usize = 256;
pub const MARKER_HISTORY_LIMIT: usize = 100;

const SCHEMA_REFRESH_MS: u64 = 5_000;
const PROVIDER_DEBUG_INTERVAL_MS: u64 = 1_000;
const MAX_DEBUG_PROPERTIES: usize = 8;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const NEVER: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProviderClass {
    DxgKrnl = 0,
    Dxgi = 1,
    Dwm = 2,
    Other = 3,
}

impl ProviderClass {
    pub const ALL: [ProviderClass; 4] = [
        ProviderClass::DxgKrnl,
        ProviderClass::Dxgi,
        ProviderClass::Dwm,
        ProviderClass::Other,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProviderSet {
    pub dxgkrnl: Option<ProviderGuid>,
    pub dxgi: Option<ProviderGuid>,
    pub dwm: Option<ProviderGuid>,
}

impl ProviderSet {
    pub fn classify(&self, provider: ProviderGuid) -> ProviderClass {
        if self.dxgkrnl == Some(provider) {
            ProviderClass::DxgKrnl
        } else if self.dxgi == Some(provider) {
            ProviderClass::Dxgi
        } else if self.dwm == Some(provider) {
            ProviderClass::Dwm
        } else {
            ProviderClass::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EtwState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Failed = 4,
}

impl EtwState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EtwState::Starting,
            2 => EtwState::Running,
            3 => EtwState::Stopping,
            4 => EtwState::Failed,
            _ => EtwState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTypeId {
    pub provider: ProviderGuid,
    pub id: u16,
    pub task: u16,
    pub opcode: u8,
}

impl EventTypeId {
    pub fn key(&self) -> u64 {
        let mut bytes = [0u8; 21];
        bytes[..16].copy_from_slice(&self.provider.to_bytes());
        bytes[16..18].copy_from_slice(&self.id.to_le_bytes());
        bytes[18..20].copy_from_slice(&self.task.to_le_bytes());
        bytes[20] = self.opcode;
        fnv1a64(&bytes)
    }
}

#[derive(Default)]
struct EventTypeEntry {
    identity: OnceCell<EventTypeId>,
    count: AtomicU64,
    last_decode_ms: AtomicU64,
    schema: ArcSwapOption<EventSchema>,
}

#[derive(Debug, Clone)]
pub struct EventTypeSummary {
    pub id: EventTypeId,
    pub count: u64,
    pub schema: Option<Arc<EventSchema>>,
}

#[derive(Default)]
struct SurfaceEntry {
    luid: AtomicU64,
    hwnd: AtomicU64,
    compat: ArcSwapOption<FlipCompatibility>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceSummary {
    pub surface_luid: u64,
    pub hwnd: Option<u64>,
    pub compat: Option<FlipCompatibility>,
}

fn surface_key(luid: u64) -> u64 {
    fnv1a64(&luid.to_le_bytes())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDebug {
    pub class: ProviderClass,
    pub provider_name: String,
    pub event_name: String,
    pub descriptor: EventDescriptor,
    pub summary: String,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlipState {
    pub mode: FlipMode,
    pub property: &'static str,
    pub raw_value: String,
    pub class: ProviderClass,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMarker {
    pub at_ms: u64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EtwCounters {
    pub total: u64,
    pub per_class: [u64; 4],
    pub schema_decodes: u64,
    pub dropped_events: u64,
}

/// OS side of the engine: session control plus the blocking consumer.
pub trait TraceBackend: SessionControl {
    /// Creates the session, enables providers and blocks consuming records
    /// into `engine` until the session is stopped.
    fn run_realtime(&self, session_name: &str, engine: &Arc<EtwEngine>) -> Result<(), EtwError>;
    /// Stops the session `run_realtime` owns, unblocking it.
    fn stop_realtime(&self, session_name: &str) -> Result<(), EtwError>;
    fn is_process_alive(&self, pid: u32) -> bool;
}

#[derive(Default)]
struct WorkerThreads {
    worker: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
}

/// PresentMon-style ETW consumer.
///
/// Records arrive on the worker thread only; everything it publishes is an
/// atomic or an `ArcSwap` snapshot, so UI and monitoring threads read
/// without locking. The marker history is the one mutex-guarded buffer.
pub struct EtwEngine {
    session_name: String,
    backend: Arc<dyn TraceBackend>,
    epoch: Instant,
    state: AtomicU8,
    stop_requested: AtomicBool,
    last_error: ArcSwapOption<String>,
    providers: ArcSwap<ProviderSet>,
    events_total: AtomicU64,
    per_class: [AtomicU64; 4],
    schema_decodes: AtomicU64,
    dropped_events: AtomicU64,
    overflow_decode_ms: [AtomicU64; 4],
    event_types: HashSlotTable<EventTypeEntry>,
    surfaces: HashSlotTable<SurfaceEntry>,
    provider_debug: [ArcSwapOption<ProviderDebug>; 4],
    last_debug_ms: [AtomicU64; 4],
    flip_state: ArcSwapOption<FlipState>,
    flip_compat: ArcSwapOption<FlipCompatibility>,
    history: Mutex<VecDeque<HistoryMarker>>,
    threads: Mutex<WorkerThreads>,
}

impl EtwEngine {
    pub fn new(session_name: impl Into<String>, backend: Arc<dyn TraceBackend>) -> Self {
        Self {
            session_name: session_name.into(),
            backend,
            epoch: Instant::now(),
            state: AtomicU8::new(EtwState::Stopped as u8),
            stop_requested: AtomicBool::new(false),
            last_error: ArcSwapOption::empty(),
            providers: ArcSwap::from_pointee(ProviderSet::default()),
            events_total: AtomicU64::new(0),
            per_class: Default::default(),
            schema_decodes: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            overflow_decode_ms: [(); 4].map(|_| AtomicU64::new(NEVER)),
            event_types: HashSlotTable::new(EVENT_TYPE_SLOTS),
            surfaces: HashSlotTable::new(SURFACE_SLOTS),
            provider_debug: Default::default(),
            last_debug_ms: [(); 4].map(|_| AtomicU64::new(NEVER)),
            flip_state: ArcSwapOption::empty(),
            flip_compat: ArcSwapOption::empty(),
            history: Mutex::new(VecDeque::with_capacity(MARKER_HISTORY_LIMIT)),
            threads: Mutex::new(WorkerThreads::default()),
        }
    }

    /// Engine bound to `DC_PresentMon_<pid>`.
    pub fn for_current_process(backend: Arc<dyn TraceBackend>) -> Self {
        Self::new(session_name(PRESENTMON_LABEL, std::process::id()), backend)
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    // Gate for future conditional startup.
    pub fn is_needed(&self) -> bool {
        true
    }

    pub fn state(&self) -> EtwState {
        EtwState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EtwState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn mark_running(&self) {
        self.set_state(EtwState::Running);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<Arc<String>> {
        self.last_error.load_full()
    }

    fn fail(&self, error: EtwError) {
        log_error!("ETW session {}: {}", self.session_name, error);
        self.last_error.store(Some(Arc::new(error.to_string())));
        self.set_state(EtwState::Failed);
    }

    pub fn set_providers(&self, providers: ProviderSet) {
        self.providers.store(Arc::new(providers));
    }

    pub fn providers(&self) -> ProviderSet {
        **self.providers.load()
    }

    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    // ---- per-record pipeline -------------------------------------------

    pub fn handle_event<R: EventRecordView + ?Sized>(&self, record: &R, now: Instant) {
        let now_ms = self.elapsed_ms(now);
        let provider = record.provider_id();
        let descriptor = record.descriptor();
        let class = self.providers.load().classify(provider);

        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.per_class[class as usize].fetch_add(1, Ordering::Relaxed);

        let schema = self.schema_for(record, provider, &descriptor, class, now_ms);
        self.update_provider_debug(record, class, &descriptor, schema.as_deref(), now_ms);

        let Some(schema) = schema else {
            return;
        };

        self.update_flip_state(record, &schema, class, now_ms);

        if class == ProviderClass::Dwm {
            self.correlate_surface_hwnd(record, &schema);
            if is_flip_compat_event(&descriptor) {
                self.update_flip_compatibility(record, &schema, now_ms);
            }
        }
    }

    fn schema_for<R: EventRecordView + ?Sized>(
        &self,
        record: &R,
        provider: ProviderGuid,
        descriptor: &EventDescriptor,
        class: ProviderClass,
        now_ms: u64,
    ) -> Option<Arc<EventSchema>> {
        let id = EventTypeId {
            provider,
            id: descriptor.id,
            task: descriptor.task,
            opcode: descriptor.opcode,
        };

        let Some(entry) = self.event_types.get_or_insert(id.key()) else {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            // Table is full: only decode the providers we interpret, and at
            // most once per refresh window per provider.
            if class == ProviderClass::Other {
                return None;
            }
            let last = &self.overflow_decode_ms[class as usize];
            let previous = last.load(Ordering::Relaxed);
            if previous != NEVER && now_ms.saturating_sub(previous) < SCHEMA_REFRESH_MS {
                return None;
            }
            if last
                .compare_exchange(previous, now_ms, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }
            self.schema_decodes.fetch_add(1, Ordering::Relaxed);
            return record.decode_schema().map(Arc::new);
        };

        if entry.identity.get().is_none() {
            let _ = entry.identity.set(id);
            entry.last_decode_ms.store(NEVER, Ordering::Relaxed);
        }
        entry.count.fetch_add(1, Ordering::Relaxed);

        let cached = entry.schema.load_full();
        let last = entry.last_decode_ms.load(Ordering::Relaxed);
        if last != NEVER && now_ms.saturating_sub(last) < SCHEMA_REFRESH_MS {
            return cached;
        }

        entry.last_decode_ms.store(now_ms, Ordering::Relaxed);
        self.schema_decodes.fetch_add(1, Ordering::Relaxed);
        match record.decode_schema() {
            Some(schema) => {
                let schema = Arc::new(schema);
                entry.schema.store(Some(Arc::clone(&schema)));
                Some(schema)
            }
            None => cached,
        }
    }

    fn update_provider_debug<R: EventRecordView + ?Sized>(
        &self,
        record: &R,
        class: ProviderClass,
        descriptor: &EventDescriptor,
        schema: Option<&EventSchema>,
        now_ms: u64,
    ) {
        let last = &self.last_debug_ms[class as usize];
        let previous = last.load(Ordering::Relaxed);
        if previous != NEVER && now_ms.saturating_sub(previous) < PROVIDER_DEBUG_INTERVAL_MS {
            return;
        }
        last.store(now_ms, Ordering::Relaxed);

        let (provider_name, event_name, summary) = match schema {
            Some(schema) => {
                let summary = schema
                    .properties
                    .iter()
                    .filter(|p| is_interesting_property(&p.name))
                    .filter_map(|p| record.property(p).map(|v| format!("{}={}", p.name, v)))
                    .take(MAX_DEBUG_PROPERTIES)
                    .collect::<Vec<_>>()
                    .join(", ");
                (schema.provider_name.clone(), schema.event_name.clone(), summary)
            }
            None => (
                record.provider_id().to_string(),
                String::new(),
                "(schema unavailable)".to_string(),
            ),
        };

        self.provider_debug[class as usize].store(Some(Arc::new(ProviderDebug {
            class,
            provider_name,
            event_name,
            descriptor: *descriptor,
            summary,
            at_ms: now_ms,
        })));
    }

    fn update_flip_state<R: EventRecordView + ?Sized>(
        &self,
        record: &R,
        schema: &EventSchema,
        class: ProviderClass,
        now_ms: u64,
    ) {
        for name in PRESENT_MODE_PROPERTIES {
            let Some(info) = schema.property(name) else {
                continue;
            };
            let Some(PropertyValue::Text(raw)) = record.property(info) else {
                continue;
            };

            let mode = flip_mode_from_text(&raw);
            let changed = self
                .flip_state
                .load()
                .as_ref()
                .map_or(true, |prev| prev.mode != mode);
            if changed {
                self.push_marker(now_ms, format!("Flip mode: {} ({}={})", mode.label(), name, raw));
            }
            self.flip_state.store(Some(Arc::new(FlipState {
                mode,
                property: name,
                raw_value: raw,
                class,
                at_ms: now_ms,
            })));
            return;
        }
    }

    fn correlate_surface_hwnd<R: EventRecordView + ?Sized>(&self, record: &R, schema: &EventSchema) {
        let lookup = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| schema.property(name))
                .find_map(|info| record.property(info).and_then(|v| v.as_u64()))
        };

        let Some(luid) = lookup(&SURFACE_LUID_PROPERTIES[..]) else {
            return;
        };
        let Some(hwnd) = lookup(&HWND_PROPERTIES[..]) else {
            return;
        };
        if hwnd == 0 {
            return;
        }

        if let Some(entry) = self.surfaces.get_or_insert(surface_key(luid)) {
            entry.luid.store(luid, Ordering::Relaxed);
            if entry.hwnd.swap(hwnd, Ordering::Relaxed) != hwnd {
                log_debug!("Surface 0x{:X} associated with hwnd 0x{:X}", luid, hwnd);
            }
        }
    }

    fn update_flip_compatibility<R: EventRecordView + ?Sized>(
        &self,
        record: &R,
        schema: &EventSchema,
        now_ms: u64,
    ) {
        let compat = extract_flip_compatibility(
            |name| schema.property(name).and_then(|info| record.property(info)),
            now_ms,
        );
        let Some(compat) = compat else {
            return;
        };

        self.flip_compat.store(Some(Arc::new(compat)));

        if let Some(entry) = self.surfaces.get_or_insert(surface_key(compat.surface_luid)) {
            entry.luid.store(compat.surface_luid, Ordering::Relaxed);
            let changed = entry
                .compat
                .load()
                .as_ref()
                .map_or(true, |prev| !prev.same_flags(&compat));
            entry.compat.store(Some(Arc::new(compat)));
            if changed {
                self.push_marker(
                    now_ms,
                    format!(
                        "Surface 0x{:X} {}x{}: {} (direct={}, advanced={}, overlay={}, overlay_required={})",
                        compat.surface_luid,
                        compat.surface_width,
                        compat.surface_height,
                        compat.best_path().label(),
                        compat.is_direct_flip_compatible,
                        compat.is_advanced_direct_flip_compatible,
                        compat.is_overlay_compatible,
                        compat.is_overlay_required,
                    ),
                );
            }
        }
    }

    fn push_marker(&self, at_ms: u64, text: String) {
        let mut history = self.history.lock();
        if history.len() >= MARKER_HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(HistoryMarker { at_ms, text });
    }

    // ---- published results ---------------------------------------------

    pub fn flip_state(&self) -> Option<Arc<FlipState>> {
        self.flip_state.load_full()
    }

    pub fn flip_compatibility(&self) -> Option<Arc<FlipCompatibility>> {
        self.flip_compat.load_full()
    }

    pub fn provider_debug(&self, class: ProviderClass) -> Option<Arc<ProviderDebug>> {
        self.provider_debug[class as usize].load_full()
    }

    pub fn marker_history(&self) -> Vec<HistoryMarker> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn counters(&self) -> EtwCounters {
        EtwCounters {
            total: self.events_total.load(Ordering::Relaxed),
            per_class: [0, 1, 2, 3].map(|i| self.per_class[i].load(Ordering::Relaxed)),
            schema_decodes: self.schema_decodes.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }

    pub fn event_type(&self, id: &EventTypeId) -> Option<EventTypeSummary> {
        let entry = self.event_types.get(id.key())?;
        Some(EventTypeSummary {
            id: *entry.identity.get()?,
            count: entry.count.load(Ordering::Relaxed),
            schema: entry.schema.load_full(),
        })
    }

    /// Histogram of seen event types, most frequent first.
    pub fn event_types(&self) -> Vec<EventTypeSummary> {
        let mut types: Vec<EventTypeSummary> = self
            .event_types
            .iter()
            .filter_map(|(_, entry)| {
                Some(EventTypeSummary {
                    id: *entry.identity.get()?,
                    count: entry.count.load(Ordering::Relaxed),
                    schema: entry.schema.load_full(),
                })
            })
            .collect();
        types.sort_by(|a, b| b.count.cmp(&a.count));
        types
    }

    fn surface_summary(entry: &SurfaceEntry) -> SurfaceSummary {
        let hwnd = entry.hwnd.load(Ordering::Relaxed);
        SurfaceSummary {
            surface_luid: entry.luid.load(Ordering::Relaxed),
            hwnd: (hwnd != 0).then_some(hwnd),
            compat: entry.compat.load().as_deref().copied(),
        }
    }

    pub fn surface(&self, luid: u64) -> Option<SurfaceSummary> {
        self.surfaces.get(surface_key(luid)).map(Self::surface_summary)
    }

    pub fn surfaces(&self) -> Vec<SurfaceSummary> {
        self.surfaces
            .iter()
            .map(|(_, entry)| Self::surface_summary(entry))
            .collect()
    }

    // ---- lifecycle -----------------------------------------------------

    /// Reaps orphaned sessions, then starts the consumer and cleanup threads.
    pub fn start_worker(self: &Arc<Self>) -> Result<(), EtwError> {
        if !self.is_needed() {
            return Ok(());
        }

        let mut threads = self.threads.lock();
        if threads.worker.is_some() {
            return Ok(());
        }

        self.stop_requested.store(false, Ordering::Release);
        self.last_error.store(None);
        self.set_state(EtwState::Starting);

        let backend = Arc::clone(&self.backend);
        close_orphaned_sessions(&*backend, |pid| backend.is_process_alive(pid));

        let engine = Arc::clone(self);
        let worker = thread::Builder::new()
            .name("dc-etw-worker".to_string())
            .spawn(move || engine.run_worker());
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                log_error!("Failed to spawn ETW worker thread: {}", e);
                self.fail(EtwError::ThreadSpawn("ETW worker"));
                return Err(EtwError::ThreadSpawn("ETW worker"));
            }
        };

        let engine = Arc::clone(self);
        let cleanup = thread::Builder::new()
            .name("dc-etw-cleanup".to_string())
            .spawn(move || engine.run_cleanup());
        if let Err(e) = &cleanup {
            log_warn!("Failed to spawn ETW cleanup thread: {}", e);
        }

        threads.worker = Some(worker);
        threads.cleanup = cleanup.ok();
        log_info!("ETW worker started for session {}", self.session_name);
        Ok(())
    }

    fn run_worker(self: Arc<Self>) {
        let result = self.backend.run_realtime(&self.session_name, &self);
        match result {
            Ok(()) => {
                log_info!("ETW session {} finished", self.session_name);
                self.set_state(EtwState::Stopped);
            }
            Err(_) if self.stop_requested() => self.set_state(EtwState::Stopped),
            Err(e) => self.fail(e),
        }
    }

    fn run_cleanup(self: Arc<Self>) {
        let slice = Duration::from_millis(100);
        loop {
            let mut waited = Duration::ZERO;
            while waited < CLEANUP_INTERVAL {
                if self.stop_requested()
                    || matches!(self.state(), EtwState::Failed | EtwState::Stopped)
                {
                    return;
                }
                thread::sleep(slice);
                waited += slice;
            }
            close_orphaned_sessions(&*self.backend, |pid| self.backend.is_process_alive(pid));
        }
    }

    pub fn stop_worker(&self) {
        let (worker, cleanup) = {
            let mut threads = self.threads.lock();
            (threads.worker.take(), threads.cleanup.take())
        };
        if worker.is_none() && cleanup.is_none() {
            return;
        }

        self.stop_requested.store(true, Ordering::Release);
        if self.state() != EtwState::Failed {
            self.set_state(EtwState::Stopping);
        }

        if let Err(e) = self.backend.stop_realtime(&self.session_name) {
            log_warn!("Stopping ETW session {} failed: {}", self.session_name, e);
        }

        let worker_done = join_with_timeout(worker, "ETW worker");
        join_with_timeout(cleanup, "ETW cleanup");

        if !worker_done {
            // Last resort: the consumer never unblocked, stop by name.
            if let Err(e) = self.backend.stop_session(&self.session_name) {
                log_warn!("Stopping ETW session {} by name failed: {}", self.session_name, e);
            }
        }

        if self.state() != EtwState::Failed {
            self.set_state(EtwState::Stopped);
        }
        log_info!("ETW worker stopped");
    }
}

impl Drop for EtwEngine {
    fn drop(&mut self) {
        let threads = self.threads.get_mut();
        if threads.worker.is_some() || threads.cleanup.is_some() {
            self.stop_requested.store(true, Ordering::Release);
            let _ = self.backend.stop_realtime(&self.session_name);
        }
    }
}

/// Waits up to two seconds, then detaches instead of blocking on a thread
/// that may be stuck inside the OS.
fn join_with_timeout(handle: Option<JoinHandle<()>>, label: &str) -> bool {
    let Some(handle) = handle else {
        return true;
    };

    let step = Duration::from_millis(20);
    let mut waited = Duration::ZERO;
    while waited < JOIN_TIMEOUT {
        if handle.is_finished() {
            let _ = handle.join();
            return true;
        }
        thread::sleep(step);
        waited += step;
    }

    log_warn!("{} thread did not exit within {:?}; detaching", label, JOIN_TIMEOUT);
    false
}
