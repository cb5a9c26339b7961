use display_commander::etw::schema::{in_type, PropertyInfo};
use display_commander::etw::{
    EtwEngine, EventDescriptor, EventRecordView, EventSchema, FlipMode, PropertyValue,
    ProviderClass, ProviderGuid, ProviderSet, UnsupportedBackend,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DWM: ProviderGuid = ProviderGuid(0x9e9bba3c_2e38_40cb_99f4_9e8281425164);
const DXGI: ProviderGuid = ProviderGuid(0xca11c036_0102_4a2d_a6ad_f03cfed5d3c9);

struct Record {
    provider: ProviderGuid,
    id: u16,
    task: u16,
    values: Vec<(&'static str, PropertyValue)>,
}

impl EventRecordView for Record {
    fn provider_id(&self) -> ProviderGuid {
        self.provider
    }

    fn descriptor(&self) -> EventDescriptor {
        EventDescriptor { id: self.id, task: self.task, ..Default::default() }
    }

    fn decode_schema(&self) -> Option<EventSchema> {
        Some(EventSchema {
            provider_name: "Microsoft-Windows-Dwm-Core".to_string(),
            event_name: format!("Event{}", self.id),
            task_name: String::new(),
            properties: self
                .values
                .iter()
                .map(|(name, value)| PropertyInfo {
                    name: name.to_string(),
                    in_type: match value {
                        PropertyValue::Text(_) => in_type::UNICODE_STRING,
                        _ => in_type::UINT64,
                    },
                })
                .collect(),
        })
    }

    fn property(&self, property: &PropertyInfo) -> Option<PropertyValue> {
        self.values
            .iter()
            .find(|(name, _)| *name == property.name)
            .map(|(_, v)| v.clone())
    }
}

fn engine() -> EtwEngine {
    let engine = EtwEngine::new("DC_PresentMon_1", Arc::new(UnsupportedBackend));
    engine.set_providers(ProviderSet { dxgkrnl: None, dxgi: Some(DXGI), dwm: Some(DWM) });
    engine
}

#[test]
fn dwm_stream_builds_surface_cache() {
    let engine = engine();
    let start = Instant::now();

    let compat = Record {
        provider: DWM,
        id: 291,
        task: 207,
        values: vec![
            ("surfaceLuid", PropertyValue::Unsigned(0x1234)),
            ("SurfaceWidth", PropertyValue::Unsigned(1920)),
            ("SurfaceHeight", PropertyValue::Unsigned(1080)),
            ("PixelFormat", PropertyValue::Unsigned(87)),
            ("IsOverlayCompatible", PropertyValue::Unsigned(1)),
            ("hwnd", PropertyValue::Unsigned(0xBEEF)),
        ],
    };
    engine.handle_event(&compat, start);

    let present = Record {
        provider: DXGI,
        id: 42,
        task: 3,
        values: vec![("PresentMode", PropertyValue::Text("Hardware: Independent Flip".to_string()))],
    };
    engine.handle_event(&present, start + Duration::from_millis(5));

    let surface = engine.surface(0x1234).unwrap();
    assert_eq!(surface.hwnd, Some(0xBEEF));
    let flags = surface.compat.unwrap();
    assert_eq!((flags.surface_width, flags.surface_height, flags.pixel_format), (1920, 1080, 87));
    assert_eq!(flags.best_path(), FlipMode::Overlay);

    assert_eq!(engine.flip_state().map(|f| f.mode), Some(FlipMode::IndependentFlip));
    assert_eq!(engine.counters().per_class[ProviderClass::Dwm as usize], 1);
    assert_eq!(engine.event_types().len(), 2);
    assert_eq!(engine.marker_history().len(), 2);
    assert!(engine.provider_debug(ProviderClass::Dxgi).unwrap().summary.contains("PresentMode="));
}
