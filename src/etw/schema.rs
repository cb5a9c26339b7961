// Runtime-decoded event schemas and the record seam the engine consumes
use std::fmt;

/// Provider GUID as a single 128-bit value (`GUID::to_u128` layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProviderGuid(pub u128);

impl ProviderGuid {
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for ProviderGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:04X}-{:012X}}}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventDescriptor {
    pub id: u16,
    pub version: u8,
    pub opcode: u8,
    pub task: u16,
    pub level: u8,
    pub keyword: u64,
}

/// TDH input types the decoder understands.
pub mod in_type {
    pub const UNICODE_STRING: u16 = 1;
    pub const ANSI_STRING: u16 = 2;
    pub const INT8: u16 = 3;
    pub const UINT8: u16 = 4;
    pub const INT16: u16 = 5;
    pub const UINT16: u16 = 6;
    pub const INT32: u16 = 7;
    pub const UINT32: u16 = 8;
    pub const INT64: u16 = 9;
    pub const UINT64: u16 = 10;
    pub const FLOAT: u16 = 11;
    pub const DOUBLE: u16 = 12;
    pub const BOOLEAN: u16 = 13;
    pub const BINARY: u16 = 14;
    pub const GUID: u16 = 15;
    pub const POINTER: u16 = 16;
    pub const FILETIME: u16 = 17;
    pub const HEXINT32: u16 = 20;
    pub const HEXINT64: u16 = 21;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    pub in_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventSchema {
    pub provider_name: String,
    pub event_name: String,
    pub task_name: String,
    pub properties: Vec<PropertyInfo>,
}

impl EventSchema {
    pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::Unsigned(v) => Some(*v),
            PropertyValue::Signed(v) => Some(*v as u64),
            PropertyValue::Bool(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            PropertyValue::Unsigned(v) => Some(*v != 0),
            PropertyValue::Signed(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Unsigned(v) => write!(f, "{}", v),
            PropertyValue::Signed(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{:.3}", v),
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Text(s) => f.write_str(s),
            PropertyValue::Bytes(b) => {
                f.write_str("0x")?;
                for byte in b.iter().take(16) {
                    write!(f, "{:02X}", byte)?;
                }
                if b.len() > 16 {
                    f.write_str("..")?;
                }
                Ok(())
            }
        }
    }
}

/// Interprets raw TDH property bytes for a given input type.
pub fn decode_property_bytes(in_type: u16, bytes: &[u8]) -> PropertyValue {
    fn le<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
        bytes.get(..N).and_then(|b| b.try_into().ok())
    }

    let decoded = match in_type {
        in_type::UNICODE_STRING => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .take_while(|&u| u != 0)
                .collect();
            Some(PropertyValue::Text(String::from_utf16_lossy(&units)))
        }
        in_type::ANSI_STRING => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            Some(PropertyValue::Text(String::from_utf8_lossy(&bytes[..end]).into_owned()))
        }
        in_type::INT8 => le::<1>(bytes).map(|b| PropertyValue::Signed(i8::from_le_bytes(b) as i64)),
        in_type::UINT8 => le::<1>(bytes).map(|b| PropertyValue::Unsigned(b[0] as u64)),
        in_type::INT16 => le::<2>(bytes).map(|b| PropertyValue::Signed(i16::from_le_bytes(b) as i64)),
        in_type::UINT16 => le::<2>(bytes).map(|b| PropertyValue::Unsigned(u16::from_le_bytes(b) as u64)),
        in_type::INT32 => le::<4>(bytes).map(|b| PropertyValue::Signed(i32::from_le_bytes(b) as i64)),
        in_type::UINT32 | in_type::HEXINT32 => {
            le::<4>(bytes).map(|b| PropertyValue::Unsigned(u32::from_le_bytes(b) as u64))
        }
        in_type::INT64 => le::<8>(bytes).map(|b| PropertyValue::Signed(i64::from_le_bytes(b))),
        in_type::UINT64 | in_type::HEXINT64 | in_type::FILETIME => {
            le::<8>(bytes).map(|b| PropertyValue::Unsigned(u64::from_le_bytes(b)))
        }
        in_type::FLOAT => le::<4>(bytes).map(|b| PropertyValue::Float(f32::from_le_bytes(b) as f64)),
        in_type::DOUBLE => le::<8>(bytes).map(|b| PropertyValue::Float(f64::from_le_bytes(b))),
        // TDH booleans are 32-bit
        in_type::BOOLEAN => le::<4>(bytes).map(|b| PropertyValue::Bool(u32::from_le_bytes(b) != 0)),
        in_type::POINTER => match bytes.len() {
            4 => le::<4>(bytes).map(|b| PropertyValue::Unsigned(u32::from_le_bytes(b) as u64)),
            _ => le::<8>(bytes).map(|b| PropertyValue::Unsigned(u64::from_le_bytes(b))),
        },
        _ => None,
    };

    decoded.unwrap_or_else(|| PropertyValue::Bytes(bytes.to_vec()))
}

/// One arriving trace record.
///
/// Decoding is lazy: the engine asks for the schema only when its cache
/// entry is missing or stale, and for individual properties by name.
pub trait EventRecordView {
    fn provider_id(&self) -> ProviderGuid;
    fn descriptor(&self) -> EventDescriptor;
    fn decode_schema(&self) -> Option<EventSchema>;
    fn property(&self, property: &PropertyInfo) -> Option<PropertyValue>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;

    /// In-memory record used by engine tests.
    pub(crate) struct FakeRecord {
        pub provider: ProviderGuid,
        pub descriptor: EventDescriptor,
        pub schema: EventSchema,
        pub values: Vec<(String, PropertyValue)>,
        pub decodes: Cell<u32>,
    }

    impl FakeRecord {
        pub(crate) fn new(provider: ProviderGuid, id: u16, task: u16) -> Self {
            Self {
                provider,
                descriptor: EventDescriptor { id, task, ..Default::default() },
                schema: EventSchema {
                    provider_name: "Fake-Provider".to_string(),
                    event_name: format!("Event{}", id),
                    ..Default::default()
                },
                values: Vec::new(),
                decodes: Cell::new(0),
            }
        }

        pub(crate) fn with(mut self, name: &str, value: PropertyValue) -> Self {
            let in_type = match &value {
                PropertyValue::Text(_) => in_type::UNICODE_STRING,
                PropertyValue::Bool(_) => in_type::BOOLEAN,
                PropertyValue::Signed(_) => in_type::INT64,
                PropertyValue::Float(_) => in_type::DOUBLE,
                PropertyValue::Bytes(_) => in_type::BINARY,
                PropertyValue::Unsigned(_) => in_type::UINT64,
            };
            self.schema.properties.push(PropertyInfo { name: name.to_string(), in_type });
            self.values.push((name.to_string(), value));
            self
        }
    }

    impl EventRecordView for FakeRecord {
        fn provider_id(&self) -> ProviderGuid {
            self.provider
        }

        fn descriptor(&self) -> EventDescriptor {
            self.descriptor
        }

        fn decode_schema(&self) -> Option<EventSchema> {
            self.decodes.set(self.decodes.get() + 1);
            Some(self.schema.clone())
        }

        fn property(&self, property: &PropertyInfo) -> Option<PropertyValue> {
            self.values
                .iter()
                .find(|(name, _)| *name == property.name)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn decodes_common_in_types() {
        let wide: Vec<u8> = "Composed\0x".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        assert_eq!(
            decode_property_bytes(in_type::UNICODE_STRING, &wide),
            PropertyValue::Text("Composed".to_string())
        );
        assert_eq!(
            decode_property_bytes(in_type::BOOLEAN, &1u32.to_le_bytes()),
            PropertyValue::Bool(true)
        );
        assert_eq!(
            decode_property_bytes(in_type::INT16, &(-2i16).to_le_bytes()),
            PropertyValue::Signed(-2)
        );
        assert_eq!(
            decode_property_bytes(in_type::POINTER, &0xABCDu32.to_le_bytes()),
            PropertyValue::Unsigned(0xABCD)
        );
        // Truncated payloads stay raw instead of failing
        assert_eq!(
            decode_property_bytes(in_type::UINT64, &[1, 2]),
            PropertyValue::Bytes(vec![1, 2])
        );
    }

    #[test]
    fn guid_display_is_registry_format() {
        let guid = ProviderGuid(0x802ec45a_1e99_4b83_9920_87c98277ba9d);
        assert_eq!(guid.to_string(), "{802EC45A-1E99-4B83-9920-87C98277BA9D}");
    }
}
