//! Message definitions and payload decoding.
//!
//! Schemas come from the log container. Two payload encodings are decoded:
//!
//! - `protobuf`: the schema is a serialized `FileDescriptorSet` and the schema
//!   name is the fully qualified message name (the MCAP convention bubbaloop
//!   records with).
//! - `json`: payloads are JSON documents; a `jsonschema` schema is optional
//!   and only used to describe fields.

use prost_reflect::{DescriptorPool, DynamicMessage, Kind, MessageDescriptor, SerializeOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ReplayError, Result};
use crate::time::Time;

pub const ENCODING_PROTOBUF: &str = "protobuf";
pub const ENCODING_JSON: &str = "json";
pub const SCHEMA_ENCODING_JSONSCHEMA: &str = "jsonschema";

/// One field of a message definition, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub is_array: bool,
    pub is_complex: bool,
}

/// Schema for one datatype, built once per source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDefinition {
    pub name: String,
    /// Schema encoding as recorded (`protobuf`, `jsonschema`, ...).
    pub encoding: String,
    pub fields: Vec<FieldDefinition>,
    /// Raw schema bytes, kept so decoders can be rebuilt across the worker boundary.
    pub data: Vec<u8>,
}

impl MessageDefinition {
    /// Build a definition from a recorded schema, resolving its field list.
    pub fn from_schema(name: &str, encoding: &str, data: &[u8]) -> Result<Self> {
        let fields = match encoding {
            ENCODING_PROTOBUF => protobuf_fields(&protobuf_descriptor(name, data)?),
            SCHEMA_ENCODING_JSONSCHEMA => jsonschema_fields(data)?,
            _ => Vec::new(),
        };
        Ok(Self {
            name: name.to_string(),
            encoding: encoding.to_string(),
            fields,
            data: data.to_vec(),
        })
    }

    /// A definition whose fields could not be resolved.
    pub fn unresolved(name: &str, encoding: &str, data: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            encoding: encoding.to_string(),
            fields: Vec::new(),
            data: data.to_vec(),
        }
    }
}

fn protobuf_descriptor(name: &str, data: &[u8]) -> Result<MessageDescriptor> {
    let pool = DescriptorPool::decode(data)?;
    pool.get_message_by_name(name).ok_or_else(|| {
        ReplayError::Parse(format!("message '{name}' not found in descriptor set"))
    })
}

fn protobuf_fields(descriptor: &MessageDescriptor) -> Vec<FieldDefinition> {
    descriptor
        .fields()
        .map(|field| {
            let kind = field.kind();
            FieldDefinition {
                name: field.name().to_string(),
                type_name: kind_name(&kind),
                is_array: field.is_list(),
                is_complex: matches!(kind, Kind::Message(_)),
            }
        })
        .collect()
}

fn kind_name(kind: &Kind) -> String {
    match kind {
        Kind::Double => "double".into(),
        Kind::Float => "float".into(),
        Kind::Int32 => "int32".into(),
        Kind::Int64 => "int64".into(),
        Kind::Uint32 => "uint32".into(),
        Kind::Uint64 => "uint64".into(),
        Kind::Sint32 => "sint32".into(),
        Kind::Sint64 => "sint64".into(),
        Kind::Fixed32 => "fixed32".into(),
        Kind::Fixed64 => "fixed64".into(),
        Kind::Sfixed32 => "sfixed32".into(),
        Kind::Sfixed64 => "sfixed64".into(),
        Kind::Bool => "bool".into(),
        Kind::String => "string".into(),
        Kind::Bytes => "bytes".into(),
        Kind::Message(message) => message.full_name().to_string(),
        Kind::Enum(en) => en.full_name().to_string(),
    }
}

fn jsonschema_fields(data: &[u8]) -> Result<Vec<FieldDefinition>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let schema: Value = serde_json::from_slice(data)?;
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };
    Ok(properties
        .iter()
        .map(|(name, property)| {
            let type_name = property
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("object");
            let is_array = type_name == "array";
            let element = if is_array {
                property
                    .get("items")
                    .and_then(|items| items.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("object")
            } else {
                type_name
            };
            FieldDefinition {
                name: name.clone(),
                type_name: element.to_string(),
                is_array,
                is_complex: element == "object",
            }
        })
        .collect())
}

/// Decodes payloads of one datatype into JSON values.
#[derive(Debug, Clone)]
pub enum MessageDecoder {
    Protobuf(MessageDescriptor),
    Json,
}

impl MessageDecoder {
    /// Pick a decoder for a topic's message encoding.
    ///
    /// `definition` is required for `protobuf` and optional for `json`.
    pub fn new(message_encoding: &str, definition: Option<&MessageDefinition>) -> Result<Self> {
        match message_encoding {
            ENCODING_PROTOBUF => {
                let definition = definition.ok_or_else(|| {
                    ReplayError::Parse("protobuf topic without a schema".into())
                })?;
                Ok(MessageDecoder::Protobuf(protobuf_descriptor(
                    &definition.name,
                    &definition.data,
                )?))
            }
            ENCODING_JSON => Ok(MessageDecoder::Json),
            other => Err(ReplayError::Parse(format!(
                "unsupported message encoding '{other}'"
            ))),
        }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Value> {
        match self {
            MessageDecoder::Protobuf(descriptor) => {
                let message = DynamicMessage::decode(descriptor.clone(), payload)?;
                let options = SerializeOptions::new()
                    .use_proto_field_name(true)
                    .stringify_64_bit_integers(false)
                    .skip_default_fields(false);
                Ok(message.serialize_with_options(serde_json::value::Serializer, &options)?)
            }
            MessageDecoder::Json => Ok(serde_json::from_slice(payload)?),
        }
    }
}

/// Whether a message encoding needs a recorded schema to be decoded.
pub fn requires_schema(message_encoding: &str) -> bool {
    message_encoding != ENCODING_JSON
}

/// Extract the timestamp a message carries in its own header.
///
/// Looks at `header.stamp` (`sec` + `nsec`/`nanosec`), then the bubbaloop
/// `header.acq_time` nanosecond field, then the first marker of a marker array.
pub fn header_stamp(message: &Value) -> Option<Time> {
    if let Some(header) = message.get("header") {
        return header_time(header);
    }
    message
        .get("markers")
        .and_then(|markers| markers.get(0))
        .and_then(|marker| marker.get("header"))
        .and_then(header_time)
}

fn header_time(header: &Value) -> Option<Time> {
    if let Some(stamp) = header.get("stamp") {
        let sec = stamp.get("sec").and_then(as_u64)?;
        let nsec = stamp
            .get("nsec")
            .or_else(|| stamp.get("nanosec"))
            .and_then(as_u64)?;
        let sec = u32::try_from(sec).ok()?;
        return Some(Time::new(sec, nsec));
    }
    header
        .get("acq_time")
        .and_then(as_u64)
        .filter(|nanos| *nanos > 0)
        .map(Time::from_nanos)
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use prost_reflect::Value as ReflectValue;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    };
    use serde_json::json;

    fn field(
        name: &str,
        number: i32,
        ty: Type,
        type_name: Option<&str>,
        label: Label,
    ) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.into()),
            number: Some(number),
            label: Some(label as i32),
            r#type: Some(ty as i32),
            type_name: type_name.map(Into::into),
            ..Default::default()
        }
    }

    fn imu_descriptor_set() -> Vec<u8> {
        let file = FileDescriptorProto {
            name: Some("imu.proto".into()),
            package: Some("test".into()),
            syntax: Some("proto3".into()),
            message_type: vec![
                DescriptorProto {
                    name: Some("Stamp".into()),
                    field: vec![
                        field("sec", 1, Type::Uint32, None, Label::Optional),
                        field("nsec", 2, Type::Uint32, None, Label::Optional),
                    ],
                    ..Default::default()
                },
                DescriptorProto {
                    name: Some("Header".into()),
                    field: vec![field(
                        "stamp",
                        1,
                        Type::Message,
                        Some(".test.Stamp"),
                        Label::Optional,
                    )],
                    ..Default::default()
                },
                DescriptorProto {
                    name: Some("Imu".into()),
                    field: vec![
                        field("header", 1, Type::Message, Some(".test.Header"), Label::Optional),
                        field("accel", 2, Type::Double, None, Label::Repeated),
                    ],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        FileDescriptorSet { file: vec![file] }.encode_to_vec()
    }

    fn imu_payload(schema: &[u8]) -> Vec<u8> {
        let pool = DescriptorPool::decode(schema).unwrap();
        let mut stamp = DynamicMessage::new(pool.get_message_by_name("test.Stamp").unwrap());
        stamp.set_field_by_name("sec", ReflectValue::U32(7));
        stamp.set_field_by_name("nsec", ReflectValue::U32(5));
        let mut header = DynamicMessage::new(pool.get_message_by_name("test.Header").unwrap());
        header.set_field_by_name("stamp", ReflectValue::Message(stamp));
        let mut imu = DynamicMessage::new(pool.get_message_by_name("test.Imu").unwrap());
        imu.set_field_by_name("header", ReflectValue::Message(header));
        imu.set_field_by_name("accel", ReflectValue::List(vec![ReflectValue::F64(1.5)]));
        imu.encode_to_vec()
    }

    #[test]
    fn test_protobuf_definition_fields() {
        let schema = imu_descriptor_set();
        let def = MessageDefinition::from_schema("test.Imu", ENCODING_PROTOBUF, &schema).unwrap();
        assert_eq!(def.fields.len(), 2);
        assert_eq!(def.fields[0].name, "header");
        assert_eq!(def.fields[0].type_name, "test.Header");
        assert!(def.fields[0].is_complex);
        assert_eq!(def.fields[1].type_name, "double");
        assert!(def.fields[1].is_array);
    }

    #[test]
    fn test_protobuf_definition_unknown_message() {
        let schema = imu_descriptor_set();
        assert!(
            MessageDefinition::from_schema("test.Missing", ENCODING_PROTOBUF, &schema).is_err()
        );
    }

    #[test]
    fn test_protobuf_decode_and_header_stamp() {
        let schema = imu_descriptor_set();
        let def = MessageDefinition::from_schema("test.Imu", ENCODING_PROTOBUF, &schema).unwrap();
        let decoder = MessageDecoder::new(ENCODING_PROTOBUF, Some(&def)).unwrap();
        let value = decoder.decode(&imu_payload(&schema)).unwrap();
        assert_eq!(value["accel"], json!([1.5]));
        assert_eq!(header_stamp(&value), Some(Time::new(7, 5)));
    }

    #[test]
    fn test_protobuf_decode_rejects_garbage() {
        let schema = imu_descriptor_set();
        let def = MessageDefinition::from_schema("test.Imu", ENCODING_PROTOBUF, &schema).unwrap();
        let decoder = MessageDecoder::new(ENCODING_PROTOBUF, Some(&def)).unwrap();
        assert!(decoder.decode(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_jsonschema_fields() {
        let schema = br#"{"type":"object","properties":{"speed":{"type":"number"},"points":{"type":"array","items":{"type":"object"}}}}"#;
        let def =
            MessageDefinition::from_schema("Odom", SCHEMA_ENCODING_JSONSCHEMA, schema).unwrap();
        let points = def.fields.iter().find(|f| f.name == "points").unwrap();
        assert!(points.is_array);
        assert!(points.is_complex);
    }

    #[test]
    fn test_protobuf_requires_schema() {
        assert!(MessageDecoder::new(ENCODING_PROTOBUF, None).is_err());
        assert!(MessageDecoder::new(ENCODING_JSON, None).is_ok());
        assert!(MessageDecoder::new("cdr", None).is_err());
        assert!(requires_schema("cdr"));
        assert!(!requires_schema(ENCODING_JSON));
    }

    #[test]
    fn test_header_stamp_variants() {
        assert_eq!(
            header_stamp(&json!({"header": {"stamp": {"sec": 3, "nanosec": 9}}})),
            Some(Time::new(3, 9))
        );
        assert_eq!(
            header_stamp(&json!({"header": {"acq_time": 2_000_000_001u64}})),
            Some(Time::new(2, 1))
        );
        assert_eq!(
            header_stamp(&json!({"markers": [{"header": {"stamp": {"sec": 1, "nsec": 0}}}]})),
            Some(Time::new(1, 0))
        );
        assert_eq!(header_stamp(&json!({"header": {"acq_time": 0}})), None);
        assert_eq!(header_stamp(&json!({"data": 1})), None);
    }
}
