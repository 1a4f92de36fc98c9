//! # JSON <-> Protobuf Codec
//!
//! This module implements `tonic::codec::Codec` so that `tonic` can move `serde_json::Value`
//! over the wire directly, with no generated Rust structs involved.
//!
//! ## How it works
//!
//! 1. **Decoder (Proto -> JSON)**:
//!    - Reads raw bytes from the wire.
//!    - Decodes them into a `DynamicMessage` using the inbound `MessageDescriptor`.
//!    - Converts the message into a `serde_json::Value` according to [`JsonOptions`], so the
//!      matcher sees the same field names and enum representation that rule authors write.
//!    - Optionally names the set member of every oneof, e.g. `"target": "room"`.
//!
//! 2. **Encoder (JSON -> Proto)**:
//!    - Takes a `serde_json::Value` produced by the synthesizer.
//!    - Deserializes it into a `DynamicMessage` of the outbound `MessageDescriptor`.
//!    - Writes the message into the gRPC byte buffer.
//!
//! On the server side the inbound message is the method input and the outbound message is
//! the method output. [`JsonCodec::client`] flips them, which is what a test client needs.
use prost::Message;
use prost_reflect::{
    DynamicMessage, FieldDescriptor, MapKey, MessageDescriptor, MethodDescriptor, ReflectMessage,
    SerializeOptions, Value as ReflectValue,
};
use serde_json::Value;
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// How decoded messages are rendered as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonOptions {
    /// Use the field names from the `.proto` file instead of lowerCamelCase.
    pub proto_field_names: bool,
    /// Render enum values as numbers instead of their names.
    pub enum_numbers: bool,
    /// Include fields that hold their default value.
    pub emit_defaults: bool,
    /// Add a property per oneof naming the field that is set in it.
    pub oneofs: bool,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            proto_field_names: true,
            enum_numbers: false,
            emit_defaults: true,
            oneofs: false,
        }
    }
}

impl JsonOptions {
    fn serialize_options(&self) -> SerializeOptions {
        SerializeOptions::new()
            .use_proto_field_name(self.proto_field_names)
            .use_enum_numbers(self.enum_numbers)
            .skip_default_fields(!self.emit_defaults)
    }
}

/// A Codec that bridges `serde_json::Value` and the Protobuf binary format.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    /// Schema of the messages we write.
    encode: MessageDescriptor,
    /// Schema of the messages we read.
    decode: MessageDescriptor,
    options: JsonOptions,
}

impl JsonCodec {
    /// Codec for answering calls to `method`: reads its input, writes its output.
    pub fn server(method: &MethodDescriptor, options: JsonOptions) -> Self {
        Self {
            encode: method.output(),
            decode: method.input(),
            options,
        }
    }

    /// Codec for issuing calls to `method`: writes its input, reads its output.
    pub fn client(method: &MethodDescriptor, options: JsonOptions) -> Self {
        Self {
            encode: method.input(),
            decode: method.output(),
            options,
        }
    }
}

impl Codec for JsonCodec {
    type Encode = Value;
    type Decode = Value;

    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder(self.encode.clone())
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder {
            desc: self.decode.clone(),
            options: self.options,
        }
    }
}

/// Encodes a JSON value into Protobuf bytes.
pub struct JsonEncoder(MessageDescriptor);

impl Encoder for JsonEncoder {
    type Item = Value;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        let msg = DynamicMessage::deserialize(self.0.clone(), item).map_err(|e| {
            Status::internal(format!(
                "Payload does not match message '{}': {}",
                self.0.full_name(),
                e
            ))
        })?;

        msg.encode_raw(dst);
        Ok(())
    }
}

/// Decodes Protobuf bytes into a JSON value.
pub struct JsonDecoder {
    desc: MessageDescriptor,
    options: JsonOptions,
}

impl Decoder for JsonDecoder {
    type Item = Value;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let mut msg = DynamicMessage::new(self.desc.clone());
        msg.merge(src).map_err(|e| {
            Status::invalid_argument(format!(
                "Failed to decode '{}' from Protobuf bytes: {}",
                self.desc.full_name(),
                e
            ))
        })?;

        let mut value = msg
            .serialize_with_options(
                serde_json::value::Serializer,
                &self.options.serialize_options(),
            )
            .map_err(|e| Status::internal(format!("Failed to map message to JSON: {}", e)))?;

        if self.options.oneofs {
            name_oneofs(&msg, &mut value, self.options.proto_field_names);
        }

        Ok(Some(value))
    }
}

/// Adds `"<oneof>": "<field>"` for every oneof with a set field, in `msg` and every message
/// nested in it.
fn name_oneofs(msg: &DynamicMessage, json: &mut Value, proto_field_names: bool) {
    let descriptor = msg.descriptor();
    // Well-known types are not rendered as objects of their fields.
    if descriptor.package_name() == "google.protobuf" {
        return;
    }
    let Value::Object(fields) = json else {
        return;
    };

    let key = |field: &FieldDescriptor| match proto_field_names {
        true => field.name().to_string(),
        false => field.json_name().to_string(),
    };

    for oneof in descriptor.oneofs().filter(|oneof| !oneof.is_synthetic()) {
        if let Some(set) = oneof.fields().find(|field| msg.has_field(field)) {
            fields
                .entry(oneof.name())
                .or_insert_with(|| Value::String(key(&set)));
        }
    }

    for (field, value) in msg.fields() {
        let Some(json) = fields.get_mut(&key(&field)) else {
            continue;
        };

        match (value, json) {
            (ReflectValue::Message(nested), json) => name_oneofs(nested, json, proto_field_names),
            (ReflectValue::List(items), Value::Array(array)) => {
                for (item, json) in items.iter().zip(array) {
                    if let ReflectValue::Message(nested) = item {
                        name_oneofs(nested, json, proto_field_names);
                    }
                }
            }
            (ReflectValue::Map(entries), Value::Object(object)) => {
                for (map_key, item) in entries {
                    if let (ReflectValue::Message(nested), Some(json)) =
                        (item, object.get_mut(&map_key_string(map_key)))
                    {
                        name_oneofs(nested, json, proto_field_names);
                    }
                }
            }
            _ => {}
        }
    }
}

fn map_key_string(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(n) => n.to_string(),
        MapKey::I64(n) => n.to_string(),
        MapKey::U32(n) => n.to_string(),
        MapKey::U64(n) => n.to_string(),
        MapKey::String(s) => s.clone(),
    }
}
