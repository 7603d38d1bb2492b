//! # JSON <-> Protobuf Marshaller
//!
//! Lets callers exchange `serde_json::Value`s with a protobuf peer without generated types.
//!
//! 1. **Serialize (JSON -> Proto)**: the value is validated against the message descriptor through
//!    `prost_reflect::DynamicMessage` and encoded to protobuf bytes.
//! 2. **Deserialize (Proto -> JSON)**: bytes are decoded into a `DynamicMessage` and converted back
//!    into a `serde_json::Value`.
use super::{MarshalError, Marshaller};
use bytes::Bytes;
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor};

/// Bridges `serde_json::Value` and the protobuf binary format of a single message type.
#[derive(Debug, Clone)]
pub struct JsonMarshaller {
    descriptor: MessageDescriptor,
}

impl JsonMarshaller {
    pub fn new(descriptor: MessageDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }
}

impl Marshaller<serde_json::Value> for JsonMarshaller {
    fn serialize(&self, value: &serde_json::Value) -> Result<Bytes, MarshalError> {
        let msg = DynamicMessage::deserialize(self.descriptor.clone(), value).map_err(|e| {
            MarshalError::Encode(format!(
                "JSON structure does not match Protobuf schema: {}",
                e
            ))
        })?;

        Ok(Bytes::from(msg.encode_to_vec()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, MarshalError> {
        let msg = DynamicMessage::decode(self.descriptor.clone(), bytes)
            .map_err(|e| MarshalError::Decode(format!("Failed to decode Protobuf bytes: {}", e)))?;

        serde_json::to_value(&msg)
            .map_err(|e| MarshalError::Decode(format!("Failed to map message to JSON: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
        field_descriptor_proto::{Label, Type},
    };

    fn echo_request() -> MessageDescriptor {
        let file = FileDescriptorProto {
            name: Some("echo.proto".into()),
            package: Some("echo".into()),
            syntax: Some("proto3".into()),
            message_type: vec![DescriptorProto {
                name: Some("EchoRequest".into()),
                field: vec![FieldDescriptorProto {
                    name: Some("message".into()),
                    number: Some(1),
                    label: Some(Label::Optional as i32),
                    r#type: Some(Type::String as i32),
                    json_name: Some("message".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })
            .expect("valid descriptor set")
            .get_message_by_name("echo.EchoRequest")
            .expect("message is part of the pool")
    }

    #[test]
    fn transcodes_json_through_protobuf() {
        let marshaller = JsonMarshaller::new(echo_request());
        let value = serde_json::json!({ "message": "hello" });

        let bytes = marshaller.serialize(&value).unwrap();
        // Field 1, wire type 2, length 5.
        assert_eq!(&bytes[..2], &[0x0a, 0x05]);
        assert_eq!(marshaller.deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn rejects_json_that_does_not_match_the_schema() {
        let marshaller = JsonMarshaller::new(echo_request());
        let value = serde_json::json!({ "unknown": 1 });

        assert!(matches!(
            marshaller.serialize(&value),
            Err(MarshalError::Encode(_))
        ));
    }
}
