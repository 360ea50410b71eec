use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use semver::Version;
use serde::Deserialize;
use tracing::debug;

use crate::error::CodecError;
use crate::message::Message;

/// Encodes and decodes structured messages against a versioned schema.
pub trait ProtocolCodec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<(u16, Vec<u8>), CodecError>;
    fn decode(&self, msg_type: u16, payload: &[u8]) -> Result<Message, CodecError>;
    /// Switches to the schema matching the connected firmware.
    fn select_schema(&self, firmware: &Version) -> Result<(), CodecError>;
}

/// Name <-> numeric id table for one firmware generation.
#[derive(Debug, Clone, Default)]
pub struct MessageSchema {
    by_name: HashMap<String, u16>,
    by_id: HashMap<u16, String>,
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    min_firmware: Option<Version>,
    messages: HashMap<String, u16>,
}

impl MessageSchema {
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u16)>,
        S: Into<String>,
    {
        let mut schema = Self::default();
        for (name, id) in pairs {
            let name = name.into();
            schema.by_id.insert(id, name.clone());
            schema.by_name.insert(name, id);
        }
        schema
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: u16) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Schemas keyed by the lowest firmware version they apply to.
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    entries: Vec<(Version, Arc<MessageSchema>)>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, min_firmware: Version, schema: MessageSchema) {
        self.entries.push((min_firmware, Arc::new(schema)));
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
    }

    /// Loads a schema file of the form
    /// `{"min_firmware": "4.0.0", "messages": {"Initialize": 0, ...}}`.
    pub fn load_file(&mut self, path: &Path) -> Result<(), std::io::Error> {
        let bytes = std::fs::read(path)?;
        let file: SchemaFile = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let min = file.min_firmware.unwrap_or_else(|| Version::new(0, 0, 0));
        self.insert(min, MessageSchema::from_pairs(file.messages));
        Ok(())
    }

    pub fn newest(&self) -> Option<Arc<MessageSchema>> {
        self.entries.last().map(|(_, schema)| schema.clone())
    }

    /// Newest schema whose minimum firmware is not above `firmware`.
    pub fn for_firmware(&self, firmware: &Version) -> Option<Arc<MessageSchema>> {
        self.entries
            .iter()
            .rev()
            .find(|(min, _)| min <= firmware)
            .map(|(_, schema)| schema.clone())
    }
}

/// Codec carrying message bodies as JSON bytes, typed by a schema id.
///
/// Used with the emulator and bridge style transports, which accept
/// JSON-described payloads next to the numeric message type.
pub struct JsonCodec {
    schemas: SchemaSet,
    active: RwLock<Option<Arc<MessageSchema>>>,
}

impl JsonCodec {
    pub fn new(schemas: SchemaSet) -> Self {
        let active = schemas.newest();
        Self {
            schemas,
            active: RwLock::new(active),
        }
    }

    fn schema(&self) -> Result<Arc<MessageSchema>, CodecError> {
        self.active
            .read()
            .clone()
            .ok_or_else(|| CodecError::NoSchema("none loaded".into()))
    }
}

impl ProtocolCodec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<(u16, Vec<u8>), CodecError> {
        let schema = self.schema()?;
        let id = schema
            .id_of(&message.name)
            .ok_or_else(|| CodecError::UnknownName(message.name.clone()))?;
        let payload = serde_json::to_vec(&message.body).map_err(|e| CodecError::Malformed {
            name: message.name.clone(),
            reason: e.to_string(),
        })?;
        Ok((id, payload))
    }

    fn decode(&self, msg_type: u16, payload: &[u8]) -> Result<Message, CodecError> {
        let schema = self.schema()?;
        let name = schema
            .name_of(msg_type)
            .ok_or(CodecError::UnknownId(msg_type))?
            .to_string();
        let body = if payload.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_slice(payload).map_err(|e| CodecError::Malformed {
                name: name.clone(),
                reason: e.to_string(),
            })?
        };
        Ok(Message { name, body })
    }

    fn select_schema(&self, firmware: &Version) -> Result<(), CodecError> {
        let schema = self
            .schemas
            .for_firmware(firmware)
            .ok_or_else(|| CodecError::NoSchema(firmware.to_string()))?;
        debug!(firmware = %firmware, messages = schema.len(), "codec schema selected");
        *self.active.write() = Some(schema);
        Ok(())
    }
}
