//! The message model shared by telemetry and cloud-to-device traffic.

use crate::error::ClientError;

/// What the application decided to do with a received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    Rejected,
    Abandoned,
}

/// The kind of payload a [`Message`] carries. Fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyKind {
    Binary,
    Text,
}

#[derive(Clone, Debug)]
enum Body {
    Binary(Vec<u8>),
    Text(String),
}

/// Application properties of a message: an ordered map of unique string
/// keys to string values. Values are copied in and out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Properties::default()
    }

    /// Inserts `key`, replacing the value of an existing entry with the
    /// same key.
    pub fn add_or_update(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Named system-property slots carried next to the payload.
#[derive(Clone, Debug, Default)]
pub struct SystemProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub output_name: Option<String>,
    pub input_name: Option<String>,
    pub component_name: Option<String>,
}

/// A unit of telemetry or cloud-to-device payload.
///
/// The body is either opaque bytes or UTF-8 text; the kind is immutable
/// after creation and the typed accessors fail on a mismatch. Cloning
/// yields a fully independent message: equal body bytes, equal system
/// properties and a deep copy of the application-property map.
#[derive(Clone, Debug)]
pub struct Message {
    body: Body,
    system: SystemProperties,
    properties: Properties,
    disposition: Option<Disposition>,
}

impl Message {
    pub fn from_binary(payload: impl Into<Vec<u8>>) -> Self {
        Message {
            body: Body::Binary(payload.into()),
            system: SystemProperties::default(),
            properties: Properties::new(),
            disposition: None,
        }
    }

    pub fn from_text(payload: impl Into<String>) -> Self {
        Message {
            body: Body::Text(payload.into()),
            system: SystemProperties::default(),
            properties: Properties::new(),
            disposition: None,
        }
    }

    pub fn body_kind(&self) -> BodyKind {
        match self.body {
            Body::Binary(_) => BodyKind::Binary,
            Body::Text(_) => BodyKind::Text,
        }
    }

    /// Returns the byte payload, failing on a text-bodied message.
    pub fn binary(&self) -> Result<&[u8], ClientError> {
        match &self.body {
            Body::Binary(bytes) => Ok(bytes),
            Body::Text(_) => Err(ClientError::InvalidArg(
                "message body is text, not a byte array",
            )),
        }
    }

    /// Returns the text payload, failing on a binary-bodied message.
    pub fn text(&self) -> Result<&str, ClientError> {
        match &self.body {
            Body::Text(text) => Ok(text),
            Body::Binary(_) => Err(ClientError::InvalidArg(
                "message body is a byte array, not text",
            )),
        }
    }

    /// The payload length in bytes, independent of the body kind.
    pub fn body_len(&self) -> usize {
        match &self.body {
            Body::Binary(bytes) => bytes.len(),
            Body::Text(text) => text.len(),
        }
    }

    pub fn system_properties(&self) -> &SystemProperties {
        &self.system
    }

    pub fn system_properties_mut(&mut self) -> &mut SystemProperties {
        &mut self.system
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn disposition(&self) -> Option<Disposition> {
        self.disposition
    }

    pub fn set_disposition(&mut self, disposition: Disposition) {
        self.disposition = Some(disposition);
    }
}
