//! Serialization and deserialization of twin properties: reported and
//! writable-response updates going up, full-twin documents and desired
//! patches coming down.

mod de;
mod ser;

pub use de::PropertyIterator;
pub use ser::{
    serialize_reported, serialize_writable_response, ReportedProperty, WritableResponseProperty,
    PROPERTY_SCHEMA_V1,
};

/// Which half of the twin a parsed property came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyOrigin {
    /// A desired property the device is expected to act on.
    Writable,
    /// A reported property previously published by the device itself.
    ReportedFromClient,
}

/// The value of a parsed property.
///
/// Only the JSON variant is produced today; the enum is non-exhaustive so
/// a binary variant can be introduced without breaking callers.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    /// The JSON serialization of the value, for example `22` or `"ok"`.
    Json(String),
}

impl PropertyValue {
    pub fn as_json(&self) -> &str {
        match self {
            PropertyValue::Json(json) => json,
        }
    }
}

/// One property produced by [`PropertyIterator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    pub origin: PropertyOrigin,
    /// The component the property belongs to, or `None` for a root-level
    /// property.
    pub component: Option<String>,
    pub name: String,
    pub value: PropertyValue,
}
