//! Builders for the JSON payloads of reported-property and
//! writable-response updates.
//!
//! Property values are pre-formed JSON literals supplied by the caller;
//! the builders assemble the envelope without re-encoding them. When a
//! component name is given, the `"__t":"c"` marker is emitted as the
//! first member of the component object, which is how the hub recognizes
//! the object as a component.

use crate::error::ClientError;

/// Schema tag accepted by the serializers.
pub const PROPERTY_SCHEMA_V1: u32 = 1;

/// A reported property: a name and a pre-formed JSON value.
#[derive(Clone, Copy, Debug)]
pub struct ReportedProperty<'a> {
    pub schema: u32,
    pub name: &'a str,
    /// A well-formed JSON literal, for example `22` or `"ok"`.
    pub value: &'a str,
}

impl<'a> ReportedProperty<'a> {
    pub fn new(name: &'a str, value: &'a str) -> Self {
        ReportedProperty {
            schema: PROPERTY_SCHEMA_V1,
            name,
            value,
        }
    }
}

/// The acknowledgement of a writable property: echoes the value together
/// with a result code and the version being acknowledged.
#[derive(Clone, Copy, Debug)]
pub struct WritableResponseProperty<'a> {
    pub schema: u32,
    pub name: &'a str,
    /// A well-formed JSON literal.
    pub value: &'a str,
    /// Result code for the acknowledgement, HTTP-style.
    pub ack_code: i32,
    /// The desired-properties version this acknowledgement refers to.
    pub ack_version: i32,
    /// Optional human-readable description.
    pub description: Option<&'a str>,
}

impl<'a> WritableResponseProperty<'a> {
    pub fn new(name: &'a str, value: &'a str, ack_code: i32, ack_version: i32) -> Self {
        WritableResponseProperty {
            schema: PROPERTY_SCHEMA_V1,
            name,
            value,
            ack_code,
            ack_version,
            description: None,
        }
    }

    pub fn with_description(mut self, description: &'a str) -> Self {
        self.description = Some(description);
        self
    }
}

/// Serializes reported properties, optionally nested in a component.
///
/// Without a component: `{"name":value,…}`. With component `C`:
/// `{"C":{"__t":"c","name":value,…}}`.
pub fn serialize_reported(
    properties: &[ReportedProperty<'_>],
    component: Option<&str>,
) -> Result<String, ClientError> {
    validate_component(component)?;
    if properties.is_empty() {
        return Err(ClientError::InvalidArg("no properties to serialize"));
    }
    for property in properties {
        validate_schema(property.schema)?;
        if property.name.is_empty() {
            return Err(ClientError::InvalidArg("property name is empty"));
        }
        if property.value.is_empty() {
            return Err(ClientError::InvalidArg("property value is empty"));
        }
    }

    let mut output = open_envelope(component);
    for (index, property) in properties.iter().enumerate() {
        if index > 0 {
            output.push(',');
        }
        output.push_str(&format!("\"{}\":{}", property.name, property.value));
    }
    close_envelope(&mut output, component);

    Ok(output)
}

/// Serializes writable-response acknowledgements, optionally nested in a
/// component.
///
/// Per property: `"name":{"value":v,"ac":code,"av":version}` with
/// `,"ad":"description"` appended when a description is present.
pub fn serialize_writable_response(
    properties: &[WritableResponseProperty<'_>],
    component: Option<&str>,
) -> Result<String, ClientError> {
    validate_component(component)?;
    if properties.is_empty() {
        return Err(ClientError::InvalidArg("no properties to serialize"));
    }
    for property in properties {
        validate_schema(property.schema)?;
        if property.name.is_empty() {
            return Err(ClientError::InvalidArg("property name is empty"));
        }
        if property.value.is_empty() {
            return Err(ClientError::InvalidArg("property value is empty"));
        }
    }

    let mut output = open_envelope(component);
    for (index, property) in properties.iter().enumerate() {
        if index > 0 {
            output.push(',');
        }
        match property.description {
            None => output.push_str(&format!(
                "\"{}\":{{\"value\":{},\"ac\":{},\"av\":{}}}",
                property.name, property.value, property.ack_code, property.ack_version
            )),
            Some(description) => output.push_str(&format!(
                "\"{}\":{{\"value\":{},\"ac\":{},\"av\":{},\"ad\":\"{}\"}}",
                property.name,
                property.value,
                property.ack_code,
                property.ack_version,
                description
            )),
        }
    }
    close_envelope(&mut output, component);

    Ok(output)
}

fn validate_schema(schema: u32) -> Result<(), ClientError> {
    if schema != PROPERTY_SCHEMA_V1 {
        return Err(ClientError::InvalidArg("unrecognized property schema tag"));
    }
    Ok(())
}

fn validate_component(component: Option<&str>) -> Result<(), ClientError> {
    if component == Some("") {
        return Err(ClientError::InvalidArg("component name is empty"));
    }
    Ok(())
}

fn open_envelope(component: Option<&str>) -> String {
    match component {
        Some(component) => format!("{{\"{component}\":{{\"__t\":\"c\","),
        None => String::from("{"),
    }
}

fn close_envelope(output: &mut String, component: Option<&str>) {
    output.push('}');
    if component.is_some() {
        output.push('}');
    }
}
