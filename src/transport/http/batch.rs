//! Assembly of batched event payloads.
//!
//! A batch is a JSON array in which every element mirrors one queued
//! message: byte-array bodies travel base64-encoded, text bodies travel
//! as JSON strings marked `"base64Encoded":false`, and application
//! properties are prefixed with `iothub-app-`.

use std::collections::VecDeque;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::message::{BodyKind, Message};
use crate::transport::SendRequest;

/// Hard cap on a request payload, batched or not.
pub(crate) const MAXIMUM_MESSAGE_SIZE: usize = 255 * 1024 - 1;
/// Fixed per-message contribution to the size accounting.
const MAXIMUM_PAYLOAD_OVERHEAD: usize = 384;
/// Per-property contribution on top of name and value lengths.
const MAXIMUM_PROPERTY_OVERHEAD: usize = 16;

pub(crate) const IOTHUB_APP_PREFIX: &str = "iothub-app-";

/// Size a message counts for against [`MAXIMUM_MESSAGE_SIZE`].
pub(crate) fn message_size(message: &Message) -> usize {
    let mut size = message.body_len() + MAXIMUM_PAYLOAD_OVERHEAD;
    for (name, value) in message.properties().iter() {
        size += name.len() + value.len() + MAXIMUM_PROPERTY_OVERHEAD;
    }
    size
}

pub(crate) enum BatchOutcome {
    /// Nothing queued.
    Empty,
    /// The first queued item alone exceeds the cap; it has been dequeued
    /// and must complete with an error.
    OversizedFirst(SendRequest),
    /// A batch was assembled from the queue head; later items stay
    /// queued.
    Batch {
        body: Vec<u8>,
        requests: Vec<SendRequest>,
    },
}

/// Drains as many queued messages into one batch as the size cap allows.
pub(crate) fn build_batch(queue: &mut VecDeque<SendRequest>) -> BatchOutcome {
    let Some(first) = queue.front() else {
        return BatchOutcome::Empty;
    };
    if message_size(&first.message) > MAXIMUM_MESSAGE_SIZE {
        let request = queue
            .pop_front()
            .expect("the queue front was just inspected");
        return BatchOutcome::OversizedFirst(request);
    }

    let mut total = 0usize;
    let mut elements = Vec::new();
    let mut requests = Vec::new();
    while let Some(front) = queue.front() {
        let size = message_size(&front.message);
        if total + size > MAXIMUM_MESSAGE_SIZE {
            break;
        }
        total += size;
        let request = queue
            .pop_front()
            .expect("the queue front was just inspected");
        elements.push(batch_element(&request.message));
        requests.push(request);
    }

    BatchOutcome::Batch {
        body: Value::Array(elements).to_string().into_bytes(),
        requests,
    }
}

fn batch_element(message: &Message) -> Value {
    let mut element = serde_json::Map::new();
    match message.body_kind() {
        BodyKind::Binary => {
            let bytes = message
                .binary()
                .expect("a binary message always yields its bytes");
            element.insert("body".to_owned(), Value::String(BASE64.encode(bytes)));
        }
        BodyKind::Text => {
            let text = message
                .text()
                .expect("a text message always yields its text");
            element.insert("body".to_owned(), Value::String(text.to_owned()));
            element.insert("base64Encoded".to_owned(), Value::Bool(false));
        }
    }

    if !message.properties().is_empty() {
        let mut properties = serde_json::Map::new();
        for (name, value) in message.properties().iter() {
            properties.insert(
                format!("{IOTHUB_APP_PREFIX}{name}"),
                Value::String(value.to_owned()),
            );
        }
        element.insert("properties".to_owned(), Value::Object(properties));
    }

    Value::Object(element)
}
