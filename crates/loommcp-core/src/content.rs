//! Typed content items returned by resource and tool handlers.
//!
//! A handler hands the core an owned `Vec<ContentItem>`; the core deep-copies
//! into the cache where needed (plain `Clone`) and serializes to the MCP wire
//! shape when building results. Binary payloads travel base64-encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value, json};

/// The payload of a content item.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBody {
    /// UTF-8 text.
    Text(String),
    /// A JSON document kept in serialized form.
    Json(String),
    /// Raw bytes; base64-encoded on the wire.
    Binary(Bytes),
}

/// One piece of typed output from a resource or tool handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentItem {
    /// The typed payload.
    pub body: ContentBody,
    /// Optional MIME type advertised to clients.
    pub mime_type: Option<String>,
}

impl ContentItem {
    /// Text content with MIME type `text/plain`.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: ContentBody::Text(text.into()),
            mime_type: Some("text/plain".into()),
        }
    }

    /// Text content with an explicit MIME type.
    pub fn text_with_mime(text: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            body: ContentBody::Text(text.into()),
            mime_type: Some(mime_type.into()),
        }
    }

    /// JSON content from an already-serialized document.
    pub fn json(raw: impl Into<String>) -> Self {
        Self {
            body: ContentBody::Json(raw.into()),
            mime_type: Some("application/json".into()),
        }
    }

    /// Binary content with an explicit MIME type.
    pub fn binary(data: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            body: ContentBody::Binary(data.into()),
            mime_type: Some(mime_type.into()),
        }
    }

    /// The text payload, when this is text content.
    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            ContentBody::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        match &self.body {
            ContentBody::Text(t) | ContentBody::Json(t) => t.len(),
            ContentBody::Binary(b) => b.len(),
        }
    }

    /// The wire discriminator: `text`, `json`, or `binary`.
    pub fn type_name(&self) -> &'static str {
        match &self.body {
            ContentBody::Text(_) => "text",
            ContentBody::Json(_) => "json",
            ContentBody::Binary(_) => "binary",
        }
    }

    /// Serialize to the tool-result wire shape.
    pub fn to_wire(&self) -> Value {
        let mut obj = match &self.body {
            ContentBody::Text(t) => json!({"type": "text", "text": t}),
            ContentBody::Json(raw) => {
                // Re-parse so the document embeds as JSON, not as a string.
                let parsed: Value =
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
                json!({"type": "json", "json": parsed})
            }
            ContentBody::Binary(b) => {
                json!({"type": "binary", "data": BASE64.encode(b), "size": b.len()})
            }
        };
        if let Some(mime) = &self.mime_type {
            obj["mimeType"] = Value::String(mime.clone());
        }
        obj
    }

    /// Serialize to the `read_resource` `contents[]` wire shape.
    pub fn to_resource_contents(&self, uri: &str) -> Value {
        let mut obj = match &self.body {
            ContentBody::Text(t) => json!({"uri": uri, "text": t}),
            ContentBody::Json(raw) => json!({"uri": uri, "text": raw}),
            ContentBody::Binary(b) => json!({"uri": uri, "blob": BASE64.encode(b)}),
        };
        if let Some(mime) = &self.mime_type {
            obj["mimeType"] = Value::String(mime.clone());
        }
        obj
    }

    /// Parse a tool-result wire object back into a content item.
    ///
    /// Returns `None` for unknown `type` discriminators or missing fields;
    /// clients treat those as opaque values.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let mime_type = value.get("mimeType").and_then(Value::as_str).map(str::to_owned);
        let body = match value.get("type")?.as_str()? {
            "text" => ContentBody::Text(value.get("text")?.as_str()?.to_owned()),
            "json" => ContentBody::Json(value.get("json")?.to_string()),
            "binary" => {
                let data = BASE64.decode(value.get("data")?.as_str()?).ok()?;
                ContentBody::Binary(Bytes::from(data))
            }
            _ => return None,
        };
        Some(Self { body, mime_type })
    }
}
