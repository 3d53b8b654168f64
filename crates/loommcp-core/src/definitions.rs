//! Resource, resource-template, and tool definitions.
//!
//! These are the metadata shapes enumerated by `list_resources`,
//! `list_resource_templates`, and `list_tools`. The core treats URIs as
//! opaque and never validates tool arguments against the declared schema;
//! the schema exists for clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// A URI-addressed piece of read-only content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Opaque URI identifying the resource.
    pub uri: String,
    /// Human-readable name.
    pub name: String,
    /// MIME type of the content, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Resource {
    /// Create a resource with just a URI and name.
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            mime_type: None,
            description: None,
        }
    }

    /// Set the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A templated resource; match semantics live outside the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    /// URI template, e.g. `file:///{path}`.
    pub uri_template: String,
    /// Human-readable name.
    pub name: String,
    /// MIME type of matching content, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ResourceTemplate {
    /// Create a template with just a URI template and name.
    pub fn new(uri_template: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri_template: uri_template.into(),
            name: name.into(),
            mime_type: None,
            description: None,
        }
    }
}

/// One declared parameter of a tool's input schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParam {
    /// Parameter name.
    pub name: String,
    /// JSON type name (`string`, `number`, `boolean`, `object`, `array`).
    #[serde(rename = "type")]
    pub type_name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the parameter is required.
    #[serde(default)]
    pub required: bool,
}

impl ToolParam {
    /// A required parameter.
    pub fn required(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            description: None,
            required: true,
        }
    }

    /// An optional parameter.
    pub fn optional(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            description: None,
            required: false,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A named, schema-described RPC exposed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name, unique per server.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared input parameters.
    #[serde(default)]
    pub params: Vec<ToolParam>,
}

impl Tool {
    /// Create a tool with no declared parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            params: Vec::new(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, param: ToolParam) -> Self {
        self.params.push(param);
        self
    }

    /// The `inputSchema` object advertised by `list_tools`.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let mut prop = Map::new();
            prop.insert("type".into(), Value::String(param.type_name.clone()));
            if let Some(desc) = &param.description {
                prop.insert("description".into(), Value::String(desc.clone()));
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// The full `list_tools` wire entry for this tool.
    pub fn to_wire(&self) -> Value {
        let mut obj = json!({
            "name": self.name,
            "inputSchema": self.input_schema(),
        });
        if let Some(desc) = &self.description {
            obj["description"] = Value::String(desc.clone());
        }
        obj
    }
}
