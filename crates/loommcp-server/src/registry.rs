//! Resource, template, and tool registries.
//!
//! Registries grow during startup and are read-mostly while serving, so a
//! reader-writer lock per table is enough. Handlers are plain closures; the
//! dispatch core owns the copies it makes of their output.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use loommcp_core::{ContentItem, McpError, Resource, ResourceTemplate, Tool};

/// Produces the content of a resource URI.
///
/// The returned items are owned by the core once the call returns; the core
/// deep-copies into the cache and frees them after building the response.
pub type ResourceHandler =
    Arc<dyn Fn(&str) -> Result<Vec<ContentItem>, McpError> + Send + Sync>;

/// What a tool handler returns.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Result content.
    pub items: Vec<ContentItem>,
    /// Marks a domain-level failure that still produced content.
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful output.
    pub fn ok(items: Vec<ContentItem>) -> Self {
        Self {
            items,
            is_error: false,
        }
    }

    /// Failed output carrying diagnostic content.
    pub fn error(items: Vec<ContentItem>) -> Self {
        Self {
            items,
            is_error: true,
        }
    }
}

/// Executes a tool call: `(tool_name, arguments_json)`.
///
/// `arguments_json` is the stringified `arguments` value, `{}` when absent;
/// the core never validates it against the declared schema.
pub type ToolHandler =
    Arc<dyn Fn(&str, &str) -> Result<ToolOutput, McpError> + Send + Sync>;

/// Receives notifications: `(method, params)`.
pub type NotificationHandler = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

struct RegisteredTool {
    tool: Tool,
    handler: ToolHandler,
}

/// The server's registered surface.
#[derive(Default)]
pub struct Registry {
    resources: RwLock<Vec<Resource>>,
    templates: RwLock<Vec<ResourceTemplate>>,
    tools: RwLock<Vec<RegisteredTool>>,
    resource_handler: RwLock<Option<ResourceHandler>>,
    notification_handler: RwLock<Option<NotificationHandler>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource.
    pub fn add_resource(&self, resource: Resource) {
        self.resources.write().push(resource);
    }

    /// Register a resource template.
    pub fn add_template(&self, template: ResourceTemplate) {
        self.templates.write().push(template);
    }

    /// Register a tool with its handler.
    pub fn add_tool(&self, tool: Tool, handler: ToolHandler) {
        self.tools.write().push(RegisteredTool { tool, handler });
    }

    /// Install the resource handler invoked on cache misses.
    pub fn set_resource_handler(&self, handler: ResourceHandler) {
        *self.resource_handler.write() = Some(handler);
    }

    /// Install the notification handler.
    pub fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.notification_handler.write() = Some(handler);
    }

    /// Snapshot of registered resources.
    pub fn resources(&self) -> Vec<Resource> {
        self.resources.read().clone()
    }

    /// Snapshot of registered templates.
    pub fn templates(&self) -> Vec<ResourceTemplate> {
        self.templates.read().clone()
    }

    /// Snapshot of registered tool definitions.
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.read().iter().map(|t| t.tool.clone()).collect()
    }

    /// The handler for a tool name.
    pub fn tool_handler(&self, name: &str) -> Option<ToolHandler> {
        self.tools
            .read()
            .iter()
            .find(|t| t.tool.name == name)
            .map(|t| Arc::clone(&t.handler))
    }

    /// The installed resource handler.
    pub fn resource_handler(&self) -> Option<ResourceHandler> {
        self.resource_handler.read().clone()
    }

    /// The installed notification handler.
    pub fn notification_handler(&self) -> Option<NotificationHandler> {
        self.notification_handler.read().clone()
    }

    /// Whether the URI is registered, directly or could match a template.
    pub fn knows_uri(&self, uri: &str) -> bool {
        self.resources.read().iter().any(|r| r.uri == uri)
            || !self.templates.read().is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("resources", &self.resources.read().len())
            .field("templates", &self.templates.read().len())
            .field("tools", &self.tools.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tools_are_registered_and_found() {
        let registry = Registry::new();
        registry.add_tool(
            Tool::new("echo"),
            Arc::new(|_, args| Ok(ToolOutput::ok(vec![ContentItem::text(args)]))),
        );
        assert_eq!(registry.tools().len(), 1);
        assert!(registry.tool_handler("echo").is_some());
        assert!(registry.tool_handler("missing").is_none());
    }

    #[test]
    fn knows_uri_checks_resources_and_templates() {
        let registry = Registry::new();
        registry.add_resource(Resource::new("test://r", "r"));
        assert!(registry.knows_uri("test://r"));
        assert!(!registry.knows_uri("test://other"));
        registry.add_template(ResourceTemplate::new("test://{x}", "t"));
        assert!(registry.knows_uri("test://anything"));
    }
}
