//! Default tool catalog.
//!
//! The descriptors for the assistant's stock capabilities. Implementations
//! are external collaborators — a host binds each descriptor to its real
//! calendar / clipboard / search code via
//! [`FunctionTool`](super::tools::FunctionTool) — but the names, descriptions
//! and schemas live here so every embedding of the runtime presents the same
//! surface to the model.

use serde_json::{json, Value};

/// A tool descriptor: name, prompt description, and parameter schema.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Stable identifier the registry keys on.
    pub name: String,
    /// Free text used in the system prompt.
    pub description: String,
    /// JSON-schema-shaped parameters object.
    pub parameters: Value,
}

impl ToolSpec {
    /// The schema rendered as canonical JSON for prompt inclusion.
    pub fn canonical_parameters(&self) -> String {
        canonical_json(&self.parameters)
    }
}

/// Renders a JSON value with object keys in sorted order.
///
/// serde_json's default map is ordered by key, so a plain serialization is
/// already canonical; this helper names the guarantee.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Descriptors for the default-registered tools.
pub fn default_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "calculator".into(),
            description: "Evaluate an arithmetic expression and return the result. Use for any math the user asks about instead of computing it yourself.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "The arithmetic expression to evaluate, e.g. \"2+2\" or \"15% of 80\""
                    }
                },
                "required": ["expression"]
            }),
        },
        ToolSpec {
            name: "device_info".into(),
            description: "Get information about the device: battery level, storage, OS version, and network status. Use when the user asks about their device.".into(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
        ToolSpec {
            name: "clipboard".into(),
            description: "Read or replace the system clipboard contents. Only write to the clipboard when the user explicitly asks for it.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "description": "Whether to read or write the clipboard",
                        "enum": ["read", "write"]
                    },
                    "content": {
                        "type": "string",
                        "description": "Text to place on the clipboard (write only)"
                    }
                },
                "required": ["action"]
            }),
        },
        ToolSpec {
            name: "web_search".into(),
            description: "Search the web and return result snippets with titles and URLs. Use for current events or anything beyond your training data. Do NOT use for questions you can answer directly.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    }
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "calendar".into(),
            description: "Read upcoming calendar events or create a new one. Use when the user asks about their schedule or wants something scheduled.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "description": "Whether to list events or create one",
                        "enum": ["list", "create"]
                    },
                    "title": {
                        "type": "string",
                        "description": "Event title (create only)"
                    },
                    "start": {
                        "type": "string",
                        "description": "Event start in ISO 8601 (create only)"
                    },
                    "duration_minutes": {
                        "type": "integer",
                        "description": "Event length in minutes (create only)"
                    }
                },
                "required": ["action"]
            }),
        },
        ToolSpec {
            name: "reminders".into(),
            description: "List the user's reminders or add a new one. Use when the user asks to be reminded of something.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "description": "Whether to list reminders or add one",
                        "enum": ["list", "add"]
                    },
                    "text": {
                        "type": "string",
                        "description": "What to be reminded about (add only)"
                    },
                    "due": {
                        "type": "string",
                        "description": "Due time in ISO 8601 (add only)"
                    }
                },
                "required": ["action"]
            }),
        },
        ToolSpec {
            name: "open_app".into(),
            description: "Open an application on the device by name. Use only when the user explicitly asks to open an app.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "The application name, e.g. \"Settings\""
                    }
                },
                "required": ["name"]
            }),
        },
        ToolSpec {
            name: "timer".into(),
            description: "Start a countdown timer. Use when the user asks for a timer or a countdown.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "seconds": {
                        "type": "integer",
                        "description": "Timer duration in seconds"
                    },
                    "label": {
                        "type": "string",
                        "description": "Optional label announced when the timer fires"
                    }
                },
                "required": ["seconds"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_has_all_default_tools() {
        let names: Vec<String> = default_tool_specs().into_iter().map(|s| s.name).collect();
        for expected in [
            "calculator",
            "device_info",
            "clipboard",
            "web_search",
            "calendar",
            "reminders",
            "open_app",
            "timer",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn test_catalog_names_unique() {
        let specs = default_tool_specs();
        let mut names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), specs.len());
    }

    #[test]
    fn test_schemas_are_object_shaped() {
        for spec in default_tool_specs() {
            assert_eq!(spec.parameters["type"], "object", "{}", spec.name);
            assert!(spec.parameters["properties"].is_object(), "{}", spec.name);
            assert!(spec.parameters["required"].is_array(), "{}", spec.name);
            assert!(!spec.description.is_empty());
        }
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"zeta": 1, "alpha": {"nested_z": 2, "nested_a": 3}});
        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":{"nested_a":3,"nested_z":2},"zeta":1}"#
        );
    }

    #[test]
    fn test_canonical_parameters_deterministic() {
        let spec = &default_tool_specs()[0];
        assert_eq!(spec.canonical_parameters(), spec.canonical_parameters());
        assert!(spec.canonical_parameters().starts_with('{'));
    }
}
