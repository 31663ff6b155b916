//! Local tools the remote model can invoke
//!
//! The session hands each invocation to a `ToolHandler` and relays only
//! whether it succeeded. The terminal handler renders the documents the
//! model asks to display.

use log::{info, warn};
use serde_json::{json, Value};
use std::io::Write;

use crate::session::protocol::{FunctionDeclaration, ToolInvocation};

/// Name of the built-in document display tool
pub const DISPLAY_DOCUMENT: &str = "display_document";

/// Performs tool invocations on behalf of the session
pub trait ToolHandler {
    /// Run one invocation and return the UI effect it produced
    fn handle(&mut self, invocation: &ToolInvocation) -> Result<Value, String>;
}

impl<F> ToolHandler for F
where
    F: FnMut(&ToolInvocation) -> Result<Value, String>,
{
    fn handle(&mut self, invocation: &ToolInvocation) -> Result<Value, String> {
        self(invocation)
    }
}

/// Declaration of the built-in display tool
pub fn display_document_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: DISPLAY_DOCUMENT.to_string(),
        description: "Show a structured document to the user, such as search results \
                      or a summary with sources."
            .to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "title": { "type": "STRING", "description": "Document heading" },
                "body": { "type": "STRING", "description": "Markdown body text" },
                "sources": {
                    "type": "ARRAY",
                    "description": "Citations backing the document",
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "title": { "type": "STRING" },
                            "url": { "type": "STRING" }
                        }
                    }
                }
            },
            "required": ["title", "body"]
        }),
    }
}

/// Renders documents to a writer, standing in for a display surface
pub struct DisplayToolHandler<W: Write> {
    out: W,
    known: Vec<String>,
}

impl<W: Write> DisplayToolHandler<W> {
    pub fn new(out: W, declarations: &[FunctionDeclaration]) -> Self {
        Self {
            out,
            known: declarations.iter().map(|d| d.name.clone()).collect(),
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn render(&mut self, args: &Value) -> Result<Value, String> {
        let title = args
            .get("title")
            .and_then(Value::as_str)
            .ok_or("missing string argument 'title'")?;
        let body = args.get("body").and_then(Value::as_str).unwrap_or_default();

        let mut text = format!("\n== {} ==\n{}\n", title, body);
        if let Some(sources) = args.get("sources").and_then(Value::as_array) {
            for (i, source) in sources.iter().enumerate() {
                let name = source.get("title").and_then(Value::as_str).unwrap_or("source");
                let url = source.get("url").and_then(Value::as_str).unwrap_or("");
                text.push_str(&format!("  [{}] {} {}\n", i + 1, name, url));
            }
        }

        self.out
            .write_all(text.as_bytes())
            .and_then(|_| self.out.flush())
            .map_err(|e| format!("Failed to display document: {}", e))?;

        Ok(json!({ "displayed": title }))
    }
}

impl<W: Write> ToolHandler for DisplayToolHandler<W> {
    fn handle(&mut self, invocation: &ToolInvocation) -> Result<Value, String> {
        if invocation.name == DISPLAY_DOCUMENT {
            info!("Displaying document for call {}", invocation.id);
            return self.render(&invocation.args);
        }

        if self.known.iter().any(|name| name == &invocation.name) {
            // Declared in settings but with no local renderer; show raw args
            let pretty = serde_json::to_string_pretty(&invocation.args)
                .map_err(|e| format!("Failed to format arguments: {}", e))?;
            writeln!(self.out, "\n== {} ==\n{}", invocation.name, pretty)
                .and_then(|_| self.out.flush())
                .map_err(|e| format!("Failed to display {}: {}", invocation.name, e))?;
            return Ok(json!({ "displayed": invocation.name }));
        }

        warn!("Model invoked unknown tool '{}'", invocation.name);
        Err(format!("unknown tool '{}'", invocation.name))
    }
}
