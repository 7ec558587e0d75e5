use crate::Result;
use crate::error::ToolError;
use crate::protocol::models::{FunctionCall, FunctionDeclaration, FunctionResponse, ToolDeclarations};
use futures::future::join_all;
use schemars::JsonSchema;
use schemars::schema::RootSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type ToolHandler = Box<dyn Fn(Value) -> BoxFuture<std::result::Result<ToolReply, ToolError>> + Send + Sync>;

/// Schema keys the live endpoint rejects in function parameters.
const UNSUPPORTED_SCHEMA_KEYS: [&str; 3] = ["$schema", "title", "definitions"];

#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub schema: RootSchema,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl From<FunctionCall> for ToolCall {
    fn from(call: FunctionCall) -> Self {
        Self { id: call.id, name: call.name, args: call.args }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub output: String,
}

impl From<ToolResult> for FunctionResponse {
    fn from(result: ToolResult) -> Self {
        Self::new(result.id, result.name, result.output)
    }
}

/// What a handler hands back: the output for the model, plus an optional
/// line of narration for the transcript.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolReply {
    pub output: String,
    pub note: Option<String>,
}

impl ToolReply {
    #[must_use]
    pub fn with_note(output: impl Into<String>, note: impl Into<String>) -> Self {
        Self { output: output.into(), note: Some(note.into()) }
    }
}

pub trait ToolOutput {
    fn into_reply(self) -> ToolReply;
}

impl ToolOutput for ToolReply {
    fn into_reply(self) -> ToolReply {
        self
    }
}

impl ToolOutput for String {
    fn into_reply(self) -> ToolReply {
        ToolReply { output: self, note: None }
    }
}

/// A resolved call: exactly one per dispatched [`ToolCall`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolOutcome {
    pub result: ToolResult,
    pub note: Option<String>,
}

#[derive(Default)]
pub struct ToolRegistry {
    defs: Vec<ToolDefinition>,
    handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.defs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn tool<TArgs, TResp, F, Fut>(&mut self, name: &str, handler: F)
    where
        TArgs: DeserializeOwned + JsonSchema + Send + 'static,
        TResp: ToolOutput + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TResp, ToolError>> + Send + 'static,
    {
        self.register(name, None, handler);
    }

    pub fn tool_with_description<TArgs, TResp, F, Fut>(
        &mut self,
        name: &str,
        description: impl Into<String>,
        handler: F,
    ) where
        TArgs: DeserializeOwned + JsonSchema + Send + 'static,
        TResp: ToolOutput + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TResp, ToolError>> + Send + 'static,
    {
        self.register(name, Some(description.into()), handler);
    }

    fn register<TArgs, TResp, F, Fut>(&mut self, name: &str, description: Option<String>, handler: F)
    where
        TArgs: DeserializeOwned + JsonSchema + Send + 'static,
        TResp: ToolOutput + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TResp, ToolError>> + Send + 'static,
    {
        let schema = schemars::schema_for!(TArgs);
        let name = name.to_string();
        // Re-registering a name replaces the earlier tool.
        self.defs.retain(|def| def.name != name);
        self.defs.push(ToolDefinition { name: name.clone(), description, schema });

        let user_handler = Arc::new(handler);
        let tool_name = name.clone();
        let handler = move |value: Value| -> BoxFuture<std::result::Result<ToolReply, ToolError>> {
            let user_handler = Arc::clone(&user_handler);
            let tool_name = tool_name.clone();
            Box::pin(async move {
                let value = if value.is_null() { Value::Object(serde_json::Map::new()) } else { value };
                let args: TArgs = serde_json::from_value(value).map_err(|e| ToolError::InvalidArgument {
                    tool: tool_name,
                    message: e.to_string(),
                })?;
                Ok(user_handler(args).await?.into_reply())
            })
        };

        self.handlers.insert(name, Box::new(handler));
    }

    /// Convert all registered tools into the setup-time declaration block.
    ///
    /// # Errors
    /// Returns an error if schema serialization fails.
    #[allow(clippy::result_large_err)]
    pub fn declarations(&self) -> Result<ToolDeclarations> {
        let mut function_declarations = Vec::with_capacity(self.defs.len());
        for def in &self.defs {
            let mut parameters = serde_json::to_value(&def.schema)?;
            if let Value::Object(map) = &mut parameters {
                for key in UNSUPPORTED_SCHEMA_KEYS {
                    map.remove(key);
                }
            }
            function_declarations.push(FunctionDeclaration {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters,
            });
        }
        Ok(ToolDeclarations { function_declarations })
    }

    /// Run one call. Never fails: unknown tools, bad arguments and provider
    /// failures all become an `Error: ...` output.
    pub async fn dispatch(&self, call: ToolCall) -> ToolOutcome {
        let ToolCall { id, name, args } = call;
        let outcome = match self.handlers.get(&name) {
            Some(handler) => handler(args).await,
            None => Err(ToolError::UnknownTool(name.clone())),
        };
        match outcome {
            Ok(reply) => {
                tracing::debug!(tool = %name, id = %id, "tool call succeeded");
                ToolOutcome { result: ToolResult { id, name, output: reply.output }, note: reply.note }
            }
            Err(err) => {
                tracing::warn!(tool = %name, id = %id, error = %err, "tool call failed");
                ToolOutcome { result: ToolResult { id, name, output: format!("Error: {err}") }, note: None }
            }
        }
    }

    /// Run a batch concurrently. Returns one outcome per call, in call order.
    pub async fn dispatch_batch(&self, calls: Vec<ToolCall>) -> Vec<ToolOutcome> {
        join_all(calls.into_iter().map(|call| self.dispatch(call))).await
    }
}
