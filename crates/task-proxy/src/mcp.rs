use crate::session::PeerNotificationSink;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, JsonObject, ListToolsResult,
        PaginatedRequestParam, ServerInfo, Tool, ToolAnnotations,
    },
    ErrorData as McpError, RoleServer, ServerHandler,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use task_runtime::{Acknowledgement, ActiveRequestInfo, TaskEndpoint};

pub(crate) struct ProxyHandler {
    endpoint: TaskEndpoint,
    server_info: ServerInfo,
}

impl ProxyHandler {
    pub(crate) fn new(endpoint: TaskEndpoint, server_info: ServerInfo) -> Self {
        Self {
            endpoint,
            server_info,
        }
    }

    fn perform_task_definition(&self) -> Tool {
        let settings = self.endpoint.settings();
        let mut properties = Map::new();
        properties.insert(
            "task".to_string(),
            json!({
                "type": "string",
                "description": "Natural-language description of what to do in the browser."
            }),
        );
        properties.insert(
            "request_id".to_string(),
            json!({
                "type": "string",
                "description": "Correlation id echoed in every notification. Assigned by the server when omitted."
            }),
        );

        let mut input_schema = Map::new();
        input_schema.insert("type".to_string(), Value::String("object".to_string()));
        input_schema.insert("required".to_string(), json!(["task"]));
        input_schema.insert("properties".to_string(), Value::Object(properties));

        Tool {
            name: "perform_task".into(),
            description: Some(
                format!(
                    "Run a browser task in the background. Returns \"Processing Request\" at once; progress and the final result arrive as logging notifications tagged with request_id. The last one has is_last=true and carries total_token. Tasks stop after {} or {} steps.",
                    humantime::format_duration(settings.time_budget),
                    settings.max_steps
                )
                .into(),
            ),
            input_schema: Arc::new(input_schema),
            output_schema: None,
            title: Some("Perform Task".to_string()),
            annotations: Some(ToolAnnotations {
                read_only_hint: Some(false),
                destructive_hint: Some(false),
                open_world_hint: Some(true),
                idempotent_hint: Some(false),
                title: Some("Perform Task".to_string()),
            }),
            icons: None,
        }
    }

    fn list_tasks_definition(&self) -> Tool {
        let mut input_schema = Map::new();
        input_schema.insert("type".to_string(), Value::String("object".to_string()));
        input_schema.insert("properties".to_string(), Value::Object(Map::new()));
        Tool {
            name: "list_tasks".into(),
            description: Some("List tasks that are still running or cleaning up.".into()),
            input_schema: Arc::new(input_schema),
            output_schema: None,
            title: Some("List Tasks".to_string()),
            annotations: Some(ToolAnnotations {
                read_only_hint: Some(true),
                destructive_hint: Some(false),
                open_world_hint: Some(false),
                idempotent_hint: Some(true),
                title: Some("List Tasks".to_string()),
            }),
            icons: None,
        }
    }
}

impl ServerHandler for ProxyHandler {
    fn get_info(&self) -> ServerInfo {
        self.server_info.clone()
    }

    fn list_tools(
        &self,
        _: Option<PaginatedRequestParam>,
        _: rmcp::service::RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move {
            Ok(ListToolsResult::with_all_items(vec![
                self.perform_task_definition(),
                self.list_tasks_definition(),
            ]))
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: rmcp::service::RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            match request.name.as_ref() {
                "perform_task" => {
                    let args = parse_arguments(request.arguments)
                        .map_err(|err| McpError::invalid_params(err, None))?;
                    let sink = Arc::new(PeerNotificationSink::new(context.peer.clone()));
                    let ack = self
                        .endpoint
                        .perform_task(&args.task, args.request_id, sink)
                        .map_err(|err| McpError::invalid_params(err.to_string(), None))?;
                    Ok(acknowledgement_to_tool_result(&ack))
                }
                "list_tasks" => Ok(tasks_to_tool_result(self.endpoint.active_requests())),
                _ => Err(McpError::invalid_params(
                    format!("unknown tool: {}", request.name),
                    None,
                )),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PerformTaskArgs {
    task: String,
    request_id: Option<String>,
}

fn parse_arguments(args: Option<JsonObject>) -> Result<PerformTaskArgs, String> {
    let map = args.ok_or_else(|| "missing arguments".to_string())?;
    let mut args: PerformTaskArgs =
        serde_json::from_value(Value::Object(map)).map_err(|err| err.to_string())?;
    if args
        .request_id
        .as_deref()
        .is_some_and(|id| id.trim().is_empty())
    {
        args.request_id = None;
    }
    Ok(args)
}

fn acknowledgement_to_tool_result(ack: &Acknowledgement) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(ack.message)],
        is_error: Some(false),
        meta: None,
        structured_content: serde_json::to_value(ack).ok(),
    }
}

fn tasks_to_tool_result(tasks: Vec<ActiveRequestInfo>) -> CallToolResult {
    let payload = json!({ "tasks": tasks });
    let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string());
    CallToolResult {
        content: vec![Content::text(text)],
        is_error: Some(false),
        meta: None,
        structured_content: Some(payload),
    }
}
