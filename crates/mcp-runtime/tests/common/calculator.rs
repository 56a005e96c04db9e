use mcp_runtime::{
    BoxError, McpServer, McpServerOptions,
    handler::server::{ResourceRequest, SchemaValidator},
    model::{
        CallToolResult, Content, Prompt, PromptArgument, PromptMessage, PromptMessageRole,
        ReadResourceResult, Resource, ResourceContents, ResourceTemplate, Tool,
    },
    schemars,
};

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SumRequest {
    #[schemars(description = "the left hand side number")]
    pub a: i32,
    pub b: i32,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SubRequest {
    #[schemars(description = "the left hand side number")]
    pub a: i32,
    #[schemars(description = "the right hand side number")]
    pub b: i32,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct GreetingArgs {
    pub name: String,
}

/// A server with `add` and `sub` tools, a `greeting` prompt, one exact
/// file resource and a file template.
pub fn calculator() -> McpServer {
    let server = McpServer::new(
        McpServerOptions::new("calculator", "1.0.0").with_instructions("A simple calculator"),
    );
    server.add_tool(
        Tool::new("add").with_description("Calculate the sum of two numbers"),
        SchemaValidator::<SumRequest>::new(),
        |SumRequest { a, b }| async move {
            Ok::<_, BoxError>(CallToolResult::success(vec![Content::text(
                (a + b).to_string(),
            )]))
        },
    );
    server.add_tool(
        Tool::new("sub").with_description("Calculate the difference of two numbers"),
        SchemaValidator::<SubRequest>::new(),
        |SubRequest { a, b }| async move {
            Ok::<_, BoxError>(CallToolResult::success(vec![Content::text(
                (a - b).to_string(),
            )]))
        },
    );
    server.add_prompt(
        Prompt::new(
            "greeting",
            Some("Greets someone by name"),
            Some(vec![PromptArgument::new("name").required(true)]),
        ),
        SchemaValidator::<GreetingArgs>::new(),
        |GreetingArgs { name }| async move {
            Ok::<_, BoxError>(vec![PromptMessage::new_text(
                PromptMessageRole::User,
                format!("Hello, {name}!"),
            )])
        },
    );
    server.add_resource(
        Resource::new("file:///example/readme.txt", "readme").with_mime_type("text/plain"),
        |request: ResourceRequest| async move {
            Ok::<_, BoxError>(ReadResourceResult {
                contents: vec![ResourceContents::text("calculator readme", request.uri)],
            })
        },
    );
    server
        .add_resource_template(
            ResourceTemplate::new("file:///example/{filename}", "example-files"),
            |request: ResourceRequest| async move {
                let filename = request.variables.get("filename").cloned().unwrap_or_default();
                Ok::<_, BoxError>(ReadResourceResult {
                    contents: vec![ResourceContents::text(
                        format!("contents of {filename}"),
                        request.uri,
                    )],
                })
            },
        )
        .expect("valid template");
    server
}
