use std::sync::Arc;

use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;

use super::validator::{ValidationError, Validator};
use crate::{
    BoxError,
    model::{CallToolResult, Tool},
};

pub type ToolFuture = BoxFuture<'static, Result<CallToolResult, BoxError>>;

/// Validates raw arguments, then starts the handler.
pub type DynCallToolHandler = dyn Fn(&Value) -> Result<ToolFuture, ValidationError> + Send + Sync;

/// A registered tool: its public descriptor and the type-erased call path.
#[derive(Clone)]
pub struct ToolRoute {
    pub attr: Tool,
    pub call: Arc<DynCallToolHandler>,
}

impl std::fmt::Debug for ToolRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRoute")
            .field("name", &self.attr.name)
            .field("description", &self.attr.description)
            .field("input_schema", &self.attr.input_schema)
            .finish()
    }
}

impl ToolRoute {
    /// Build a route whose descriptor advertises `validator`'s schema.
    pub fn new<V, F, Fut, E>(mut attr: Tool, validator: V, handler: F) -> Self
    where
        V: Validator,
        F: Fn(V::Output) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        if attr.description.is_none() {
            attr.description = Some(format!("Execute the {} tool", attr.name).into());
        }
        attr.input_schema = validator.schema();
        let handler = Arc::new(handler);
        let call = move |raw: &Value| -> Result<ToolFuture, ValidationError> {
            let args = validator.parse(raw)?;
            let handler = handler.clone();
            Ok(async move { handler(args).await.map_err(Into::into) }.boxed())
        };
        Self {
            attr,
            call: Arc::new(call),
        }
    }

    pub fn name(&self) -> &str {
        &self.attr.name
    }

    /// Validate `arguments` and start the call. A validation failure never
    /// reaches the handler.
    pub fn call(&self, arguments: &Value) -> Result<ToolFuture, ValidationError> {
        (self.call)(arguments)
    }
}

/// Name-keyed tool store. Listing follows registration order; re-adding a
/// name replaces the entry in place.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    routes: Vec<ToolRoute>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, route: ToolRoute) {
        match self.routes.iter_mut().find(|r| r.name() == route.name()) {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
    }

    pub fn add<V, F, Fut, E>(&mut self, tool: Tool, validator: V, handler: F)
    where
        V: Validator,
        F: Fn(V::Output) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.add_route(ToolRoute::new(tool, validator, handler));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r.name() != name);
        self.routes.len() != before
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.route(name).map(|r| &r.attr)
    }

    pub fn route(&self, name: &str) -> Option<&ToolRoute> {
        self.routes.iter().find(|r| r.name() == name)
    }

    pub fn list(&self) -> Vec<Tool> {
        self.routes.iter().map(|r| r.attr.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.name().to_owned()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
