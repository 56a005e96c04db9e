use std::{collections::HashMap, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;

use super::validator::{ValidationError, Validator};
use crate::{
    BoxError,
    model::{Prompt, PromptMessage, PromptMessageContent},
};

pub type PromptFuture = BoxFuture<'static, Result<Vec<PromptMessage>, BoxError>>;

pub type DynGetPromptHandler =
    dyn Fn(&Value) -> Result<PromptFuture, ValidationError> + Send + Sync;

#[derive(Clone)]
pub struct PromptRoute {
    pub attr: Prompt,
    pub get: Arc<DynGetPromptHandler>,
}

impl std::fmt::Debug for PromptRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRoute")
            .field("name", &self.attr.name)
            .field("description", &self.attr.description)
            .field("arguments", &self.attr.arguments)
            .finish()
    }
}

impl PromptRoute {
    pub fn new<V, F, Fut, E>(attr: Prompt, validator: V, generator: F) -> Self
    where
        V: Validator,
        F: Fn(V::Output) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<PromptMessage>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let generator = Arc::new(generator);
        let get = move |raw: &Value| -> Result<PromptFuture, ValidationError> {
            let args = validator.parse(raw)?;
            let generator = generator.clone();
            Ok(async move { generator(args).await.map_err(Into::into) }.boxed())
        };
        Self {
            attr,
            get: Arc::new(get),
        }
    }

    pub fn name(&self) -> &str {
        &self.attr.name
    }

    pub fn get(&self, arguments: &Value) -> Result<PromptFuture, ValidationError> {
        (self.get)(arguments)
    }
}

#[derive(Debug, Default, Clone)]
pub struct PromptRegistry {
    routes: Vec<PromptRoute>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, route: PromptRoute) {
        match self.routes.iter_mut().find(|r| r.name() == route.name()) {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
    }

    pub fn add<V, F, Fut, E>(&mut self, prompt: Prompt, validator: V, generator: F)
    where
        V: Validator,
        F: Fn(V::Output) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<PromptMessage>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.add_route(PromptRoute::new(prompt, validator, generator));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r.name() != name);
        self.routes.len() != before
    }

    pub fn get(&self, name: &str) -> Option<&Prompt> {
        self.route(name).map(|r| &r.attr)
    }

    pub fn route(&self, name: &str) -> Option<&PromptRoute> {
        self.routes.iter().find(|r| r.name() == name)
    }

    pub fn list(&self) -> Vec<Prompt> {
        self.routes.iter().map(|r| r.attr.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.name().to_owned()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Substitute every `{{key}}` in text content with its value. Embedded
/// resources are returned unchanged, as are tokens with no matching key.
pub fn replace_tokens(
    content: &PromptMessageContent,
    args: &HashMap<String, String>,
) -> PromptMessageContent {
    match content {
        PromptMessageContent::Text { text } => {
            let text = args.iter().fold(text.clone(), |text, (key, value)| {
                text.replace(&format!("{{{{{key}}}}}"), value)
            });
            PromptMessageContent::Text { text }
        }
        other => other.clone(),
    }
}

/// Expand a list of template messages against `args`, keeping roles.
///
/// ```rust
/// # use std::collections::HashMap;
/// # use mcp_runtime::{handler::server::compile_template_messages, model::*};
/// let template = [PromptMessage::new_text(PromptMessageRole::User, "Hello {{name}}!")];
/// let args = HashMap::from([("name".to_owned(), "Ada".to_owned())]);
/// assert_eq!(
///     compile_template_messages(&template, &args),
///     vec![PromptMessage::new_text(PromptMessageRole::User, "Hello Ada!")]
/// );
/// ```
pub fn compile_template_messages(
    messages: &[PromptMessage],
    args: &HashMap<String, String>,
) -> Vec<PromptMessage> {
    messages
        .iter()
        .map(|message| PromptMessage {
            role: message.role.clone(),
            content: replace_tokens(&message.content, args),
        })
        .collect()
}
