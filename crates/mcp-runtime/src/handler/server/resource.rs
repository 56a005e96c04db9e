use std::{collections::HashMap, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use regex::Regex;

use crate::{
    BoxError,
    model::{ReadResourceResult, Resource, ResourceTemplate},
};

pub type ResourceFuture = BoxFuture<'static, Result<ReadResourceResult, BoxError>>;

pub type DynReadResourceHandler = dyn Fn(ResourceRequest) -> ResourceFuture + Send + Sync;

/// What a reader is invoked with. `variables` holds the template captures
/// and is empty for exact URI matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub uri: String,
    pub variables: HashMap<String, String>,
}

/// A compiled `{var}` URI template.
///
/// Each placeholder matches one non-empty path segment, lazily. Everything
/// else matches literally. Nested or unbalanced braces are literal text.
///
/// ```rust
/// # use mcp_runtime::handler::server::UriTemplate;
/// let template = UriTemplate::new("file:///example/{filename}").unwrap();
/// let vars = template.matches("file:///example/test.txt").unwrap();
/// assert_eq!(vars["filename"], "test.txt");
/// assert!(template.matches("file:///example/a/b.txt").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct UriTemplate {
    template: String,
    pattern: Regex,
    variables: Vec<String>,
}

impl UriTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self, regex::Error> {
        let template = template.into();
        let mut pattern = String::from("^");
        let mut variables = Vec::new();
        let mut rest = template.as_str();
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            let close = after.find('}');
            let nested = after.find('{');
            match close {
                Some(close) if close > 0 && nested.is_none_or(|n| n > close) => {
                    pattern.push_str(&regex::escape(&rest[..open]));
                    pattern.push_str("([^/]+?)");
                    variables.push(after[..close].to_owned());
                    rest = &after[close + 1..];
                }
                _ => {
                    pattern.push_str(&regex::escape(&rest[..=open]));
                    rest = after;
                }
            }
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');
        Ok(Self {
            pattern: Regex::new(&pattern)?,
            template,
            variables,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn matches(&self, uri: &str) -> Option<HashMap<String, String>> {
        let captures = self.pattern.captures(uri)?;
        Some(
            self.variables
                .iter()
                .enumerate()
                .filter_map(|(index, name)| {
                    captures
                        .get(index + 1)
                        .map(|m| (name.clone(), m.as_str().to_owned()))
                })
                .collect(),
        )
    }
}

fn erase_reader<F, Fut, E>(reader: F) -> Arc<DynReadResourceHandler>
where
    F: Fn(ResourceRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ReadResourceResult, E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |request: ResourceRequest| -> ResourceFuture {
        reader(request).map(|result| result.map_err(Into::into)).boxed()
    })
}

#[derive(Clone)]
pub struct ResourceRoute {
    pub attr: Resource,
    pub read: Arc<DynReadResourceHandler>,
}

#[derive(Clone)]
pub struct ResourceTemplateRoute {
    pub attr: ResourceTemplate,
    pub template: UriTemplate,
    pub read: Arc<DynReadResourceHandler>,
}

impl std::fmt::Debug for ResourceRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRoute")
            .field("name", &self.attr.name)
            .field("uri", &self.attr.uri)
            .finish()
    }
}

impl std::fmt::Debug for ResourceTemplateRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTemplateRoute")
            .field("name", &self.attr.name)
            .field("uri_template", &self.attr.uri_template)
            .finish()
    }
}

/// Exact resources and URI templates, sharing one name space.
#[derive(Debug, Default, Clone)]
pub struct ResourceRegistry {
    resources: Vec<ResourceRoute>,
    templates: Vec<ResourceTemplateRoute>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource<F, Fut, E>(&mut self, resource: Resource, reader: F)
    where
        F: Fn(ResourceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReadResourceResult, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let route = ResourceRoute {
            attr: resource,
            read: erase_reader(reader),
        };
        self.templates.retain(|t| t.attr.name != route.attr.name);
        match self
            .resources
            .iter_mut()
            .find(|r| r.attr.name == route.attr.name)
        {
            Some(existing) => *existing = route,
            None => self.resources.push(route),
        }
    }

    /// Register a template entry. Fails only if the compiled pattern is
    /// rejected by the regex engine.
    pub fn add_template<F, Fut, E>(
        &mut self,
        template: ResourceTemplate,
        reader: F,
    ) -> Result<(), regex::Error>
    where
        F: Fn(ResourceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReadResourceResult, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let route = ResourceTemplateRoute {
            template: UriTemplate::new(template.uri_template.clone())?,
            attr: template,
            read: erase_reader(reader),
        };
        self.resources.retain(|r| r.attr.name != route.attr.name);
        match self
            .templates
            .iter_mut()
            .find(|t| t.attr.name == route.attr.name)
        {
            Some(existing) => *existing = route,
            None => self.templates.push(route),
        }
        Ok(())
    }

    /// Remove a resource or template by name.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.resources.len() + self.templates.len();
        self.resources.retain(|r| r.attr.name != name);
        self.templates.retain(|t| t.attr.name != name);
        self.resources.len() + self.templates.len() != before
    }

    pub fn get_resource(&self, name: &str) -> Option<&Resource> {
        self.resources
            .iter()
            .find(|r| r.attr.name == name)
            .map(|r| &r.attr)
    }

    pub fn get_template(&self, name: &str) -> Option<&ResourceTemplate> {
        self.templates
            .iter()
            .find(|t| t.attr.name == name)
            .map(|t| &t.attr)
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.resources.iter().map(|r| r.attr.clone()).collect()
    }

    pub fn list_templates(&self) -> Vec<ResourceTemplate> {
        self.templates.iter().map(|t| t.attr.clone()).collect()
    }

    /// Names of both resources and templates, resources first.
    pub fn names(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(|r| r.attr.name.clone())
            .chain(self.templates.iter().map(|t| t.attr.name.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.templates.is_empty()
    }

    /// Find the reader for `uri` and start it. Exact URIs win over
    /// templates; among templates the first registered match wins.
    pub fn resolve(&self, uri: &str) -> Option<ResourceFuture> {
        if let Some(route) = self.resources.iter().find(|r| r.attr.uri == uri) {
            return Some((route.read)(ResourceRequest {
                uri: uri.to_owned(),
                variables: HashMap::new(),
            }));
        }
        self.templates.iter().find_map(|route| {
            route.template.matches(uri).map(|variables| {
                (route.read)(ResourceRequest {
                    uri: uri.to_owned(),
                    variables,
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceContents;

    fn text_reader(
        label: &'static str,
    ) -> impl Fn(ResourceRequest) -> futures::future::Ready<Result<ReadResourceResult, BoxError>>
    + Send
    + Sync
    + 'static {
        move |request| {
            futures::future::ready(Ok(ReadResourceResult {
                contents: vec![ResourceContents::text(label, request.uri)],
            }))
        }
    }

    fn text_of(result: &ReadResourceResult) -> &str {
        match &result.contents[0] {
            ResourceContents::TextResourceContents { text, .. } => text,
            _ => panic!("expected text contents"),
        }
    }

    #[test]
    fn test_template_compilation() {
        let template = UriTemplate::new("users://{user}/posts/{post}").unwrap();
        assert_eq!(template.variables(), ["user", "post"]);
        let vars = template.matches("users://ada/posts/42").unwrap();
        assert_eq!(vars["user"], "ada");
        assert_eq!(vars["post"], "42");
        assert!(template.matches("users://ada/posts/").is_none());
        assert!(template.matches("users://ada/posts/42/extra").is_none());
    }

    #[test]
    fn test_template_escapes_literals_and_ignores_nested_braces() {
        let template = UriTemplate::new("data://v1.0/{id}?x").unwrap();
        assert!(template.matches("data://v1.0/7?x").is_some());
        assert!(template.matches("data://v1x0/7?x").is_none());

        let nested = UriTemplate::new("odd://{a{b}}").unwrap();
        assert_eq!(nested.variables(), ["b"]);
        assert!(nested.matches("odd://{azz}").is_some());

        let empty = UriTemplate::new("odd://{}").unwrap();
        assert!(empty.variables().is_empty());
        assert!(empty.matches("odd://{}").is_some());
    }

    #[tokio::test]
    async fn test_exact_uri_wins_over_template() {
        let mut registry = ResourceRegistry::new();
        registry
            .add_template(
                ResourceTemplate::new("file:///example/{filename}", "files"),
                text_reader("template"),
            )
            .unwrap();
        registry.add_resource(
            Resource::new("file:///example/test.txt", "test"),
            text_reader("exact"),
        );

        let result = registry.resolve("file:///example/test.txt").unwrap().await.unwrap();
        assert_eq!(text_of(&result), "exact");

        let result = registry.resolve("file:///example/other.txt").unwrap().await.unwrap();
        assert_eq!(text_of(&result), "template");
        assert_eq!(result.contents[0].uri(), "file:///example/other.txt");

        assert!(registry.resolve("file:///nowhere").is_none());
    }

    #[test]
    fn test_shared_name_space() {
        let mut registry = ResourceRegistry::new();
        registry.add_resource(Resource::new("test://a", "test"), text_reader("a"));
        registry.add_resource(Resource::new("test://b", "data"), text_reader("b"));
        assert_eq!(registry.names(), vec!["test", "data"]);
        assert!(registry.list_templates().is_empty());

        registry
            .add_template(ResourceTemplate::new("test://{x}", "test"), text_reader("t"))
            .unwrap();
        assert!(registry.get_resource("test").is_none());
        assert!(registry.get_template("test").is_some());

        assert!(registry.remove("test"));
        assert!(registry.remove("data"));
        assert!(registry.is_empty());
    }
}
