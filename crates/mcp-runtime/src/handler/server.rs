//! Server-side building blocks: the validator seam and the registries the
//! dispatcher routes into.
pub mod prompt;
pub mod resource;
pub mod tool;
pub mod validator;

pub use prompt::{PromptRegistry, PromptRoute, compile_template_messages, replace_tokens};
pub use resource::{
    ResourceRegistry, ResourceRequest, ResourceRoute, ResourceTemplateRoute, UriTemplate,
};
pub use tool::{ToolRegistry, ToolRoute};
#[cfg(feature = "schemars")]
pub use validator::{SchemaValidator, cached_schema_for_type, schema_for_type};
#[cfg(feature = "jsonschema")]
pub use validator::JsonSchemaValidator;
pub use validator::{AnyObjectValidator, FnValidator, ValidationError, Validator};
