//! The seam between protocol dispatch and whichever schema engine checks
//! tool and prompt arguments.
//!
//! A [`Validator`] carries the schema that is advertised to clients and a
//! `parse` step that turns raw JSON arguments into the handler's input type.
//! Most validators only forward the schema; [`JsonSchemaValidator`] (behind
//! the `jsonschema` feature) also checks arguments against it.
use std::{marker::PhantomData, sync::Arc};

use serde_json::{Value, json};

use crate::model::JsonObject;

/// A failed argument check. `detail` is forwarded as the `data` member of the
/// resulting InvalidParams error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub detail: Option<Value>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub trait Validator: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Schema advertised in tool and prompt descriptors.
    fn schema(&self) -> Arc<JsonObject>;

    fn parse(&self, raw: &Value) -> Result<Self::Output, ValidationError>;
}

/// A validator built from a schema and a caller supplied parse function.
///
/// ```rust
/// # use mcp_runtime::handler::server::{FnValidator, ValidationError, Validator};
/// # use serde_json::json;
/// let positive = FnValidator::new(
///     json!({"type": "object", "properties": {"n": {"type": "integer"}}}),
///     |raw: &serde_json::Value| {
///         raw.get("n")
///             .and_then(|n| n.as_i64())
///             .filter(|n| *n > 0)
///             .ok_or_else(|| ValidationError::new("n must be a positive integer"))
///     },
/// );
/// assert_eq!(positive.parse(&json!({"n": 3})).unwrap(), 3);
/// assert!(positive.parse(&json!({"n": -1})).is_err());
/// ```
pub struct FnValidator<F, T> {
    schema: Arc<JsonObject>,
    parse: F,
    _output: PhantomData<fn() -> T>,
}

impl<F, T> FnValidator<F, T>
where
    F: Fn(&Value) -> Result<T, ValidationError> + Send + Sync + 'static,
    T: Send + 'static,
{
    /// A non-object `schema` is advertised as an empty object schema.
    pub fn new(schema: Value, parse: F) -> Self {
        let schema = match schema {
            Value::Object(object) => object,
            _ => JsonObject::new(),
        };
        Self {
            schema: Arc::new(schema),
            parse,
            _output: PhantomData,
        }
    }
}

impl<F, T> Validator for FnValidator<F, T>
where
    F: Fn(&Value) -> Result<T, ValidationError> + Send + Sync + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn schema(&self) -> Arc<JsonObject> {
        self.schema.clone()
    }

    fn parse(&self, raw: &Value) -> Result<T, ValidationError> {
        (self.parse)(raw)
    }
}

/// Accepts any JSON object unchanged. Used for tools and prompts that take
/// free-form or no arguments.
#[derive(Debug, Clone)]
pub struct AnyObjectValidator {
    schema: Arc<JsonObject>,
}

impl Default for AnyObjectValidator {
    fn default() -> Self {
        let mut schema = JsonObject::new();
        schema.insert("type".into(), Value::String("object".into()));
        Self {
            schema: Arc::new(schema),
        }
    }
}

impl Validator for AnyObjectValidator {
    type Output = JsonObject;

    fn schema(&self) -> Arc<JsonObject> {
        self.schema.clone()
    }

    fn parse(&self, raw: &Value) -> Result<JsonObject, ValidationError> {
        match raw {
            Value::Object(object) => Ok(object.clone()),
            other => Err(ValidationError::new("expected an object")
                .with_detail(json!({"received": type_name(other)}))),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(feature = "schemars")]
mod schema {
    use std::{
        any::TypeId,
        collections::HashMap,
        marker::PhantomData,
        sync::{Arc, PoisonError, RwLock},
    };

    use schemars::{JsonSchema, generate::SchemaSettings};
    use serde::de::DeserializeOwned;
    use serde_json::{Value, json};

    use super::{ValidationError, Validator};
    use crate::model::JsonObject;

    /// A shortcut for generating a JSON schema for a type.
    pub fn schema_for_type<T: JsonSchema>() -> JsonObject {
        // align json schema version to the protocol's dialect
        let mut settings = SchemaSettings::draft2020_12();
        settings.transforms = vec![Box::new(schemars::transform::AddNullable::default())];
        let generator = settings.into_generator();
        let schema = generator.into_root_schema_for::<T>();
        match Value::from(schema) {
            Value::Object(object) => object,
            _ => JsonObject::new(),
        }
    }

    /// Call [`schema_for_type`] with a cache
    pub fn cached_schema_for_type<T: JsonSchema + std::any::Any>() -> Arc<JsonObject> {
        thread_local! {
            static CACHE_FOR_TYPE: RwLock<HashMap<TypeId, Arc<JsonObject>>> = Default::default();
        };
        CACHE_FOR_TYPE.with(|cache| {
            if let Some(x) = cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&TypeId::of::<T>())
            {
                x.clone()
            } else {
                let schema = Arc::new(schema_for_type::<T>());
                cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(TypeId::of::<T>(), schema.clone());
                schema
            }
        })
    }

    /// Validates by deserializing into `T`; the schema is generated from `T`.
    pub struct SchemaValidator<T> {
        schema: Arc<JsonObject>,
        _output: PhantomData<fn() -> T>,
    }

    impl<T: JsonSchema + DeserializeOwned + Send + 'static> SchemaValidator<T> {
        pub fn new() -> Self {
            Self {
                schema: cached_schema_for_type::<T>(),
                _output: PhantomData,
            }
        }
    }

    impl<T: JsonSchema + DeserializeOwned + Send + 'static> Default for SchemaValidator<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<T: JsonSchema + DeserializeOwned + Send + 'static> Validator for SchemaValidator<T> {
        type Output = T;

        fn schema(&self) -> Arc<JsonObject> {
            self.schema.clone()
        }

        fn parse(&self, raw: &Value) -> Result<T, ValidationError> {
            <T as serde::Deserialize>::deserialize(raw).map_err(|e| {
                ValidationError::new(e.to_string()).with_detail(json!({"reason": e.to_string()}))
            })
        }
    }
}

#[cfg(feature = "schemars")]
pub use schema::{SchemaValidator, cached_schema_for_type, schema_for_type};

#[cfg(feature = "jsonschema")]
mod json_schema {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use super::{ValidationError, Validator};
    use crate::model::JsonObject;

    /// Checks raw arguments against a caller supplied JSON Schema and hands
    /// them to the handler unchanged when they conform.
    pub struct JsonSchemaValidator {
        schema: Arc<JsonObject>,
        compiled: jsonschema::Validator,
    }

    impl std::fmt::Debug for JsonSchemaValidator {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("JsonSchemaValidator")
                .field("schema", &self.schema)
                .finish()
        }
    }

    impl JsonSchemaValidator {
        /// Compile `schema`. Fails if it is not an object or not a valid schema.
        pub fn new(schema: Value) -> Result<Self, ValidationError> {
            let compiled = jsonschema::validator_for(&schema).map_err(|e| {
                ValidationError::new(format!("invalid schema: {e}"))
                    .with_detail(json!({"reason": e.to_string()}))
            })?;
            let Value::Object(schema) = schema else {
                return Err(ValidationError::new("invalid schema: expected an object"));
            };
            Ok(Self {
                schema: Arc::new(schema),
                compiled,
            })
        }
    }

    impl Validator for JsonSchemaValidator {
        type Output = Value;

        fn schema(&self) -> Arc<JsonObject> {
            self.schema.clone()
        }

        fn parse(&self, raw: &Value) -> Result<Value, ValidationError> {
            let errors: Vec<String> = self
                .compiled
                .iter_errors(raw)
                .map(|e| e.to_string())
                .collect();
            if errors.is_empty() {
                return Ok(raw.clone());
            }
            Err(ValidationError::new(errors.join(", ")).with_detail(json!({"errors": errors})))
        }
    }
}

#[cfg(feature = "jsonschema")]
pub use json_schema::JsonSchemaValidator;
