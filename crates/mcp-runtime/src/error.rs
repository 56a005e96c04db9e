use std::fmt::Display;

pub use crate::model::ErrorData;

/// Boxed error returned by registered handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorCode, ErrorData};

    #[test]
    fn test_error_data_display_without_data() {
        let error = ErrorData::new(ErrorCode::INVALID_REQUEST, "Invalid Request", None);
        assert_eq!(format!("{}", error), "-32600: Invalid Request");
    }

    #[test]
    fn test_error_data_display_with_data() {
        let error = ErrorData::invalid_params(
            "Invalid arguments",
            Some(serde_json::json!({"detail": "missing field"})),
        );
        assert_eq!(
            format!("{}", error),
            "-32602: Invalid arguments({\"detail\":\"missing field\"})"
        );
    }

    #[test]
    fn test_error_data_is_std_error() {
        let error = ErrorData::resource_not_found("Resource file:///x not found", None);
        let boxed: BoxError = Box::new(error);
        assert!(boxed.to_string().starts_with("-32002"));
    }
}
