//! Upstream error enhancement
//!
//! Transforms cryptic upstream API errors into user-friendly messages.

use serde_json::Value;

/// Structured information about an upstream API error
#[derive(Debug, Clone)]
pub struct UpstreamErrorInfo {
    /// Error reason code reported by the upstream
    pub reason: String,
    /// Enhanced message for end users
    pub user_message: String,
    /// Original upstream message (for logging)
    pub original_message: String,
}

/// Enhance a parsed upstream error body.
///
/// Expected shape: `{"message": "...", "reason": "..."}`; both fields are
/// optional.
pub fn enhance_upstream_error(error_json: &Value) -> UpstreamErrorInfo {
    let original_message = error_json
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown error")
        .to_string();

    let reason = error_json
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("UNKNOWN")
        .to_string();

    let user_message = match reason.as_str() {
        "CONTENT_LENGTH_EXCEEDS_THRESHOLD" => {
            "Model context limit reached. Conversation size exceeds model capacity.".to_string()
        }
        "MONTHLY_REQUEST_LIMIT_REACHED" | "MONTHLY_REQUEST_COUNT" => {
            "Monthly request limit exceeded. Account has reached its monthly quota.".to_string()
        }
        "RATE_LIMIT_EXCEEDED" => {
            "Rate limit exceeded. Please wait a moment before retrying.".to_string()
        }
        "SERVICE_UNAVAILABLE" => {
            "Upstream service temporarily unavailable. Please try again later.".to_string()
        }
        "THROTTLING_EXCEPTION" => "Too many requests. Please slow down and try again.".to_string(),
        "VALIDATION_EXCEPTION" => format!("Invalid request: {}", original_message),
        "UNKNOWN" => original_message.clone(),
        _ => format!("{} (reason: {})", original_message, reason),
    };

    UpstreamErrorInfo {
        reason,
        user_message,
        original_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_length_error_enhanced() {
        let info = enhance_upstream_error(&json!({
            "message": "Input is too long.",
            "reason": "CONTENT_LENGTH_EXCEEDS_THRESHOLD"
        }));
        assert!(info.user_message.contains("context limit"));
        assert_eq!(info.original_message, "Input is too long.");
    }

    #[test]
    fn test_monthly_limit_error_enhanced() {
        let info = enhance_upstream_error(&json!({
            "message": "You have reached the limit.",
            "reason": "MONTHLY_REQUEST_COUNT"
        }));
        assert!(info.user_message.contains("Monthly request limit"));
    }

    #[test]
    fn test_unknown_reason_keeps_original_with_suffix() {
        let info = enhance_upstream_error(&json!({
            "message": "Something went wrong.",
            "reason": "FUTURE_ERROR"
        }));
        assert_eq!(info.user_message, "Something went wrong. (reason: FUTURE_ERROR)");
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let info = enhance_upstream_error(&json!({}));
        assert_eq!(info.reason, "UNKNOWN");
        assert_eq!(info.user_message, "Unknown error");
    }

    #[test]
    fn test_validation_exception_includes_original() {
        let info = enhance_upstream_error(&json!({
            "message": "Invalid model ID.",
            "reason": "VALIDATION_EXCEPTION"
        }));
        assert!(info.user_message.contains("Invalid request"));
        assert!(info.user_message.contains("Invalid model ID"));
    }
}
