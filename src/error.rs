use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub hint: String,
    pub url: String,
    pub api_version: String,
    pub error_status: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            hint: hint.into(),
            url: CHAT_COMPLETIONS_PATH.to_string(),
            api_version: "v1".to_string(),
            error_status: "Failed".to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    pub fn with_error_status(mut self, error_status: impl Into<String>) -> Self {
        self.error_status = error_status.into();
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
            "Please try again later.",
        )
    }

    pub fn body(&self) -> serde_json::Value {
        serde_json::to_value(ErrorEnvelope::from(self)).unwrap_or_else(|_| {
            serde_json::json!({ "error": { "status": self.error_status, "message": self.message } })
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: String,
    message: String,
    hint: String,
    url: String,
    api_version: String,
}

impl From<&AppError> for ErrorEnvelope {
    fn from(err: &AppError) -> Self {
        Self {
            error: ErrorBody {
                status: err.error_status.clone(),
                message: err.message.clone(),
                hint: err.hint.clone(),
                url: err.url.clone(),
                api_version: err.api_version.clone(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope::from(&self);
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Plan ceiling that rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    Rpm,
    Rph,
    Rpd,
    Balance,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rpm => "RPM",
            Self::Rph => "RPH",
            Self::Rpd => "RPD",
            Self::Balance => "Balance",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("Model {0} is not available for your current plan.")]
    Forbidden(String),
    #[error("Model not found")]
    ModelNotFound(String),
    #[error("Provider {provider} does not support model {model}")]
    ModelNotSupported { provider: String, model: String },
    #[error("{} Limit Exceeded.", .0.as_str())]
    QuotaExceeded(LimitType),
    #[error("{0}")]
    Provider(String),
    #[error("account not found")]
    AccountNotFound,
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ModelNotFound(_) | Self::ModelNotSupported { .. } => StatusCode::NOT_FOUND,
            Self::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Provider(_) | Self::AccountNotFound | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn into_app_error(self, api_version: &str) -> AppError {
        let status = self.status();
        let (message, hint, error_status) = match &self {
            Self::Unauthorized(_) => (
                self.to_string(),
                "Check your API key and try again.",
                "Failed",
            ),
            Self::Forbidden(_) => (
                self.to_string(),
                "Upgrade your plan or choose a different model.",
                "Failed",
            ),
            Self::ModelNotFound(_) => (
                self.to_string(),
                "Ensure the model name is correct.",
                "Failed",
            ),
            Self::ModelNotSupported { .. } => (
                self.to_string(),
                "Check the provider and model name.",
                "Failed",
            ),
            Self::QuotaExceeded(LimitType::Balance) => (
                "Not enough quota available for this request.".to_string(),
                "Wait for your daily reset or upgrade your plan.",
                "Out of Quota",
            ),
            Self::QuotaExceeded(_) => (
                self.to_string(),
                "Reduce your request rate or upgrade your plan.",
                "Out of Quota",
            ),
            Self::Provider(_) => (self.to_string(), "An unexpected error occurred.", "Failed"),
            Self::AccountNotFound => (
                "A database error occurred while processing your request.".to_string(),
                "Please try again later.",
                "Failed",
            ),
            Self::Internal(_) => (
                "An internal server error occurred while processing your request.".to_string(),
                "Please try again later.",
                "Failed",
            ),
        };
        AppError::new(status, message, hint)
            .with_api_version(api_version)
            .with_error_status(error_status)
    }
}
