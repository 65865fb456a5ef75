use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mlreg_core::{ErrorCategory, RegistryError};
use serde::Serialize;
use tracing::{error, warn};

/// A [`RegistryError`] on its way out of a handler.
///
/// The response carries only the status and an [`ErrorDetail`] extension;
/// the request context middleware renders the JSON body so that it can add
/// the request id and path.
#[derive(Debug)]
pub struct ApiError(pub RegistryError);

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_for(&self.0)
    }
}

pub fn status_for(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RegistryError::NotTrained | RegistryError::Training(_) => StatusCode::BAD_REQUEST,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Unauthorized(_) => StatusCode::FORBIDDEN,
        RegistryError::Persistence(_)
        | RegistryError::Serialization(_)
        | RegistryError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// What the client is told about a failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub error: &'static str,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Full error body: the detail plus request context.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(flatten)]
    pub detail: ErrorDetail,
    pub request_id: String,
    pub timestamp: String,
    pub path: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self.0.category() {
            ErrorCategory::SystemError | ErrorCategory::ConfigError => {
                error!(kind = self.0.kind(), "Request failed: {}", self.0)
            }
            ErrorCategory::UserError | ErrorCategory::SecurityError => {
                warn!(kind = self.0.kind(), "Request rejected: {}", self.0)
            }
        }

        let detail = ErrorDetail {
            error: self.0.kind(),
            detail: self.0.user_message(),
            field: self.0.field().map(str::to_string),
        };
        let mut response = status.into_response();
        response.extensions_mut().insert(detail);
        response
    }
}
