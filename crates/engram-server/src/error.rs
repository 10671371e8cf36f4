use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use engram_schema::EngramError;

/// Error body: `{"error": {"code", "message"}}`, status per taxonomy.
pub struct ApiError(pub EngramError);

impl From<EngramError> for ApiError {
    fn from(e: EngramError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(e: &EngramError) -> StatusCode {
    match e {
        EngramError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        EngramError::NotFound(_) => StatusCode::NOT_FOUND,
        EngramError::Conflict(_) => StatusCode::CONFLICT,
        EngramError::FailedPrecondition(_) => StatusCode::CONFLICT,
        EngramError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        EngramError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        EngramError::Cancelled => StatusCode::BAD_REQUEST,
        EngramError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngramError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error on request: {}", self.0);
        }
        let body = serde_json::json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_documented_statuses() {
        assert_eq!(
            status_for(&EngramError::invalid_argument("x")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&EngramError::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&EngramError::conflict("x")), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&EngramError::resource_exhausted("x")),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&EngramError::DeadlineExceeded),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&EngramError::internal("x")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
