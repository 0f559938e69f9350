//! HTTP API endpoints.

pub mod health;
pub mod query;
pub mod schema;

use axum::Router;
use axum::http::StatusCode;

use crate::AppState;
use crate::error::ReasonCode;

/// Create the API router.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(query::router())
        .merge(schema::router())
}

/// HTTP status for a failed request.
pub fn status_for(reason: ReasonCode) -> StatusCode {
    match reason {
        ReasonCode::InvalidQuestion => StatusCode::BAD_REQUEST,
        ReasonCode::SynthesisEmpty
        | ReasonCode::DisallowedStatement
        | ReasonCode::MultiStatement
        | ReasonCode::UnknownIdentifier
        | ReasonCode::ForbiddenSystemAccess
        | ReasonCode::SyntaxError => StatusCode::UNPROCESSABLE_ENTITY,
        ReasonCode::ProviderError => StatusCode::BAD_GATEWAY,
        ReasonCode::SchemaUnavailable | ReasonCode::IndexNotReady | ReasonCode::RetrievalEmpty => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ReasonCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        ReasonCode::ExecutionError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
