use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{Error, ResponseError, web};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::security::terminal_credentials::constant_time_equal;

/// Shared key business services present on the `/api` scope. `None` disables the check.
#[derive(Clone, Debug, Default)]
pub struct ServiceApiKey(pub Option<String>);

/// Extract API key from request headers
/// Priority: X-API-Key header, then Authorization: ApiKey header
fn extract_api_key(req: &ServiceRequest) -> Option<String> {
    if let Some(value) = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }

    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("ApiKey "))
        .map(str::to_string)
}

pub async fn require_service_api_key(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<EitherBody<impl MessageBody>>, Error> {
    let expected = req
        .app_data::<web::Data<ServiceApiKey>>()
        .and_then(|key| key.0.clone());

    // Skip authentication for OPTIONS requests (CORS preflight) and open deployments
    let Some(expected) = expected.filter(|_| req.method() != actix_web::http::Method::OPTIONS)
    else {
        return Ok(next.call(req).await?.map_into_left_body());
    };

    let rejection = match extract_api_key(&req) {
        Some(presented) if constant_time_equal(&expected, &presented) => {
            debug!(path = %req.path(), "service api key accepted");
            return Ok(next.call(req).await?.map_into_left_body());
        }
        Some(_) => {
            warn!(path = %req.path(), "service api key rejected");
            AppError::Unauthorized("invalid service API key".to_string())
        }
        None => AppError::Unauthorized("missing service API key".to_string()),
    };

    Ok(req
        .into_response(rejection.error_response())
        .map_into_right_body())
}
