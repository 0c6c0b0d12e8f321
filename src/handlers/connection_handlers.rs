use actix_web::{HttpResponse, web};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::services::connection_registry::ConnectionRegistry;

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineResponse {
    pub terminal_id: String,
    pub online: bool,
}

pub async fn broadcast(
    body: web::Json<BroadcastRequest>,
    registry: web::Data<ConnectionRegistry>,
) -> Result<HttpResponse, AppError> {
    let count = registry.broadcast(&body.message);
    Ok(HttpResponse::Ok().json(BroadcastResponse { count }))
}

pub async fn broadcast_to_organization(
    path: web::Path<String>,
    body: web::Json<BroadcastRequest>,
    registry: web::Data<ConnectionRegistry>,
) -> Result<HttpResponse, AppError> {
    let count = registry.broadcast_to_organization(&path.into_inner(), &body.message);
    Ok(HttpResponse::Ok().json(BroadcastResponse { count }))
}

pub async fn is_terminal_online(
    path: web::Path<String>,
    registry: web::Data<ConnectionRegistry>,
) -> Result<HttpResponse, AppError> {
    let terminal_id = path.into_inner();
    let online = registry.is_online(&terminal_id);
    Ok(HttpResponse::Ok().json(OnlineResponse {
        terminal_id,
        online,
    }))
}

pub async fn connection_stats(
    registry: web::Data<ConnectionRegistry>,
) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(registry.stats()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TerminalIdentity;
    use crate::test_support::RecordingHandle;
    use actix_web::{App, test};
    use serde_json::Value as JsonValue;
    use uuid::Uuid;

    #[actix_rt::test]
    async fn test_online_and_stats() {
        let registry = web::Data::new(ConnectionRegistry::new(4));
        registry.add_connection(
            &TerminalIdentity {
                terminal_id: "T1".into(),
                organization_id: "org".into(),
            },
            Uuid::new_v4(),
            RecordingHandle::new(),
        );

        let app = test::init_service(
            App::new()
                .app_data(registry.clone())
                .route("/api/terminals/{id}/online", web::get().to(is_terminal_online))
                .route("/api/connections/stats", web::get().to(connection_stats))
                .route("/api/broadcast", web::post().to(broadcast)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/terminals/T1/online").to_request();
        let body: JsonValue = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["online"], true);

        let req = test::TestRequest::get().uri("/api/terminals/T9/online").to_request();
        let body: JsonValue = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["online"], false);

        let req = test::TestRequest::get().uri("/api/connections/stats").to_request();
        let body: JsonValue = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["totalConnections"], 1);
        assert_eq!(body["perShardCounts"].as_array().map(Vec::len), Some(4));

        let req = test::TestRequest::post()
            .uri("/api/broadcast")
            .set_json(serde_json::json!({"message": "{\"type\":\"notice\"}"}))
            .to_request();
        let body: JsonValue = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
    }
}
