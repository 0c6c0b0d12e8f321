use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::AppError;
use crate::models::{CommandIntent, ExecutionMode};
use crate::services::command_dispatcher::CommandDispatcher;

/// Body of `POST /api/terminals/{terminalId}/commands`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommandRequest {
    pub organization_id: String,
    pub kind: String,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Submit a command for one terminal.
pub async fn send_terminal_command(
    path: web::Path<String>,
    body: web::Json<SendCommandRequest>,
    dispatcher: web::Data<CommandDispatcher>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let intent = CommandIntent {
        terminal_id: path.into_inner(),
        organization_id: body.organization_id,
        kind: body.kind,
        execution_mode: body.execution_mode,
        payload: body.payload,
        expires_at: body.expires_at,
    };

    let result = dispatcher.send_command(intent).await?;
    Ok(HttpResponse::Ok().json(result))
}

/// Same as `send_terminal_command` with the terminal id in the body.
pub async fn send_command(
    body: web::Json<CommandIntent>,
    dispatcher: web::Data<CommandDispatcher>,
) -> Result<HttpResponse, AppError> {
    let result = dispatcher.send_command(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(result))
}

/// Pending offline messages for a terminal, in delivery order.
pub async fn get_pending_commands(
    path: web::Path<String>,
    dispatcher: web::Data<CommandDispatcher>,
) -> Result<HttpResponse, AppError> {
    let pending = dispatcher.pending_for(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(pending))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::command_dispatcher::DispatcherConfig;
    use crate::services::command_queue::MemoryCommandQueueStore;
    use crate::services::connection_registry::ConnectionRegistry;
    use crate::services::offline_message_store::MemoryOfflineMessageStore;
    use actix_web::{App, http::StatusCode, test};
    use std::sync::Arc;

    fn dispatcher() -> web::Data<CommandDispatcher> {
        web::Data::new(CommandDispatcher::new(
            Arc::new(ConnectionRegistry::new(2)),
            Arc::new(MemoryCommandQueueStore::new()),
            Arc::new(MemoryOfflineMessageStore::new()),
            DispatcherConfig::default(),
        ))
    }

    #[actix_rt::test]
    async fn test_offline_terminal_command_is_queued() {
        let app = test::init_service(
            App::new()
                .app_data(dispatcher())
                .route(
                    "/api/terminals/{terminal_id}/commands",
                    web::post().to(send_terminal_command),
                )
                .route(
                    "/api/terminals/{terminal_id}/pending",
                    web::get().to(get_pending_commands),
                ),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/terminals/T1/commands")
            .set_json(serde_json::json!({
                "organizationId": "org",
                "kind": "brightness",
                "executionMode": "PUT",
                "payload": {"brightness": 50}
            }))
            .to_request();
        let body: JsonValue = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["delivered"], false);
        assert_eq!(body["queuedOffline"], true);
        assert!(body["commandId"].as_i64().is_some());

        let req = test::TestRequest::get()
            .uri("/api/terminals/T1/pending")
            .to_request();
        let pending: JsonValue = test::call_and_read_body_json(&app, req).await;
        assert_eq!(pending.as_array().map(Vec::len), Some(1));
        assert_eq!(pending[0]["kind"], "brightness");
        assert_eq!(pending[0]["status"], "PENDING");
    }

    #[actix_rt::test]
    async fn test_blank_kind_is_bad_request() {
        let app = test::init_service(
            App::new()
                .app_data(dispatcher())
                .route("/api/commands", web::post().to(send_command)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/commands")
            .set_json(serde_json::json!({
                "terminalId": "T1",
                "organizationId": "org",
                "kind": "",
                "executionMode": "GET"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
