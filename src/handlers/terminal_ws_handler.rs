use actix_web::{HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::AppError;
use crate::security::terminal_credentials::CredentialVerifier;
use crate::services::command_dispatcher::CommandDispatcher;
use crate::services::inbound_report_handler::InboundReportHandler;
use crate::services::terminal_link_ws::TerminalLinkWs;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalConnectQuery {
    pub terminal_id: Option<String>,
    pub organization_id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, PartialEq)]
struct PresentedCredentials {
    terminal_id: String,
    organization_id: String,
    token: String,
}

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Query parameters win over headers.
fn presented_credentials(
    req: &HttpRequest,
    query: TerminalConnectQuery,
) -> Result<PresentedCredentials, AppError> {
    let terminal_id = query
        .terminal_id
        .or_else(|| header(req, "x-terminal-id"))
        .ok_or_else(|| AppError::Unauthorized("terminalId is required".to_string()))?;
    let organization_id = query
        .organization_id
        .or_else(|| header(req, "x-organization-id"))
        .ok_or_else(|| AppError::Unauthorized("organizationId is required".to_string()))?;
    let token = query
        .token
        .or_else(|| {
            header(req, "authorization")
                .and_then(|v| v.strip_prefix("Bearer ").map(str::to_string))
        })
        .ok_or_else(|| AppError::Unauthorized("token is required".to_string()))?;

    Ok(PresentedCredentials {
        terminal_id,
        organization_id,
        token,
    })
}

/// WebSocket endpoint for terminals. Credentials are checked before the upgrade.
pub async fn terminal_ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<TerminalConnectQuery>,
    verifier: web::Data<dyn CredentialVerifier>,
    dispatcher: web::Data<CommandDispatcher>,
    reports: web::Data<InboundReportHandler>,
) -> Result<HttpResponse, actix_web::Error> {
    let presented = presented_credentials(&req, query.into_inner())?;

    let identity = verifier
        .verify(
            &presented.terminal_id,
            &presented.organization_id,
            &presented.token,
        )
        .inspect_err(|e| {
            warn!(
                terminal_id = %presented.terminal_id,
                organization_id = %presented.organization_id,
                error = %e,
                "terminal_auth_rejected"
            );
        })?;

    info!(
        terminal_id = %identity.terminal_id,
        organization_id = %identity.organization_id,
        "Starting terminal WebSocket connection"
    );

    let actor = TerminalLinkWs::new(identity, dispatcher.into_inner(), reports.into_inner());
    ws::start(actor, &req, stream)
}
