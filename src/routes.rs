use actix_web::middleware::from_fn;
use actix_web::web;

use crate::handlers::{command_handlers, connection_handlers, health, terminal_ws_handler};
use crate::middleware::require_service_api_key;

/// Unauthenticated routes: health and the terminal socket, which checks its own credentials.
pub fn configure_public_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .route(
            "/ws/terminal",
            web::get().to(terminal_ws_handler::terminal_ws_handler),
        );
}

// Configure service API routes (requires the service API key when one is set)
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .wrap(from_fn(require_service_api_key))
            .route("/commands", web::post().to(command_handlers::send_command))
            .route("/broadcast", web::post().to(connection_handlers::broadcast))
            .route(
                "/organizations/{organization_id}/broadcast",
                web::post().to(connection_handlers::broadcast_to_organization),
            )
            .route(
                "/connections/stats",
                web::get().to(connection_handlers::connection_stats),
            )
            .service(
                web::scope("/terminals/{terminal_id}")
                    .route(
                        "/commands",
                        web::post().to(command_handlers::send_terminal_command),
                    )
                    .route(
                        "/pending",
                        web::get().to(command_handlers::get_pending_commands),
                    )
                    .route(
                        "/online",
                        web::get().to(connection_handlers::is_terminal_online),
                    ),
            ),
    );
}
