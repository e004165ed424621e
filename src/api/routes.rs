use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/blocks", web::post().to(handlers::add_block))
            .route("/blocks/{index}", web::get().to(handlers::get_block))
            .route("/transactions", web::post().to(handlers::submit_transaction))
            .route("/chain/last-hash", web::get().to(handlers::get_last_hash))
            .route("/chain/size", web::get().to(handlers::get_size))
            .route("/balance/{address}", web::get().to(handlers::get_balance))
            .route("/mining/abort", web::post().to(handlers::abort_mining))
    );
}
