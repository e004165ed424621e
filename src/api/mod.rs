// API module
//
// HTTP transport for the node operations

pub mod handlers;
pub mod routes;

// Re-export main components for easier access
pub use routes::configure_routes;
