pub mod auth;
pub mod config;
pub mod database;
pub mod handlers;
pub mod hub;
pub mod repositories;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod websocket;

pub use routes::create_app;
pub use state::AppState;
