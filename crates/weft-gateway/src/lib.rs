mod auth;
mod error;
mod middleware;
mod routes;
mod server;
mod state;
mod stream;

pub use error::ApiError;
pub use server::{build_app, GatewayServer};
pub use state::AppState;
pub use stream::RunEventFeed;
