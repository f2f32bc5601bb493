pub mod connection;
pub mod handlers;
pub mod metrics_handler;
pub mod router;

pub use connection::{Connection, Database, RespServer, authenticate, dispatch};
pub use handlers::AppState;
pub use metrics_handler::metrics_handler;
pub use router::create_router;
