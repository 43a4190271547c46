pub mod concurrency;
pub mod cooldown;
pub mod forwarder;
pub mod handlers;
pub mod identity;
pub mod middleware;
pub mod passthrough;
pub mod selection;
pub mod server;
pub mod session_hash;
pub mod state;
pub mod token;
pub mod upstream;
pub mod usage;

pub use server::build_router;
pub use state::AppState;
