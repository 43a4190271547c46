pub mod body_limit;
pub mod client;
pub mod retry;

pub use body_limit::{read_body_limited, BodyLimitError, DEFAULT_UPSTREAM_RESPONSE_READ_MAX_BYTES};
pub use client::UpstreamClient;
