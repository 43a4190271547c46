mod manager;

pub use manager::{OpenAiTokenProvider, TokenError, TokenManager};
