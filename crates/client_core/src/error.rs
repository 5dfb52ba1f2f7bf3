use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("unknown chat out-of-band system: {0}")]
    UnknownChatSystem(String),
    #[error("failed to decode {system} body: {source}")]
    Decode {
        system: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("system clock requires a running tokio runtime")]
    NoRuntime,
}
