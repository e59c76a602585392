/// Replay pipeline error types.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MCAP error: {0}")]
    Mcap(#[from] mcap::McapError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Protobuf descriptor error: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("Invalid arguments for provider '{provider}': {reason}")]
    InvalidArgs { provider: String, reason: String },

    #[error("Topic '{0}' is provided by more than one source; add a rename stage")]
    TopicCollision(String),

    #[error("No schema for topic '{topic}' (datatype '{datatype}')")]
    MissingSchema { topic: String, datatype: String },

    #[error("Message decode failed: {0}")]
    Parse(String),

    #[error("Invalid time range: {0}")]
    InvalidRange(String),

    #[error("Provider '{0}' used before initialize")]
    NotInitialized(&'static str),

    #[error("Provider closed")]
    Closed,

    #[error("Worker disconnected")]
    WorkerDisconnected,

    #[error("Worker protocol error: {0}")]
    WorkerProtocol(String),

    #[error("Worker error: {0}")]
    Remote(String),

    #[error("Player error: {0}")]
    Player(String),
}

impl ReplayError {
    /// Whether the Player must treat the whole provider tree as unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplayError::WorkerDisconnected
                | ReplayError::WorkerProtocol(_)
                | ReplayError::Closed
                | ReplayError::NotInitialized(_)
                | ReplayError::TopicCollision(_)
                | ReplayError::MissingSchema { .. }
                | ReplayError::Io(_)
                | ReplayError::Mcap(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;
