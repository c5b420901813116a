use graph_types::{Errno, Location, MsgType, TypesError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No destination could be resolved for a message.
    #[error("{msg_type} `{name}` is not connected to any destination")]
    MsgNotConnected { msg_type: MsgType, name: String },

    #[error("schema validation failed: {0}")]
    SchemaViolation(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("no extension registered at {0}")]
    ExtensionNotFound(Location),

    #[error("extension is closing")]
    Closed,

    #[error("result conversion failed: {0}")]
    Conversion(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Types(#[from] TypesError),
}

impl RuntimeError {
    pub fn errno(&self) -> Errno {
        match self {
            RuntimeError::MsgNotConnected { .. } => Errno::MsgNotConnected,
            RuntimeError::SchemaViolation(_) => Errno::InvalidJson,
            RuntimeError::InvalidGraph(_) => Errno::InvalidGraph,
            RuntimeError::ExtensionNotFound(_) => Errno::NotFound,
            RuntimeError::Closed => Errno::Closed,
            RuntimeError::Conversion(_) => Errno::Generic,
            RuntimeError::InvalidArgument(_) => Errno::InvalidArgument,
            RuntimeError::Json(_) => Errno::InvalidJson,
            RuntimeError::Types(e) => e.errno(),
        }
    }
}
