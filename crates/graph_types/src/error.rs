use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;

/// Coarse error category carried across API boundaries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Errno {
    Generic,
    InvalidArgument,
    InvalidJson,
    InvalidGraph,
    MsgNotConnected,
    Timeout,
    NotFound,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    #[error("unknown result return policy `{0}`")]
    UnknownPolicy(String),
}

impl TypesError {
    pub fn errno(&self) -> Errno {
        Errno::InvalidArgument
    }
}
