use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Every message flowing between extensions is one of these kinds.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, JsonSchema, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MsgType {
    Cmd,
    CmdResult,
    Data,
    AudioFrame,
    VideoFrame,
}

impl MsgType {
    pub fn is_cmd(&self) -> bool {
        matches!(self, MsgType::Cmd)
    }

    pub fn is_result(&self) -> bool {
        matches!(self, MsgType::CmdResult)
    }

    /// Commands and results are correlated through paths; the other kinds
    /// are fire-and-forget.
    pub fn is_cmd_like(&self) -> bool {
        matches!(self, MsgType::Cmd | MsgType::CmdResult)
    }
}

#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, Hash,
    Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StatusCode {
    #[default]
    Ok,
    Error,
}

impl StatusCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, StatusCode::Ok)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StatusCode::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn names_round_trip_through_strum() {
        for t in MsgType::iter() {
            assert_eq!(MsgType::from_str(&t.to_string()).unwrap(), t);
        }
        assert_eq!(MsgType::AudioFrame.to_string(), "audio_frame");
    }

    #[test]
    fn only_cmd_and_result_are_cmd_like() {
        let cmd_like: Vec<_> = MsgType::iter().filter(|t| t.is_cmd_like()).collect();
        assert_eq!(cmd_like, vec![MsgType::Cmd, MsgType::CmdResult]);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&StatusCode::Error).unwrap(), "\"error\"");
        assert_eq!(StatusCode::default(), StatusCode::Ok);
    }
}
