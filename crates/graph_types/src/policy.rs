use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::TypesError;

/// How the results of a fanned-out command are folded back into what the
/// original sender sees.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, Hash,
    Serialize, Deserialize, JsonSchema, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResultReturnPolicy {
    /// Every result of every member is passed through.
    #[default]
    EachOkAndError,
    /// The first result to arrive, error or not, settles the group.
    FirstErrorOrFirstOk,
    /// The first error settles the group; otherwise the last OK once every
    /// member has answered.
    FirstErrorOrLastOk,
}

impl FromStr for ResultReturnPolicy {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "each_ok_and_error" => Ok(Self::EachOkAndError),
            "first_error_or_first_ok" => Ok(Self::FirstErrorOrFirstOk),
            "first_error_or_last_ok" => Ok(Self::FirstErrorOrLastOk),
            _ => Err(TypesError::UnknownPolicy(s.to_string())),
        }
    }
}
