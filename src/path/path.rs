use std::fmt;

use graph_types::Location;
use tracing::error;

use crate::message::{Message, ResultHandler};
use crate::path::{conversion::ResultConversion, group::GroupId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathType {
    In,
    Out,
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathType::In => f.write_str("in"),
            PathType::Out => f.write_str("out"),
        }
    }
}

/// Bookkeeping for one command in flight through an extension.
#[derive(Debug, Clone)]
pub struct Path {
    pub(crate) path_type: PathType,
    pub(crate) cmd_name: String,
    /// Id the previous hop knows this command by; restored on the result.
    pub(crate) original_cmd_id: String,
    pub(crate) cmd_id: String,
    pub(crate) src_loc: Location,
    pub(crate) dest_loc: Location,
    pub(crate) group: Option<GroupId>,
    pub(crate) cached_cmd_result: Option<Message>,
    pub(crate) result_conversion: Option<ResultConversion>,
    pub(crate) result_handler: Option<ResultHandler>,
    pub(crate) expired_time_us: u64,
}

impl Path {
    pub(crate) fn new(
        path_type: PathType,
        cmd: &Message,
        result_conversion: Option<ResultConversion>,
        expired_time_us: u64,
    ) -> Self {
        Self {
            path_type,
            cmd_name: cmd.name.clone(),
            original_cmd_id: cmd.parent_cmd_id.clone(),
            cmd_id: cmd.cmd_id.clone(),
            src_loc: cmd.src_loc.clone(),
            dest_loc: cmd.dest_locs.first().cloned().unwrap_or_default(),
            group: None,
            cached_cmd_result: None,
            result_conversion,
            result_handler: None,
            expired_time_us,
        }
    }

    pub fn path_type(&self) -> PathType {
        self.path_type
    }

    pub fn cmd_name(&self) -> &str {
        &self.cmd_name
    }

    pub fn cmd_id(&self) -> &str {
        &self.cmd_id
    }

    pub fn original_cmd_id(&self) -> &str {
        &self.original_cmd_id
    }

    pub fn src_loc(&self) -> &Location {
        &self.src_loc
    }

    pub fn dest_loc(&self) -> &Location {
        &self.dest_loc
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn cached_cmd_result(&self) -> Option<&Message> {
        self.cached_cmd_result.as_ref()
    }

    pub fn expired_time_us(&self) -> u64 {
        self.expired_time_us
    }

    pub fn is_expired(&self, now_us: u64) -> bool {
        self.expired_time_us != u64::MAX && self.expired_time_us <= now_us
    }

    /// Cache `result` (converted if this path carries a conversion),
    /// replacing whatever was cached before.
    pub(crate) fn set_result(&mut self, result: &Message) {
        let cached = match &self.result_conversion {
            Some(conversion) => match conversion.convert_result(result) {
                Ok(converted) => converted,
                Err(e) => {
                    error!(
                        cmd_id = %self.cmd_id,
                        cmd = %self.cmd_name,
                        "failed to convert result, passing it through unconverted: {e}"
                    );
                    result.clone()
                }
            },
            None => result.clone(),
        };
        self.cached_cmd_result = Some(cached);
    }
}
