pub mod conversion;
pub mod group;
pub mod list;
#[allow(clippy::module_inception)]
pub mod path;
pub mod table;

pub use conversion::{ConversionMode, ConversionRule, MsgConversion, ResultConversion};
pub use group::{GroupId, GroupResolution, PathGroup};
pub use list::PathId;
pub use path::{Path, PathType};
pub use table::{AttachTo, PathTable, PATH_LEAK_THRESHOLD};
