pub mod error;
pub mod loc;
pub mod msg_type;
pub mod policy;

pub use error::{Errno, TypesError};
pub use loc::Location;
pub use msg_type::{MsgType, StatusCode};
pub use policy::ResultReturnPolicy;
