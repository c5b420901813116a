pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod extension;
pub mod extension_thread;
pub mod graph;
pub mod logger;
pub mod message;
mod msg_handling;
pub mod msg_kind;
pub mod path;
pub mod router;
pub mod schema;
pub mod timer;

pub use graph_types::{Errno, Location, MsgType, ResultReturnPolicy, StatusCode};

pub use engine::{AddonRegistry, Engine, EngineOptions, ResultStream};
pub use error::RuntimeError;
pub use extension::{Extension, ExtensionEnv};
pub use graph::{GraphDefinition, RoutingTable};
pub use message::{Message, ResultHandler};
pub use schema::{ExtensionApi, MsgApi};
