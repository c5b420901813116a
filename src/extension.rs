use std::sync::Arc;

use async_trait::async_trait;
use graph_types::{Location, MsgType, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatch::dispatch_msg;
use crate::error::RuntimeError;
use crate::graph::RoutingTable;
use crate::message::Message;
use crate::msg_kind::MsgKindTable;
use crate::path::PathTable;
use crate::router::MsgRouter;
use crate::schema::{ExtensionApi, SchemaStore};

/// A message-processing unit living at one location of a graph.
///
/// Every callback runs on the extension's own task; the [`ExtensionEnv`]
/// it receives is the only way to send messages or return results.
#[async_trait]
pub trait Extension: Send + 'static {
    /// Message interface used to build the extension's schema store.
    fn api(&self) -> ExtensionApi {
        ExtensionApi::default()
    }

    async fn on_start(&mut self, _env: &mut ExtensionEnv<'_>) {}

    async fn on_stop(&mut self, _env: &mut ExtensionEnv<'_>) {}

    /// Answers OK unless overridden.
    async fn on_cmd(&mut self, env: &mut ExtensionEnv<'_>, cmd: Message) {
        let result = Message::cmd_result_from_cmd(StatusCode::Ok, &cmd);
        if let Err(e) = env.return_result(result) {
            warn!(extension = %env.loc(), cmd = cmd.name(), "failed to return result: {e}");
        }
    }

    async fn on_data(&mut self, env: &mut ExtensionEnv<'_>, data: Message) {
        forward(env, data);
    }

    async fn on_audio_frame(&mut self, env: &mut ExtensionEnv<'_>, frame: Message) {
        forward(env, frame);
    }

    async fn on_video_frame(&mut self, env: &mut ExtensionEnv<'_>, frame: Message) {
        forward(env, frame);
    }
}

fn forward(env: &mut ExtensionEnv<'_>, msg: Message) {
    let (msg_type, name) = (msg.msg_type(), msg.name().to_string());
    if let Err(e) = env.core.send(msg) {
        match e {
            RuntimeError::MsgNotConnected { .. } => {
                debug!(extension = %env.loc(), %msg_type, name = %name, "not forwarded: {e}")
            }
            e => warn!(extension = %env.loc(), %msg_type, name = %name, "forwarding failed: {e}"),
        }
    }
}

/// State an extension task owns besides the extension itself.
#[derive(Debug)]
pub struct ExtensionCore {
    pub(crate) loc: Location,
    pub(crate) path_table: PathTable,
    pub(crate) routing: Arc<RoutingTable>,
    pub(crate) schema: SchemaStore,
    pub(crate) kinds: Arc<MsgKindTable>,
    pub(crate) router: MsgRouter,
    pub(crate) properties: Value,
    pub(crate) closing: bool,
}

impl ExtensionCore {
    pub(crate) fn new(
        path_table: PathTable,
        routing: Arc<RoutingTable>,
        schema: SchemaStore,
        kinds: Arc<MsgKindTable>,
        router: MsgRouter,
        properties: Value,
    ) -> Self {
        Self {
            loc: path_table.attach_to().loc().clone(),
            path_table,
            routing,
            schema,
            kinds,
            router,
            properties,
            closing: false,
        }
    }

    /// Fill schema defaults then validate.
    pub(crate) fn check_schema(
        &self,
        msg: &mut Message,
        is_outgoing: bool,
    ) -> Result<(), RuntimeError> {
        self.schema.adjust_msg_properties(msg, is_outgoing)?;
        self.kinds.validate_schema(&self.schema, msg, is_outgoing)
    }

    fn send(&mut self, msg: Message) -> Result<(), RuntimeError> {
        if self.closing && msg.msg_type().is_cmd() {
            return Err(RuntimeError::Closed);
        }
        dispatch_msg(self, msg)
    }
}

fn expect_type(msg: &Message, expected: MsgType) -> Result<(), RuntimeError> {
    if msg.msg_type() == expected {
        Ok(())
    } else {
        Err(RuntimeError::InvalidArgument(format!(
            "expected a {expected}, got a {} `{}`",
            msg.msg_type(),
            msg.name()
        )))
    }
}

/// Handle given to extension callbacks and result handlers.
pub struct ExtensionEnv<'a> {
    core: &'a mut ExtensionCore,
}

impl<'a> ExtensionEnv<'a> {
    pub(crate) fn new(core: &'a mut ExtensionCore) -> Self {
        Self { core }
    }

    pub fn loc(&self) -> &Location {
        &self.core.loc
    }

    /// Properties from the graph node, defaults already filled in.
    pub fn properties(&self) -> &Value {
        &self.core.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.core.properties.get(key)
    }

    pub fn path_table(&self) -> &PathTable {
        &self.core.path_table
    }

    pub fn is_closing(&self) -> bool {
        self.core.closing
    }

    /// Send a command. Without explicit destinations the graph decides
    /// where it goes; every result comes back to the command's result
    /// handler.
    pub fn send_cmd(&mut self, cmd: Message) -> Result<(), RuntimeError> {
        expect_type(&cmd, MsgType::Cmd)?;
        self.core.send(cmd)
    }

    pub fn send_data(&mut self, data: Message) -> Result<(), RuntimeError> {
        expect_type(&data, MsgType::Data)?;
        self.core.send(data)
    }

    pub fn send_audio_frame(&mut self, frame: Message) -> Result<(), RuntimeError> {
        expect_type(&frame, MsgType::AudioFrame)?;
        self.core.send(frame)
    }

    pub fn send_video_frame(&mut self, frame: Message) -> Result<(), RuntimeError> {
        expect_type(&frame, MsgType::VideoFrame)?;
        self.core.send(frame)
    }

    /// Answer a command this extension received. The result travels back
    /// along the command's IN path; a result for a path that is already
    /// gone is dropped quietly.
    pub fn return_result(&mut self, result: Message) -> Result<(), RuntimeError> {
        expect_type(&result, MsgType::CmdResult)?;
        self.core.send(result)
    }
}
