use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use graph_types::{Location, MsgType, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::extension::ExtensionEnv;
use crate::path::ResultConversion;

/// Property carrying the human readable explanation of an ERROR result.
pub const DETAIL_PROPERTY: &str = "detail";

/// Callback invoked with every result correlated to a command sent by an
/// extension. Captured onto the OUT path when the command leaves and moved
/// back onto the result once it is resolved.
#[derive(Clone)]
pub struct ResultHandler(Arc<dyn Fn(&mut ExtensionEnv<'_>, Message) + Send + Sync>);

impl ResultHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut ExtensionEnv<'_>, Message) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, env: &mut ExtensionEnv<'_>, result: Message) {
        (self.0)(env, result)
    }
}

impl fmt::Debug for ResultHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResultHandler")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub(crate) msg_type: MsgType,
    /// For results, the name of the command being answered.
    pub(crate) name: String,
    pub(crate) src_loc: Location,
    pub(crate) dest_locs: Vec<Location>,
    pub(crate) properties: Map<String, Value>,
    pub(crate) timestamp: DateTime<Utc>,

    pub(crate) cmd_id: String,
    pub(crate) parent_cmd_id: String,

    pub(crate) status: StatusCode,
    pub(crate) is_final: bool,
    pub(crate) completed: bool,

    #[serde(skip)]
    pub(crate) result_handler: Option<ResultHandler>,
    /// Conversion the receiving extension attaches to its IN path.
    #[serde(skip)]
    pub(crate) result_conversion: Option<ResultConversion>,
}

fn new_cmd_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Message {
    fn new(msg_type: MsgType, name: &str) -> Self {
        Self {
            msg_type,
            name: name.to_string(),
            src_loc: Location::default(),
            dest_locs: Vec::new(),
            properties: Map::new(),
            timestamp: Utc::now(),
            cmd_id: String::new(),
            parent_cmd_id: String::new(),
            status: StatusCode::Ok,
            is_final: true,
            completed: false,
            result_handler: None,
            result_conversion: None,
        }
    }

    pub fn new_cmd(name: &str) -> Self {
        let mut cmd = Self::new(MsgType::Cmd, name);
        cmd.cmd_id = new_cmd_id();
        cmd
    }

    pub fn new_data(name: &str) -> Self {
        Self::new(MsgType::Data, name)
    }

    pub fn new_audio_frame(name: &str) -> Self {
        Self::new(MsgType::AudioFrame, name)
    }

    pub fn new_video_frame(name: &str) -> Self {
        Self::new(MsgType::VideoFrame, name)
    }

    /// A bare result correlated to `cmd_id`. Destination is decided by the
    /// path tables, not by the caller.
    pub fn new_result(status: StatusCode, cmd_id: &str, cmd_name: &str) -> Self {
        let mut result = Self::new(MsgType::CmdResult, cmd_name);
        result.status = status;
        result.cmd_id = cmd_id.to_string();
        result
    }

    pub fn cmd_result_from_cmd(status: StatusCode, cmd: &Message) -> Self {
        let mut result = Self::new_result(status, &cmd.cmd_id, &cmd.name);
        result.dest_locs = vec![cmd.src_loc.clone()];
        result
    }

    /// ERROR result whose only payload is the `detail` string.
    pub fn error_result(cmd_id: &str, cmd_name: &str, detail: &str) -> Self {
        Self::new_result(StatusCode::Error, cmd_id, cmd_name).with_detail(detail)
    }

    /// Copy meant to travel as a distinct message: commands and results get
    /// a fresh `cmd_id` and remember the one they were cloned from.
    pub fn clone_as_new(&self) -> Self {
        let mut copy = self.clone();
        copy.timestamp = Utc::now();
        if self.msg_type.is_cmd_like() {
            copy.parent_cmd_id = std::mem::replace(&mut copy.cmd_id, new_cmd_id());
        }
        copy
    }

    pub(crate) fn regenerate_cmd_id(&mut self) {
        self.parent_cmd_id = std::mem::replace(&mut self.cmd_id, new_cmd_id());
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn src_loc(&self) -> &Location {
        &self.src_loc
    }

    pub fn dest_locs(&self) -> &[Location] {
        &self.dest_locs
    }

    pub fn set_dest(&mut self, loc: Location) {
        self.dest_locs = vec![loc];
    }

    pub fn add_dest(&mut self, loc: Location) {
        self.dest_locs.push(loc);
    }

    pub fn clear_dests(&mut self) {
        self.dest_locs.clear();
    }

    pub fn cmd_id(&self) -> &str {
        &self.cmd_id
    }

    pub fn set_cmd_id(&mut self, cmd_id: &str) {
        self.cmd_id = cmd_id.to_string();
    }

    pub fn parent_cmd_id(&self) -> &str {
        &self.parent_cmd_id
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn set_final(&mut self, is_final: bool) {
        self.is_final = is_final;
    }

    /// Set on a delivered result when no further result will follow for
    /// the originating command.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn set_result_handler(&mut self, handler: ResultHandler) {
        self.result_handler = Some(handler);
    }

    pub fn with_result_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ExtensionEnv<'_>, Message) + Send + Sync + 'static,
    {
        self.result_handler = Some(ResultHandler::new(f));
        self
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn properties_value(&self) -> Value {
        Value::Object(self.properties.clone())
    }

    /// Dot separated lookup, e.g. `"a.b.c"`.
    pub fn property(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut cur = self.properties.get(parts.next()?)?;
        for part in parts {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur)
    }

    /// Dot separated write; intermediate objects are created (and non
    /// object intermediates replaced) as needed.
    pub fn set_property(&mut self, path: &str, value: Value) {
        let mut parts: Vec<&str> = path.split('.').collect();
        let Some(last) = parts.pop() else { return };
        let mut cur = &mut self.properties;
        for part in parts {
            let entry = cur.entry(part.to_string()).or_insert_with(|| json!({}));
            if !entry.is_object() {
                *entry = json!({});
            }
            let Some(next) = entry.as_object_mut() else { return };
            cur = next;
        }
        cur.insert(last.to_string(), value);
    }

    pub fn with_property(mut self, path: &str, value: Value) -> Self {
        self.set_property(path, value);
        self
    }

    pub fn replace_properties(&mut self, properties: Map<String, Value>) {
        self.properties = properties;
    }

    pub fn detail(&self) -> Option<&str> {
        self.properties.get(DETAIL_PROPERTY).and_then(Value::as_str)
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.properties
            .insert(DETAIL_PROPERTY.to_string(), Value::String(detail.to_string()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_gets_generated_id() {
        let a = Message::new_cmd("ping");
        let b = Message::new_cmd("ping");
        assert!(!a.cmd_id().is_empty());
        assert_ne!(a.cmd_id(), b.cmd_id());
        assert!(Message::new_data("d").cmd_id().is_empty());
    }

    #[test]
    fn clone_as_new_chains_cmd_id() {
        let cmd = Message::new_cmd("ping");
        let copy = cmd.clone_as_new();
        assert_ne!(copy.cmd_id(), cmd.cmd_id());
        assert_eq!(copy.parent_cmd_id(), cmd.cmd_id());

        let data = Message::new_data("frame");
        let data_copy = data.clone_as_new();
        assert!(data_copy.cmd_id().is_empty());
        assert!(data_copy.parent_cmd_id().is_empty());
    }

    #[test]
    fn nested_properties() {
        let mut msg = Message::new_data("d").with_property("a.b", json!(1));
        assert_eq!(msg.property("a.b"), Some(&json!(1)));
        msg.set_property("a", json!(5));
        msg.set_property("a.c", json!("x"));
        assert_eq!(msg.property("a.c"), Some(&json!("x")));
        assert_eq!(msg.property("a.b"), None);
        assert_eq!(msg.property("missing.path"), None);
    }

    #[test]
    fn result_from_cmd_targets_sender() {
        let mut cmd = Message::new_cmd("ping");
        cmd.src_loc = Location::new("app", "g", "grp", "e");
        let result = Message::cmd_result_from_cmd(StatusCode::Ok, &cmd);
        assert_eq!(result.msg_type(), MsgType::CmdResult);
        assert_eq!(result.cmd_id(), cmd.cmd_id());
        assert_eq!(result.name(), "ping");
        assert_eq!(result.dest_locs(), &[cmd.src_loc.clone()]);
        assert!(result.is_final());
    }

    #[test]
    fn error_result_carries_detail() {
        let r = Message::error_result("c1", "slow_op", "Path timeout.");
        assert_eq!(r.status(), StatusCode::Error);
        assert_eq!(r.detail(), Some("Path timeout."));
    }
}
