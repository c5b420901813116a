use std::collections::HashMap;

use graph_types::MsgType;
use serde_json::Value;
use strum::IntoEnumIterator;

use crate::error::RuntimeError;
use crate::message::Message;
use crate::schema::SchemaStore;

pub type CloneFn = fn(&Message) -> Message;
pub type LoopFieldsFn = fn(&Message, &mut dyn FnMut(&str, &Value));
pub type ValidateFn = fn(&SchemaStore, &Message, bool) -> Result<(), RuntimeError>;

/// What the runtime can do with one kind of message.
#[derive(Debug, Clone, Copy)]
pub struct MsgKindInfo {
    pub clone: CloneFn,
    pub loop_fields: LoopFieldsFn,
    pub validate_schema: ValidateFn,
    /// Whether sending this kind creates paths.
    pub tracks_paths: bool,
}

fn clone_as_new(msg: &Message) -> Message {
    msg.clone_as_new()
}

fn loop_properties(msg: &Message, f: &mut dyn FnMut(&str, &Value)) {
    for (k, v) in msg.properties() {
        f(k, v);
    }
}

fn loop_result_fields(msg: &Message, f: &mut dyn FnMut(&str, &Value)) {
    f("status_code", &Value::String(msg.status().to_string()));
    f("is_final", &Value::Bool(msg.is_final()));
    loop_properties(msg, f);
}

fn validate(store: &SchemaStore, msg: &Message, is_outgoing: bool) -> Result<(), RuntimeError> {
    store.validate_schema(msg, is_outgoing)
}

fn no_validation(_: &SchemaStore, _: &Message, _: bool) -> Result<(), RuntimeError> {
    Ok(())
}

/// Per-runtime table of message kind capabilities, built once by the
/// engine and shared with every extension task.
#[derive(Debug, Clone)]
pub struct MsgKindTable {
    kinds: HashMap<MsgType, MsgKindInfo>,
}

impl Default for MsgKindTable {
    fn default() -> Self {
        let kinds = MsgType::iter()
            .map(|t| {
                let info = match t {
                    MsgType::Cmd => MsgKindInfo {
                        clone: clone_as_new,
                        loop_fields: loop_properties,
                        validate_schema: validate,
                        tracks_paths: true,
                    },
                    MsgType::CmdResult => MsgKindInfo {
                        clone: clone_as_new,
                        loop_fields: loop_result_fields,
                        validate_schema: validate,
                        tracks_paths: true,
                    },
                    MsgType::Data | MsgType::AudioFrame | MsgType::VideoFrame => MsgKindInfo {
                        clone: clone_as_new,
                        loop_fields: loop_properties,
                        validate_schema: validate,
                        tracks_paths: false,
                    },
                };
                (t, info)
            })
            .collect();
        Self { kinds }
    }
}

impl MsgKindTable {
    /// Table with schema checks switched off for every kind.
    pub fn without_validation() -> Self {
        let mut table = Self::default();
        for info in table.kinds.values_mut() {
            info.validate_schema = no_validation;
        }
        table
    }

    pub fn register(&mut self, msg_type: MsgType, info: MsgKindInfo) {
        self.kinds.insert(msg_type, info);
    }

    pub fn info(&self, msg_type: MsgType) -> Option<&MsgKindInfo> {
        self.kinds.get(&msg_type)
    }

    pub fn clone_msg(&self, msg: &Message) -> Message {
        match self.info(msg.msg_type()) {
            Some(info) => (info.clone)(msg),
            None => msg.clone_as_new(),
        }
    }

    pub fn validate_schema(
        &self,
        store: &SchemaStore,
        msg: &Message,
        is_outgoing: bool,
    ) -> Result<(), RuntimeError> {
        match self.info(msg.msg_type()) {
            Some(info) => (info.validate_schema)(store, msg, is_outgoing),
            None => Ok(()),
        }
    }

    pub fn tracks_paths(&self, msg_type: MsgType) -> bool {
        self.info(msg_type).is_some_and(|i| i.tracks_paths)
    }

    /// `name=value` pairs of every field, for trace logs.
    pub fn describe(&self, msg: &Message) -> String {
        let mut fields = Vec::new();
        if let Some(info) = self.info(msg.msg_type()) {
            (info.loop_fields)(msg, &mut |k, v| fields.push(format!("{k}={v}")));
        }
        fields.join(" ")
    }
}
