use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use graph_types::MsgType;
use jsonschema::Validator;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RuntimeError;
use crate::message::Message;

/// Schema of one named message an extension accepts or emits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MsgApi {
    pub name: String,
    /// JSON Schema of the message properties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<Value>,
    /// JSON Schema of the properties of results answering a command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Message interface an extension declares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtensionApi {
    /// JSON Schema of the extension's own properties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<Value>,
    #[serde(default)]
    pub cmd_in: Vec<MsgApi>,
    #[serde(default)]
    pub cmd_out: Vec<MsgApi>,
    #[serde(default)]
    pub data_in: Vec<MsgApi>,
    #[serde(default)]
    pub data_out: Vec<MsgApi>,
    #[serde(default)]
    pub audio_frame_in: Vec<MsgApi>,
    #[serde(default)]
    pub audio_frame_out: Vec<MsgApi>,
    #[serde(default)]
    pub video_frame_in: Vec<MsgApi>,
    #[serde(default)]
    pub video_frame_out: Vec<MsgApi>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    In,
    Out,
}

#[derive(Clone)]
struct CompiledSchema {
    raw: Value,
    validator: Arc<Validator>,
}

impl CompiledSchema {
    fn compile(raw: &Value) -> Result<Self, RuntimeError> {
        let validator = jsonschema::validator_for(raw)
            .map_err(|e| RuntimeError::SchemaViolation(format!("schema does not compile: {e}")))?;
        Ok(Self { raw: raw.clone(), validator: Arc::new(validator) })
    }

    fn validate(&self, what: &str, value: &Value) -> Result<(), RuntimeError> {
        let errors: Vec<String> =
            self.validator.iter_errors(value).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::SchemaViolation(format!("{what}: {}", errors.join("; "))))
        }
    }
}

#[derive(Clone, Default)]
struct MsgSchemas {
    property: Option<CompiledSchema>,
    result: Option<CompiledSchema>,
}

/// Compiled schemas of one extension, keyed by kind, direction and name.
#[derive(Clone, Default)]
pub struct SchemaStore {
    property: Option<CompiledSchema>,
    msgs: HashMap<(MsgType, Direction, String), MsgSchemas>,
}

impl fmt::Debug for SchemaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaStore")
            .field("property", &self.property.is_some())
            .field("msgs", &self.msgs.len())
            .finish()
    }
}

fn compile_opt(raw: Option<&Value>) -> Result<Option<CompiledSchema>, RuntimeError> {
    raw.map(CompiledSchema::compile).transpose()
}

impl SchemaStore {
    pub fn from_api(api: &ExtensionApi) -> Result<Self, RuntimeError> {
        let mut store = Self {
            property: compile_opt(api.property.as_ref())?,
            msgs: HashMap::new(),
        };
        let sections = [
            (MsgType::Cmd, Direction::In, &api.cmd_in),
            (MsgType::Cmd, Direction::Out, &api.cmd_out),
            (MsgType::Data, Direction::In, &api.data_in),
            (MsgType::Data, Direction::Out, &api.data_out),
            (MsgType::AudioFrame, Direction::In, &api.audio_frame_in),
            (MsgType::AudioFrame, Direction::Out, &api.audio_frame_out),
            (MsgType::VideoFrame, Direction::In, &api.video_frame_in),
            (MsgType::VideoFrame, Direction::Out, &api.video_frame_out),
        ];
        for (msg_type, dir, apis) in sections {
            for msg in apis {
                let schemas = MsgSchemas {
                    property: compile_opt(msg.property.as_ref())?,
                    result: compile_opt(msg.result.as_ref())?,
                };
                store.msgs.insert((msg_type, dir, msg.name.clone()), schemas);
            }
        }
        Ok(store)
    }

    /// Schema governing `msg` when it leaves (`is_outgoing`) or enters the
    /// extension. Results are checked against the `result` schema of the
    /// command they answer: a result we return answers a `cmd_in`, a
    /// result we receive answers a `cmd_out`.
    fn schema_for(&self, msg: &Message, is_outgoing: bool) -> Option<&CompiledSchema> {
        let dir = if is_outgoing { Direction::Out } else { Direction::In };
        match msg.msg_type() {
            MsgType::CmdResult => {
                let cmd_dir = if is_outgoing { Direction::In } else { Direction::Out };
                self.msgs
                    .get(&(MsgType::Cmd, cmd_dir, msg.name().to_string()))?
                    .result
                    .as_ref()
            }
            t => self.msgs.get(&(t, dir, msg.name().to_string()))?.property.as_ref(),
        }
    }

    pub fn validate_schema(&self, msg: &Message, is_outgoing: bool) -> Result<(), RuntimeError> {
        match self.schema_for(msg, is_outgoing) {
            Some(schema) => schema.validate(
                &format!("{} `{}`", msg.msg_type(), msg.name()),
                &msg.properties_value(),
            ),
            None => Ok(()),
        }
    }

    /// Fill declared defaults into the properties of an incoming message.
    pub fn adjust_msg_properties(
        &self,
        msg: &mut Message,
        is_outgoing: bool,
    ) -> Result<(), RuntimeError> {
        let Some(schema) = self.schema_for(msg, is_outgoing) else {
            return Ok(());
        };
        let mut value = msg.properties_value();
        adjust_properties(&schema.raw, &mut value)?;
        if let Value::Object(map) = value {
            msg.replace_properties(map);
        }
        Ok(())
    }

    /// Adjust then validate the extension's own properties.
    pub fn check_extension_properties(&self, properties: &mut Value) -> Result<(), RuntimeError> {
        if let Some(schema) = &self.property {
            adjust_properties(&schema.raw, properties)?;
            schema.validate("extension property", properties)?;
        }
        Ok(())
    }
}

/// Insert `default`s declared by an object schema for missing properties,
/// recursing into nested objects. A null value counts as an empty object.
pub fn adjust_properties(schema: &Value, value: &mut Value) -> Result<(), RuntimeError> {
    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    let Some(obj) = value.as_object_mut() else {
        return Err(RuntimeError::InvalidArgument(format!(
            "expected an object, found {value}"
        )));
    };
    for (name, prop_schema) in props {
        match obj.get_mut(name) {
            Some(existing) => {
                if existing.is_object() {
                    adjust_properties(prop_schema, existing)?;
                }
            }
            None => {
                if let Some(default) = prop_schema.get("default") {
                    obj.insert(name.clone(), default.clone());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_types::StatusCode;
    use serde_json::json;

    fn api() -> ExtensionApi {
        serde_json::from_value(json!({
            "property": {
                "type": "object",
                "properties": {"greeting": {"type": "string", "default": "hello"}}
            },
            "cmd_in": [{
                "name": "ping",
                "property": {
                    "type": "object",
                    "required": ["n"],
                    "properties": {"n": {"type": "integer"}}
                },
                "result": {"type": "object", "required": ["pong"]}
            }],
            "cmd_out": [{
                "name": "ask",
                "result": {"type": "object", "properties": {"answer": {"type": "string"}}}
            }],
            "data_out": [{
                "name": "frame",
                "property": {
                    "type": "object",
                    "properties": {
                        "meta": {
                            "type": "object",
                            "properties": {"fps": {"type": "integer", "default": 30}}
                        }
                    }
                }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn validates_incoming_cmd() {
        let store = SchemaStore::from_api(&api()).unwrap();
        let good = Message::new_cmd("ping").with_property("n", json!(1));
        let bad = Message::new_cmd("ping").with_property("n", json!("one"));
        assert!(store.validate_schema(&good, false).is_ok());
        let err = store.validate_schema(&bad, false).unwrap_err();
        assert!(matches!(err, RuntimeError::SchemaViolation(_)));
        assert!(store.validate_schema(&bad, true).is_ok());
    }

    #[test]
    fn result_uses_schema_of_answered_cmd() {
        let store = SchemaStore::from_api(&api()).unwrap();
        let returned = Message::new_result(StatusCode::Ok, "c", "ping");
        assert!(store.validate_schema(&returned, true).is_err());
        let received =
            Message::new_result(StatusCode::Ok, "c", "ask").with_property("answer", json!(5));
        assert!(store.validate_schema(&received, false).is_err());
        let unknown = Message::new_result(StatusCode::Ok, "c", "other");
        assert!(store.validate_schema(&unknown, false).is_ok());
    }

    #[test]
    fn defaults_are_filled_recursively() {
        let store = SchemaStore::from_api(&api()).unwrap();
        let mut frame = Message::new_data("frame").with_property("meta", json!({}));
        store.adjust_msg_properties(&mut frame, true).unwrap();
        assert_eq!(frame.property("meta.fps"), Some(&json!(30)));

        let mut props = Value::Null;
        store.check_extension_properties(&mut props).unwrap();
        assert_eq!(props, json!({"greeting": "hello"}));
    }

    #[test]
    fn extension_property_type_is_checked() {
        let store = SchemaStore::from_api(&api()).unwrap();
        let mut props = json!({"greeting": 3});
        assert!(store.check_extension_properties(&mut props).is_err());
    }

    #[test]
    fn broken_schema_fails_to_compile() {
        let api = ExtensionApi {
            cmd_in: vec![MsgApi {
                name: "x".into(),
                property: Some(json!({"type": 12})),
                result: None,
            }],
            ..Default::default()
        };
        assert!(SchemaStore::from_api(&api).is_err());
    }
}
