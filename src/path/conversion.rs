use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::RuntimeError, message::Message};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConversionType {
    PerProperty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "conversion_mode", rename_all = "snake_case")]
pub enum ConversionMode {
    FixedValue { value: Value },
    FromOriginal { original_path: String },
}

/// Writes one property of the converted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConversionRule {
    pub path: String,
    #[serde(flatten)]
    pub mode: ConversionMode,
}

/// Per-property rewrite of a message, as declared on a graph destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MsgConversion {
    #[serde(rename = "type", default = "per_property")]
    pub conversion_type: ConversionType,
    /// Start from all properties of the incoming message instead of none.
    #[serde(default)]
    pub keep_original: bool,
    #[serde(default)]
    pub rules: Vec<ConversionRule>,
    /// Conversion applied to the results answering a converted command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<MsgConversion>>,
}

fn per_property() -> ConversionType {
    ConversionType::PerProperty
}

pub type ResultConversion = MsgConversion;

impl MsgConversion {
    pub fn new(keep_original: bool, rules: Vec<ConversionRule>) -> Self {
        Self {
            conversion_type: ConversionType::PerProperty,
            keep_original,
            rules,
            result: None,
        }
    }

    pub fn with_result(mut self, result: MsgConversion) -> Self {
        self.result = Some(Box::new(result));
        self
    }

    pub fn result_conversion(&self) -> Option<&ResultConversion> {
        self.result.as_deref()
    }

    /// Convert an outgoing command, data or frame. Commands come out as a
    /// new message with their own `cmd_id`.
    pub fn convert_msg(&self, msg: &Message) -> Result<Message, RuntimeError> {
        let mut out = msg.clone_as_new();
        self.apply_rules(msg, &mut out)?;
        Ok(out)
    }

    /// Convert a result. Unlike messages, the converted result keeps the
    /// `cmd_id` of the one it came from.
    pub fn convert_result(&self, result: &Message) -> Result<Message, RuntimeError> {
        let mut out = result.clone();
        self.apply_rules(result, &mut out)?;
        Ok(out)
    }

    fn apply_rules(&self, original: &Message, out: &mut Message) -> Result<(), RuntimeError> {
        if !self.keep_original {
            out.replace_properties(Map::new());
        }
        for rule in &self.rules {
            let value = match &rule.mode {
                ConversionMode::FixedValue { value } => value.clone(),
                ConversionMode::FromOriginal { original_path } => original
                    .property(original_path)
                    .cloned()
                    .ok_or_else(|| {
                        RuntimeError::Conversion(format!(
                            "property `{original_path}` missing from `{}`",
                            original.name()
                        ))
                    })?,
            };
            out.set_property(&rule.path, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_types::StatusCode;
    use serde_json::json;

    fn rules() -> Vec<ConversionRule> {
        vec![
            ConversionRule {
                path: "answer.text".into(),
                mode: ConversionMode::FromOriginal { original_path: "reply".into() },
            },
            ConversionRule {
                path: "source".into(),
                mode: ConversionMode::FixedValue { value: json!("converted") },
            },
        ]
    }

    #[test]
    fn result_conversion_drops_unlisted_properties_and_keeps_id() {
        let result = Message::new_result(StatusCode::Ok, "c1", "ask")
            .with_property("reply", json!("hi"))
            .with_property("noise", json!(1));
        let out = MsgConversion::new(false, rules()).convert_result(&result).unwrap();
        assert_eq!(out.cmd_id(), "c1");
        assert_eq!(out.property("answer.text"), Some(&json!("hi")));
        assert_eq!(out.property("source"), Some(&json!("converted")));
        assert_eq!(out.property("noise"), None);
    }

    #[test]
    fn keep_original_retains_properties() {
        let result = Message::new_result(StatusCode::Ok, "c1", "ask")
            .with_property("reply", json!("hi"))
            .with_property("noise", json!(1));
        let out = MsgConversion::new(true, rules()).convert_result(&result).unwrap();
        assert_eq!(out.property("noise"), Some(&json!(1)));
    }

    #[test]
    fn missing_source_property_fails() {
        let result = Message::new_result(StatusCode::Ok, "c1", "ask");
        let err = MsgConversion::new(false, rules()).convert_result(&result).unwrap_err();
        assert!(matches!(err, RuntimeError::Conversion(_)));
    }

    #[test]
    fn converted_cmd_gets_new_id() {
        let cmd = Message::new_cmd("ask").with_property("reply", json!("q"));
        let out = MsgConversion::new(false, rules()).convert_msg(&cmd).unwrap();
        assert_ne!(out.cmd_id(), cmd.cmd_id());
        assert_eq!(out.parent_cmd_id(), cmd.cmd_id());
    }

    #[test]
    fn parses_graph_json() {
        let conv: MsgConversion = serde_json::from_value(json!({
            "type": "per_property",
            "rules": [
                {"path": "a", "conversion_mode": "fixed_value", "value": 3},
                {"path": "b", "conversion_mode": "from_original", "original_path": "x.y"}
            ],
            "result": {"keep_original": true, "rules": []}
        }))
        .unwrap();
        assert_eq!(conv.rules.len(), 2);
        assert!(conv.result_conversion().unwrap().keep_original);
    }
}
