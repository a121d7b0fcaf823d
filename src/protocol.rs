//! Wire types shared between the transaction coordinator and Upstream.
//!
//! The core treats commands as opaque tagged payloads (see spec non-goals);
//! only the `type` discriminator and the JSON Patch operation shape are
//! modeled concretely, because both are needed to run the command-dispatch
//! and trigger algorithms.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COMMAND_DISCRIMINATOR: &str = "modelserver.emfcommand";
pub const PATCH_DISCRIMINATOR: &str = "modelserver.patch";

/// A single RFC 6902 JSON Patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// An opaque, type-tagged edit command. The body beyond `type` is never
/// interpreted by this crate; it is forwarded verbatim to Upstream or to
/// whichever `CommandProvider` claims the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(flatten)]
    pub body: serde_json::Map<String, Value>,
}

impl Command {
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            body: serde_json::Map::new(),
        }
    }
}

/// Either a `Command` or a `Patch`, as sent in an `execute` message's `data`
/// field.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOrPatch {
    Command(Command),
    Patch(Vec<Operation>),
}

impl CommandOrPatch {
    pub fn is_empty_patch(&self) -> bool {
        matches!(self, CommandOrPatch::Patch(ops) if ops.is_empty())
    }
}

impl From<Command> for CommandOrPatch {
    fn from(command: Command) -> Self {
        CommandOrPatch::Command(command)
    }
}

impl From<Vec<Operation>> for CommandOrPatch {
    fn from(ops: Vec<Operation>) -> Self {
        CommandOrPatch::Patch(ops)
    }
}

/// Tagged envelope for an `execute` message's `data` field:
/// `{"type": "modelserver.emfcommand"|"modelserver.patch", "data": ...}`.
impl Serialize for CommandOrPatch {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut envelope = serializer.serialize_struct("CommandOrPatch", 2)?;
        match self {
            CommandOrPatch::Command(command) => {
                envelope.serialize_field("type", COMMAND_DISCRIMINATOR)?;
                envelope.serialize_field("data", command)?;
            }
            CommandOrPatch::Patch(ops) => {
                envelope.serialize_field("type", PATCH_DISCRIMINATOR)?;
                envelope.serialize_field("data", ops)?;
            }
        }
        envelope.end()
    }
}

impl<'de> Deserialize<'de> for CommandOrPatch {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            kind: String,
            data: Value,
        }

        let envelope = Envelope::deserialize(deserializer)?;
        match envelope.kind.as_str() {
            COMMAND_DISCRIMINATOR => {
                let command: Command =
                    serde_json::from_value(envelope.data).map_err(serde::de::Error::custom)?;
                Ok(CommandOrPatch::Command(command))
            }
            PATCH_DISCRIMINATOR => {
                let ops = match envelope.data {
                    Value::Array(_) => {
                        serde_json::from_value(envelope.data).map_err(serde::de::Error::custom)?
                    }
                    single => vec![
                        serde_json::from_value(single).map_err(serde::de::Error::custom)?,
                    ],
                };
                Ok(CommandOrPatch::Patch(ops))
            }
            other => Err(serde::de::Error::custom(format!(
                "unknown command-or-patch discriminator: {other}"
            ))),
        }
    }
}

/// `{ success, patch?, patchModel? }`, the aggregation monoid for a
/// transaction's effects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdateResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patch: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(rename = "patchModel")]
    pub patch_model: Option<Value>,
}

impl ModelUpdateResult {
    pub fn success(patch: Vec<Operation>) -> Self {
        Self {
            success: true,
            patch,
            patch_model: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            patch: Vec::new(),
            patch_model: None,
        }
    }

    /// Merges `next` into `self` in place, following the monoid in the
    /// design: `success` is AND'd, `patch` is concatenated in order, and
    /// `patchModel` takes `next`'s value only while the running `success`
    /// stays true.
    pub fn merge(&mut self, next: ModelUpdateResult) {
        self.success = self.success && next.success;
        self.patch.extend(next.patch);
        if self.success {
            if let Some(model) = next.patch_model {
                self.patch_model = Some(model);
            }
        } else {
            self.patch_model = None;
        }
    }

    pub fn merged(mut self, next: ModelUpdateResult) -> Self {
        self.merge(next);
        self
    }
}

/// One message on the transaction WebSocket, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub modeluri: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Execute,
    Close,
    RollBack,
    IncrementalUpdate,
    Success,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_and_concat_and_latest_model() {
        let mut a = ModelUpdateResult::success(vec![Operation {
            op: "replace".into(),
            path: "/a".into(),
            value: Some(json!(1)),
            from: None,
        }]);
        let b = ModelUpdateResult {
            success: true,
            patch: vec![Operation {
                op: "replace".into(),
                path: "/b".into(),
                value: Some(json!(2)),
                from: None,
            }],
            patch_model: Some(json!({"b": 2})),
        };

        a.merge(b);

        assert!(a.success);
        assert_eq!(a.patch.len(), 2);
        assert_eq!(a.patch_model, Some(json!({"b": 2})));
    }

    #[test]
    fn merge_drops_patch_model_once_failed() {
        let mut a = ModelUpdateResult::success(vec![]);
        a.merge(ModelUpdateResult {
            success: false,
            patch: vec![],
            patch_model: Some(json!({"x": 1})),
        });
        assert!(!a.success);
        assert_eq!(a.patch_model, None);

        a.merge(ModelUpdateResult {
            success: true,
            patch: vec![],
            patch_model: Some(json!({"y": 2})),
        });
        assert!(!a.success, "AND with a prior failure stays false");
        assert_eq!(a.patch_model, None, "no model update once success is false");
    }

    #[test]
    fn command_or_patch_envelope_round_trips() {
        let cmd = CommandOrPatch::Command(Command::new("example.SetCommand"));
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["type"], COMMAND_DISCRIMINATOR);

        let parsed: CommandOrPatch = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn patch_envelope_accepts_single_operation_payload() {
        let value = json!({
            "type": PATCH_DISCRIMINATOR,
            "data": {"op": "replace", "path": "/name", "value": "X"}
        });
        let parsed: CommandOrPatch = serde_json::from_value(value).unwrap();
        match parsed {
            CommandOrPatch::Patch(ops) => assert_eq!(ops.len(), 1),
            _ => panic!("expected a patch"),
        }
    }
}
