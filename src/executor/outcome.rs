//! Interpretation of a command's return value.
//!
//! Scripts return plain JSON-representable values; a small set of tagged
//! shapes (produced by host helpers bound into every engine) map to richer
//! output actions. Anything unrecognized produces no observable output.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::script::interpreter::Interpreter;
use crate::script::EvalError;
use crate::transport::{Embed, TransportAction};

const EMBED_TAG: &str = "__embed";
const MESSAGE_TAG: &str = "__message";
const ACTION_TAG: &str = "__action";

/// The single output action of one command invocation.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// Plain text, sent to the triggering channel.
    Text(String),
    /// Pre-built rich content, sent as-is.
    Rich(Embed),
    /// A pre-built message object.
    Message(OutgoingMessage),
    /// A deferred transport operation to trigger.
    Action(TransportAction),
    /// No observable output.
    Silent,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
pub struct OutgoingMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub embed: Option<Embed>,
}

/// Maps a returned value to its output action.
pub fn interpret(value: &Value) -> Outcome {
    match value {
        Value::String(text) => Outcome::Text(text.clone()),
        Value::Object(map) => interpret_object(map),
        // Numbers, booleans, null, arrays: nothing to show.
        _ => Outcome::Silent,
    }
}

fn interpret_object(map: &Map<String, Value>) -> Outcome {
    if let Some(inner) = map.get(EMBED_TAG) {
        return match serde_json::from_value::<Embed>(inner.clone()) {
            Ok(embed) => Outcome::Rich(embed),
            Err(e) => {
                warn!("Malformed embed returned by script: {e}");
                Outcome::Silent
            }
        };
    }
    if let Some(inner) = map.get(MESSAGE_TAG) {
        return match serde_json::from_value::<OutgoingMessage>(inner.clone()) {
            Ok(message) => Outcome::Message(message),
            Err(e) => {
                warn!("Malformed message returned by script: {e}");
                Outcome::Silent
            }
        };
    }
    if let Some(inner) = map.get(ACTION_TAG) {
        return match serde_json::from_value::<TransportAction>(inner.clone()) {
            Ok(action) => Outcome::Action(action),
            Err(e) => {
                warn!("Malformed action returned by script: {e}");
                Outcome::Silent
            }
        };
    }
    // An untagged object shaped like rich content is treated as an embed
    // under construction and finalized here.
    if looks_like_embed(map) {
        return match serde_json::from_value::<Embed>(Value::Object(map.clone())) {
            Ok(embed) => Outcome::Rich(embed),
            Err(e) => {
                warn!("Malformed embed shape returned by script: {e}");
                Outcome::Silent
            }
        };
    }
    Outcome::Silent
}

fn looks_like_embed(map: &Map<String, Value>) -> bool {
    ["title", "description", "fields"]
        .iter()
        .any(|key| map.contains_key(*key))
}

/// Binds the output constructors (`embed`, `message`, `send_to`,
/// `set_presence`) into an interpreter. These produce the tagged shapes
/// [`interpret`] recognizes.
pub fn bind_output_helpers(interpreter: &Arc<dyn Interpreter>) -> Result<(), EvalError> {
    interpreter.bind_callable(
        "embed",
        Arc::new(|args| {
            let inner = object_arg(&args, "embed")?;
            Ok(json!({ "__embed": inner }))
        }),
    )?;
    interpreter.bind_callable(
        "message",
        Arc::new(|args| {
            let inner = match args.first() {
                Some(Value::String(text)) => json!({ "content": text }),
                _ => object_arg(&args, "message")?,
            };
            Ok(json!({ "__message": inner }))
        }),
    )?;
    interpreter.bind_callable(
        "send_to",
        Arc::new(|args| {
            let channel = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| EvalError::Value("send_to: channel must be a string".into()))?;
            let content = args
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| EvalError::Value("send_to: content must be a string".into()))?;
            Ok(json!({ "__action": { "op": "send_message", "channel": channel, "content": content } }))
        }),
    )?;
    interpreter.bind_callable(
        "set_presence",
        Arc::new(|args| {
            let status = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| EvalError::Value("set_presence: status must be a string".into()))?;
            let activity = args.get(1).and_then(Value::as_str);
            Ok(json!({ "__action": { "op": "set_presence", "status": status, "activity": activity } }))
        }),
    )
}

fn object_arg(args: &[Value], what: &str) -> Result<Value, EvalError> {
    match args.first() {
        Some(value @ Value::Object(_)) => Ok(value.clone()),
        _ => Err(EvalError::Value(format!("{what}: expected an object"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_becomes_text() {
        assert_eq!(interpret(&json!("pong")), Outcome::Text("pong".into()));
    }

    #[test]
    fn test_scalars_and_arrays_are_silent() {
        for value in [json!(5), json!(true), json!(null), json!([1, 2])] {
            assert_eq!(interpret(&value), Outcome::Silent);
        }
    }

    #[test]
    fn test_tagged_embed() {
        let value = json!({ "__embed": { "title": "Hi", "description": "there" } });
        match interpret(&value) {
            Outcome::Rich(embed) => {
                assert_eq!(embed.title.as_deref(), Some("Hi"));
                assert_eq!(embed.description.as_deref(), Some("there"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_tagged_message() {
        let value = json!({ "__message": { "content": "hello" } });
        match interpret(&value) {
            Outcome::Message(message) => {
                assert_eq!(message.content.as_deref(), Some("hello"));
                assert!(message.embed.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_tagged_action() {
        let value = json!({ "__action": { "op": "send_message", "channel": "log", "content": "x" } });
        assert_eq!(
            interpret(&value),
            Outcome::Action(TransportAction::SendMessage {
                channel: "log".into(),
                content: "x".into()
            })
        );
    }

    #[test]
    fn test_untagged_embed_shape_is_finalized() {
        let value = json!({ "title": "Builder" });
        match interpret(&value) {
            Outcome::Rich(embed) => {
                assert_eq!(embed.title.as_deref(), Some("Builder"));
                assert!(embed.fields.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_unrecognized_object_is_silent() {
        assert_eq!(interpret(&json!({ "weird": 1 })), Outcome::Silent);
    }

    #[test]
    fn test_malformed_action_is_silent() {
        let value = json!({ "__action": { "op": "explode" } });
        assert_eq!(interpret(&value), Outcome::Silent);
    }
}
