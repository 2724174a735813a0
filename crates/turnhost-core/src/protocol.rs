//! Wire protocol: `{"event": <name>, "data": <any>}` JSON documents.
//!
//! Inbound documents decode into the closed [`SentEvent`] set; anything else
//! is a [`ProtocolViolation`], whose display text is the `fatal` message the
//! peer receives before it is disconnected.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the event sent right before a server-initiated disconnect.
pub const FATAL_EVENT: &str = "fatal";

/// One complete inbound document as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text, expected to be JSON.
    Text(String),
    /// Binary frame; never valid in this protocol.
    Binary(Bytes),
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Binary(bytes) => write!(f, "<{} binary bytes>", bytes.len()),
        }
    }
}

/// Procedures a remote agent may invoke.
#[derive(Debug, Clone, PartialEq)]
pub enum SentEvent {
    /// The agent finished an order: `{orderIndex, returned}`.
    Finished(Value),
    /// The agent asks the engine to run game logic: `{caller, functionName, args}`.
    Run(Value),
    /// The agent asks to join a game.
    Play(Value),
    /// The agent asks which game an alias names.
    Alias(Value),
}

impl SentEvent {
    /// Wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Finished(_) => "finished",
            Self::Run(_) => "run",
            Self::Play(_) => "play",
            Self::Alias(_) => "alias",
        }
    }

    /// The raw `data` the agent sent (`null` when omitted).
    #[must_use]
    pub const fn data(&self) -> &Value {
        match self {
            Self::Finished(data) | Self::Run(data) | Self::Play(data) | Self::Alias(data) => data,
        }
    }

    /// Deserialize `data` into an engine-side type.
    ///
    /// # Errors
    /// Returns error if `data` does not have the shape of `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.data())
    }
}

/// Ways a remote agent can break the protocol. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("Sent {0}, which cannot be parsed.")]
    NotText(String),
    #[error("Sent malformed JSON: '{0}'")]
    MalformedJson(#[from] serde_json::Error),
    #[error("Sent malformed json event")]
    MalformedEvent,
    #[error("Sent unknown event '{0}'.")]
    UnknownEvent(String),
}

/// Parse one inbound payload as JSON.
///
/// # Errors
/// Returns error for binary payloads and invalid JSON.
pub fn parse_payload(payload: &Payload) -> Result<Value, ProtocolViolation> {
    match payload {
        Payload::Text(text) => Ok(serde_json::from_str(text)?),
        Payload::Binary(bytes) => Err(ProtocolViolation::NotText(format!(
            "{} bytes of binary data",
            bytes.len()
        ))),
    }
}

/// Validate the `{event, data}` envelope and resolve the event name.
///
/// # Errors
/// Returns error if `value` is not an object with a string `event`, or the
/// name is not one the server accepts.
pub fn decode_sent(value: Value) -> Result<SentEvent, ProtocolViolation> {
    let Value::Object(mut envelope) = value else {
        return Err(ProtocolViolation::MalformedEvent);
    };
    let Some(Value::String(name)) = envelope.remove("event") else {
        return Err(ProtocolViolation::MalformedEvent);
    };
    let data = envelope.remove("data").unwrap_or(Value::Null);

    match name.as_str() {
        "finished" => Ok(SentEvent::Finished(data)),
        "run" => Ok(SentEvent::Run(data)),
        "play" => Ok(SentEvent::Play(data)),
        "alias" => Ok(SentEvent::Alias(data)),
        _ => Err(ProtocolViolation::UnknownEvent(name)),
    }
}

/// Outbound event envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Outbound<'a, D> {
    pub event: &'a str,
    pub data: D,
}

impl<'a, D: Serialize> Outbound<'a, D> {
    #[must_use]
    pub const fn new(event: &'a str, data: D) -> Self {
        Self { event, data }
    }
}

/// Payload of the `fatal` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Fatal {
    pub message: String,
    pub timed_out: bool,
}

impl Outbound<'static, Fatal> {
    /// The last event a peer sees before a disconnect for cause.
    #[must_use]
    pub fn fatal(message: impl Into<String>, timed_out: bool) -> Self {
        Self::new(
            FATAL_EVENT,
            Fatal {
                message: message.into(),
                timed_out,
            },
        )
    }
}

/// Serializes any outbound event to its wire text.
///
/// # Errors
/// Returns error if `event` cannot be represented as JSON.
pub fn to_wire<E: Serialize + ?Sized>(event: &E) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn text(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }

    #[test]
    fn test_decode_known_events() {
        let sent = decode_sent(json!({"event": "run", "data": {"x": 1}})).unwrap();
        assert_eq!(sent, SentEvent::Run(json!({"x": 1})));
        assert_eq!(sent.name(), "run");

        let sent = decode_sent(json!({"event": "alias", "data": "foo"})).unwrap();
        assert_eq!(sent, SentEvent::Alias(json!("foo")));
    }

    #[test]
    fn test_missing_data_is_null() {
        let sent = decode_sent(json!({"event": "finished"})).unwrap();
        assert_eq!(sent.data(), &Value::Null);
    }

    #[test]
    fn test_envelope_violations() {
        for bad in [
            json!(null),
            json!(42),
            json!("run"),
            json!(["run"]),
            json!({"data": 1}),
            json!({"event": 7, "data": 1}),
        ] {
            let err = decode_sent(bad).unwrap_err();
            assert!(matches!(err, ProtocolViolation::MalformedEvent));
            assert_eq!(err.to_string(), "Sent malformed json event");
        }
    }

    #[test]
    fn test_unknown_event_name() {
        let err = decode_sent(json!({"event": "fatal", "data": {}})).unwrap_err();
        assert_eq!(err.to_string(), "Sent unknown event 'fatal'.");
    }

    #[test]
    fn test_parse_never_panics() {
        let inputs = [
            text(""),
            text("not json"),
            text("{\"event\":"),
            text("\u{fffd}\u{fffd}"),
            text("{}"),
            Payload::Binary(Bytes::from_static(&[0xff, 0x00, 0x04])),
        ];
        for input in &inputs {
            let _ = parse_payload(input);
        }
        assert!(parse_payload(&text("{}")).is_ok());
    }

    #[test]
    fn test_parse_error_messages() {
        let err = parse_payload(&text("not json")).unwrap_err();
        assert!(err.to_string().starts_with("Sent malformed JSON: '"));

        let err = parse_payload(&Payload::Binary(Bytes::from_static(b"abc"))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Sent 3 bytes of binary data, which cannot be parsed."
        );
    }

    #[test]
    fn test_fatal_wire_shape() {
        let wire = to_wire(&Outbound::fatal("bye", true)).unwrap();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(
            value,
            json!({"event": "fatal", "data": {"message": "bye", "timedOut": true}})
        );
    }

    #[test]
    fn test_data_as_typed_view() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Order {
            order_index: u32,
        }

        let sent = decode_sent(json!({
            "event": "finished",
            "data": {"orderIndex": 3, "returned": true}
        }))
        .unwrap();
        let order: Order = sent.data_as().unwrap();
        assert_eq!(order.order_index, 3);
    }
}
