//! Shepherd wire protocol.
//!
//! Newline-delimited JSON over TCP. Each frame is one serde-tagged message
//! on a single line; the tag field is `type`. The shepherd end of the
//! contract (dispatcher internals, scheduling policy) is out of scope here,
//! only the frames themselves are modeled.
//!
//! Delivery is at-least-once: a `SubmitResult` that was sent but never
//! acked is resent after reconnect, and the shepherd deduplicates on
//! `request_id`.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::environment::EnvironmentDescriptor;
use crate::job::{TestRequest, TestResult};

/// Frames sent sheep → shepherd.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SheepMessage {
    /// Opens (or reopens) a session. `capacity` is the worker pool size,
    /// advertised so the shepherd can bound its assignment window.
    Handshake {
        environment: EnvironmentDescriptor,
        capacity: usize,
    },
    Heartbeat,
    SubmitResult { result: TestResult },
}

/// Frames sent shepherd → sheep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShepherdMessage {
    HandshakeAck { session_epoch: u64 },
    HeartbeatAck,
    Assign { request: TestRequest },
    SubmitAck { request_id: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("empty frame")]
    Empty,
}

/// Serialize a message as one newline-terminated frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parse one frame. The trailing newline may or may not be present
/// depending on how the caller split the stream.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_str(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_heartbeat_frame_is_tagged() {
        let line = encode(&SheepMessage::Heartbeat).unwrap();
        assert_eq!(line, "{\"type\":\"heartbeat\"}\n");
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_assign_round_trips() {
        let request = TestRequest::new(7, "harness.sh", "submission.tar");
        let frame = ShepherdMessage::Assign {
            request: request.clone(),
        };
        let decoded: ShepherdMessage = decode(&encode(&frame).unwrap()).unwrap();
        match decoded {
            ShepherdMessage::Assign { request: r } => {
                assert_eq!(r.request_id, request.request_id);
                assert_eq!(r.harness, request.harness);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_decode_tolerates_missing_newline() {
        let ack: ShepherdMessage = decode("{\"type\":\"submit_ack\",\"request_id\":3}").unwrap();
        assert_eq!(ack, ShepherdMessage::SubmitAck { request_id: 3 });
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode::<ShepherdMessage>("not json").is_err());
        assert!(matches!(
            decode::<ShepherdMessage>("\n"),
            Err(ProtocolError::Empty)
        ));
    }

    #[test]
    fn test_handshake_carries_environment() {
        let msg = SheepMessage::Handshake {
            environment: EnvironmentDescriptor::detect(),
            capacity: 4,
        };
        let line = encode(&msg).unwrap();
        assert!(line.contains("\"type\":\"handshake\""));
        assert!(line.contains("\"capacity\":4"));
        let back: SheepMessage = decode(&line).unwrap();
        assert_eq!(back, msg);
    }
}
