//! Protocol module
//!
//! The game protocol is line-delimited JSON over TCP:
//! - One [`ClientMessage`] per inbound line
//! - One [`ServerMessage`] per outbound line
//!
//! Inbound lines are bounded by [`MAX_MESSAGE_SIZE`].

pub mod messages;

pub use messages::{CharacterSummary, ClientMessage, ServerMessage};

use crate::error::{ProtocolError, Result};

/// Maximum inbound line length in bytes
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Decode one inbound line
pub fn decode_line(line: &str) -> std::result::Result<ClientMessage, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    serde_json::from_str(line).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
}

/// Encode one outbound message, newline included
pub fn encode_line(message: &ServerMessage) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_line() {
        let msg = decode_line("{\"type\":\"say\",\"text\":\"hi\"}\r\n").unwrap();
        assert_eq!(
            msg,
            ClientMessage::Say {
                text: "hi".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_garbage_and_oversize() {
        assert!(matches!(
            decode_line("not json"),
            Err(ProtocolError::MalformedMessage(_))
        ));

        let huge = format!("{{\"type\":\"say\",\"text\":\"{}\"}}", "a".repeat(MAX_MESSAGE_SIZE));
        assert!(matches!(
            decode_line(&huge),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_line_terminated() {
        let bytes = encode_line(&ServerMessage::system("hello")).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);
    }
}
