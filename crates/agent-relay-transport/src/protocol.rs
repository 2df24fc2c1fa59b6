//! Wire protocol for command envelopes.

use agent_relay_core::CommandEnvelope;
use thiserror::Error;

/// Envelope encode/decode error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Envelope serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize an envelope to its wire form.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_envelope(envelope: &CommandEnvelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parse an envelope from its wire form. Unknown fields are ignored.
///
/// # Errors
/// Returns error on malformed input or missing fields.
pub fn decode_envelope(raw: &[u8]) -> Result<CommandEnvelope, CodecError> {
    Ok(serde_json::from_slice(raw)?)
}

/// Split `payload` into slices of at most `max_len` bytes.
///
/// Slices never split a UTF-8 character, so a single character wider than
/// `max_len` gets its own slice. `max_len == 0` disables splitting. An empty
/// payload yields one empty fragment so it still carries a final flag.
#[must_use]
pub fn fragment(payload: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || payload.len() <= max_len {
        return vec![payload.to_owned()];
    }

    let mut fragments = Vec::with_capacity(payload.len().div_ceil(max_len));
    let mut rest = payload;
    while !rest.is_empty() {
        let mut cut = max_len.min(rest.len());
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(cut);
        fragments.push(head.to_owned());
        rest = tail;
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_encode_decode() {
        let envelope = CommandEnvelope {
            agent_id: "agent-1".into(),
            msg_id: 3,
            data: "hostname".into(),
        };
        let wire = encode_envelope(&envelope).unwrap();
        assert_eq!(decode_envelope(wire.as_bytes()).unwrap(), envelope);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_envelope(b"{\"agentID\":\"a\"").is_err());
        assert!(decode_envelope(b"{\"agentID\":\"a\",\"data\":\"x\"}").is_err());
    }

    #[test]
    fn test_fragment_concatenates_back() {
        let payload = "abcdefghij";
        let parts = fragment(payload, 3);
        assert_eq!(parts, vec!["abc", "def", "ghi", "j"]);
        assert_eq!(parts.concat(), payload);
    }

    #[test]
    fn test_fragment_respects_char_boundaries() {
        let payload = "aé€😀b";
        let parts = fragment(payload, 2);
        assert!(parts.iter().all(|p| !p.is_empty()));
        assert_eq!(parts.concat(), payload);
        assert!(parts.contains(&"😀".to_owned()));
    }

    #[test]
    fn test_fragment_edge_cases() {
        assert_eq!(fragment("", 4), vec![String::new()]);
        assert_eq!(fragment("abc", 0), vec!["abc"]);
        assert_eq!(fragment("abc", 3), vec!["abc"]);
    }
}
