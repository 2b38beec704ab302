//! Newline message framing
//!
//! Handles the line-delimited framing used by MCP stdio servers:
//! one compact JSON object per line, terminated by `\n`.
//!
//! Framing format:
//! <json>\n

use serde::Serialize;

/// Line terminator appended to every outbound message
pub const LINE_TERMINATOR: u8 = b'\n';

/// Serialize a message into a single wire line, terminator included
///
/// Compact JSON never contains a raw newline (newlines inside strings are
/// escaped), so the result is always exactly one line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(LINE_TERMINATOR);
    Ok(line)
}

/// Strip a trailing `\n` or `\r\n` from a raw line in place
pub fn strip_line_terminator(raw: &mut Vec<u8>) {
    if raw.last() == Some(&LINE_TERMINATOR) {
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
    }
}

/// Decode a raw line into text
///
/// Invalid UTF-8 is replaced rather than rejected so the line still reaches
/// the consumer, which reports it as a protocol error with the offending text.
pub fn decode_text(raw: Vec<u8>) -> String {
    match String::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_line_is_single_terminated_line() {
        let message = json!({
            "jsonrpc": "2.0",
            "method": "notify",
            "params": {"text": "first\nsecond\r\nthird"}
        });

        let line = encode_line(&message).unwrap();

        assert_eq!(line.last(), Some(&LINE_TERMINATOR));
        assert_eq!(line.iter().filter(|b| **b == LINE_TERMINATOR).count(), 1);
        let decoded: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_strip_line_terminator_variants() {
        let mut unix = b"{}\n".to_vec();
        strip_line_terminator(&mut unix);
        assert_eq!(unix, b"{}");

        let mut windows = b"{}\r\n".to_vec();
        strip_line_terminator(&mut windows);
        assert_eq!(windows, b"{}");

        // Unterminated fragment at EOF is left alone
        let mut fragment = b"{\"partial\"".to_vec();
        strip_line_terminator(&mut fragment);
        assert_eq!(fragment, b"{\"partial\"");

        let mut empty = b"\n".to_vec();
        strip_line_terminator(&mut empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_decode_text_replaces_invalid_utf8() {
        assert_eq!(decode_text("世界".as_bytes().to_vec()), "世界");

        let text = decode_text(vec![b'o', b'k', 0xFF, b'!']);
        assert_eq!(text, "ok\u{FFFD}!");
    }
}
