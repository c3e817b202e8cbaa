// SSE framing for relayed responses
use bytes::Bytes;

use crate::proxy::error::RelayError;

pub const KEEPALIVE_FRAME: &str = ": keep-alive\n\n";
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// One `data:` event. Raw newlines in JSON can only be whitespace, so they are flattened.
pub fn data_frame(payload: &str) -> Bytes {
    let line: String = payload
        .trim()
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    Bytes::from(format!("data: {}\n\n", line))
}

pub fn keepalive_frame() -> Bytes {
    Bytes::from_static(KEEPALIVE_FRAME.as_bytes())
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME.as_bytes())
}

/// Error event written once response headers are already committed.
pub fn error_frame(err: &RelayError) -> Bytes {
    Bytes::from(format!("data: {}\n\n", err.to_payload()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_is_single_line() {
        let frame = data_frame("{\n\"candidates\": []\n}\n");
        assert_eq!(&frame[..], b"data: { \"candidates\": [] }\n\n");
        let value: serde_json::Value =
            serde_json::from_slice(&frame[6..frame.len() - 2]).unwrap();
        assert!(value["candidates"].is_array());
    }

    #[test]
    fn test_data_frame_keeps_text_on_one_line() {
        let frame = data_frame("plain\ntext");
        assert_eq!(&frame[..], b"data: plain text\n\n");
    }

    #[test]
    fn test_error_frame_carries_status() {
        let frame = error_frame(&RelayError::Upstream {
            status: 503,
            message: "overloaded".to_string(),
        });
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"code\":503"));
        assert!(text.contains("overloaded"));
    }
}
