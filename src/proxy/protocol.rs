//! Bridging channel wire format.
//!
//! Every frame is a JSON text message. The relay sends [`ProxyRequest`] and
//! [`CancelRequest`] envelopes; the browser peer answers with [`PeerFrame`]s
//! keyed by the same `request_id`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::proxy::config::StreamingMode;

/// Request headers never forwarded to the peer. The browser supplies its own.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "content-length",
    "origin",
    "referer",
    "user-agent",
    "cookie",
    "authorization",
    "x-goog-api-key",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
    "forwarded",
];

/// Response headers the relay recomputes itself.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

/// Query parameter carrying the client API key.
pub const API_KEY_QUERY_PARAM: &str = "key";

/// One inbound HTTP request, as forwarded to the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub path: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub body: String,
    pub request_id: String,
    pub streaming_mode: StreamingMode,
    pub is_generative: bool,
}

impl ProxyRequest {
    /// Whether the client asked for an event stream.
    pub fn wants_stream(&self) -> bool {
        self.path.contains(":streamGenerateContent")
            || self
                .query_params
                .get("alt")
                .map(|v| v.eq_ignore_ascii_case("sse"))
                .unwrap_or(false)
    }
}

/// The service's primary generative operation.
pub fn is_generative_path(path: &str) -> bool {
    path.contains("generateContent")
}

/// Best-effort abort notice for the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub event_type: String,
    pub request_id: String,
}

impl CancelRequest {
    pub fn new(request_id: &str) -> Self {
        Self {
            event_type: "cancel_request".to_string(),
            request_id: request_id.to_string(),
        }
    }
}

/// Raw peer envelope. Kept loose so unknown event types can be logged and dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerFrame {
    pub request_id: String,
    pub event_type: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A fragment delivered to a request's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    ResponseHeaders {
        status: u16,
        headers: HashMap<String, String>,
    },
    Chunk(String),
    Error {
        status: Option<u16>,
        message: String,
    },
    /// End-of-stream sentinel
    StreamEnd,
}

impl RelayMessage {
    /// Peer-side aborts surface as error fragments carrying the user-abort signature.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Error { message, .. } => is_abort_message(message),
            _ => false,
        }
    }
}

pub fn is_abort_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("user aborted") || lower.contains("aborterror")
}

impl PeerFrame {
    /// `None` for event types the relay does not understand.
    pub fn into_message(self) -> Option<RelayMessage> {
        match self.event_type.as_str() {
            "response_headers" => Some(RelayMessage::ResponseHeaders {
                status: self.status.unwrap_or(200),
                headers: self.headers.unwrap_or_default(),
            }),
            "chunk" => Some(RelayMessage::Chunk(self.data.unwrap_or_default())),
            "error" => Some(RelayMessage::Error {
                status: self.status,
                message: self
                    .message
                    .unwrap_or_else(|| "unknown browser error".to_string()),
            }),
            "stream_close" => Some(RelayMessage::StreamEnd),
            _ => None,
        }
    }
}

/// Drops hop-by-hop and client-identifying headers.
pub fn sanitize_request_headers<'a, I>(headers: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .filter(|(k, _)| !STRIPPED_REQUEST_HEADERS.contains(&k.as_str()) && !k.starts_with("sec-"))
        .map(|(k, v)| (k, v.to_string()))
        .collect()
}

/// Drops headers whose value is no longer accurate once the body is re-framed.
pub fn is_forwardable_response_header(name: &str) -> bool {
    !STRIPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

/// Parses a query string, leaving out the client API key.
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let Some(query) = query else {
        return HashMap::new();
    };

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .filter(|(k, _)| k != API_KEY_QUERY_PARAM)
        .collect()
}
