// Network event descriptor types handed to the event owner

use serde::{Deserialize, Serialize};

/// HTTP header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    /// Header name
    pub name: String,
    /// Header value
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Cookie parsed from a `Cookie` or `Set-Cookie` header
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

/// Request body captured from the wire or from the page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostData {
    /// Body text, possibly truncated to the configured limit
    pub text: String,
    /// Length of the body in characters before truncation
    pub size: usize,
}

/// `Server-Timing` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerTiming {
    pub name: String,
    pub duration: f64,
    pub description: String,
}

/// Response metadata available once the status line has been seen
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStart {
    /// Version token from the status line, e.g. `HTTP/1.1`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_version: Option<String>,
    /// Negotiated protocol (ALPN) or derived from scheme/version
    pub protocol: String,
    pub from_cache: bool,
    pub remote_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    pub body_size: u64,
    pub headers_size: u64,
    pub transferred_size: u64,
    /// Milliseconds between request sent and first response byte, -1 if unknown
    pub waiting_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub discard_response_body: bool,
}

/// Response body handed over when the response stream stops
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseContent {
    /// Captured bytes, up to the response body limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Whether `text` is base64 (body was not valid UTF-8)
    pub base64_encoded: bool,
    /// Total bytes observed on the wire
    pub body_size: u64,
    /// Whether the captured body was cut at the limit
    pub truncated: bool,
    /// Whether the body was discarded by policy or status
    pub discarded: bool,
}

/// Initial description of a request, passed to the `onNetworkEvent` callback
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEvent {
    /// Activity record sequence id
    pub resource_id: u64,
    /// Platform channel identity
    pub channel_id: u64,
    pub url: String,
    pub method: String,
    /// Request start timestamp in microseconds, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub is_xhr: bool,
    pub private: bool,
    pub from_cache: bool,
    pub from_service_worker: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_extension: Option<String>,
    pub discard_request_body: bool,
    pub discard_response_body: bool,
    /// Raw request header block from the transaction, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_headers: Option<String>,
}

impl NetworkEvent {
    pub fn is_blocked(&self) -> bool {
        self.blocked_reason.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_event_camel_case() {
        let event = NetworkEvent {
            resource_id: 3,
            url: "https://example.com/".to_string(),
            method: "GET".to_string(),
            blocked_reason: Some("devtools".to_string()),
            ..Default::default()
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["resourceId"], 3);
        assert_eq!(json["blockedReason"], "devtools");
        assert!(json.get("timestamp").is_none());
        assert!(event.is_blocked());
    }

    #[test]
    fn test_cookie_flags_default() {
        let cookie: Cookie = serde_json::from_str(r#"{"name":"a","value":"b"}"#).unwrap();
        assert!(!cookie.http_only);
        assert!(!cookie.secure);
        assert!(cookie.path.is_none());
    }
}
