//! Request/Response Data Model
//!
//! The types stored in a cache entry: a fetch request, the response served
//! for it, and the serialized metadata record written to the HEADERS stream.
//! Header names are case-insensitive per HTTP; `Headers` lowercases names on
//! insert so lookups and Vary comparisons never depend on the wire casing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Case-insensitive header map
///
/// Names are lowercased on insert; values are stored verbatim. Iteration is
/// in name order (stable for serialization).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any existing value for the same name
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Look up a header value by name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// True if the header is present
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no headers are present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over (name, value) pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A request to match or store, keyed by URL within a cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Request URL - the entry key within a cache
    pub url: String,
    /// HTTP method
    pub method: String,
    /// Request headers
    pub headers: Headers,
}

impl FetchRequest {
    /// Create a GET request for a URL with no headers
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: Headers::new(),
        }
    }

    /// Create a request with explicit method and headers
    pub fn new(url: impl Into<String>, method: impl Into<String>, headers: Headers) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers,
        }
    }
}

/// Fetch response type, mirroring the service-worker response taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response
    Basic,
    /// Cross-origin response with CORS
    Cors,
    /// Default type
    Default,
    /// Network error response
    Error,
    /// Opaque cross-origin response
    Opaque,
}

impl Default for ResponseType {
    fn default() -> Self {
        ResponseType::Default
    }
}

/// A stored response (metadata only - the body lives in the BODY stream)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// HTTP status code
    pub status: u16,
    /// HTTP status text
    pub status_text: String,
    /// Response type
    pub response_type: ResponseType,
    /// Response URL (may differ from the request URL after redirects)
    pub url: String,
    /// Response headers
    pub headers: Headers,
}

impl FetchResponse {
    /// Create a 200 OK response with the given headers
    pub fn ok(url: impl Into<String>, headers: Headers) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            response_type: ResponseType::Default,
            url: url.into(),
            headers,
        }
    }
}

/// The record serialized into an entry's HEADERS stream
///
/// The request URL is *not* authoritative here - it derives from the entry
/// key - but it is stored anyway so the record is self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// The stored request (method + headers, URL informational)
    pub request: FetchRequest,
    /// The stored response metadata
    pub response: FetchResponse,
}

impl EntryMetadata {
    /// Serialize to the HEADERS stream representation
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| crate::error::Error::storage(e.to_string()))
    }

    /// Parse from the HEADERS stream representation
    pub fn from_bytes(data: &[u8]) -> crate::error::Result<Self> {
        serde_json::from_slice(data).map_err(|e| crate::error::Error::storage(e.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
