//! HTTP wire types shared between `fastfsd` and its clients.
//!
//! Field names mirror the Go server's JSON output byte for byte (Go's
//! `encoding/json` marshals exported struct fields under their literal Go
//! names when no tag is present — `Filename`, not `filename`), kept here
//! via `rename_all = "PascalCase"` rather than switching to the usual
//! camelCase convention, so existing clients don't have to change.

use serde::{Deserialize, Serialize};

/// Query parameters accepted by the `/data/{path}` route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataQuery {
    /// Which block to fetch. Absent means "stream the whole file range".
    pub block: Option<u64>,
    /// `force=1` tells the node receiving the request to serve the block
    /// itself rather than redirecting to the owning node.
    #[serde(default)]
    pub force: Option<String>,
    /// `cache=onlyCache` tells the node to serve the block and then evict
    /// it locally, used when a peer drains a block off another node after
    /// an ownership change instead of re-downloading from the object
    /// store.
    #[serde(default)]
    pub cache: Option<String>,
    pub offset: Option<u64>,
    pub len: Option<u64>,
}

impl DataQuery {
    pub fn is_forced(&self) -> bool {
        self.force.as_deref() == Some("1")
    }

    pub fn is_only_cache(&self) -> bool {
        self.cache.as_deref() == Some("onlyCache")
    }
}

/// A single file's metadata, as returned by `/ls`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct FileResponse {
    pub filename: String,
    pub file_size: u64,
}

/// Response body for `/ls/{path}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct LsResponse {
    pub files: Vec<FileResponse>,
}

/// Response body for `/setup`: the current cluster membership and the
/// cluster's configured block size, so a client can compute block
/// ownership locally instead of asking for every block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct SetupResponse {
    pub servers: Vec<String>,
    pub block_size: u32,
}

/// JSON error body returned for non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ls_response_uses_go_field_casing() {
        let resp = LsResponse {
            files: vec![FileResponse {
                filename: "a.csv".into(),
                file_size: 1024,
            }],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"Files\""));
        assert!(json.contains("\"Filename\""));
        assert!(json.contains("\"FileSize\""));
    }

    #[test]
    fn setup_response_round_trips() {
        let resp = SetupResponse {
            servers: vec!["10.0.0.1:9000".into(), "10.0.0.2:9000".into()],
            block_size: 65536,
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: SetupResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(resp, back);
    }

    #[test]
    fn data_query_force_flag_parses_from_string() {
        let q: DataQuery = serde_urlencoded::from_str("block=3&force=1").unwrap();
        assert_eq!(q.block, Some(3));
        assert!(q.is_forced());
    }
}
