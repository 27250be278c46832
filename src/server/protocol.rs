use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::models::{ExtractRequest, ExtractionRun, IndexStats, SearchQuery, SearchResults};

/// Largest frame either side accepts.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Health,
    Extract(ExtractRequest),
    Cancel {
        project_id: String,
    },
    RunStatus {
        #[serde(default)]
        run_id: Option<String>,
        #[serde(default)]
        project_id: Option<String>,
    },
    IndexStats,
    Search(SearchQuery),
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Health(HealthReport),
    Run(ExtractionRun),
    Stats(IndexStats),
    Search(SearchResults),
    ShutdownAck,
    Error(ErrorResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn from_check<E: std::fmt::Display>(
        name: impl Into<String>,
        check: Result<bool, E>,
    ) -> Self {
        match check {
            Ok(healthy) => Self {
                name: name.into(),
                healthy,
                error: None,
            },
            Err(e) => Self {
                name: name.into(),
                healthy: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// `ok` while the daemon answers; components report their own state.
    pub status: String,
    pub uptime_secs: u64,
    pub requests_served: u64,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.components.iter().all(|c| c.healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error(ErrorResponse {
            kind,
            message: message.into(),
        })
    }
}

pub fn encode_message(msg: &impl Serialize) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = (json.len() as u32).to_be_bytes();
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&json);
    Ok(buf)
}

pub fn decode_length(buf: &[u8; 4]) -> usize {
    u32::from_be_bytes(*buf) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_prefix() {
        let frame = encode_message(&Request::Ping).unwrap();
        let len = decode_length(&[frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len, frame.len() - 4);
        assert_eq!(&frame[4..], br#"{"type":"ping"}"#);
    }

    #[test]
    fn test_request_wire_shape() {
        let request: Request = serde_json::from_str(
            r#"{"type":"extract","project_id":"acme","force_refresh":true}"#,
        )
        .unwrap();
        match request {
            Request::Extract(req) => {
                assert_eq!(req.project_id.as_deref(), Some("acme"));
                assert!(req.force_refresh);
            }
            other => panic!("unexpected request: {other:?}"),
        }

        let status: Request = serde_json::from_str(r#"{"type":"run_status"}"#).unwrap();
        assert!(matches!(
            status,
            Request::RunStatus {
                run_id: None,
                project_id: None
            }
        ));

        let search: Request =
            serde_json::from_str(r#"{"type":"search","query":"email","top_k":5}"#).unwrap();
        assert!(matches!(search, Request::Search(q) if q.top_k == Some(5)));
    }

    #[test]
    fn test_error_response_carries_kind() {
        let response = Response::error(ErrorKind::Conflict, "busy");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "conflict");
        assert_eq!(json["message"], "busy");
    }

    #[test]
    fn test_health_from_check() {
        let ok = ComponentHealth::from_check::<String>("index", Ok(true));
        assert!(ok.healthy);
        let failed = ComponentHealth::from_check("catalog", Err("unreachable"));
        assert!(!failed.healthy);
        assert_eq!(failed.error.as_deref(), Some("unreachable"));
    }
}
