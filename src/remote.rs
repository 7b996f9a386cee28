//! Client for an external isolation service.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{IsolationError, Result};
use crate::traits::RemoteIsolationBackend;

const SERVICE_NAME: &str = "isolation endpoint";

/// Request body sent to `POST {endpoint}/isolate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteIsolationRequest {
    pub image_path: PathBuf,
    pub model: String,
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Response of the remote isolation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteIsolation {
    pub mask_path: PathBuf,
    pub foreground_path: PathBuf,
    #[serde(default)]
    pub stats: serde_json::Value,
    pub model_used: String,
}

pub struct HttpIsolationBackend {
    endpoint: String,
    client: Client,
}

impl HttpIsolationBackend {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IsolationError::Configuration {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    fn url(&self) -> String {
        format!("{}/isolate", self.endpoint.trim_end_matches('/'))
    }
}

impl RemoteIsolationBackend for HttpIsolationBackend {
    fn isolate(&self, request: &RemoteIsolationRequest) -> Result<RemoteIsolation> {
        let url = self.url();
        debug!(%url, model = %request.model, "calling remote isolation");

        let response = self.client.post(&url).json(request).send()?;
        let status = response.status();
        if status.is_server_error() {
            return Err(IsolationError::ServiceUnavailable {
                service: SERVICE_NAME.to_string(),
                message: format!("{} returned {}", url, status),
            });
        }
        if !status.is_success() {
            return Err(IsolationError::PrerequisiteCheckFailed {
                message: format!("{} rejected the request with {}", url, status),
            });
        }

        let isolation: RemoteIsolation =
            response
                .json()
                .map_err(|e| IsolationError::PrerequisiteCheckFailed {
                    message: format!("malformed response from {}: {}", url, e),
                })?;
        validate_response(isolation)
    }
}

/// Rejects responses that decode but name no output files.
pub fn validate_response(isolation: RemoteIsolation) -> Result<RemoteIsolation> {
    if isolation.mask_path.as_os_str().is_empty() || isolation.foreground_path.as_os_str().is_empty()
    {
        return Err(IsolationError::PrerequisiteCheckFailed {
            message: "response is missing mask_path or foreground_path".to_string(),
        });
    }
    Ok(isolation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_url_joins_endpoint() -> Result<()> {
        let backend = HttpIsolationBackend::new("http://localhost:9000/", Duration::from_secs(1))?;
        assert_eq!(backend.url(), "http://localhost:9000/isolate");
        Ok(())
    }

    #[test]
    fn test_response_decoding() -> std::result::Result<(), serde_json::Error> {
        let isolation: RemoteIsolation = serde_json::from_str(
            r#"{"mask_path": "/out/m.png", "foreground_path": "/out/f.png", "model_used": "u2net"}"#,
        )?;
        assert_eq!(isolation.stats, serde_json::Value::Null);
        assert!(validate_response(isolation).is_ok());

        let empty: RemoteIsolation = serde_json::from_str(
            r#"{"mask_path": "", "foreground_path": "/out/f.png", "model_used": "u2net"}"#,
        )?;
        assert!(matches!(
            validate_response(empty),
            Err(IsolationError::PrerequisiteCheckFailed { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unreachable_endpoint_is_service_unavailable() -> Result<()> {
        // port 9 (discard) is not expected to accept HTTP
        let backend = HttpIsolationBackend::new("http://127.0.0.1:9", Duration::from_millis(500))?;
        let request = RemoteIsolationRequest {
            image_path: PathBuf::from("/tmp/a.png"),
            model: "u2net".to_string(),
            options: serde_json::Map::new(),
        };

        let err = backend.isolate(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        Ok(())
    }
}
