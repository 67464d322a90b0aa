// src/overlay.rs
//
// Remote device-status overlay.
//
// One REST read of the device table before the loop starts. Any failure here
// is reported to the caller, which falls back to manifest-only status.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::OverlayConfig;

pub const URL_ENV: &str = "SUPABASE_URL";
pub const KEY_ENV: &str = "SUPABASE_KEY";

/// Remote row type for a traffic-light controller.
pub const KIND_SIGNAL: &str = "SEMAFARO";
/// Remote row type for a camera.
pub const KIND_CAMERA: &str = "CAMERA";

/// One row of the remote device table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRow {
    pub mac_address: String,
    pub status: String,
    pub tipo: String,
}

impl StatusRow {
    pub fn new(mac: &str, status: &str, tipo: &str) -> Self {
        Self {
            mac_address: mac.to_string(),
            status: status.to_string(),
            tipo: tipo.to_string(),
        }
    }

    pub fn is_signal(&self) -> bool {
        self.tipo.eq_ignore_ascii_case(KIND_SIGNAL)
    }

    pub fn is_camera(&self) -> bool {
        self.tipo.eq_ignore_ascii_case(KIND_CAMERA)
    }
}

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("overlay credentials missing: set {0}")]
    MissingCredentials(&'static str),
    #[error("overlay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("overlay returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// REST client for the device table.
pub struct RemoteOverlay {
    http: Client,
    base_url: String,
    api_key: String,
    table: String,
    timeout: Duration,
}

impl RemoteOverlay {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, cfg: &OverlayConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            table: cfg.table.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
        }
    }

    /// Credentials from SUPABASE_URL / SUPABASE_KEY, with the config URL as a
    /// fallback for the former.
    pub fn from_env(cfg: &OverlayConfig) -> Result<Self, OverlayError> {
        let url = std::env::var(URL_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| cfg.url.clone())
            .ok_or(OverlayError::MissingCredentials(URL_ENV))?;
        let key = std::env::var(KEY_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(OverlayError::MissingCredentials(KEY_ENV))?;
        Ok(Self::new(url, key, cfg))
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/rest/v1/{}?select=mac_address,status,tipo",
            self.base_url.trim_end_matches('/'),
            self.table
        )
    }

    pub async fn fetch(&self) -> Result<Vec<StatusRow>, OverlayError> {
        let resp = self
            .http
            .get(self.endpoint())
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OverlayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let rows: Vec<StatusRow> = resp.json().await?;
        info!(rows = rows.len(), table = %self.table, "remote device status fetched");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_selects_status_columns() {
        let cfg = OverlayConfig::default();
        let overlay = RemoteOverlay::new("https://example.supabase.co/", "k", &cfg);
        assert_eq!(
            overlay.endpoint(),
            "https://example.supabase.co/rest/v1/dispositivos?select=mac_address,status,tipo"
        );
    }

    #[test]
    fn row_kinds() {
        assert!(StatusRow::new("aa", "active", "SEMAFARO").is_signal());
        assert!(StatusRow::new("aa", "active", "camera").is_camera());
        assert!(!StatusRow::new("aa", "active", "SENSOR").is_signal());
    }

    #[test]
    fn rows_deserialize_from_rest_payload() {
        let body = r#"[{"mac_address":"AA:BB","status":"maintenance","tipo":"SEMAFARO"}]"#;
        let rows: Vec<StatusRow> = serde_json::from_str(body).unwrap();
        assert_eq!(rows, vec![StatusRow::new("AA:BB", "maintenance", "SEMAFARO")]);
    }
}
