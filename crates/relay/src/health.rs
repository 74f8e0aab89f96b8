//! Reachability checks for the suite API and Ollama.

use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::settings::RelaySettings;
use std::time::Duration;

const API_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Status strings as shown in the debugger: an HTTP code or `"down"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub api: String,
    pub ollama: String,
}

/// Something that can tell whether the suite API is up.
#[async_trait::async_trait]
pub trait ApiProbe: Send + Sync {
    async fn is_up(&self) -> bool;
}

pub struct HealthProbe {
    http: Client,
    api_base: String,
    ollama_base: String,
}

impl HealthProbe {
    pub fn new(settings: &RelaySettings) -> Result<Self> {
        Ok(Self {
            http: Client::builder().build()?,
            api_base: settings.api_base().to_string(),
            ollama_base: settings.ollama_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `GET /api/tools` answered with a success status.
    pub async fn check_api_health(&self) -> bool {
        self.status_of(&format!("{}/api/tools", self.api_base), API_CHECK_TIMEOUT)
            .await
            .is_some_and(|code| (200..300).contains(&code))
    }

    pub async fn probe(&self) -> HealthReport {
        let api_url = format!("{}/api/ollama/models", self.api_base);
        let ollama_url = format!("{}/api/tags", self.ollama_base);
        let (api, ollama) = tokio::join!(
            self.status_of(&api_url, PROBE_TIMEOUT),
            self.status_of(&ollama_url, PROBE_TIMEOUT),
        );
        HealthReport {
            api: api_status(api),
            ollama: ollama_status(ollama),
        }
    }

    async fn status_of(&self, url: &str, timeout: Duration) -> Option<u16> {
        match self.http.get(url).timeout(timeout).send().await {
            Ok(resp) => Some(resp.status().as_u16()),
            Err(e) => {
                tracing::debug!(url, error = %e, "health probe failed");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl ApiProbe for HealthProbe {
    async fn is_up(&self) -> bool {
        self.check_api_health().await
    }
}

// The API answers 500 when it is up but Ollama is not; that still counts.
fn api_status(code: Option<u16>) -> String {
    match code {
        Some(code @ (200 | 500)) => code.to_string(),
        _ => "down".to_string(),
    }
}

fn ollama_status(code: Option<u16>) -> String {
    match code {
        Some(200) => "200".to_string(),
        _ => "down".to_string(),
    }
}
