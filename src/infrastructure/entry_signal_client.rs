use crate::domain::errors::EntrySignalError;
use crate::domain::repositories::{EntryCandidate, EntrySignalSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Pulls entry candidates from an HTTP endpoint returning
/// `[{"asset": .., "confidence": .., "suggested_amount": ..}]`.
pub struct HttpEntrySignals {
    client: Client,
    url: String,
}

impl HttpEntrySignals {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, EntrySignalError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EntrySignalError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl EntrySignalSource for HttpEntrySignals {
    async fn candidates(&self, now: DateTime<Utc>) -> Result<Vec<EntryCandidate>, EntrySignalError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("at", now.timestamp())])
            .send()
            .await
            .map_err(|e| EntrySignalError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EntrySignalError::Network(format!("HTTP {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| EntrySignalError::Network(e.to_string()))?;
        let candidates = parse_candidates(&body)?;
        debug!("{} entry candidate(s) received", candidates.len());
        Ok(candidates)
    }
}

/// Decodes the candidate list, dropping entries that fail validation.
fn parse_candidates(body: &str) -> Result<Vec<EntryCandidate>, EntrySignalError> {
    let raw: Vec<EntryCandidate> =
        serde_json::from_str(body).map_err(|e| EntrySignalError::Malformed(e.to_string()))?;

    Ok(raw
        .into_iter()
        .filter(|c| {
            let valid = !c.asset.trim().is_empty()
                && c.confidence.is_finite()
                && (0.0..=100.0).contains(&c.confidence)
                && c.suggested_amount.is_finite()
                && c.suggested_amount > 0.0;
            if !valid {
                warn!("Discarding invalid entry candidate: {:?}", c);
            }
            valid
        })
        .collect())
}
