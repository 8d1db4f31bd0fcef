use crate::config::{HTTP_TIMEOUT, Settings};
use crate::models::{Batch, Payload};
use anyhow::Context;
use log::{error, info, warn};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;

/// Hands a sealed batch to the analytics endpoint.
pub(crate) trait Uploader {
    /// Fire-and-forget: failures are logged and the batch is dropped.
    fn send(&self, batch: Batch);
}

pub(crate) struct HttpClient {
    client: Client,
    url: String,
    user: String,
    password: String,
}

impl HttpClient {
    pub(crate) fn new(settings: &Settings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("‼️ Could not init HTTP client")?;

        Ok(Self {
            client,
            url: settings.url.clone(),
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }

    pub(crate) fn post_data(&self, payload: &Payload) -> anyhow::Result<u16> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .basic_auth(&self.user, Some(&self.password))
            .json(payload)
            .send()?;

        Ok(response.status().as_u16())
    }
}

impl Uploader for HttpClient {
    fn send(&self, batch: Batch) {
        let payload = match Payload::from_batch(&batch) {
            Ok(payload) => payload,
            Err(e) => {
                error!("📡‼️ Network: Batch not sent: {:#}", e);
                return;
            }
        };

        match self.post_data(&payload) {
            Ok(status) if (200..300).contains(&status) => {
                info!(
                    "📡 Network: {} readings of {} posted (Status {})",
                    batch.len(),
                    batch.timestamp(),
                    status
                )
            }
            Ok(status) => warn!("📡 Network: Server rejected batch (Status {})", status),
            Err(e) => error!("📡‼️ Network: Upload failed: {:#}", e),
        }
    }
}
