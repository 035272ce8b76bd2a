//! Push notifications for new listings through an ntfy server.

use anyhow::{bail, Context};
use async_trait::async_trait;
use spek_core::{Listing, NewListingEvent};
use tracing::debug;

use crate::publish::EventHandler;

pub const DEFAULT_NTFY_URL: &str = "https://ntfy.sh";

#[derive(Debug, Clone)]
pub struct NtfyConfig {
    pub base_url: String,
    pub topic: String,
    pub forward_email: Option<String>,
}

pub struct NtfyNotifier {
    client: reqwest::Client,
    config: NtfyConfig,
}

impl NtfyNotifier {
    pub fn new(client: reqwest::Client, config: NtfyConfig) -> Self {
        Self { client, config }
    }

    pub fn build_request(&self, event: &NewListingEvent) -> reqwest::Result<reqwest::Request> {
        let listing = &event.listing;
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.topic
        );

        let mut params: Vec<(&str, String)> = vec![("title", listing.title.clone())];
        if !listing.url.is_empty() {
            params.push(("click", listing.url.clone()));
        }
        if let Some(image) = listing.image_urls.first() {
            params.push(("attach", absolute_image_url(image)));
        }
        if let Some(email) = self.config.forward_email.as_ref().filter(|e| !e.is_empty()) {
            params.push(("email", email.clone()));
        }

        self.client
            .post(url)
            .query(&params)
            .body(message_body(listing))
            .build()
    }
}

/// Marketplace image urls are protocol-relative (`//images...`).
fn absolute_image_url(url: &str) -> String {
    if url.starts_with("//") {
        format!("https:{url}")
    } else {
        url.to_string()
    }
}

fn message_body(listing: &Listing) -> String {
    let published = listing
        .published_at
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}\ndatum: {}\nprijs: €{}\n{}",
        listing.description,
        published,
        listing.price.price_cents / 100,
        listing.location.city_name
    )
}

#[async_trait]
impl EventHandler for NtfyNotifier {
    fn name(&self) -> &str {
        "send-new-ad-notification"
    }

    async fn handle(&self, event: &NewListingEvent) -> anyhow::Result<()> {
        let request = self
            .build_request(event)
            .context("building ntfy request")?;
        let response = self
            .client
            .execute(request)
            .await
            .context("sending ntfy notification")?;
        let status = response.status();
        if !status.is_success() {
            bail!("ntfy answered {status} for listing {}", event.listing.id);
        }
        debug!(listing_id = %event.listing.id, topic = %self.config.topic, "ntfy notification sent");
        Ok(())
    }
}
