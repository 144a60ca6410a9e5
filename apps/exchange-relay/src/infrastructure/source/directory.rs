//! Instrument directory adapter.
//!
//! The listing endpoint answers either a map of instrument ID to record or
//! an array whose first element is that map. The daily and static detail
//! feeds use the same shape and are optional; an unconfigured feed yields
//! an empty directory.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{build_client, get_json};
use crate::application::ports::{DirectorySource, FetchError, RawDirectory};

/// HTTP client for the directory feeds.
#[derive(Debug, Clone)]
pub struct HttpDirectorySource {
    client: reqwest::Client,
    listing_url: String,
    daily_url: Option<String>,
    static_url: Option<String>,
}

impl HttpDirectorySource {
    /// Create a source for the listing at `listing_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(listing_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self::with_client(build_client(timeout)?, listing_url))
    }

    /// Create a source sharing an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, listing_url: impl Into<String>) -> Self {
        Self {
            client,
            listing_url: listing_url.into(),
            daily_url: None,
            static_url: None,
        }
    }

    /// Set the daily detail feed.
    #[must_use]
    pub fn with_daily_details(mut self, url: Option<String>) -> Self {
        self.daily_url = url;
        self
    }

    /// Set the static detail feed.
    #[must_use]
    pub fn with_static_details(mut self, url: Option<String>) -> Self {
        self.static_url = url;
        self
    }

    async fn fetch(&self, url: &str) -> Result<RawDirectory, FetchError> {
        parse_directory(get_json(&self.client, url, &[]).await?)
    }

    async fn fetch_optional(&self, url: Option<&str>) -> Result<RawDirectory, FetchError> {
        match url {
            Some(url) => self.fetch(url).await,
            None => Ok(RawDirectory::new()),
        }
    }
}

#[async_trait]
impl DirectorySource for HttpDirectorySource {
    async fn fetch_listing(&self) -> Result<RawDirectory, FetchError> {
        self.fetch(&self.listing_url).await
    }

    async fn fetch_daily_details(&self) -> Result<RawDirectory, FetchError> {
        self.fetch_optional(self.daily_url.as_deref()).await
    }

    async fn fetch_static_details(&self) -> Result<RawDirectory, FetchError> {
        self.fetch_optional(self.static_url.as_deref()).await
    }
}

fn parse_directory(value: Value) -> Result<RawDirectory, FetchError> {
    let map = match value {
        Value::Object(map) => map,
        Value::Array(items) => match items.into_iter().next() {
            Some(Value::Object(map)) => map,
            None => return Ok(RawDirectory::new()),
            Some(_) => {
                return Err(FetchError::Malformed {
                    message: "directory array does not start with an object".into(),
                });
            }
        },
        Value::Null => return Ok(RawDirectory::new()),
        _ => {
            return Err(FetchError::Malformed {
                message: "directory is neither an object nor an array".into(),
            });
        }
    };

    Ok(map
        .into_iter()
        .filter_map(|(id, record)| match record {
            Value::Object(record) => Some((id, record)),
            _ => None,
        })
        .collect())
}
