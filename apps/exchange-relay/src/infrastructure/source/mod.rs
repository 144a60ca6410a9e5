//! Upstream Source Adapters
//!
//! HTTP implementations of the `SnapshotSource` and `DirectorySource` ports.
//!
//! - `RelaySnapshotSource`: JSON relay in front of the exchange web service,
//!   one endpoint per remote call
//! - `HttpDirectorySource`: instrument listing plus optional detail feeds
//!
//! Both share one `reqwest::Client` with a request timeout; every failure is
//! mapped onto [`FetchError`] and left to the caller to degrade.

mod directory;
mod snapshot;

use std::time::Duration;

use serde_json::Value;

pub use directory::HttpDirectorySource;
pub use snapshot::RelaySnapshotSource;

use crate::application::ports::FetchError;

/// Longest error body kept in [`FetchError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Build the shared HTTP client.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| FetchError::Transport {
            message: e.to_string(),
        })
}

/// GET `url` and decode the body as JSON.
async fn get_json(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, String)],
) -> Result<Value, FetchError> {
    let response = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| FetchError::Transport {
            message: e.to_string(),
        })?;

    let status = response.status();
    let text = response.text().await.map_err(|e| FetchError::Transport {
        message: e.to_string(),
    })?;

    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
            body: truncate(text),
        });
    }

    serde_json::from_str(&text).map_err(|e| FetchError::Malformed {
        message: e.to_string(),
    })
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
