use std::path::Path;
use std::time::Duration;
use stowage_models::StowageError;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};

pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// File name a fetched URL is stored under when the destination is a directory.
pub fn remote_file_name(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query.splitn(4, '/').nth(3)?;
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
}

/// Downloads `ADD` sources over HTTP(S).
pub struct RemoteFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl RemoteFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, StowageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stowage/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StowageError::InternalError {
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client, max_bytes })
    }

    /// Stream `url` into `dest`. Returns the number of bytes written.
    #[instrument(skip(self))]
    pub async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, StowageError> {
        let fetch_error = |reason: String| StowageError::Fetch {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", response.status())));
        }
        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(fetch_error(format!(
                    "content length {} exceeds {} bytes",
                    length, self.max_bytes
                )));
            }
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(StowageError::storage)?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fetch_error(e.to_string()))?
        {
            written += chunk.len() as u64;
            if written > self.max_bytes {
                return Err(fetch_error(format!("body exceeds {} bytes", self.max_bytes)));
            }
            file.write_all(&chunk).await.map_err(StowageError::storage)?;
        }
        file.flush().await.map_err(StowageError::storage)?;

        info!("Fetched {} ({} bytes)", url, written);
        Ok(written)
    }
}
