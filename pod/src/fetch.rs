// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP artifact fetching.
//!
//! Downloads stream to a temporary file next to the destination so a
//! partial transfer is never observable at the final path.

use camino::Utf8Path;
use futures::TryStreamExt;
use slog::{Logger, debug, o};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request for {url} failed")]
    Request {
        url: String,
        #[source]
        err: reqwest::Error,
    },

    #[error("fetch of {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("I/O failure on {path}")]
    Io {
        path: String,
        #[source]
        err: std::io::Error,
    },
}

#[derive(Clone, Debug)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
    log: Logger,
}

impl ArtifactFetcher {
    pub fn new(log: &Logger) -> ArtifactFetcher {
        ArtifactFetcher {
            client: reqwest::ClientBuilder::new()
                .connect_timeout(Duration::from_secs(15))
                .read_timeout(Duration::from_secs(15))
                .build()
                .unwrap(),
            log: log.new(o!("component" => "ArtifactFetcher")),
        }
    }

    /// Download `url` to `dest`, staging in `dest`'s parent directory.
    pub async fn fetch_to(
        &self,
        url: &str,
        dest: &Utf8Path,
    ) -> Result<(), FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Request { url: url.to_string(), err })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let parent = dest.parent().unwrap_or(Utf8Path::new("."));
        let staged = camino_tempfile::Builder::new()
            .prefix(".fetch-")
            .tempfile_in(parent)
            .map_err(|err| FetchError::Io {
                path: parent.to_string(),
                err,
            })?;
        let staged_path = staged.path().to_owned();

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&staged_path)
            .await
            .map_err(|err| FetchError::Io {
                path: staged_path.to_string(),
                err,
            })?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.try_next().await.map_err(|err| {
            FetchError::Request { url: url.to_string(), err }
        })? {
            file.write_all(&chunk).await.map_err(|err| FetchError::Io {
                path: staged_path.to_string(),
                err,
            })?;
        }
        file.flush().await.map_err(|err| FetchError::Io {
            path: staged_path.to_string(),
            err,
        })?;
        drop(file);

        staged.persist(dest).map_err(|err| FetchError::Io {
            path: dest.to_string(),
            err: err.error,
        })?;
        debug!(self.log, "fetched artifact"; "url" => url, "dest" => dest.as_str());
        Ok(())
    }

    /// Fetch a small resource (a digest file, a signature) into memory.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Request { url: url.to_string(), err })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(resp
            .bytes()
            .await
            .map_err(|err| FetchError::Request { url: url.to_string(), err })?
            .to_vec())
    }
}
