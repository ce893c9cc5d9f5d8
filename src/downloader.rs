//! Component D — Downloader.
//!
//! `try_all` walks a list of candidate mirror base URLs in order, issuing a
//! ranged GET against each in turn until one succeeds, streaming bytes to the
//! local cache file with `tokio::io::AsyncWriteExt::write_all` on each chunk,
//! falling through to the next mirror on failure and reporting the resolved
//! content-length back to the caller as soon as the response headers arrive.

use std::path::Path;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use crate::error::DownloadError;
use crate::serializer::DownloaderHandle;

/// Reported back to the caller as soon as the first mirror responds with
/// usable headers, before the body has finished streaming.
#[derive(Debug, Clone, Copy)]
pub struct DownloadStarted {
    pub content_length: u64,
}

pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Tries every URL in `mirrors` in order. `local_path` is opened for
    /// append (or created) and bytes are streamed to it sequentially so a
    /// concurrent Filewatcher/reader always sees a prefix of the final file.
    ///
    /// `started` is fired exactly once, the moment a mirror's response
    /// headers resolve a content-length — the caller uses this to send the
    /// Serializer's `content_length` follow-up without waiting for the body.
    /// `started` fires exactly once: with `Ok` as soon as any mirror's
    /// response headers resolve a content-length, or with `Err` once every
    /// mirror has been exhausted without ever reaching that point. A mirror
    /// that succeeds at the header phase but fails mid-body does not
    /// re-fire `started` — the client already has a response in flight.
    pub async fn try_all(
        &self,
        mirrors: &[String],
        uri_path: &str,
        local_path: &Path,
        start_offset: u64,
        started: oneshot::Sender<Result<DownloadStarted, DownloadError>>,
    ) -> Result<(), DownloadError> {
        let mut started = Some(started);
        let mut last_err: Option<DownloadError> = None;
        let mut saw_404 = false;

        for base in mirrors {
            let url = join_url(base, uri_path);
            match self
                .try_one(&url, local_path, start_offset, &mut started)
                .await
            {
                Ok(()) => return Ok(()),
                Err(DownloadError::NotFound) => {
                    saw_404 = true;
                }
                Err(e) => {
                    log::warn!("downloader: mirror {} failed: {}", url, e);
                    last_err = Some(e);
                }
            }
        }

        let final_err = if saw_404 && last_err.is_none() {
            DownloadError::NotFound
        } else {
            last_err.unwrap_or(DownloadError::Exhausted)
        };

        if let Some(tx) = started.take() {
            let _ = tx.send(Err(final_err.clone()));
        }

        Err(final_err)
    }

    async fn try_one(
        &self,
        url: &str,
        local_path: &Path,
        start_offset: u64,
        started: &mut Option<oneshot::Sender<Result<DownloadStarted, DownloadError>>>,
    ) -> Result<(), DownloadError> {
        let mut request = self.client.get(url);
        if start_offset > 0 {
            request = request.header("Range", format!("bytes={}-", start_offset));
        }

        let response = request.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound);
        }
        if !response.status().is_success() {
            return Err(DownloadError::Network(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let content_length = resolve_content_length(&response, start_offset)
            .ok_or_else(|| DownloadError::Network("no content-length in response".into()))?;

        if let Some(tx) = started.take() {
            let _ = tx.send(Ok(DownloadStarted { content_length }));
        }

        let mut file = if start_offset > 0 {
            OpenOptions::new().append(true).open(local_path).await?
        } else {
            tokio::fs::File::create(local_path).await?
        };

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(())
    }
}

fn resolve_content_length(response: &reqwest::Response, start_offset: u64) -> Option<u64> {
    if let Some(total) = content_range_total(response) {
        return Some(total);
    }
    response.content_length().map(|cl| cl + start_offset)
}

fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(reqwest::header::CONTENT_RANGE)?;
    let value = value.to_str().ok()?;
    let total = value.rsplit('/').next()?;
    total.parse::<u64>().ok()
}

fn join_url(base: &str, uri_path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), uri_path.trim_start_matches('/'))
}

/// Monotonic counter used to hand out opaque `DownloaderHandle`s.
pub fn next_handle() -> DownloaderHandle {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
