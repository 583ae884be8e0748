// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Model artifact download and cache management.
//!
//! The STT model is opened from its configured local path when present and
//! otherwise downloaded from the configured URL, with progress logged every
//! ~10%. Downloads land in a `.tmp` sibling and are renamed into place so a
//! concurrent reader never sees a partial file.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;

/// Errors that can occur during model acquisition.
///
/// Every variant means the model is unavailable for this call; callers
/// treat them uniformly as fatal for call answer, not for the process.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model unavailable: {0}")]
    Unavailable(String),
}

/// Acquires model files for the call pipeline.
pub struct ModelManager;

impl ModelManager {
    /// Return `path` if the model already exists there, otherwise download
    /// it from `url` and install it at `path`.
    pub async fn ensure(path: &Path, url: &str) -> Result<PathBuf, ModelError> {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        if url.is_empty() {
            return Err(ModelError::Unavailable(format!(
                "model missing at {} and no download URL configured",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!("downloading model from {} to {}", url, path.display());
        Self::download(url, path).await?;
        Ok(path.to_path_buf())
    }

    /// Stream a file from `url` to `dest` with ~10% progress logging and an
    /// atomic tmp-rename install.
    async fn download(url: &str, dest: &Path) -> Result<(), ModelError> {
        let response = reqwest::get(url).await?.error_for_status()?;
        let total = response.content_length();

        let tmp = dest.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = response.bytes_stream();

        let mut written: u64 = 0;
        let mut next_progress_pct: u64 = 10;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
            written += chunk.len() as u64;

            if let Some(total) = total {
                let pct = written.saturating_mul(100) / total.max(1);
                while pct >= next_progress_pct && next_progress_pct <= 100 {
                    tracing::info!(
                        "model download {}% ({} / {} bytes)",
                        next_progress_pct,
                        written,
                        total
                    );
                    next_progress_pct += 10;
                }
            }
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        drop(file);

        tokio::fs::rename(&tmp, dest).await?;
        tracing::info!("model installed at {}", dest.display());
        Ok(())
    }
}
