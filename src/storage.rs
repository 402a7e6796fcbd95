//! E-book content and cover storage.
//!
//! Content lives either in one file per book under the configured
//! directory or inline in the `books` table. Books remember where their
//! content went, so switching modes never orphans existing uploads.

use crate::config::{BookFormat, StorageConfig, StorageMode};
use crate::db::{Book, Database};
use crate::error::{AppError, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
use image::codecs::jpeg::JpegEncoder;
use std::path::PathBuf;

/// JPEG quality used for stored covers.
const COVER_QUALITY: u8 = 85;

const COVER_MIME: &str = "image/jpeg";

/// Where saved content ended up, ready for `NewBook`.
#[derive(Debug, Clone, Default)]
pub struct StoredContent {
    /// File path in disk mode.
    pub content_path: Option<String>,
    /// Bytes to store inline in database mode.
    pub content: Option<Vec<u8>>,
}

/// Readable content of a book.
#[derive(Debug)]
pub enum ContentSource {
    /// File on disk, streamed on download.
    File {
        /// Path to the file.
        path: PathBuf,
        /// Size in bytes.
        size: u64,
    },
    /// Inline bytes from the database.
    Bytes(Vec<u8>),
}

/// E-book content store.
#[derive(Debug, Clone)]
pub struct ContentStore {
    mode: StorageMode,
    ebooks_dir: PathBuf,
    cover_max_size: u32,
}

impl ContentStore {
    /// Create a store from configuration.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            mode: config.mode,
            ebooks_dir: config.ebooks_dir.clone(),
            cover_max_size: config.cover_max_size,
        }
    }

    /// Save uploaded bytes for a new book.
    pub async fn save(
        &self,
        book_id: &str,
        format: BookFormat,
        data: Vec<u8>,
    ) -> Result<StoredContent> {
        match self.mode {
            StorageMode::Database => Ok(StoredContent {
                content_path: None,
                content: Some(data),
            }),
            StorageMode::Disk => {
                tokio::fs::create_dir_all(&self.ebooks_dir).await?;
                let path = self
                    .ebooks_dir
                    .join(format!("{}.{}", book_id, format.extension()));
                tokio::fs::write(&path, &data).await?;

                tracing::debug!(path = %path.display(), bytes = data.len(), "Stored e-book file");

                Ok(StoredContent {
                    content_path: Some(path.to_string_lossy().to_string()),
                    content: None,
                })
            }
        }
    }

    /// Locate the content of a book.
    pub async fn open(&self, db: &Database, book: &Book) -> Result<ContentSource> {
        if let Some(path) = &book.content_path {
            let path = PathBuf::from(path);
            let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    AppError::NotFound(format!("Content file missing for book {}", book.id))
                } else {
                    AppError::Io(e)
                }
            })?;
            return Ok(ContentSource::File {
                path,
                size: metadata.len(),
            });
        }

        db.get_book_content(&book.id)?
            .map(ContentSource::Bytes)
            .ok_or_else(|| AppError::NotFound(format!("No content stored for book {}", book.id)))
    }

    /// Read the whole content of a book into memory.
    pub async fn read(&self, db: &Database, book: &Book) -> Result<Vec<u8>> {
        match self.open(db, book).await? {
            ContentSource::File { path, .. } => Ok(tokio::fs::read(path).await?),
            ContentSource::Bytes(bytes) => Ok(bytes),
        }
    }

    /// Delete the content file of a book, if it has one.
    pub async fn remove(&self, book: &Book) -> Result<()> {
        let Some(path) = &book.content_path else {
            return Ok(());
        };

        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path, "Content file already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Validate, downscale and encode an uploaded cover as a data URL.
    pub fn process_cover(&self, data: &[u8]) -> Result<String> {
        process_cover(data, self.cover_max_size)
    }
}

/// Decode an image, fit it within `max_size` pixels and re-encode as a JPEG data URL.
pub fn process_cover(data: &[u8], max_size: u32) -> Result<String> {
    let img = image::load_from_memory(data)?;

    let img = if img.width() > max_size || img.height() > max_size {
        img.thumbnail(max_size, max_size)
    } else {
        img
    };

    let mut jpeg_data = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg_data, COVER_QUALITY);
    encoder.encode_image(&img.to_rgb8())?;

    Ok(format!("data:{};base64,{}", COVER_MIME, STANDARD.encode(&jpeg_data)))
}

/// Split a base64 data URL into its MIME type and bytes.
pub fn decode_cover(data_url: &str) -> Result<(String, Vec<u8>)> {
    let invalid = || AppError::Internal("Stored cover is not a base64 data URL".to_string());

    let rest = data_url.strip_prefix("data:").ok_or_else(invalid)?;
    let (mime, payload) = rest.split_once(";base64,").ok_or_else(invalid)?;
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| AppError::Internal(format!("Invalid cover encoding: {}", e)))?;

    Ok((mime.to_string(), bytes))
}
