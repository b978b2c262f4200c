//! File save utility.
//!
//! The host base64-encodes a file and asks the page to evaluate
//! `browser_download("<name>", "<base64>")`; the page decodes it and saves
//! it for the user. This sits beside the call/return protocol rather than
//! in it.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{PagewireError, Result};
use crate::protocol::reserved;

/// Build the page code that saves `data` as `filename`.
pub fn download_code(filename: &str, data: &[u8]) -> Result<String> {
    let encoded = STANDARD.encode(data);
    Ok(format!(
        "{}({}, {})",
        reserved::BROWSER_DOWNLOAD,
        serde_json::to_string(filename)?,
        serde_json::to_string(&encoded)?
    ))
}

/// Decode a base64 payload and write it into `dir`.
///
/// Only the final component of `filename` is used, so a host cannot
/// direct the write outside `dir`.
pub fn save_base64(dir: &Path, filename: &str, payload: &str) -> Result<PathBuf> {
    let name = Path::new(filename)
        .file_name()
        .ok_or_else(|| PagewireError::Protocol(format!("invalid file name: {}", filename)))?;
    let data = STANDARD.decode(payload.trim())?;

    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    std::fs::write(&path, data)?;

    tracing::info!(path = %path.display(), "Saved download");
    Ok(path)
}
