//! Newline-delimited JSON framing.
//!
//! One message per line. Payloads are base64 photo records, so the frame
//! limit is sized for the largest accepted upload after encoding.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum encoded frame size (160 MiB).
pub const MAX_FRAME_SIZE: usize = 160 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes `msg` into a single line, including the trailing `\n`.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<String, FrameError> {
    let mut line = serde_json::to_string(msg)?;
    if line.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: line.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    line.push('\n');
    Ok(line)
}

/// Parses one line (trailing whitespace tolerated).
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, FrameError> {
    if line.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: line.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_str(line.trim_end())?)
}
