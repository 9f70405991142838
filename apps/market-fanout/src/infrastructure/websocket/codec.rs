//! Feed Frame Codec
//!
//! Decodes WebSocket frames into raw records.
//!
//! - **Text frames**: JSON, either a single record object or an array
//! - **Binary frames**: `MessagePack` array or map (JSON when the codec is
//!   forced to JSON)
//!
//! Array elements that are not records (control or status messages) are
//! counted and skipped rather than failing the whole frame.
//!
//! Example text frame:
//! ```json
//! [{"S":"AAPL","p":187.12,"seq":42,"t":"2024-01-15T10:00:00Z"}]
//! ```

use serde_json::Value;

use crate::domain::streaming::RawRecord;
use crate::infrastructure::config::FeedCodec;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// `MessagePack` decoding failed.
    #[error("`MessagePack` decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// The frame type is not accepted by the configured codec.
    #[error("{frame} frame not accepted by {codec} codec")]
    UnexpectedFrame {
        /// Frame kind.
        frame: &'static str,
        /// Configured codec.
        codec: &'static str,
    },

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// Records decoded from one frame.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Records in frame order.
    pub records: Vec<RawRecord>,
    /// Elements that were not records.
    pub ignored: usize,
}

/// Frame decoder for a configured codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameDecoder {
    codec: FeedCodec,
}

impl FrameDecoder {
    /// Create a decoder.
    #[must_use]
    pub const fn new(codec: FeedCodec) -> Self {
        Self { codec }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON or the codec only accepts
    /// binary frames.
    pub fn decode_text(&self, text: &str) -> Result<DecodedFrame, CodecError> {
        if self.codec == FeedCodec::MessagePack {
            return Err(CodecError::UnexpectedFrame {
                frame: "text",
                codec: self.codec.as_str(),
            });
        }
        decode_json(text)
    }

    /// Decode a binary frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be decoded.
    pub fn decode_binary(&self, data: &[u8]) -> Result<DecodedFrame, CodecError> {
        match self.codec {
            FeedCodec::Json => {
                let text = std::str::from_utf8(data)
                    .map_err(|e| CodecError::InvalidFormat(format!("binary JSON not UTF-8: {e}")))?;
                decode_json(text)
            }
            FeedCodec::Auto | FeedCodec::MessagePack => decode_msgpack(data),
        }
    }
}

fn decode_json(text: &str) -> Result<DecodedFrame, CodecError> {
    let trimmed = text.trim();

    if trimmed.starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(trimmed)?;
        let mut frame = DecodedFrame {
            records: Vec::with_capacity(values.len()),
            ignored: 0,
        };
        for value in values {
            match serde_json::from_value::<RawRecord>(value) {
                Ok(record) => frame.records.push(record),
                Err(_) => frame.ignored += 1,
            }
        }
        Ok(frame)
    } else if trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed)?;
        Ok(serde_json::from_value::<RawRecord>(value).map_or_else(
            |_| DecodedFrame {
                records: Vec::new(),
                ignored: 1,
            },
            |record| DecodedFrame {
                records: vec![record],
                ignored: 0,
            },
        ))
    } else {
        Err(CodecError::InvalidFormat(format!(
            "expected JSON array or object, got: {}...",
            trimmed.chars().take(50).collect::<String>()
        )))
    }
}

fn decode_msgpack(data: &[u8]) -> Result<DecodedFrame, CodecError> {
    if let Ok(records) = rmp_serde::from_slice::<Vec<RawRecord>>(data) {
        return Ok(DecodedFrame {
            records,
            ignored: 0,
        });
    }

    let record: RawRecord = rmp_serde::from_slice(data)?;
    Ok(DecodedFrame {
        records: vec![record],
        ignored: 0,
    })
}
