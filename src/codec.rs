//! Per-block codec: deflate with gzip framing, or identity.
//!
//! The chosen mode travels in the block header, so sender and receiver
//! never have to agree out of band. Compression is only kept when it
//! actually pays for its framing overhead (see `select_best`).

use crate::config::COMPRESSION_KEEP_RATIO;
use crate::error::BlockError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Codec modes carried in the `compression` header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    None,
}

/// Encode a chunk under the given mode.
pub fn encode(mode: Compression, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    match mode {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => gzip(data),
    }
}

/// Decode a chunk under the mode named in its header. Decoder failures are
/// block-level integrity failures and trigger a NACK upstream.
pub fn decode(mode: Compression, data: &[u8]) -> Result<Vec<u8>, BlockError> {
    match mode {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|_| BlockError::DecompressFailed)?;
            Ok(out)
        }
    }
}

/// Pick the cheaper representation for a chunk.
///
/// Gzips the input and keeps the result only when it is strictly smaller
/// than `COMPRESSION_KEEP_RATIO` of the original; otherwise returns the raw
/// bytes under `Compression::None`. A compressor error also falls back to
/// the raw bytes — it is never fatal on the sender.
pub fn select_best(data: &[u8]) -> (Compression, Vec<u8>) {
    match gzip(data) {
        Ok(compressed)
            if (compressed.len() as f64) < (data.len() as f64) * COMPRESSION_KEEP_RATIO =>
        {
            (Compression::Gzip, compressed)
        }
        Ok(_) => (Compression::None, data.to_vec()),
        Err(e) => {
            tracing::warn!(
                event = "compression_fallback",
                bytes = data.len(),
                error = %e,
                "Compressor failed, sending chunk uncompressed"
            );
            (Compression::None, data.to_vec())
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
