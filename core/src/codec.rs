//! C1: self-describing binary encode/decode of the VM descriptor and its
//! sub-messages, plus the base64+gzip wrapper used for argv transport.
//!
//! The codec's only contract: `decode(encode(x)) == x` for every value the
//! schema describes (spec §4.1). Sub-structures ([`crate::descriptor::Entrypoint`],
//! [`crate::descriptor::Vsockd`]) are encoded independently of the
//! enclosing [`crate::descriptor::Data`] so they can be shipped over
//! separate pipes, exactly as the descriptor itself is.
//!
//! This is the single codec spec §9 calls for, exposed twice: [`encode`]/
//! [`decode`] for the raw form used over C2, and [`encode_gzip_base64`]/
//! [`decode_gzip_base64`] for the compressed, base64-armoured form used on
//! argv.

use crate::{Result, RunqError};
use base64::engine::{general_purpose::STANDARD, Engine};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read;

/// Encodes a value with the self-describing binary codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(RunqError::from)
}

/// Decodes a value with the self-describing binary codec. Unknown trailing
/// bytes or an undersized buffer are decode errors, never silently
/// ignored — `bincode`'s deserializer already rejects a buffer that
/// doesn't fully account for the type's shape.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(RunqError::from)
}

/// Encodes, gzip-compresses, then base64-encodes a value for argv
/// transport.
pub fn encode_gzip_base64<T: Serialize>(value: &T) -> Result<String> {
    let raw = encode(value)?;
    let mut gz = GzEncoder::new(raw.as_slice(), Compression::default());
    let mut compressed = Vec::new();
    gz.read_to_end(&mut compressed)?;
    Ok(STANDARD.encode(compressed))
}

/// Inverse of [`encode_gzip_base64`].
pub fn decode_gzip_base64<T: DeserializeOwned>(s: &str) -> Result<T> {
    let compressed = STANDARD
        .decode(s)
        .map_err(|e| RunqError::Codec(format!("base64 decode failed: {e}")))?;
    let mut gz = GzDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    gz.read_to_end(&mut raw)
        .map_err(|e| RunqError::Codec(format!("gzip decode failed: {e}")))?;
    decode(&raw)
}
