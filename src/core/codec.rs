// Cache payload codec: JSON serialization plus optional raw-deflate compression.
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::core::error::{Error, ErrorKind};
use crate::core::snapshot::CacheEntry;

pub const COMPRESSION_LEVEL: u32 = 3;

pub fn serialize(entry: &CacheEntry) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(entry).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to serialize cache entry")
            .with_source(err)
    })
}

pub fn deserialize(bytes: &[u8]) -> Result<CacheEntry, Error> {
    if bytes.is_empty() {
        return Err(Error::new(ErrorKind::Corrupt).with_message("empty cache payload"));
    }
    serde_json::from_slice(bytes).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("cache payload is not a valid entry")
            .with_source(err)
    })
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    encoder.write_all(bytes).map_err(compress_error)?;
    encoder.finish().map_err(compress_error)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("cache payload does not inflate")
            .with_source(err)
    })?;
    Ok(out)
}

/// Serialize then compress, the on-disk form of an entry.
pub fn encode_compressed(entry: &CacheEntry) -> Result<Vec<u8>, Error> {
    compress(&serialize(entry)?)
}

pub fn decode_compressed(bytes: &[u8]) -> Result<CacheEntry, Error> {
    deserialize(&decompress(bytes)?)
}

/// One leading tag byte records whether the body is deflated, for stores without item flags.
pub fn encode_tagged(entry: &CacheEntry, compressed: bool) -> Result<Vec<u8>, Error> {
    let body = if compressed {
        encode_compressed(entry)?
    } else {
        serialize(entry)?
    };
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(if compressed { TAG_DEFLATE } else { TAG_PLAIN });
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_tagged(bytes: &[u8]) -> Result<CacheEntry, Error> {
    match bytes.split_first() {
        Some((&TAG_PLAIN, body)) => deserialize(body),
        Some((&TAG_DEFLATE, body)) => decode_compressed(body),
        Some((tag, _)) => Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!("unknown cache payload tag 0x{tag:02x}"))),
        None => Err(Error::new(ErrorKind::Corrupt).with_message("empty cache payload")),
    }
}

const TAG_PLAIN: u8 = b'J';
const TAG_DEFLATE: u8 = b'Z';

fn compress_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("failed to compress cache payload")
        .with_source(err)
}
