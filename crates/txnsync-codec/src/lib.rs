//! Wire framing for a batch of transaction groups: a count-prefixed,
//! length-prefixed sequence of opaque payloads, optionally deflated as a
//! whole when doing so actually shrinks the frame.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Frames below this encoded size are never compressed; the deflate header
/// overhead isn't worth paying on a handful of small groups.
pub const COMPRESSION_THRESHOLD_BYTES: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame ended before the declared group count was read")]
    Truncated,

    #[error("declared decompressed length exceeds the configured maximum")]
    DecompressedTooLarge,

    #[error("deflate stream failed to decompress")]
    Inflate,
}

/// Upper bound on a decompressed frame, guarding against a peer claiming an
/// enormous `decompressed_len` to force an unbounded allocation.
pub const MAX_DECOMPRESSED_BYTES: u32 = 32 * 1024 * 1024;

fn encode_raw(groups: &[Bytes]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(groups.len() as u32);
    for group in groups {
        body.put_u32(group.len() as u32);
        body.put_slice(group);
    }
    body
}

/// Encodes `groups` into a single frame. If deflating the raw encoding saves
/// space, the frame carries the compressed body and its decompressed length;
/// otherwise it carries the raw encoding unchanged.
pub fn encode(groups: &[Bytes]) -> Bytes {
    let raw = encode_raw(groups);

    if raw.len() < COMPRESSION_THRESHOLD_BYTES {
        let mut out = BytesMut::with_capacity(raw.len() + 1);
        out.put_u8(0);
        out.extend_from_slice(&raw);
        return out.freeze();
    }

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(&raw).is_err() {
        let mut out = BytesMut::with_capacity(raw.len() + 1);
        out.put_u8(0);
        out.extend_from_slice(&raw);
        return out.freeze();
    }
    let compressed = match encoder.finish() {
        Ok(c) => c,
        Err(_) => {
            let mut out = BytesMut::with_capacity(raw.len() + 1);
            out.put_u8(0);
            out.extend_from_slice(&raw);
            return out.freeze();
        }
    };

    if compressed.len() + 5 >= raw.len() {
        tracing::trace!(raw_len = raw.len(), compressed_len = compressed.len(), "deflate did not shrink the frame, sending raw");
        let mut out = BytesMut::with_capacity(raw.len() + 1);
        out.put_u8(0);
        out.extend_from_slice(&raw);
        return out.freeze();
    }

    tracing::trace!(raw_len = raw.len(), compressed_len = compressed.len(), "deflated transaction group frame");
    let mut out = BytesMut::with_capacity(compressed.len() + 5);
    out.put_u8(1);
    out.put_u32(raw.len() as u32);
    out.extend_from_slice(&compressed);
    out.freeze()
}

/// Decodes a frame produced by [`encode`] back into the original group
/// payloads, in order.
pub fn decode(frame: &[u8]) -> Result<Vec<Bytes>, CodecError> {
    if frame.is_empty() {
        return Err(CodecError::Truncated);
    }
    let compressed = frame[0] != 0;
    let mut rest = &frame[1..];

    let raw = if compressed {
        if rest.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let decompressed_len = rest.get_u32();
        if decompressed_len > MAX_DECOMPRESSED_BYTES {
            return Err(CodecError::DecompressedTooLarge);
        }
        let mut decoder = DeflateDecoder::new(rest);
        let mut buf = Vec::with_capacity(decompressed_len as usize);
        decoder.read_to_end(&mut buf).map_err(|_| CodecError::Inflate)?;
        buf
    } else {
        rest.to_vec()
    };

    decode_raw(&raw)
}

fn decode_raw(raw: &[u8]) -> Result<Vec<Bytes>, CodecError> {
    let mut buf = raw;
    if buf.len() < 4 {
        return Err(CodecError::Truncated);
    }
    let count = buf.get_u32() as usize;
    let mut groups = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let len = buf.get_u32() as usize;
        if buf.len() < len {
            return Err(CodecError::Truncated);
        }
        groups.push(Bytes::copy_from_slice(&buf[..len]));
        buf.advance(len);
    }
    Ok(groups)
}
