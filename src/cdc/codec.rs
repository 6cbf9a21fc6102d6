//! Deflate/zstd payload codec with trailer validation.
//!
//! A compressed payload is `<compressed bytes> + <8-byte trailer>`; the
//! trailer is the little-endian CRC-32 of the plaintext followed by the
//! little-endian low 32 bits of the plaintext length. The receiving side
//! recomputes both and rejects mismatches before handing data on.

use std::io::Write;

use flate2::Compression;
use flate2::write::{DeflateDecoder, DeflateEncoder};
use log::debug;

use crate::errno::Errno;
use crate::fop::Payload;

/// Trailer length: CRC-32 + uncompressed length.
pub const TRAILER_SIZE: usize = 8;

/// Codec tuning shared by both directions.
#[derive(Clone, Copy, Debug)]
pub struct CodecConfig {
    /// Deflate level: -1 (library default) or 0..=9.
    pub level: i32,
    /// Raw-deflate window size in bits, 9..=15.
    pub window_bits: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig { level: -1, window_bits: 15 }
    }
}

impl CodecConfig {
    fn compression(&self) -> Compression {
        match self.level {
            -1 => Compression::default(),
            n => Compression::new(n.clamp(0, 9) as u32),
        }
    }
}

fn trailer_for(crc: u32, len: usize) -> [u8; TRAILER_SIZE] {
    let mut trailer = [0u8; TRAILER_SIZE];
    trailer[..4].copy_from_slice(&crc.to_le_bytes());
    trailer[4..].copy_from_slice(&(len as u32).to_le_bytes());
    trailer
}

fn split_trailer(data: &[u8]) -> Result<(&[u8], u32, u32), Errno> {
    if data.len() < TRAILER_SIZE {
        return Err(Errno::EBADMSG);
    }
    let (body, trailer) = data.split_at(data.len() - TRAILER_SIZE);
    let crc = u32::from_le_bytes(trailer[..4].try_into().expect("4 bytes"));
    let len = u32::from_le_bytes(trailer[4..].try_into().expect("4 bytes"));
    Ok((body, crc, len))
}

/// Compress a scatter-gather payload, buffers processed in order, into a
/// single output buffer carrying the validation trailer.
pub fn deflate_compress(payload: &Payload, config: &CodecConfig) -> Result<Vec<u8>, Errno> {
    let mut hasher = crc32fast::Hasher::new();
    let mut encoder = DeflateEncoder::new(Vec::new(), config.compression());
    for buf in payload.iter() {
        hasher.update(buf);
        encoder.write_all(buf).map_err(|_| Errno::ENOMEM)?;
    }
    let mut out = encoder.finish().map_err(|_| Errno::ENOMEM)?;
    let crc = hasher.finalize();
    out.extend_from_slice(&trailer_for(crc, payload.len()));
    debug!("deflated {} -> {} bytes (crc {crc:#010x})", payload.len(), out.len());
    Ok(out)
}

/// Inflate a single compressed buffer and validate its trailer.
pub fn deflate_decompress(data: &[u8]) -> Result<Vec<u8>, Errno> {
    let (body, want_crc, want_len) = split_trailer(data)?;
    let mut decoder = DeflateDecoder::new(Vec::new());
    decoder.write_all(body).map_err(|_| Errno::EBADMSG)?;
    let plain = decoder.finish().map_err(|_| Errno::EBADMSG)?;
    let crc = crc32fast::hash(&plain);
    if crc != want_crc || plain.len() as u32 != want_len {
        debug!(
            "inflate validation failed: crc {crc:#010x}/{want_crc:#010x}, len {}/{want_len}",
            plain.len()
        );
        return Err(Errno::EBADMSG);
    }
    Ok(plain)
}

#[cfg(feature = "zstd")]
pub fn zstd_compress(payload: &Payload, level: i32) -> Result<Vec<u8>, Errno> {
    let plain = payload.contiguous();
    let mut out = zstd::bulk::compress(&plain, level).map_err(|_| Errno::ENOMEM)?;
    out.extend_from_slice(&trailer_for(crc32fast::hash(&plain), plain.len()));
    Ok(out)
}

#[cfg(feature = "zstd")]
pub fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, Errno> {
    let (body, want_crc, want_len) = split_trailer(data)?;
    let plain =
        zstd::bulk::decompress(body, want_len as usize).map_err(|_| Errno::EBADMSG)?;
    if crc32fast::hash(&plain) != want_crc || plain.len() as u32 != want_len {
        return Err(Errno::EBADMSG);
    }
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn deflate_round_trip_multi_vector() {
        let mut payload = Payload::new();
        payload.push(Arc::from(&b"the quick brown fox "[..]));
        payload.push(Arc::from(&b"jumps over the lazy dog"[..]));
        let packed = deflate_compress(&payload, &CodecConfig::default()).unwrap();
        assert!(packed.len() > TRAILER_SIZE);
        let plain = deflate_decompress(&packed).unwrap();
        assert_eq!(plain, b"the quick brown fox jumps over the lazy dog");
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let payload = Payload::from_vec(vec![7u8; 4096]);
        let mut packed = deflate_compress(&payload, &CodecConfig::default()).unwrap();
        let crc_at = packed.len() - TRAILER_SIZE;
        packed[crc_at] ^= 0xff;
        assert_eq!(deflate_decompress(&packed), Err(Errno::EBADMSG));
    }

    #[test]
    fn corrupted_length_is_rejected() {
        let payload = Payload::from_vec(b"data".to_vec());
        let mut packed = deflate_compress(&payload, &CodecConfig::default()).unwrap();
        let len_at = packed.len() - 4;
        packed[len_at] = packed[len_at].wrapping_add(1);
        assert_eq!(deflate_decompress(&packed), Err(Errno::EBADMSG));
    }

    #[test]
    fn short_input_is_rejected() {
        assert_eq!(deflate_decompress(&[0u8; 3]), Err(Errno::EBADMSG));
    }

    #[test]
    fn large_block_round_trip() {
        let block: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let payload = Payload::from_vec(block.clone());
        let packed = deflate_compress(&payload, &CodecConfig { level: 9, window_bits: 15 }).unwrap();
        assert!(packed.len() < block.len());
        assert_eq!(deflate_decompress(&packed).unwrap(), block);
    }
}
