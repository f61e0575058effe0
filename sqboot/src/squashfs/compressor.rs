use std::io::{self, Read};

use flate2::read::ZlibDecoder;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::error::{DecompressError, Result, SqfsError};

/// Compression codec ids as stored in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Compressor {
    Zlib = 1,
    Lzma = 2,
    Lzo = 3,
    Xz = 4,
    Lz4 = 5,
    Zstd = 6,
    #[num_enum(default)]
    Unknown = 0xFFFF,
}

/// Decompress one block of `src` into `dst`, returning the decoded length.
/// Pure dispatch; zlib is always available, xz and zstd behind their feature
/// flags, everything else reports `UnsupportedCodec`.
pub fn decompress(codec: Compressor, src: &[u8], dst: &mut [u8]) -> Result<usize> {
    match codec {
        Compressor::Zlib => zlib(src, dst).map_err(SqfsError::from),
        #[cfg(feature = "xz")]
        Compressor::Xz => xz(src, dst).map_err(SqfsError::from),
        #[cfg(feature = "zstd")]
        Compressor::Zstd => zstd(src, dst).map_err(SqfsError::from),
        other => Err(SqfsError::UnsupportedCodec(other.into())),
    }
}

fn zlib(src: &[u8], dst: &mut [u8]) -> std::result::Result<usize, DecompressError> {
    let mut decoder = ZlibDecoder::new(src);
    drain_into(&mut decoder, dst)
}

#[cfg(feature = "xz")]
fn xz(src: &[u8], dst: &mut [u8]) -> std::result::Result<usize, DecompressError> {
    use lzma_rs::error::Error;

    let mut cursor = io::Cursor::new(&mut dst[..]);
    match lzma_rs::xz_decompress(&mut &src[..], &mut cursor) {
        Ok(()) => Ok(cursor.position() as usize),
        Err(Error::IoError(e)) if e.kind() == io::ErrorKind::WriteZero => {
            Err(DecompressError::BufferTooSmall)
        }
        Err(e) => Err(DecompressError::CorruptData(e.to_string())),
    }
}

#[cfg(feature = "zstd")]
fn zstd(src: &[u8], dst: &mut [u8]) -> std::result::Result<usize, DecompressError> {
    let mut decoder = ruzstd::decoding::StreamingDecoder::new(src)
        .map_err(|e| DecompressError::CorruptData(e.to_string()))?;
    drain_into(&mut decoder, dst)
}

/// Pull everything a decoder produces into `dst`; producing more than `dst`
/// holds is the caller's `BufferTooSmall`.
fn drain_into<R: Read>(decoder: &mut R, dst: &mut [u8]) -> std::result::Result<usize, DecompressError> {
    let mut len = 0;
    while len < dst.len() {
        match decoder.read(&mut dst[len..]) {
            Ok(0) => return Ok(len),
            Ok(n) => len += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::OutOfMemory => {
                return Err(DecompressError::OutOfMemory)
            }
            Err(e) => return Err(DecompressError::CorruptData(e.to_string())),
        }
    }
    let mut probe = [0u8; 1];
    match decoder.read(&mut probe) {
        Ok(0) => Ok(len),
        Ok(_) => Err(DecompressError::BufferTooSmall),
        Err(e) => Err(DecompressError::CorruptData(e.to_string())),
    }
}
