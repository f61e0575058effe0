use std::cmp::min;
use std::io;

use log::trace;

use super::compressor;
use super::device::{BlockDevice, DeviceIo};
use super::error::{Result, SqfsError};
use super::fragment::{self, FRAG_NONE};
use super::metadata::{Inode, InodeExtendedInfo};
use super::superblock::Superblock;

/// Everything the data path needs from a regular-file inode, copied out of
/// the inode buffer so the tables can be released before any disk I/O.
#[derive(Debug)]
pub(crate) struct FileInfo {
    pub file_size: u64,
    pub blocks_start: u64,
    pub frag_index: u32,
    pub frag_offset: u32,
    pub block_sizes: Vec<u32>,
}

impl FileInfo {
    pub(crate) fn from_inode(inode: &Inode) -> Result<FileInfo> {
        match &inode.extended_info {
            InodeExtendedInfo::BasicFile(f) => Ok(FileInfo {
                file_size: u64::from(f.file_size),
                blocks_start: u64::from(f.blocks_start),
                frag_index: f.frag_index,
                frag_offset: f.block_offset,
                block_sizes: f.block_sizes.clone(),
            }),
            InodeExtendedInfo::ExtFile(f) => Ok(FileInfo {
                file_size: f.file_size,
                blocks_start: f.blocks_start,
                frag_index: f.frag_index,
                frag_offset: f.block_offset,
                block_sizes: f.block_sizes.clone(),
            }),
            _ => Err(SqfsError::UnsupportedType),
        }
    }

    pub(crate) fn has_fragment(&self) -> bool {
        self.frag_index != FRAG_NONE
    }
}

/// On-disk length of a data block; the low 24 bits of the size word.
pub(crate) fn block_on_disk_len(word: u32) -> usize {
    (word & 0x00FF_FFFF) as usize
}

/// Bit 24 of a data-block size word marks it stored uncompressed.
pub(crate) fn block_is_compressed(word: u32) -> bool {
    word & (1 << 24) == 0
}

/// Assemble file contents into `dst`: every data block in order, then the
/// trailing fragment slice when the inode names one. `len == 0` means the
/// whole file. Returns the number of bytes written.
pub(crate) fn read_file<D: BlockDevice>(
    io: &mut DeviceIo<D>,
    sb: &Superblock,
    info: &FileInfo,
    dst: &mut [u8],
    len: u64,
) -> Result<usize> {
    if len > 0 && len > info.file_size {
        return Err(SqfsError::LengthExceedsFile {
            requested: len,
            file_size: info.file_size,
        });
    }
    let effective = if len == 0 { info.file_size } else { len } as usize;
    if dst.len() < effective {
        return Err(SqfsError::Io(io::Error::new(
            io::ErrorKind::WriteZero,
            "destination buffer too small for requested read",
        )));
    }

    let block_size = sb.block_size as usize;
    let mut written = 0usize;
    let mut data_offset = info.blocks_start;
    let mut scratch = vec![0u8; block_size];

    for &word in &info.block_sizes {
        if written >= effective {
            break;
        }
        let wanted = min(block_size, effective - written);
        let on_disk_len = block_on_disk_len(word);

        // A zero-length size word is a sparse hole covering a whole block.
        if on_disk_len == 0 {
            dst[written..written + wanted].fill(0);
            written += wanted;
            continue;
        }

        let raw = io.read_bytes(data_offset, on_disk_len)?;
        if block_is_compressed(word) {
            let n = compressor::decompress(sb.compressor, &raw, &mut scratch)?;
            let take = min(n, wanted);
            dst[written..written + take].copy_from_slice(&scratch[..take]);
            written += take;
        } else {
            if on_disk_len > block_size {
                return Err(SqfsError::CorruptImage("data block larger than block size"));
            }
            let take = min(on_disk_len, wanted);
            dst[written..written + take].copy_from_slice(&raw[..take]);
            written += take;
        }
        data_offset += on_disk_len as u64;
    }

    if written < effective {
        if !info.has_fragment() {
            return Err(SqfsError::CorruptImage("file data ends before inode size"));
        }
        let entry = fragment::lookup(io, sb, info.frag_index)?;
        let raw = io.read_bytes(entry.start, entry.on_disk_len())?;
        let tail_len = effective - written;
        let tail_at = info.frag_offset as usize;

        if entry.is_compressed() {
            let n = compressor::decompress(sb.compressor, &raw, &mut scratch)?;
            if tail_at + tail_len > n {
                return Err(SqfsError::CorruptImage("fragment slice outside fragment block"));
            }
            dst[written..written + tail_len].copy_from_slice(&scratch[tail_at..tail_at + tail_len]);
        } else {
            if tail_at + tail_len > raw.len() {
                return Err(SqfsError::CorruptImage("fragment slice outside fragment block"));
            }
            dst[written..written + tail_len].copy_from_slice(&raw[tail_at..tail_at + tail_len]);
        }
        written += tail_len;
    }

    trace!("assembled {written} bytes from {} data blocks", info.block_sizes.len());
    Ok(written)
}
