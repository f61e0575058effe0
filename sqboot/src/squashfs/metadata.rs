use std::io::Read;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::trace;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::compressor::{self, Compressor};
use super::error::{Result, SqfsError};
use super::fragment::FRAG_NONE;

/// Decompressed metadata blocks never exceed 8 KiB.
pub(crate) const METADATA_BLOCK_SIZE: usize = 8192;

/// Every metadata block starts with a 2-byte length/flag header.
pub(crate) const HEADER_SIZE: usize = 2;

#[derive(Debug, Clone, Copy)]
pub(crate) struct MetaBlockHeader {
    pub on_disk_len: usize,
    pub compressed: bool,
}

/// Decode a raw 16-bit metadata-block header: bit 15 clear means the payload
/// is compressed, bits 14..0 carry the on-disk payload length.
pub(crate) fn parse_block_header(header: u16) -> Result<MetaBlockHeader> {
    let on_disk_len = (header & 0x7FFF) as usize;
    if on_disk_len > METADATA_BLOCK_SIZE {
        return Err(SqfsError::CorruptImage("metadata block length exceeds 8 KiB"));
    }
    Ok(MetaBlockHeader {
        on_disk_len,
        compressed: header & 0x8000 == 0,
    })
}

pub(crate) fn read_u16_at(buf: &[u8], at: usize) -> Result<u16> {
    buf.get(at..at + 2)
        .map(LittleEndian::read_u16)
        .ok_or(SqfsError::CorruptImage("record extends past end of metadata buffer"))
}

pub(crate) fn read_u32_at(buf: &[u8], at: usize) -> Result<u32> {
    buf.get(at..at + 4)
        .map(LittleEndian::read_u32)
        .ok_or(SqfsError::CorruptImage("record extends past end of metadata buffer"))
}

pub(crate) fn read_u64_at(buf: &[u8], at: usize) -> Result<u64> {
    buf.get(at..at + 8)
        .map(LittleEndian::read_u64)
        .ok_or(SqfsError::CorruptImage("record extends past end of metadata buffer"))
}

/// Position of one metadata block within a reconstructed table: where its
/// header sat on disk (relative to the table start) and where its payload
/// landed in the decoded buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MetaBlockPos {
    pub disk_offset: u64,
    pub decoded_offset: usize,
}

/// A metadata table (inode or directory) materialized into one contiguous
/// decoded buffer, plus the per-block position map used to translate
/// `(start_block, offset)` references.
#[derive(Debug)]
pub struct MetaTable {
    pub(crate) decoded: Vec<u8>,
    pub(crate) blocks: Vec<MetaBlockPos>,
}

impl MetaTable {
    /// Reconstruct the sequence of metadata blocks stored in `raw`: walk the
    /// 2-byte headers, inflate or copy each payload, and record where every
    /// block's payload begins. The final block of a table is usually short,
    /// so nothing here assumes full 8 KiB payloads.
    pub(crate) fn rebuild(raw: &[u8], codec: Compressor) -> Result<MetaTable> {
        let mut decoded: Vec<u8> = Vec::new();
        let mut blocks = Vec::new();
        let mut cursor = 0usize;

        while cursor < raw.len() {
            let header = parse_block_header(read_u16_at(raw, cursor)?)?;
            let payload_at = cursor + HEADER_SIZE;
            let payload_end = payload_at + header.on_disk_len;
            if payload_end > raw.len() {
                return Err(SqfsError::CorruptImage("metadata block overruns its table"));
            }
            let src = &raw[payload_at..payload_end];

            let pos = MetaBlockPos {
                disk_offset: cursor as u64,
                decoded_offset: decoded.len(),
            };
            decoded
                .try_reserve(METADATA_BLOCK_SIZE)
                .map_err(|_| SqfsError::OutOfMemory)?;
            if header.compressed {
                let tail = decoded.len();
                decoded.resize(tail + METADATA_BLOCK_SIZE, 0);
                let n = compressor::decompress(codec, src, &mut decoded[tail..])
                    .map_err(|e| match e {
                        SqfsError::UnsupportedCodec(_) => e,
                        _ => SqfsError::CorruptImage("metadata block failed to decompress"),
                    })?;
                decoded.truncate(tail + n);
            } else {
                decoded.extend_from_slice(src);
            }
            blocks.push(pos);
            cursor = payload_end;
        }

        trace!(
            "metadata table rebuilt: {} blocks, {} decoded bytes",
            blocks.len(),
            decoded.len()
        );
        Ok(MetaTable { decoded, blocks })
    }

    pub(crate) fn decoded(&self) -> &[u8] {
        &self.decoded
    }
}

/// Inode type tags. Basic forms carry 32-bit size/offset fields; extended
/// forms widen them and add hard-link/xattr fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum InodeType {
    BasicDir = 1,
    BasicFile = 2,
    BasicSymlink = 3,
    BasicBlockDev = 4,
    BasicCharDev = 5,
    BasicFifo = 6,
    BasicSocket = 7,
    ExtDir = 8,
    ExtFile = 9,
    ExtSymlink = 10,
    ExtBlockDev = 11,
    ExtCharDev = 12,
    ExtFifo = 13,
    ExtSocket = 14,
}

/// Number of data blocks backing a regular file: a fragmented file keeps its
/// tail in a fragment block, an unfragmented one rounds the tail up into a
/// final data block.
pub(crate) fn data_block_count(file_size: u64, frag_index: u32, block_size: u32) -> u64 {
    if frag_index == FRAG_NONE {
        file_size.div_ceil(u64::from(block_size))
    } else {
        file_size / u64::from(block_size)
    }
}

/// On-disk footprint of the inode starting at `at`, the one place that knows
/// every variant's size. The walker advances by exactly this much.
pub(crate) fn inode_disk_len(buf: &[u8], at: usize, block_size: u32) -> Result<usize> {
    let tag = read_u16_at(buf, at)?;
    let inode_type = InodeType::try_from(tag)
        .map_err(|_| SqfsError::CorruptImage("unknown inode type tag"))?;

    Ok(match inode_type {
        InodeType::BasicDir => 32,
        InodeType::BasicFile => {
            let frag_index = read_u32_at(buf, at + 20)?;
            let file_size = u64::from(read_u32_at(buf, at + 28)?);
            32 + data_block_count(file_size, frag_index, block_size) as usize * 4
        }
        InodeType::BasicSymlink | InodeType::ExtSymlink => {
            let target_len = read_u32_at(buf, at + 20)? as usize;
            24 + target_len
        }
        InodeType::BasicBlockDev | InodeType::BasicCharDev => 24,
        InodeType::BasicFifo | InodeType::BasicSocket => 20,
        InodeType::ExtDir => {
            let index_count = read_u16_at(buf, at + 32)? as usize;
            let mut len = 40;
            if index_count > 0 {
                for _ in 0..=index_count {
                    let name_len = read_u32_at(buf, at + len + 8)? as usize;
                    len += 12 + name_len + 1;
                }
            }
            len
        }
        InodeType::ExtFile => {
            let file_size = read_u64_at(buf, at + 24)?;
            let frag_index = read_u32_at(buf, at + 44)?;
            56 + data_block_count(file_size, frag_index, block_size) as usize * 4
        }
        InodeType::ExtBlockDev | InodeType::ExtCharDev => 28,
        InodeType::ExtFifo | InodeType::ExtSocket => 24,
    })
}

/// Walk the packed inode table from offset 0 and return the byte offset of
/// the inode whose number matches. The table carries no index, so this is a
/// linear scan with per-type advance.
pub(crate) fn find_inode(
    buf: &[u8],
    inode_number: u32,
    inode_count: u32,
    block_size: u32,
) -> Result<usize> {
    let mut offset = 0usize;
    for _ in 0..inode_count {
        if read_u32_at(buf, offset + 12)? == inode_number {
            return Ok(offset);
        }
        offset += inode_disk_len(buf, offset, block_size)?;
        if offset > buf.len() {
            return Err(SqfsError::CorruptImage("inode walk ran past end of table"));
        }
    }
    Err(SqfsError::CorruptImage("inode number not present in inode table"))
}

/// Information about an object in the filesystem (file, directory, device
/// node, ...), decoded out of the materialized inode table.
#[derive(Debug)]
pub struct Inode {
    inode_type: InodeType,
    permissions: u16,
    uid_index: u16,
    gid_index: u16,
    mtime: u32,
    inode_number: u32,
    pub extended_info: InodeExtendedInfo,
}

/// Type-specific part of an inode.
#[derive(Debug)]
pub enum InodeExtendedInfo {
    BasicDir(BasicDirInfo),
    ExtDir(ExtDirInfo),
    BasicFile(BasicFileInfo),
    ExtFile(ExtFileInfo),
    Symlink(SymlinkInfo),
    Dev(DevInfo),
    ExtDev(ExtDevInfo),
    Ipc(IpcInfo),
    ExtIpc(ExtIpcInfo),
}

#[derive(Debug)]
pub struct BasicDirInfo {
    pub start_block: u32,
    pub link_count: u32,
    pub file_size: u16,
    pub block_offset: u16,
    pub parent_inode: u32,
}

#[derive(Debug)]
pub struct ExtDirInfo {
    pub link_count: u32,
    pub file_size: u32,
    pub start_block: u32,
    pub parent_inode: u32,
    pub index_count: u16,
    pub block_offset: u16,
    pub xattr_index: u32,
}

#[derive(Debug)]
pub struct BasicFileInfo {
    pub(crate) blocks_start: u32,
    pub(crate) frag_index: u32,
    pub(crate) block_offset: u32,
    pub file_size: u32,
    pub(crate) block_sizes: Vec<u32>,
}

#[derive(Debug)]
pub struct ExtFileInfo {
    pub(crate) blocks_start: u64,
    pub file_size: u64,
    pub sparse: u64,
    pub link_count: u32,
    pub(crate) frag_index: u32,
    pub(crate) block_offset: u32,
    pub xattr_index: u32,
    pub(crate) block_sizes: Vec<u32>,
}

#[derive(Debug)]
pub struct SymlinkInfo {
    pub link_count: u32,
    pub target: Vec<u8>,
}

#[derive(Debug)]
pub struct DevInfo {
    pub link_count: u32,
    pub dev_number: u32,
}

#[derive(Debug)]
pub struct ExtDevInfo {
    pub link_count: u32,
    pub dev_number: u32,
    pub xattr_index: u32,
}

#[derive(Debug)]
pub struct IpcInfo {
    pub link_count: u32,
}

#[derive(Debug)]
pub struct ExtIpcInfo {
    pub link_count: u32,
    pub xattr_index: u32,
}

impl Inode {
    /// Decode one inode from the head of `r`. `block_size` drives the length
    /// of the trailing block-size list on regular files.
    pub(crate) fn read<R: Read>(r: &mut R, block_size: u32) -> Result<Self> {
        let tag = r.read_u16::<LittleEndian>()?;
        let inode_type = InodeType::try_from(tag)
            .map_err(|_| SqfsError::CorruptImage("unknown inode type tag"))?;
        let permissions = r.read_u16::<LittleEndian>()?;
        let uid_index = r.read_u16::<LittleEndian>()?;
        let gid_index = r.read_u16::<LittleEndian>()?;
        let mtime = r.read_u32::<LittleEndian>()?;
        let inode_number = r.read_u32::<LittleEndian>()?;

        let extended_info = match inode_type {
            InodeType::BasicDir => InodeExtendedInfo::BasicDir(BasicDirInfo {
                start_block: r.read_u32::<LittleEndian>()?,
                link_count: r.read_u32::<LittleEndian>()?,
                file_size: r.read_u16::<LittleEndian>()?,
                block_offset: r.read_u16::<LittleEndian>()?,
                parent_inode: r.read_u32::<LittleEndian>()?,
            }),
            InodeType::ExtDir => InodeExtendedInfo::ExtDir(ExtDirInfo {
                link_count: r.read_u32::<LittleEndian>()?,
                file_size: r.read_u32::<LittleEndian>()?,
                start_block: r.read_u32::<LittleEndian>()?,
                parent_inode: r.read_u32::<LittleEndian>()?,
                index_count: r.read_u16::<LittleEndian>()?,
                block_offset: r.read_u16::<LittleEndian>()?,
                xattr_index: r.read_u32::<LittleEndian>()?,
            }),
            InodeType::BasicFile => {
                let blocks_start = r.read_u32::<LittleEndian>()?;
                let frag_index = r.read_u32::<LittleEndian>()?;
                let block_offset = r.read_u32::<LittleEndian>()?;
                let file_size = r.read_u32::<LittleEndian>()?;
                let block_sizes =
                    read_block_sizes(r, u64::from(file_size), frag_index, block_size)?;
                InodeExtendedInfo::BasicFile(BasicFileInfo {
                    blocks_start,
                    frag_index,
                    block_offset,
                    file_size,
                    block_sizes,
                })
            }
            InodeType::ExtFile => {
                let blocks_start = r.read_u64::<LittleEndian>()?;
                let file_size = r.read_u64::<LittleEndian>()?;
                let sparse = r.read_u64::<LittleEndian>()?;
                let link_count = r.read_u32::<LittleEndian>()?;
                let frag_index = r.read_u32::<LittleEndian>()?;
                let block_offset = r.read_u32::<LittleEndian>()?;
                let xattr_index = r.read_u32::<LittleEndian>()?;
                let block_sizes = read_block_sizes(r, file_size, frag_index, block_size)?;
                InodeExtendedInfo::ExtFile(ExtFileInfo {
                    blocks_start,
                    file_size,
                    sparse,
                    link_count,
                    frag_index,
                    block_offset,
                    xattr_index,
                    block_sizes,
                })
            }
            InodeType::BasicSymlink | InodeType::ExtSymlink => {
                let link_count = r.read_u32::<LittleEndian>()?;
                let target_size = r.read_u32::<LittleEndian>()?;
                let mut target = Vec::new();
                let read_size = r.take(u64::from(target_size)).read_to_end(&mut target)?;
                if read_size != target_size as usize {
                    return Err(SqfsError::CorruptImage("symlink target truncated"));
                }
                InodeExtendedInfo::Symlink(SymlinkInfo { link_count, target })
            }
            InodeType::BasicBlockDev | InodeType::BasicCharDev => {
                InodeExtendedInfo::Dev(DevInfo {
                    link_count: r.read_u32::<LittleEndian>()?,
                    dev_number: r.read_u32::<LittleEndian>()?,
                })
            }
            InodeType::ExtBlockDev | InodeType::ExtCharDev => {
                InodeExtendedInfo::ExtDev(ExtDevInfo {
                    link_count: r.read_u32::<LittleEndian>()?,
                    dev_number: r.read_u32::<LittleEndian>()?,
                    xattr_index: r.read_u32::<LittleEndian>()?,
                })
            }
            InodeType::BasicFifo | InodeType::BasicSocket => {
                InodeExtendedInfo::Ipc(IpcInfo {
                    link_count: r.read_u32::<LittleEndian>()?,
                })
            }
            InodeType::ExtFifo | InodeType::ExtSocket => {
                InodeExtendedInfo::ExtIpc(ExtIpcInfo {
                    link_count: r.read_u32::<LittleEndian>()?,
                    xattr_index: r.read_u32::<LittleEndian>()?,
                })
            }
        };

        Ok(Self {
            inode_type,
            permissions,
            uid_index,
            gid_index,
            mtime,
            inode_number,
            extended_info,
        })
    }

    pub fn inode_type(&self) -> InodeType {
        self.inode_type
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.inode_type, InodeType::BasicDir | InodeType::ExtDir)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.inode_type, InodeType::BasicFile | InodeType::ExtFile)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.inode_type, InodeType::BasicSymlink | InodeType::ExtSymlink)
    }

    pub fn inode_number(&self) -> u32 {
        self.inode_number
    }

    pub fn permissions(&self) -> u16 {
        self.permissions
    }

    pub fn uid_index(&self) -> u16 {
        self.uid_index
    }

    pub fn gid_index(&self) -> u16 {
        self.gid_index
    }

    pub fn mtime(&self) -> u32 {
        self.mtime
    }

    /// Unix mode word: type bits or'ed over the permission bits.
    pub fn mode(&self) -> u16 {
        let type_bits = match self.inode_type {
            InodeType::BasicDir | InodeType::ExtDir => 0o40000,
            InodeType::BasicFile | InodeType::ExtFile => 0o100000,
            InodeType::BasicSymlink | InodeType::ExtSymlink => 0o120000,
            InodeType::BasicBlockDev | InodeType::ExtBlockDev => 0o60000,
            InodeType::BasicCharDev | InodeType::ExtCharDev => 0o20000,
            InodeType::BasicFifo | InodeType::ExtFifo => 0o10000,
            InodeType::BasicSocket | InodeType::ExtSocket => 0o140000,
        };
        self.permissions | type_bits
    }

    /// Decompressed size of a regular file's contents.
    pub fn data_size(&self) -> u64 {
        match &self.extended_info {
            InodeExtendedInfo::BasicFile(i) => u64::from(i.file_size),
            InodeExtendedInfo::ExtFile(i) => i.file_size,
            _ => 0,
        }
    }

    pub fn symlink_target(&self) -> Option<&[u8]> {
        match &self.extended_info {
            InodeExtendedInfo::Symlink(i) => Some(&i.target),
            _ => None,
        }
    }

    /// Directory-table reference of a directory inode:
    /// `(start_block, offset, listing_size)`.
    pub(crate) fn dir_ref(&self) -> Option<(u32, u16, u32)> {
        match &self.extended_info {
            InodeExtendedInfo::BasicDir(d) => {
                Some((d.start_block, d.block_offset, u32::from(d.file_size)))
            }
            InodeExtendedInfo::ExtDir(d) => Some((d.start_block, d.block_offset, d.file_size)),
            _ => None,
        }
    }
}

fn read_block_sizes<R: Read>(
    r: &mut R,
    file_size: u64,
    frag_index: u32,
    block_size: u32,
) -> Result<Vec<u32>> {
    let count = data_block_count(file_size, frag_index, block_size);
    let mut block_sizes = Vec::new();
    block_sizes
        .try_reserve_exact(count as usize)
        .map_err(|_| SqfsError::OutOfMemory)?;
    for _ in 0..count {
        block_sizes.push(r.read_u32::<LittleEndian>()?);
    }
    Ok(block_sizes)
}
