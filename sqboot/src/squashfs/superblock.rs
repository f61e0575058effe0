use std::io::Read;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};

use super::compressor::Compressor;
use super::error::{Result, SqfsError};

pub const MAGIC: u32 = 0x7371_7368;

/// On-disk size of the superblock.
pub const SUPERBLOCK_SIZE: usize = 96;

pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Decoded superblock. All table fields are absolute byte offsets into the
/// image; absent optional tables read as `u64::MAX`.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub magic: u32,
    pub inode_count: u32,
    pub mod_time: u32,
    pub block_size: u32,
    pub frag_count: u32,
    pub compressor: Compressor,
    pub block_log: u16,
    pub flags: SuperblockFlags,
    pub id_count: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub root_inode_ref: u64,
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuperblockFlags: u16 {
        const INODES_UNCOMPRESSED = 0x0001;
        const DATABLOCKS_UNCOMPRESSED = 0x0002;
        const FRAGMENTS_UNCOMPRESSED = 0x0008;
        const FRAGMENTS_NOT_USED = 0x0010;
        const FRAGMENTS_ALWAYS_GENERATED = 0x0020;
        const DATA_DEDUPLICATED = 0x0040;
        const NFS_EXPORT_EXISTS = 0x0080;
        const XATTRS_UNCOMPRESSED = 0x0100;
        const NO_XATTRS = 0x0200;
        const COMPRESSOR_OPTIONS_PRESENT = 0x0400;
        const ID_TABLE_UNCOMPRESSED = 0x0800;
    }
}

impl Superblock {
    pub fn read<R: Read>(r: &mut R) -> Result<Superblock> {
        let sb = Superblock {
            magic: r.read_u32::<LittleEndian>()?,
            inode_count: r.read_u32::<LittleEndian>()?,
            mod_time: r.read_u32::<LittleEndian>()?,
            block_size: r.read_u32::<LittleEndian>()?,
            frag_count: r.read_u32::<LittleEndian>()?,
            compressor: Compressor::try_from(r.read_u16::<LittleEndian>()?)
                .unwrap_or(Compressor::Unknown),
            block_log: r.read_u16::<LittleEndian>()?,
            flags: SuperblockFlags::from_bits_truncate(r.read_u16::<LittleEndian>()?),
            id_count: r.read_u16::<LittleEndian>()?,
            version_major: r.read_u16::<LittleEndian>()?,
            version_minor: r.read_u16::<LittleEndian>()?,
            root_inode_ref: r.read_u64::<LittleEndian>()?,
            bytes_used: r.read_u64::<LittleEndian>()?,
            id_table: r.read_u64::<LittleEndian>()?,
            xattr_table: r.read_u64::<LittleEndian>()?,
            inode_table: r.read_u64::<LittleEndian>()?,
            dir_table: r.read_u64::<LittleEndian>()?,
            frag_table: r.read_u64::<LittleEndian>()?,
            export_table: r.read_u64::<LittleEndian>()?,
        };
        sb.validate()?;
        Ok(sb)
    }

    pub fn from_bytes(b: &[u8]) -> Result<Superblock> {
        Superblock::read(&mut &b[..])
    }

    fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(SqfsError::BadMagic(self.magic));
        }
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(SqfsError::CorruptImage("block size out of range"));
        }
        if u32::from(self.block_log) >= 32 || self.block_size != 1 << self.block_log {
            return Err(SqfsError::CorruptImage("block size does not match block log"));
        }
        if self.inode_table >= self.dir_table {
            return Err(SqfsError::CorruptImage(
                "inode table does not precede directory table",
            ));
        }
        if self.frag_table != u64::MAX && self.frag_table < self.dir_table {
            return Err(SqfsError::CorruptImage("fragment table precedes directory table"));
        }
        Ok(())
    }

    pub fn has_fragments(&self) -> bool {
        self.frag_count > 0 && self.frag_table != u64::MAX
    }

    /// Root inode number, by format convention the highest-numbered inode.
    pub fn root_inode_number(&self) -> u32 {
        self.inode_count
    }
}
