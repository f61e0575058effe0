//! See https://dr-emann.github.io/squashfs/squashfs.html
//! for details on the SquashFS binary format

use log::{debug, trace};

use super::device::{BlockDevice, DeviceIo, Partition};
use super::dir::{self, DirCursor, EntryKind};
use super::error::{Result, SqfsError};
use super::filedata::{self, FileInfo};
use super::metadata::{self, Inode, MetaTable};
use super::path;
use super::superblock::{Superblock, SUPERBLOCK_SIZE};

/// A mounted read-only SquashFS: one device handle, one decoded superblock.
/// All lookups run against tables materialized per operation; a mount holds
/// no mutable state beyond the device cursor.
#[derive(Debug)]
pub struct SquashFs<D: BlockDevice> {
    io: DeviceIo<D>,
    sb: Superblock,
}

/// The two metadata tables a lookup needs, reconstructed into flat buffers.
/// Owned by the operation (or the open `DirStream`) that materialized them.
#[derive(Debug)]
struct Tables {
    inodes: MetaTable,
    dirs: MetaTable,
}

impl<D: BlockDevice> SquashFs<D> {
    /// Probe `partition` on `dev` for a SquashFS image: read sector 0,
    /// validate the superblock, and keep both handles for the mount's
    /// lifetime.
    pub fn probe(dev: D, partition: Partition) -> Result<Self> {
        let mut io = DeviceIo::new(dev, partition);
        let raw = io.read_bytes(0, SUPERBLOCK_SIZE)?;
        let sb = Superblock::from_bytes(&raw)?;
        debug!(
            "squashfs {}.{}: {} inodes, {} byte blocks, {} fragments, {:?} compression",
            sb.version_major, sb.version_minor, sb.inode_count, sb.block_size, sb.frag_count,
            sb.compressor
        );
        Ok(SquashFs { io, sb })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Open a directory for iteration. The returned stream owns the
    /// materialized inode and directory tables and is positioned at the
    /// listing's first header.
    pub fn opendir(&mut self, path: &str) -> Result<DirStream> {
        let tables = self.load_tables()?;
        let inode = self.resolve(&tables, path)?;
        let (start_block, offset, listing_size) =
            inode.dir_ref().ok_or(SqfsError::NotADirectory)?;
        let listing_at = dir::listing_offset(&tables.dirs, start_block, offset)?;
        trace!("opendir {path:?}: listing at {listing_at}, {listing_size} bytes");
        Ok(DirStream {
            tables,
            cursor: DirCursor::new(listing_at, listing_size),
            inode_count: self.sb.inode_count,
            block_size: self.sb.block_size,
        })
    }

    /// Decompressed size of the object at `path`: file size for regular
    /// files, target length for symlinks, 0 for everything else.
    pub fn size(&mut self, path: &str) -> Result<u64> {
        let tables = self.load_tables()?;
        let inode = self.resolve(&tables, path)?;
        Ok(match inode.symlink_target() {
            Some(target) => target.len() as u64,
            None => inode.data_size(),
        })
    }

    /// Read the regular file at `path` into `buf[dst_offset..]`. `len == 0`
    /// reads the whole file; a non-zero `len` longer than the file fails
    /// with `LengthExceedsFile`. Returns the number of bytes written.
    pub fn read(&mut self, path: &str, buf: &mut [u8], dst_offset: usize, len: u64) -> Result<usize> {
        let info = {
            let tables = self.load_tables()?;
            let inode = self.resolve(&tables, path)?;
            FileInfo::from_inode(&inode)?
            // tables drop here; the copied block-size list is all the data
            // path needs
        };
        let dst = buf.get_mut(dst_offset..).ok_or_else(|| {
            SqfsError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "destination offset outside buffer",
            ))
        })?;
        filedata::read_file(&mut self.io, &self.sb, &info, dst, len)
    }

    /// Release the mount, handing the device back to the host.
    pub fn close(self) -> D {
        self.io.into_inner()
    }

    /// Materialize the inode and directory tables. The directory table's
    /// metadata region runs to the first table that follows it in the image.
    fn load_tables(&mut self) -> Result<Tables> {
        let sb = &self.sb;
        let dir_end = if sb.frag_table != u64::MAX {
            sb.frag_table
        } else if sb.export_table != u64::MAX {
            sb.export_table
        } else {
            sb.id_table
        };
        if dir_end < sb.dir_table {
            return Err(SqfsError::CorruptImage("directory table has negative extent"));
        }

        let raw_inodes = self
            .io
            .read_bytes(sb.inode_table, (sb.dir_table - sb.inode_table) as usize)?;
        let inodes = MetaTable::rebuild(&raw_inodes, sb.compressor)?;
        let raw_dirs = self
            .io
            .read_bytes(sb.dir_table, (dir_end - sb.dir_table) as usize)?;
        let dirs = MetaTable::rebuild(&raw_dirs, sb.compressor)?;
        Ok(Tables { inodes, dirs })
    }

    fn inode_by_number(&self, tables: &Tables, number: u32) -> Result<Inode> {
        let at = metadata::find_inode(
            tables.inodes.decoded(),
            number,
            self.sb.inode_count,
            self.sb.block_size,
        )?;
        Inode::read(&mut &tables.inodes.decoded()[at..], self.sb.block_size)
    }

    /// Walk `path` from the root inode, matching each component byte-wise
    /// against directory entries.
    fn resolve(&self, tables: &Tables, path: &str) -> Result<Inode> {
        let mut inode = self.inode_by_number(tables, self.sb.root_inode_number())?;
        for component in path::components(path) {
            let (start_block, offset, listing_size) =
                inode.dir_ref().ok_or(SqfsError::NotADirectory)?;
            if listing_size <= dir::EMPTY_DIR_SIZE {
                return Err(SqfsError::EmptyDirectory);
            }
            let listing_at = dir::listing_offset(&tables.dirs, start_block, offset)?;
            let mut cursor = DirCursor::new(listing_at, listing_size);
            let mut next = None;
            while let Some(entry) = dir::next_entry(tables.dirs.decoded(), &mut cursor)? {
                if entry.name == component.as_bytes() {
                    next = Some(entry.inode_number);
                    break;
                }
            }
            let number = next.ok_or(SqfsError::NotFound)?;
            inode = self.inode_by_number(tables, number)?;
        }
        Ok(inode)
    }
}

/// A named entry yielded by `readdir`, in on-disk order.
#[derive(Debug, Clone)]
pub struct DirEntry {
    name: Vec<u8>,
    kind: EntryKind,
    inode_number: u32,
    size: u64,
}

impl DirEntry {
    /// Entry name as stored; the format permits arbitrary bytes.
    pub fn name_bytes(&self) -> &[u8] {
        &self.name
    }

    /// Entry name for display, with invalid UTF-8 replaced.
    pub fn file_name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn inode_number(&self) -> u32 {
        self.inode_number
    }

    /// Decompressed size for regular files, 0 for everything else.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// An open directory handle: owns the materialized tables and walks the
/// listing one entry per `readdir` call.
#[derive(Debug)]
pub struct DirStream {
    tables: Tables,
    cursor: DirCursor,
    inode_count: u32,
    block_size: u32,
}

impl DirStream {
    /// Yield the next entry, or `None` once the listing is exhausted.
    pub fn readdir(&mut self) -> Result<Option<DirEntry>> {
        let raw = match dir::next_entry(self.tables.dirs.decoded(), &mut self.cursor)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let kind = dir::entry_kind(raw.type_tag);
        let size = if kind == EntryKind::File {
            let at = metadata::find_inode(
                self.tables.inodes.decoded(),
                raw.inode_number,
                self.inode_count,
                self.block_size,
            )?;
            let inode = Inode::read(&mut &self.tables.inodes.decoded()[at..], self.block_size)?;
            inode.data_size()
        } else {
            0
        };
        Ok(Some(DirEntry {
            name: raw.name.to_vec(),
            kind,
            inode_number: raw.inode_number,
            size,
        }))
    }

    /// Release the handle and its table buffers.
    pub fn closedir(self) {}
}

impl Iterator for DirStream {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.readdir().transpose()
    }
}
