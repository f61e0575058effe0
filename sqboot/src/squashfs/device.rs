use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use super::error::{Result, SqfsError};

/// The single primitive the driver consumes from its environment: a
/// sector-addressable, synchronous read. Sector size is a device attribute
/// and callers size their destination buffers to whole sectors.
pub trait BlockDevice {
    fn sector_size(&self) -> u32;

    /// Read `count` sectors starting at `sector` into `dst`. `dst` must hold
    /// exactly `count * sector_size()` bytes. A device that cannot deliver
    /// all requested sectors fails the whole read.
    fn read_sectors(&mut self, sector: u64, count: usize, dst: &mut [u8]) -> Result<()>;
}

/// Partition the image lives in; `start_sector` biases every device read.
#[derive(Debug, Clone, Copy, Default)]
pub struct Partition {
    pub start_sector: u64,
}

/// Result of translating a byte range to whole sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorSpan {
    /// First sector covering the range.
    pub sector: u64,
    /// Number of sectors covering the range.
    pub count: usize,
    /// Byte offset of the range within the first sector.
    pub offset: usize,
}

/// Translate an absolute byte range into the sector span covering it. Every
/// disk read in the driver goes through this one helper.
pub fn sector_span(byte_offset: u64, byte_len: usize, sector_size: u32) -> SectorSpan {
    let size = u64::from(sector_size);
    let sector = byte_offset / size;
    let offset = (byte_offset % size) as usize;
    let count = (offset + byte_len).div_ceil(sector_size as usize);
    SectorSpan { sector, count, offset }
}

/// Owns the device handle plus the partition bias and converts byte-granular
/// requests into sector-granular reads.
#[derive(Debug)]
pub(crate) struct DeviceIo<D> {
    dev: D,
    partition: Partition,
}

impl<D: BlockDevice> DeviceIo<D> {
    pub(crate) fn new(dev: D, partition: Partition) -> Self {
        Self { dev, partition }
    }

    /// Read `len` bytes at absolute byte offset `offset` within the image,
    /// bouncing through a sector-aligned scratch buffer.
    pub(crate) fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let sector_size = self.dev.sector_size() as usize;
        let span = sector_span(offset, len, self.dev.sector_size());
        let mut scratch = vec![0u8; span.count * sector_size];
        self.dev
            .read_sectors(self.partition.start_sector + span.sector, span.count, &mut scratch)?;
        scratch.drain(..span.offset);
        scratch.truncate(len);
        Ok(scratch)
    }

    pub(crate) fn into_inner(self) -> D {
        self.dev
    }
}

/// Byte-vector backed device, mainly for tests and embedded images.
#[derive(Debug)]
pub struct MemDevice {
    data: Vec<u8>,
    sector_size: u32,
}

impl MemDevice {
    /// `data` must be a whole number of sectors long.
    pub fn new(data: Vec<u8>, sector_size: u32) -> Self {
        assert!(sector_size.is_power_of_two());
        Self { data, sector_size }
    }
}

impl BlockDevice for MemDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read_sectors(&mut self, sector: u64, count: usize, dst: &mut [u8]) -> Result<()> {
        let size = self.sector_size as usize;
        debug_assert_eq!(dst.len(), count * size);
        let start = sector as usize * size;
        let end = start + count * size;
        let src = self
            .data
            .get(start..end)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// File-backed device with a fixed 512-byte sector size, used by the CLI.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    len: u64,
}

impl FileDevice {
    pub const SECTOR_SIZE: u32 = 512;

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl BlockDevice for FileDevice {
    fn sector_size(&self) -> u32 {
        Self::SECTOR_SIZE
    }

    fn read_sectors(&mut self, sector: u64, count: usize, dst: &mut [u8]) -> Result<()> {
        let start = sector
            .checked_mul(u64::from(Self::SECTOR_SIZE))
            .ok_or(SqfsError::CorruptImage("sector index overflows device"))?;
        if start >= self.len {
            return Err(SqfsError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        self.file.seek(SeekFrom::Start(start))?;
        // Images are not always padded out to the sector size; bytes past the
        // end of the file read back as zeros.
        let available = ((self.len - start) as usize).min(dst.len());
        self.file.read_exact(&mut dst[..available])?;
        dst[available..].fill(0);
        Ok(())
    }
}
