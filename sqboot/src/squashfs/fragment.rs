use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use super::compressor;
use super::device::{BlockDevice, DeviceIo};
use super::error::{Result, SqfsError};
use super::metadata::{self, read_u64_at, METADATA_BLOCK_SIZE};
use super::superblock::Superblock;

/// Fragment index value marking an unfragmented file.
pub(crate) const FRAG_NONE: u32 = u32::MAX;

/// 16-byte fragment entries, 512 to a metadata block.
pub(crate) const ENTRY_SIZE: usize = 16;
pub(crate) const ENTRIES_PER_BLOCK: u32 = (METADATA_BLOCK_SIZE / ENTRY_SIZE) as u32;

/// One fragment-block entry: where the shared fragment block lives and how
/// it is stored. Bit 24 of `size` marks the block uncompressed, the low 24
/// bits carry the on-disk length.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FragmentEntry {
    pub start: u64,
    pub size: u32,
}

impl FragmentEntry {
    pub(crate) fn on_disk_len(&self) -> usize {
        (self.size & 0x00FF_FFFF) as usize
    }

    pub(crate) fn is_compressed(&self) -> bool {
        self.size & (1 << 24) == 0
    }
}

/// Decode the fragment entry in slot `slot` of a decoded metadata block.
pub(crate) fn decode_entry(block: &[u8], slot: usize) -> Result<FragmentEntry> {
    let at = slot * ENTRY_SIZE;
    if at + ENTRY_SIZE > block.len() {
        return Err(SqfsError::CorruptImage("fragment entry outside its metadata block"));
    }
    Ok(FragmentEntry {
        start: LittleEndian::read_u64(&block[at..]),
        size: LittleEndian::read_u32(&block[at + 8..]),
    })
}

/// Look up the fragment-block entry for `index`. The fragment index table is
/// `ceil(frag_count / 512)` 64-bit image offsets starting exactly at
/// `frag_table`, one per metadata block of packed entries; the entry itself
/// sits at slot `index % 512` of the decoded block.
pub(crate) fn lookup<D: BlockDevice>(
    io: &mut DeviceIo<D>,
    sb: &Superblock,
    index: u32,
) -> Result<FragmentEntry> {
    if index >= sb.frag_count {
        return Err(SqfsError::CorruptImage("fragment index out of range"));
    }

    let index_entries = sb.frag_count.div_ceil(ENTRIES_PER_BLOCK) as usize;
    let index_table = io.read_bytes(sb.frag_table, index_entries * 8)?;
    let block = (index / ENTRIES_PER_BLOCK) as usize;
    let slot = (index % ENTRIES_PER_BLOCK) as usize;
    let md_start = read_u64_at(&index_table, block * 8)?;

    // Single-block metadata read: 2-byte header, then the payload.
    let raw_header = io.read_bytes(md_start, metadata::HEADER_SIZE)?;
    let header = metadata::parse_block_header(LittleEndian::read_u16(&raw_header))?;
    let payload = io.read_bytes(md_start + metadata::HEADER_SIZE as u64, header.on_disk_len)?;

    let entry = if header.compressed {
        let mut decoded = vec![0u8; METADATA_BLOCK_SIZE];
        let n = compressor::decompress(sb.compressor, &payload, &mut decoded)
            .map_err(|e| match e {
                SqfsError::UnsupportedCodec(_) => e,
                _ => SqfsError::CorruptImage("fragment metadata block failed to decompress"),
            })?;
        decode_entry(&decoded[..n], slot)?
    } else {
        decode_entry(&payload, slot)?
    };

    trace!(
        "fragment {index}: block at {:#x}, {} bytes on disk, compressed: {}",
        entry.start,
        entry.on_disk_len(),
        entry.is_compressed()
    );
    Ok(entry)
}
