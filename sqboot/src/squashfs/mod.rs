mod compressor;
mod device;
mod dir;
mod error;
mod filedata;
mod fragment;
mod metadata;
mod path;
mod squashfs;
mod superblock;

pub use compressor::{decompress, Compressor};
pub use device::{sector_span, BlockDevice, FileDevice, MemDevice, Partition, SectorSpan};
pub use dir::EntryKind;
pub use error::{DecompressError, Result, SqfsError};
pub use metadata::{
    BasicDirInfo, BasicFileInfo, DevInfo, ExtDevInfo, ExtDirInfo, ExtFileInfo, ExtIpcInfo, Inode,
    InodeExtendedInfo, InodeType, IpcInfo, SymlinkInfo,
};
pub use squashfs::{DirEntry, DirStream, SquashFs};
pub use superblock::{Superblock, SuperblockFlags, MAGIC};
