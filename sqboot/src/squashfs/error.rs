use thiserror::Error;

/// Result alias used throughout the driver.
pub type Result<T> = std::result::Result<T, SqfsError>;

/// Failure modes of a single `decompress` call, independent of which codec
/// produced them.
#[derive(Debug, Error)]
pub enum DecompressError {
    #[error("output buffer too small for decompressed data")]
    BufferTooSmall,

    #[error("corrupt compressed data: {0}")]
    CorruptData(String),

    #[error("decompressor ran out of memory")]
    OutOfMemory,
}

/// Errors surfaced by the public driver operations.
#[derive(Debug, Error)]
pub enum SqfsError {
    #[error("bad superblock magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported compression codec id {0}")]
    UnsupportedCodec(u16),

    /// Any format-consistency violation: oversized metadata header, inode
    /// walk overrunning the table, directory iterator overrunning a listing,
    /// fragment index out of range, and so on.
    #[error("corrupt image: {0}")]
    CorruptImage(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path not found")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("directory is empty")]
    EmptyDirectory,

    #[error("operation not supported for this inode type")]
    UnsupportedType,

    #[error("requested length {requested} exceeds file size {file_size}")]
    LengthExceedsFile { requested: u64, file_size: u64 },

    #[error("decompression failed: {0}")]
    Decompress(#[from] DecompressError),

    #[error("allocation failed")]
    OutOfMemory,
}
