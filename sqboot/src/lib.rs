//! Sqboot is a read-only SquashFS driver for block-addressable devices, the
//! kind of storage a bootloader or small runtime sees: a sector size and a
//! synchronous read primitive. It parses the superblock, rebuilds the inode
//! and directory metadata streams, resolves paths, and assembles file
//! contents from data blocks plus an optional trailing fragment.
//!
//! # Usage Example
//! ```rust,no_run
//! use sqboot::squashfs::{FileDevice, Partition, Result, SquashFs};
//!
//! fn print_rootfs_listing() -> Result<()> {
//!     // Probe the device for a SquashFS image
//!     let dev = FileDevice::open("rootfs.squashfs")?;
//!     let mut sqfs = SquashFs::probe(dev, Partition::default())?;
//!
//!     // List the contents of a directory
//!     let mut dir = sqfs.opendir("/etc")?;
//!     while let Some(entry) = dir.readdir()? {
//!         println!("{}", entry.file_name());
//!     }
//!     dir.closedir();
//!
//!     // Read a file's contents
//!     let size = sqfs.size("/etc/group")? as usize;
//!     let mut buf = vec![0u8; size];
//!     sqfs.read("/etc/group", &mut buf, 0, 0)?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//! Zlib images are always supported; other codecs are feature-gated:
//! - **xz** - XZ compression via lzma-rs (default)
//! - **zstd** - ZSTD compression via ruzstd (default)
//!
//! The driver is single-threaded and synchronous throughout: every call
//! blocks on the block device and returns after all side effects complete.
//! Hosts that want concurrent readers mount independent instances.

pub mod squashfs;
