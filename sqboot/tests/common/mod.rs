//! Deterministic SquashFS image builder for the integration tests. Emits the
//! same layout mksquashfs does for small trees: superblock, data blocks plus
//! a shared fragment block, inode table, directory table, fragment entry
//! block + index, id table.

use std::collections::BTreeMap;
use std::io::Read;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::read::ZlibEncoder;
use flate2::Compression;

const MAGIC: u32 = 0x7371_7368;
const META_SIZE: usize = 8192;
const MTIME: u32 = 0x6655_0000;

enum Node {
    Dir(BTreeMap<String, Node>),
    File {
        content: Vec<u8>,
        tail_as_frag: bool,
        extended: bool,
    },
    Symlink(Vec<u8>),
}

pub struct ImageBuilder {
    block_size: u32,
    root: BTreeMap<String, Node>,
    compress_metadata: bool,
    extended_dirs: bool,
    magic: u32,
}

impl ImageBuilder {
    pub fn new(block_size: u32) -> Self {
        assert!(block_size.is_power_of_two() && block_size >= 4096);
        Self {
            block_size,
            root: BTreeMap::new(),
            compress_metadata: true,
            extended_dirs: false,
            magic: MAGIC,
        }
    }

    /// Regular file; a sub-block tail goes to the shared fragment block.
    pub fn file(&mut self, path: &str, content: &[u8]) -> &mut Self {
        self.insert(
            path,
            Node::File {
                content: content.to_vec(),
                tail_as_frag: true,
                extended: false,
            },
        );
        self
    }

    /// Regular file whose tail is stored as a short data block instead of a
    /// fragment (mksquashfs -no-fragments).
    pub fn file_no_frag(&mut self, path: &str, content: &[u8]) -> &mut Self {
        self.insert(
            path,
            Node::File {
                content: content.to_vec(),
                tail_as_frag: false,
                extended: false,
            },
        );
        self
    }

    /// Regular file encoded as an extended (64-bit) inode.
    pub fn file_extended(&mut self, path: &str, content: &[u8]) -> &mut Self {
        self.insert(
            path,
            Node::File {
                content: content.to_vec(),
                tail_as_frag: true,
                extended: true,
            },
        );
        self
    }

    pub fn symlink(&mut self, path: &str, target: &[u8]) -> &mut Self {
        self.insert(path, Node::Symlink(target.to_vec()));
        self
    }

    /// Ensure a (possibly empty) directory exists at `path`.
    pub fn dir(&mut self, path: &str) -> &mut Self {
        let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut cur = &mut self.root;
        for comp in comps {
            cur = match cur
                .entry(comp.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()))
            {
                Node::Dir(children) => children,
                _ => panic!("path component {comp:?} is not a directory"),
            };
        }
        self
    }

    /// Store every metadata block uncompressed.
    pub fn uncompressed_metadata(&mut self) -> &mut Self {
        self.compress_metadata = false;
        self
    }

    /// Encode every directory as an extended directory inode.
    pub fn extended_dirs(&mut self) -> &mut Self {
        self.extended_dirs = true;
        self
    }

    /// Corrupt the superblock magic.
    pub fn bad_magic(&mut self) -> &mut Self {
        self.magic = 0x0BAD_0BAD;
        self
    }

    fn insert(&mut self, path: &str, node: Node) {
        let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let (last, dirs) = comps.split_last().expect("path must name an entry");
        let mut cur = &mut self.root;
        for comp in dirs {
            cur = match cur
                .entry(comp.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()))
            {
                Node::Dir(children) => children,
                _ => panic!("path component {comp:?} is not a directory"),
            };
        }
        cur.insert(last.to_string(), node);
    }

    pub fn build(&self) -> Vec<u8> {
        let bs = self.block_size as usize;

        // Inode numbering: children before parents, root last.
        let mut inodes = Vec::new();
        let root_number = flatten(&self.root, &mut inodes);
        let count = inodes.len();
        assert_eq!(root_number as usize, count);

        // Data region: per-file blocks, then one shared fragment block.
        let data_base = 96u64;
        let mut data = Vec::new();
        let mut frag_buf = Vec::new();
        let mut file_data: BTreeMap<u32, FileData> = BTreeMap::new();
        for (i, spec) in inodes.iter().enumerate() {
            let number = (i + 1) as u32;
            let Spec::File {
                content,
                tail_as_frag,
                ..
            } = spec
            else {
                continue;
            };
            let (block_bytes, tail) = if *tail_as_frag {
                let full = content.len() / bs * bs;
                (&content[..full], &content[full..])
            } else {
                (&content[..], &[][..])
            };
            let blocks_start = data_base + data.len() as u64;
            let mut words = Vec::new();
            for chunk in block_bytes.chunks(bs) {
                let packed = deflate(chunk);
                if packed.len() < chunk.len() {
                    words.push(packed.len() as u32);
                    data.extend_from_slice(&packed);
                } else {
                    words.push(0x0100_0000 | chunk.len() as u32);
                    data.extend_from_slice(chunk);
                }
            }
            let (frag_index, frag_offset) = if tail.is_empty() {
                (u32::MAX, 0)
            } else {
                let offset = frag_buf.len() as u32;
                frag_buf.extend_from_slice(tail);
                (0, offset)
            };
            file_data.insert(
                number,
                FileData {
                    blocks_start,
                    words,
                    frag_index,
                    frag_offset,
                },
            );
        }
        let frag_block = if frag_buf.is_empty() {
            None
        } else {
            assert!(frag_buf.len() <= bs, "fragment block overflows block size");
            let start = data_base + data.len() as u64;
            let packed = deflate(&frag_buf);
            let word = if packed.len() < frag_buf.len() {
                data.extend_from_slice(&packed);
                packed.len() as u32
            } else {
                data.extend_from_slice(&frag_buf);
                0x0100_0000 | frag_buf.len() as u32
            };
            Some((start, word))
        };

        // Decoded offset of every inode, needed by directory entries.
        let mut inode_pos = Vec::with_capacity(count);
        let mut offset = 0usize;
        for (i, spec) in inodes.iter().enumerate() {
            inode_pos.push(offset);
            offset += self.inode_len(spec, &file_data, (i + 1) as u32);
        }

        // Decoded directory table plus each directory's listing position.
        let mut dir_decoded = Vec::new();
        let mut dir_pos: BTreeMap<u32, DirPos> = BTreeMap::new();
        for (i, spec) in inodes.iter().enumerate() {
            let number = (i + 1) as u32;
            let Spec::Dir { entries, .. } = spec else {
                continue;
            };
            let listing_start = dir_decoded.len();
            for group in entries.chunks(256) {
                let base = group[0].1;
                dir_decoded
                    .write_u32::<LittleEndian>(group.len() as u32 - 1)
                    .unwrap();
                dir_decoded
                    .write_u32::<LittleEndian>((inode_pos[base as usize - 1] / META_SIZE * META_SIZE) as u32)
                    .unwrap();
                dir_decoded.write_u32::<LittleEndian>(base).unwrap();
                for (name, child, tag) in group {
                    let delta = i64::from(*child) - i64::from(base);
                    assert!(i64::from(i16::MIN) <= delta && delta <= i64::from(i16::MAX));
                    assert!(!name.is_empty() && name.len() <= 256);
                    dir_decoded
                        .write_u16::<LittleEndian>((inode_pos[*child as usize - 1] % META_SIZE) as u16)
                        .unwrap();
                    dir_decoded.write_i16::<LittleEndian>(delta as i16).unwrap();
                    dir_decoded.write_u16::<LittleEndian>(u16::from(*tag)).unwrap();
                    dir_decoded
                        .write_u16::<LittleEndian>(name.len() as u16 - 1)
                        .unwrap();
                    dir_decoded.extend_from_slice(name.as_bytes());
                }
            }
            let listing_size = 3 + (dir_decoded.len() - listing_start);
            assert!(listing_size <= usize::from(u16::MAX));
            dir_pos.insert(
                number,
                DirPos {
                    ord: listing_start / META_SIZE,
                    intra: (listing_start % META_SIZE) as u16,
                    listing_size: listing_size as u32,
                },
            );
        }
        let (dir_table, dir_chunk_offs) = encode_meta(&dir_decoded, self.compress_metadata);

        // Inode table, in number order.
        let mut inode_decoded = Vec::new();
        for (i, spec) in inodes.iter().enumerate() {
            let number = (i + 1) as u32;
            assert_eq!(inode_decoded.len(), inode_pos[i]);
            self.encode_inode(
                &mut inode_decoded,
                spec,
                number,
                root_number,
                &file_data,
                &dir_pos,
                &dir_chunk_offs,
            );
        }
        let (inode_table, inode_chunk_offs) = encode_meta(&inode_decoded, self.compress_metadata);

        // Fragment entry block (16 bytes per entry, single block here).
        let mut frag_md = Vec::new();
        if let Some((start, word)) = frag_block {
            let mut entry = Vec::new();
            entry.write_u64::<LittleEndian>(start).unwrap();
            entry.write_u32::<LittleEndian>(word).unwrap();
            entry.write_u32::<LittleEndian>(0).unwrap();
            let (encoded, _) = encode_meta(&entry, self.compress_metadata);
            frag_md = encoded;
        }

        // Id table: one id, stored uncompressed.
        let mut id_md = Vec::new();
        id_md.write_u16::<LittleEndian>(0x8000 | 4).unwrap();
        id_md.write_u32::<LittleEndian>(0).unwrap();

        // Section offsets.
        let inode_table_start = data_base + data.len() as u64;
        let dir_table_start = inode_table_start + inode_table.len() as u64;
        let frag_md_start = dir_table_start + dir_table.len() as u64;
        let frag_index_start = frag_md_start + frag_md.len() as u64;
        let frag_index_len = if frag_block.is_some() { 8 } else { 0 };
        let id_md_start = frag_index_start + frag_index_len;
        let id_table_start = id_md_start + id_md.len() as u64;
        let bytes_used = id_table_start + 8;

        let root_ord = inode_pos[root_number as usize - 1] / META_SIZE;
        let root_ref = (inode_chunk_offs[root_ord] << 16)
            | (inode_pos[root_number as usize - 1] % META_SIZE) as u64;

        // Superblock.
        let mut image = Vec::new();
        image.write_u32::<LittleEndian>(self.magic).unwrap();
        image.write_u32::<LittleEndian>(count as u32).unwrap();
        image.write_u32::<LittleEndian>(MTIME).unwrap();
        image.write_u32::<LittleEndian>(self.block_size).unwrap();
        image
            .write_u32::<LittleEndian>(if frag_block.is_some() { 1 } else { 0 })
            .unwrap();
        image.write_u16::<LittleEndian>(1).unwrap(); // zlib
        image
            .write_u16::<LittleEndian>(self.block_size.trailing_zeros() as u16)
            .unwrap();
        image.write_u16::<LittleEndian>(0x0200).unwrap(); // NO_XATTRS
        image.write_u16::<LittleEndian>(1).unwrap(); // id count
        image.write_u16::<LittleEndian>(4).unwrap();
        image.write_u16::<LittleEndian>(0).unwrap();
        image.write_u64::<LittleEndian>(root_ref).unwrap();
        image.write_u64::<LittleEndian>(bytes_used).unwrap();
        image.write_u64::<LittleEndian>(id_table_start).unwrap();
        image.write_u64::<LittleEndian>(u64::MAX).unwrap(); // xattr table
        image.write_u64::<LittleEndian>(inode_table_start).unwrap();
        image.write_u64::<LittleEndian>(dir_table_start).unwrap();
        image
            .write_u64::<LittleEndian>(if frag_block.is_some() {
                frag_index_start
            } else {
                u64::MAX
            })
            .unwrap();
        image.write_u64::<LittleEndian>(u64::MAX).unwrap(); // export table
        assert_eq!(image.len(), 96);

        // Body.
        image.extend_from_slice(&data);
        image.extend_from_slice(&inode_table);
        image.extend_from_slice(&dir_table);
        image.extend_from_slice(&frag_md);
        if frag_block.is_some() {
            image.write_u64::<LittleEndian>(frag_md_start).unwrap();
        }
        image.extend_from_slice(&id_md);
        image.write_u64::<LittleEndian>(id_md_start).unwrap();
        assert_eq!(image.len() as u64, bytes_used);

        image.resize(image.len().next_multiple_of(4096), 0);
        image
    }

    fn inode_len(&self, spec: &Spec, file_data: &BTreeMap<u32, FileData>, number: u32) -> usize {
        match spec {
            Spec::File { extended, .. } => {
                let words = file_data[&number].words.len();
                (if *extended { 56 } else { 32 }) + words * 4
            }
            Spec::Dir { .. } => {
                if self.extended_dirs {
                    40
                } else {
                    32
                }
            }
            Spec::Symlink(target) => 24 + target.len(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_inode(
        &self,
        out: &mut Vec<u8>,
        spec: &Spec,
        number: u32,
        root_number: u32,
        file_data: &BTreeMap<u32, FileData>,
        dir_pos: &BTreeMap<u32, DirPos>,
        dir_chunk_offs: &[u64],
    ) {
        let base = |out: &mut Vec<u8>, tag: u16, mode: u16| {
            out.write_u16::<LittleEndian>(tag).unwrap();
            out.write_u16::<LittleEndian>(mode).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u32::<LittleEndian>(MTIME).unwrap();
            out.write_u32::<LittleEndian>(number).unwrap();
        };
        match spec {
            Spec::File { content, extended, .. } => {
                let fd = &file_data[&number];
                if *extended {
                    base(out, 9, 0o644);
                    out.write_u64::<LittleEndian>(fd.blocks_start).unwrap();
                    out.write_u64::<LittleEndian>(content.len() as u64).unwrap();
                    out.write_u64::<LittleEndian>(0).unwrap(); // sparse
                    out.write_u32::<LittleEndian>(1).unwrap(); // nlink
                    out.write_u32::<LittleEndian>(fd.frag_index).unwrap();
                    out.write_u32::<LittleEndian>(fd.frag_offset).unwrap();
                    out.write_u32::<LittleEndian>(u32::MAX).unwrap(); // xattr
                } else {
                    base(out, 2, 0o644);
                    out.write_u32::<LittleEndian>(fd.blocks_start as u32).unwrap();
                    out.write_u32::<LittleEndian>(fd.frag_index).unwrap();
                    out.write_u32::<LittleEndian>(fd.frag_offset).unwrap();
                    out.write_u32::<LittleEndian>(content.len() as u32).unwrap();
                }
                for word in &fd.words {
                    out.write_u32::<LittleEndian>(*word).unwrap();
                }
            }
            Spec::Dir { entries, parent } => {
                let pos = &dir_pos[&number];
                let start_block = dir_chunk_offs.get(pos.ord).copied().unwrap_or(0) as u32;
                let parent = if number == root_number {
                    root_number + 1
                } else {
                    *parent
                };
                let nlink = entries.len() as u32 + 2;
                if self.extended_dirs {
                    base(out, 8, 0o755);
                    out.write_u32::<LittleEndian>(nlink).unwrap();
                    out.write_u32::<LittleEndian>(pos.listing_size).unwrap();
                    out.write_u32::<LittleEndian>(start_block).unwrap();
                    out.write_u32::<LittleEndian>(parent).unwrap();
                    out.write_u16::<LittleEndian>(0).unwrap(); // index count
                    out.write_u16::<LittleEndian>(pos.intra).unwrap();
                    out.write_u32::<LittleEndian>(u32::MAX).unwrap(); // xattr
                } else {
                    base(out, 1, 0o755);
                    out.write_u32::<LittleEndian>(start_block).unwrap();
                    out.write_u32::<LittleEndian>(nlink).unwrap();
                    out.write_u16::<LittleEndian>(pos.listing_size as u16).unwrap();
                    out.write_u16::<LittleEndian>(pos.intra).unwrap();
                    out.write_u32::<LittleEndian>(parent).unwrap();
                }
            }
            Spec::Symlink(target) => {
                base(out, 3, 0o777);
                out.write_u32::<LittleEndian>(1).unwrap();
                out.write_u32::<LittleEndian>(target.len() as u32).unwrap();
                out.extend_from_slice(target);
            }
        }
    }
}

enum Spec {
    File {
        content: Vec<u8>,
        tail_as_frag: bool,
        extended: bool,
    },
    Dir {
        entries: Vec<(String, u32, u8)>,
        parent: u32,
    },
    Symlink(Vec<u8>),
}

struct FileData {
    blocks_start: u64,
    words: Vec<u32>,
    frag_index: u32,
    frag_offset: u32,
}

struct DirPos {
    ord: usize,
    intra: u16,
    listing_size: u32,
}

/// Assign inode numbers depth-first with children before their parent, so
/// the root comes out last with the highest number.
fn flatten(dir: &BTreeMap<String, Node>, inodes: &mut Vec<Spec>) -> u32 {
    let mut entries = Vec::new();
    for (name, node) in dir {
        let (number, tag) = match node {
            Node::File {
                content,
                tail_as_frag,
                extended,
            } => {
                inodes.push(Spec::File {
                    content: content.clone(),
                    tail_as_frag: *tail_as_frag,
                    extended: *extended,
                });
                (inodes.len() as u32, 2u8)
            }
            Node::Symlink(target) => {
                inodes.push(Spec::Symlink(target.clone()));
                (inodes.len() as u32, 3u8)
            }
            Node::Dir(children) => (flatten(children, inodes), 1u8),
        };
        entries.push((name.clone(), number, tag));
    }
    inodes.push(Spec::Dir { entries, parent: 0 });
    let number = inodes.len() as u32;
    // Back-fill the children's parent links now that this dir has a number.
    let child_dirs: Vec<u32> = match &inodes[number as usize - 1] {
        Spec::Dir { entries, .. } => entries
            .iter()
            .filter(|(_, _, tag)| *tag == 1)
            .map(|(_, n, _)| *n)
            .collect(),
        _ => unreachable!(),
    };
    for child in child_dirs {
        if let Spec::Dir { parent, .. } = &mut inodes[child as usize - 1] {
            *parent = number;
        }
    }
    number
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    ZlibEncoder::new(data, Compression::default())
        .read_to_end(&mut out)
        .unwrap();
    out
}

/// Split a decoded metadata stream into 8 KiB blocks and encode each with
/// its 2-byte header. Returns the encoded bytes and each block's offset
/// within them.
fn encode_meta(decoded: &[u8], compress: bool) -> (Vec<u8>, Vec<u64>) {
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    for chunk in decoded.chunks(META_SIZE) {
        offsets.push(out.len() as u64);
        if compress {
            let packed = deflate(chunk);
            if packed.len() < chunk.len() {
                out.write_u16::<LittleEndian>(packed.len() as u16).unwrap();
                out.extend_from_slice(&packed);
                continue;
            }
        }
        out.write_u16::<LittleEndian>(0x8000 | chunk.len() as u16).unwrap();
        out.extend_from_slice(chunk);
    }
    (out, offsets)
}
