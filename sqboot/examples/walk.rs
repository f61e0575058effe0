/// List a SquashFS subtree starting at a specified path
use std::env;

use sqboot::squashfs::{EntryKind, FileDevice, Partition, SquashFs};

fn main() -> anyhow::Result<()> {
    let image = env::args().nth(1).expect("usage: walk <image> [path]");
    let top = env::args().nth(2).unwrap_or_else(|| "/".to_string());

    let dev = FileDevice::open(&image)?;
    let mut sqfs = SquashFs::probe(dev, Partition::default())?;

    let mut pending = vec![top.trim_end_matches('/').to_string()];
    while let Some(dir_path) = pending.pop() {
        let mut dir = sqfs.opendir(&dir_path)?;
        while let Some(entry) = dir.readdir()? {
            let full = format!("{}/{}", dir_path, entry.file_name());
            println!("{full}");
            if entry.kind() == EntryKind::Dir {
                pending.push(full);
            }
        }
        dir.closedir();
    }
    Ok(())
}
