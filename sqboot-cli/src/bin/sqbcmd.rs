use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqboot::squashfs::{EntryKind, FileDevice, Partition, SquashFs};

#[derive(Parser, Debug)]
struct Cli {
    /// The SquashFS image to operate on
    image: PathBuf,

    /// The command to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List directory contents
    Ls(LsArgs),
    /// Print file contents
    Cat(CatArgs),
    /// Print decompressed file sizes
    Size(SizeArgs),
    /// Dump the decoded superblock
    Probe,
}

#[derive(Args, Debug)]
struct LsArgs {
    #[arg(default_value = "/")]
    paths: Vec<String>,
}

#[derive(Args, Debug)]
struct CatArgs {
    files: Vec<String>,
}

#[derive(Args, Debug)]
struct SizeArgs {
    files: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let dev = FileDevice::open(&cli.image)
        .with_context(|| format!("cannot open {}", cli.image.display()))?;
    let mut sqfs = SquashFs::probe(dev, Partition::default())
        .context("not a usable SquashFS image")?;

    match &cli.command {
        Command::Ls(args) => cmd_ls(&mut sqfs, args),
        Command::Cat(args) => cmd_cat(&mut sqfs, args),
        Command::Size(args) => cmd_size(&mut sqfs, args),
        Command::Probe => cmd_probe(&sqfs),
    }
}

fn cmd_ls(sqfs: &mut SquashFs<FileDevice>, args: &LsArgs) -> anyhow::Result<()> {
    let single_path = args.paths.len() == 1;
    let mut nfiles = 0;
    let mut ndirs = 0;

    for (n, path) in args.paths.iter().enumerate() {
        let mut dir = sqfs
            .opendir(path)
            .with_context(|| format!("cannot open directory '{path}'"))?;
        if !single_path {
            if n != 0 {
                println!();
            }
            println!("{path}:");
        }
        while let Some(entry) = dir.readdir()? {
            match entry.kind() {
                EntryKind::Dir => {
                    println!("            {}/", entry.file_name());
                    ndirs += 1;
                }
                EntryKind::File => {
                    println!("{:8}   {}", entry.size(), entry.file_name());
                    nfiles += 1;
                }
                EntryKind::Symlink => {
                    println!("<SYMLINK>   {}", entry.file_name());
                    nfiles += 1;
                }
                EntryKind::Misc => {
                    println!("            {}", entry.file_name());
                    nfiles += 1;
                }
            }
        }
        dir.closedir();
    }

    println!("\n{nfiles} file(s), {ndirs} dir(s)");
    Ok(())
}

fn cmd_cat(sqfs: &mut SquashFs<FileDevice>, args: &CatArgs) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    for path in &args.files {
        let size = sqfs
            .size(path)
            .with_context(|| format!("cannot stat '{path}'"))?;
        let mut buf = vec![0u8; size as usize];
        let n = sqfs
            .read(path, &mut buf, 0, 0)
            .with_context(|| format!("cannot read '{path}'"))?;
        stdout.write_all(&buf[..n])?;
    }
    Ok(())
}

fn cmd_size(sqfs: &mut SquashFs<FileDevice>, args: &SizeArgs) -> anyhow::Result<()> {
    for path in &args.files {
        let size = sqfs
            .size(path)
            .with_context(|| format!("cannot stat '{path}'"))?;
        println!("{size:8}   {path}");
    }
    Ok(())
}

fn cmd_probe(sqfs: &SquashFs<FileDevice>) -> anyhow::Result<()> {
    let sb = sqfs.superblock();
    println!("version:      {}.{}", sb.version_major, sb.version_minor);
    println!("compression:  {:?}", sb.compressor);
    println!("block size:   {} (log {})", sb.block_size, sb.block_log);
    println!("inodes:       {}", sb.inode_count);
    println!("fragments:    {}", sb.frag_count);
    println!("ids:          {}", sb.id_count);
    println!("flags:        {:?}", sb.flags);
    println!("bytes used:   {}", sb.bytes_used);
    println!("inode table:  {:#x}", sb.inode_table);
    println!("dir table:    {:#x}", sb.dir_table);
    if sb.frag_table != u64::MAX {
        println!("frag table:   {:#x}", sb.frag_table);
    }
    if sb.export_table != u64::MAX {
        println!("export table: {:#x}", sb.export_table);
    }
    println!("id table:     {:#x}", sb.id_table);
    Ok(())
}
