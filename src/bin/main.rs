use clap::{Parser, Subcommand};
use hfsplus_explorer::partition::{self, PartitionSystemType};
use hfsplus_explorer::{fs, CatalogLeafRecord, CatalogRecord, FileSystem, ForkType, MountOptions};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser, Debug)]
#[command(name = "hfsx", about = "Browse and extract files from HFS+ and HFSX disk images")]
struct Args {
    /// Cache B-tree nodes in memory
    #[arg(long, global = true)]
    node_cache: bool,

    /// Mount this partition (as numbered by `partitions`) instead of the first HFS one
    #[arg(long, global = true)]
    partition: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the partitions of a disk image
    Partitions { image: PathBuf },
    /// Print the volume header
    Info { image: PathBuf },
    /// List a folder
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        /// Descend into subfolders
        #[arg(short, long)]
        recursive: bool,
    },
    /// Copy a file's data or resource fork out of the image
    Extract {
        image: PathBuf,
        path: String,
        #[arg(short, long)]
        output: PathBuf,
        /// Extract the resource fork instead of the data fork
        #[arg(long)]
        resource: bool,
    },
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

fn describe(record: &CatalogLeafRecord) -> String {
    match &record.record {
        CatalogRecord::Folder(folder) => format!("d {:>8} {:>12} {}", folder.folder_id, folder.valence, record.name()),
        CatalogRecord::File(file) => format!(
            "- {:>8} {:>12} {}",
            file.file_id,
            file.data_fork.logical_size,
            record.name()
        ),
        CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => format!("t {}", record.name()),
    }
}

fn mount(image: &Path, options: &MountOptions) -> fs::Result<FileSystem<File>> {
    FileSystem::mount_with_options(File::open(image)?, options)
}

fn run(args: Args) -> fs::Result<()> {
    let options = MountOptions {
        node_cache: args.node_cache,
        partition_index: args.partition,
        ..MountOptions::default()
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match args.command {
        Command::Partitions { image } => {
            let mut file = File::open(image)?;
            let system = partition::detect(&mut file);
            writeln!(out, "Partition system: {}", system)?;
            if system != PartitionSystemType::None {
                for (index, entry) in partition::get_partition_system(&mut file, system)?.iter().enumerate() {
                    writeln!(out, "{:>3} {}", index, entry)?;
                }
            }
        }
        Command::Info { image } => {
            let volume = mount(&image, &options)?;
            writeln!(out, "File system: {}", volume.fs_type())?;
            writeln!(out, "Offset: {}", volume.location().offset)?;
            write!(out, "{}", volume.volume_header())?;
        }
        Command::Ls { image, path, recursive } => {
            let volume = mount(&image, &options)?;
            let folder = volume.resolve_path(&split_path(&path), None)?.into_inner();
            if recursive {
                for entry in volume.list_recursive(&folder, None)?.into_inner() {
                    writeln!(out, "{}", entry.path.join("/"))?;
                }
            } else {
                for child in volume.list_children(folder.cnid(), None)?.into_inner() {
                    writeln!(out, "{}", describe(&child))?;
                }
            }
        }
        Command::Extract {
            image,
            path,
            output,
            resource,
        } => {
            let volume = mount(&image, &options)?;
            let record = volume.resolve_path(&split_path(&path), None)?.into_inner();
            let fork_type = if resource { ForkType::Resource } else { ForkType::Data };
            let mut writer = BufWriter::new(File::create(&output)?);
            let written = volume.extract_fork(&record, fork_type, &mut writer, None)?.into_inner();
            writer.flush()?;
            writeln!(out, "Wrote {} bytes to {}", written, output.display())?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(error) = run(Args::parse()) {
        eprintln!("hfsx: {}", error);
        process::exit(1);
    }
}
