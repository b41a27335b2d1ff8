use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use dupvol_core::config::RawOptions;
use dupvol_core::container::{PackedReader, PackedWriter, VolumeContainer};
use dupvol_core::fileset_volume::{CONTROL_FILES_FOLDER, FILELIST};
use dupvol_core::index_volume::{INDEX_BLOCKLIST_FOLDER, INDEX_VOLUME_FOLDER};
use dupvol_core::{
    filename, manifest, BlockVolumeReader, FilesetVolumeReader, IndexVolumeReader,
    IndexVolumeWriter, VolumeOptions, VolumeType,
};

#[derive(Parser)]
#[command(name = "dupvol", version, about = "Inspect, verify and repack backup volumes")]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args)]
struct GlobalOpts {
    /// JSON file with volume options (kebab-case keys)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    blocksize: Option<String>,
    #[arg(long, global = true)]
    block_hash: Option<String>,
    #[arg(long, global = true)]
    file_hash: Option<String>,
    /// Open volumes without checking their manifest
    #[arg(long, global = true, default_value_t = false)]
    no_manifest_check: bool,
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show what a volume's filename and manifest say about it
    Inspect { volume: PathBuf },
    /// Check a volume's manifest against the configured options
    Verify { volume: PathBuf },
    /// List the entries and control files of a fileset volume
    ListFiles { dlist: PathBuf },
    /// List the blocks of a block volume, or the indexed volumes of an index volume
    ListBlocks { volume: PathBuf },
    /// Rewrite an index volume with one block volume renamed
    RenameIndex {
        dindex: PathBuf,
        out: PathBuf,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);
    let g = &cli.global;
    match &cli.cmd {
        Cmd::Inspect { volume } => inspect(g, volume)?,
        Cmd::Verify { volume } => verify(g, volume)?,
        Cmd::ListFiles { dlist } => list_files(g, dlist)?,
        Cmd::ListBlocks { volume } => list_blocks(g, volume)?,
        Cmd::RenameIndex { dindex, out, from, to } => rename_index(g, dindex, out, from, to)?,
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Options from `--config`, overridden by flags.
fn raw_options(g: &GlobalOpts) -> Result<RawOptions> {
    let base = match &g.config {
        Some(p) => RawOptions::from_json_file(p)
            .with_context(|| format!("load config {}", p.display()))?,
        None => RawOptions::default(),
    };
    let flags = RawOptions {
        blocksize: g.blocksize.clone(),
        block_hash_algorithm: g.block_hash.clone(),
        file_hash_algorithm: g.file_hash.clone(),
        dont_read_manifests: g.no_manifest_check.then_some(true),
        ..Default::default()
    };
    Ok(base.overlay(flags))
}

/// Resolve options for reading `container`, filling anything unset from its manifest.
fn harvested_options(g: &GlobalOpts, container: &PackedReader) -> Result<VolumeOptions> {
    let mut raw = raw_options(g)?;
    if let Err(e) = manifest::harvest(container, &mut raw) {
        if raw.dont_read_manifests != Some(true) {
            return Err(e).context("read manifest");
        }
        warn!(error = %e, "no usable manifest; using configured options");
    }
    Ok(raw.resolve()?)
}

fn open(path: &Path) -> Result<PackedReader> {
    PackedReader::open(path).with_context(|| format!("open volume {}", path.display()))
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Volume type from the filename, or from the entries when the name is not a volume name.
fn volume_type(path: &Path, container: &PackedReader) -> Result<VolumeType> {
    if let Some(id) = filename::parse(&file_name(path)) {
        return Ok(id.file_type);
    }
    let names = container.list_files(None)?;
    let t = if names.iter().any(|n| n == FILELIST) {
        VolumeType::Files
    } else if names
        .iter()
        .any(|n| n.starts_with(INDEX_VOLUME_FOLDER) || n.starts_with(INDEX_BLOCKLIST_FOLDER))
    {
        VolumeType::Index
    } else {
        VolumeType::Blocks
    };
    debug!(path = %path.display(), kind = %t, "volume type guessed from contents");
    Ok(t)
}

fn inspect(g: &GlobalOpts, path: &Path) -> Result<()> {
    let container = open(path)?;
    let name = file_name(path);
    println!("file: {name}");
    match filename::parse(&name) {
        Some(id) => {
            println!("type: {}", id.file_type);
            println!("prefix: {}", id.prefix);
            if let Some(guid) = &id.guid {
                println!("guid: {guid}");
            }
            if let Some(ts) = &id.timestamp {
                println!("timestamp: {}", ts.to_rfc3339());
            }
            println!("compression: {}", id.compression_module);
            if let Some(enc) = &id.encryption_module {
                println!("encryption: {enc}");
            }
        }
        None => println!("type: {} (not a volume filename)", volume_type(path, &container)?),
    }
    match manifest::read(&container) {
        Ok(m) => println!("manifest: {}", serde_json::to_string(&m)?),
        Err(e) if g.no_manifest_check => println!("manifest: unreadable ({e})"),
        Err(e) => return Err(e).context("read manifest"),
    }
    let entries = container.list_files_with_size(None)?;
    let plain: u64 = entries.iter().map(|(_, s)| s).sum();
    println!("entries: {} ({} bytes, {} on disk)", entries.len(), plain, container.size());
    Ok(())
}

fn verify(g: &GlobalOpts, path: &Path) -> Result<()> {
    let container = open(path)?;
    let options = raw_options(g)?.resolve()?;
    if options.dont_read_manifests {
        bail!("--no-manifest-check leaves nothing to verify");
    }
    manifest::verify(&container, options.blocksize, options.block_hash, options.file_hash)
        .with_context(|| format!("verify {}", path.display()))?;
    println!("OK {}", file_name(path));
    Ok(())
}

fn list_files(g: &GlobalOpts, path: &Path) -> Result<()> {
    let container = open(path)?;
    let options = harvested_options(g, &container)?;
    let reader = FilesetVolumeReader::open(container, &options)?;
    for entry in reader.files()? {
        let e = entry.with_context(|| format!("read {FILELIST} in {}", path.display()))?;
        match &e.content {
            Some(c) => println!("{} {} {}", e.entry_type, e.path, c.size),
            None => println!("{} {} -", e.entry_type, e.path),
        }
    }
    for cf in reader.control_files()? {
        let (name, _) = cf?;
        println!("{CONTROL_FILES_FOLDER}{name}");
    }
    if !reader.is_full_backup() {
        println!("partial backup");
    }
    Ok(())
}

fn list_blocks(g: &GlobalOpts, path: &Path) -> Result<()> {
    let container = open(path)?;
    let kind = volume_type(path, &container)?;
    let options = harvested_options(g, &container)?;
    match kind {
        VolumeType::Blocks => {
            let reader = BlockVolumeReader::open(container, &options)?;
            for (hash, size) in reader.blocks()? {
                println!("{hash} {size}");
            }
        }
        VolumeType::Index => {
            let reader = IndexVolumeReader::open(container, &options)?;
            for mut vol in reader.volumes()? {
                println!("volume {}", vol.filename());
                for block in vol.blocks()? {
                    let (hash, size) = block?;
                    println!("  {hash} {size}");
                }
                let hash = vol.volume_hash()?.to_string();
                println!("  volumehash {hash} volumesize {}", vol.volume_size()?);
            }
            for list in reader.block_lists()? {
                let n = list.hashes()?.collect::<dupvol_core::Result<Vec<_>>>()?.len();
                println!("blocklist {} {} {n}", list.hash(), list.length());
            }
        }
        VolumeType::Files => bail!("{} is a fileset volume; use list-files", path.display()),
    }
    Ok(())
}

fn rename_index(g: &GlobalOpts, src: &Path, out: &Path, from: &str, to: &str) -> Result<()> {
    if filename::parse(to).is_none() {
        bail!("{to:?} is not a volume filename");
    }
    let container = open(src)?;
    let options = harvested_options(g, &container)?;
    let reader = IndexVolumeReader::open(container, &options)?;
    let sink = PackedWriter::create(out).with_context(|| format!("create {}", out.display()))?;
    let mut writer = IndexVolumeWriter::create(sink, options)?;
    let mut renamed = 0usize;
    writer.copy_from(&reader, |name| {
        if name == from {
            renamed += 1;
            to.to_string()
        } else {
            name.to_string()
        }
    })?;
    if renamed == 0 {
        warn!(from, "no indexed volume had that name; copied unchanged");
    }
    let volumes = writer.volumes();
    writer.close().with_context(|| format!("finish {}", out.display()))?;
    println!("wrote {} ({} volumes, {} renamed)", out.display(), volumes, renamed);
    Ok(())
}
