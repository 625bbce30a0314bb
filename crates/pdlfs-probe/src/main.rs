//! pdlfs-probe binary.
//!
//! Exercises the preload routing layer from the command line.
//!
//! Usage:
//!   # Where would these paths go?
//!   pdlfs-probe route /tmp/pdlfs/a /tmp/b data/c
//!
//!   # Open, stat and close through the preload layer
//!   pdlfs-probe --root /mnt/pdlfs stat /mnt/pdlfs/file
//!
//!   # Raw and buffered I/O on both backends
//!   pdlfs-probe -vv smoke --scratch /tmp/probe

use std::io::SeekFrom;
use std::path::PathBuf;

use anyhow::{Context, Result, bail, ensure};
use clap::{Parser, Subcommand};
use pdlfs_preload::{Errno, OpenFlags, Preload, PreloadConfig, logging};
use tracing::info;

/// Inspect and smoke-test pdlfs-preload routing.
#[derive(Parser, Debug)]
#[command(name = "pdlfs-probe")]
#[command(about = "Inspect and smoke-test pdlfs-preload routing")]
struct Args {
    /// Root prefix redirected to PDLFS (default: $PDLFS_ROOT or /tmp/pdlfs)
    #[arg(long)]
    root: Option<String>,

    /// Increase diagnostic output (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show which backend each path routes to
    Route {
        /// Paths to classify
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Print descriptor metadata as JSON
    Stat {
        /// File or directory to stat
        path: String,
    },

    /// Run low-level and buffered I/O against both backends
    Smoke {
        /// Directory for native-side files
        #[arg(long)]
        scratch: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.root {
        Some(root) => PreloadConfig::new(root.clone()),
        None => PreloadConfig::from_env(),
    };
    let config = PreloadConfig {
        verbosity: config.verbosity.max(args.verbose),
        ..config
    };
    logging::init(config.verbosity);

    let preload = Preload::new(&config).context("invalid configuration")?;
    info!(root = preload.root(), "preload ready");

    match args.command {
        Command::Route { paths } => route(&preload, &paths),
        Command::Stat { path } => stat(&preload, &path),
        Command::Smoke { scratch } => {
            let scratch = scratch.unwrap_or_else(|| std::env::temp_dir().join("pdlfs-probe"));
            smoke(&preload, &scratch)
        }
    }
}

fn route(preload: &Preload, paths: &[String]) -> Result<()> {
    for path in paths {
        let route = preload
            .route(path)
            .with_context(|| format!("cannot route {path:?}"))?;
        println!("{path} -> {} {}", route.backend, route.path);
    }
    Ok(())
}

fn stat(preload: &Preload, path: &str) -> Result<()> {
    let route = preload.route(path)?;
    let fd = preload
        .open(path, OpenFlags::read(), 0)
        .with_context(|| format!("open {path}"))?;
    let stat = preload.fstat(fd);
    preload.close(fd)?;
    let stat = stat.with_context(|| format!("fstat {path}"))?;

    let out = serde_json::json!({
        "path": path,
        "backend": route.backend,
        "backend_path": route.path,
        "stat": stat,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn smoke(preload: &Preload, scratch: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(scratch)
        .with_context(|| format!("create scratch dir {}", scratch.display()))?;
    let scratch = scratch.to_string_lossy();
    let root = preload.root();

    // Make sure the PDLFS side has somewhere to put things.
    match preload.mkdir(root, 0o777) {
        Err(e) if e.errno() != Errno::EXIST => return Err(e).context("mkdir root"),
        _ => {}
    }

    // Interleave both backends while keeping descriptors open, so native
    // descriptor numbers run into PDLFS ones.
    for round in 0..2 {
        let mut paths = vec![format!("{root}/1"), format!("{root}/2")];
        let native_count = if round == 0 { 2 } else { 12 };
        paths.extend((1..=native_count).map(|i| format!("{scratch}/{i}")));

        for path in &paths {
            low_level_io(preload, path, false)?;
        }
        low_level_io(preload, &format!("{scratch}/lalala"), true)?;
        low_level_io(preload, &format!("{root}/lalala"), true)?;

        info!(round, open = preload.open_fds(), "closing all");
        preload.shutdown().context("close all")?;
    }

    buffered_io(preload, &format!("{scratch}/lalala"))?;
    buffered_io(preload, &format!("{root}/lalala"))?;

    println!("smoke: ok");
    Ok(())
}

fn low_level_io(preload: &Preload, path: &str, close: bool) -> Result<()> {
    let fd = preload
        .open(path, OpenFlags::create_truncate(), 0o666)
        .with_context(|| format!("open {path}"))?;
    info!(path, fd, "created");

    let written = preload.pwrite(fd, b"xxx", 0)?;
    ensure!(written == 3, "{path}: short write ({written})");
    let mut buf = [0u8; 3];
    let read = preload.pread(fd, &mut buf, 0)?;
    ensure!(read == 3 && &buf == b"xxx", "{path}: read back {:?}", &buf[..read]);

    if close {
        preload.close(fd).with_context(|| format!("close {path}"))?;
    }
    Ok(())
}

fn buffered_io(preload: &Preload, path: &str) -> Result<()> {
    let stream = preload
        .fopen(path, "w+")
        .with_context(|| format!("fopen {path}"))?;
    info!(path, %stream, "opened");

    ensure!(preload.fwrite(stream, b"xxx")? == 3, "{path}: short fwrite");
    preload.fseek(stream, SeekFrom::Start(0))?;
    ensure!(preload.ftell(stream)? == 0, "{path}: rewind failed");

    let mut buf = [0u8; 3];
    let read = preload.fread(stream, &mut buf)?;
    if read != 3 || &buf != b"xxx" {
        bail!("{path}: read back {:?}", &buf[..read]);
    }
    preload.fflush(stream)?;
    preload.fclose(stream).with_context(|| format!("fclose {path}"))?;
    Ok(())
}
