use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use ttorrent::torrent::Torrent;
use ttorrent::{client, metainfo, server};

/// Trivial Torrent: download a file block by block, serve one, or create
/// the metainfo document describing one.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Listen on PORT and serve blocks of the metainfo's companion file
    #[arg(
        short = 'l',
        long = "listen",
        value_name = "PORT",
        conflicts_with = "create",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    listen: Option<u16>,

    /// Create FILE.ttorrent next to FILE instead of transferring anything
    #[arg(short = 'c', long = "create", value_name = "FILE")]
    create: Option<PathBuf>,

    /// Path to the *.ttorrent metainfo document
    #[arg(value_name = "METAINFO", required_unless_present = "create", conflicts_with = "create")]
    metainfo: Option<PathBuf>,
}

fn main() -> ExitCode {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    log::info!("Trivial Torrent {}", env!("CARGO_PKG_VERSION"));

    let args = Cli::parse();
    if let Err(e) = run(args) {
        log::error!("{e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(args: Cli) -> anyhow::Result<()> {
    if let Some(file) = args.create {
        let metainfo_name = metainfo::create(&file)
            .with_context(|| format!("failed to create a metainfo for {}", file.display()))?;
        log::info!("wrote {}", metainfo_name.display());
        return Ok(());
    }

    let metainfo_path = args.metainfo.context("no metainfo document given")?;
    let mut torrent = Torrent::open(&metainfo_path)
        .with_context(|| format!("failed to open torrent {}", metainfo_path.display()))?;

    match args.listen {
        Some(port) => {
            log::info!("starting server...");
            server::serve(&mut torrent, port).context("server failed")?;
        }
        None => {
            log::info!("starting client...");
            client::download(&mut torrent).context("download failed")?;
        }
    }
    Ok(())
}
