use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use time::macros::format_description;
use tracing::{Level, error};
use tracing_appender::non_blocking;
use tracing_subscriber::fmt::time::LocalTime;

use torrent::config::{DEFAULT_MAX_PEERS, DEFAULT_PORT};
use torrent::metadata::TorrentMetadata;
use torrent::peer::Reserved;
use torrent::{ClientConfig, PeerId};

#[derive(Parser, Debug)]
#[command(name = "torrentium", version, about = "Download files from a BitTorrent swarm")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Port reported to the tracker
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum number of simultaneous peer connections
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_PEERS)]
    max_peers: usize,

    /// Seconds to wait for a TCP connection to a peer
    #[arg(long, global = true, default_value_t = 10)]
    connect_timeout: u64,

    /// Accept pieces without checking their SHA-1
    #[arg(long, global = true)]
    no_verify: bool,

    /// Directory for the log file
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a bencoded value as JSON
    Decode { value: String },
    /// Print the contents of a torrent file
    Info { file: PathBuf },
    /// List the peers the tracker reports
    Peers { file: PathBuf },
    /// Handshake with a peer and print its id
    Handshake { file: PathBuf, peer: SocketAddr },
    #[command(name = "download_piece")]
    DownloadPiece {
        #[arg(short, long)]
        output: PathBuf,
        file: PathBuf,
        index: u32,
    },
    Download {
        #[arg(short, long)]
        output: PathBuf,
        file: PathBuf,
    },
    #[command(name = "magnet_parse")]
    MagnetParse { link: String },
    #[command(name = "magnet_handshake")]
    MagnetHandshake { link: String },
    #[command(name = "magnet_info")]
    MagnetInfo { link: String },
    #[command(name = "magnet_download_piece")]
    MagnetDownloadPiece {
        #[arg(short, long)]
        output: PathBuf,
        link: String,
        index: u32,
    },
    #[command(name = "magnet_download")]
    MagnetDownload {
        #[arg(short, long)]
        output: PathBuf,
        link: String,
    },
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            peer_id: PeerId::generate(),
            port: self.port,
            max_peers: self.max_peers.max(1),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            verify_pieces: !self.no_verify,
        }
    }
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pieces")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

async fn run(args: Args) -> torrent::Result<()> {
    let config = args.client_config();
    match args.command {
        Command::Decode { value } => {
            println!("{}", torrent::decode_value(&value)?.to_json());
        }
        Command::Info { file } => {
            print!("{}", torrent::parse_torrent(&file)?);
        }
        Command::Peers { file } => {
            let meta = torrent::parse_torrent(&file)?;
            for peer in torrent::torrent_peers(&meta, &config).await? {
                println!("{}", peer);
            }
        }
        Command::Handshake { file, peer } => {
            let meta = torrent::parse_torrent(&file)?;
            let conn = torrent::handshake(peer, meta.info_hash, Reserved::NONE, &config).await?;
            println!("Peer ID: {}", hex::encode(conn.peer_id()));
        }
        Command::DownloadPiece { output, file, index } => {
            let meta = torrent::parse_torrent(&file)?;
            let peers = torrent::torrent_peers(&meta, &config).await?;
            let piece = torrent::download_piece(&meta, index, &peers, &config).await?;
            torrent::save(&output, &piece).await?;
            println!("Piece {} downloaded to {}.", index, output.display());
        }
        Command::Download { output, file } => {
            let meta = torrent::parse_torrent(&file)?;
            let peers = torrent::torrent_peers(&meta, &config).await?;
            download_all(&meta, &peers, &config, &output).await?;
            println!("Downloaded {} to {}.", file.display(), output.display());
        }
        Command::MagnetParse { link } => {
            print!("{}", torrent::parse_magnet(&link)?);
        }
        Command::MagnetHandshake { link } => {
            let link = torrent::parse_magnet(&link)?;
            let (conn, _) = torrent::magnet_handshake(&link, &config).await?;
            println!("Peer ID: {}", hex::encode(conn.peer_id()));
            if let Some(id) = conn.metadata_extension_id() {
                println!("Peer Metadata Extension ID: {}", id);
            }
        }
        Command::MagnetInfo { link } => {
            let link = torrent::parse_magnet(&link)?;
            let (meta, _) = torrent::magnet_metadata(&link, &config).await?;
            print!("{}", meta);
        }
        Command::MagnetDownloadPiece { output, link, index } => {
            let link = torrent::parse_magnet(&link)?;
            let (meta, peers) = torrent::magnet_metadata(&link, &config).await?;
            let piece = torrent::download_piece(&meta, index, &peers, &config).await?;
            torrent::save(&output, &piece).await?;
            println!("Piece {} downloaded to {}.", index, output.display());
        }
        Command::MagnetDownload { output, link } => {
            let link = torrent::parse_magnet(&link)?;
            let (meta, peers) = torrent::magnet_metadata(&link, &config).await?;
            download_all(&meta, &peers, &config, &output).await?;
            let name = link.display_name.or(meta.name).unwrap_or_else(|| meta.info_hash.to_string());
            println!("Downloaded {} to {}.", name, output.display());
        }
    }
    Ok(())
}

async fn download_all(
    meta: &TorrentMetadata,
    peers: &[SocketAddr],
    config: &ClientConfig,
    output: &Path,
) -> torrent::Result<()> {
    let file = torrent::download_file(meta, peers, config, progress_bar()).await?;
    torrent::save(output, &file).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let file_appender = tracing_appender::rolling::never(&args.log_dir, "torrent.log");
    let (non_blocking, _guard) = non_blocking(file_appender);
    let timer = LocalTime::new(format_description!(
        "[month]/[day]/[year] [hour repr:24]:[minute]:[second].[subsecond digits:4]"
    ));
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_timer(timer)
        .with_max_level(level)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
