use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use podkeep::{
    DownloadError, DownloadManager, DownloadOutcome, DownloadProgress, DownloadStatus, Episode,
    HeadlessElement, MediaSession, NoopReporter, OfflineLibrary, PlayerOptions, PlayerStore,
    ProgressReporter, ReqwestClient, SharedProgressReporter, SnapshotStore,
};

// Emoji with fallback for terminals without Unicode support
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static STOPPED: Emoji<'_, '_> = Emoji("⏹️  ", "[-] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");
static ARROW: Emoji<'_, '_> = Emoji("▶ ", "> ");

/// Keep podcast episodes available offline and inspect the saved player
#[derive(Parser, Debug)]
#[command(name = "podkeep")]
#[command(about = "Keep podcast episodes available offline")]
#[command(version)]
struct Args {
    /// Library directory (defaults to the platform data directory)
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download episodes listed in a catalogue file
    Download {
        /// JSON file holding an array of episodes
        catalog: PathBuf,

        /// Episode ids to download (all when omitted)
        ids: Vec<String>,

        /// Maximum number of concurrent downloads
        #[arg(short = 'c', long, default_value = "3")]
        concurrent: usize,
    },
    /// List offline episodes
    List,
    /// Delete one offline episode
    Delete { id: String },
    /// Delete every offline episode
    Clear,
    /// Show storage usage
    Stats,
    /// Show the saved player state
    Player,
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
    titles: Mutex<HashMap<String, String>>,
}

impl IndicatifReporter {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            titles: Mutex::new(HashMap::new()),
        }
    }

    fn start(&self, episode: &Episode) {
        self.titles
            .lock()
            .insert(episode.id.clone(), episode.title.clone());
        let bar = self.get_or_create_bar(&episode.id);
        bar.set_message(truncate_title(&episode.title, 40));
    }

    fn title(&self, episode_id: &str) -> String {
        self.titles
            .lock()
            .get(episode_id)
            .cloned()
            .unwrap_or_else(|| episode_id.to_string())
    }

    fn get_or_create_bar(&self, episode_id: &str) -> ProgressBar {
        let mut bars = self.bars.lock();

        if let Some(bar) = bars.get(episode_id) {
            return bar.clone();
        }

        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bars.insert(episode_id.to_string(), bar.clone());
        bar
    }

    fn take_bar(&self, episode_id: &str) -> Option<ProgressBar> {
        self.bars.lock().remove(episode_id)
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, progress: DownloadProgress) {
        let id = progress.episode_id.as_str();

        match progress.status {
            DownloadStatus::Pending | DownloadStatus::Downloading => {
                let bar = self.get_or_create_bar(id);
                if let Some(total) = progress.total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(progress.bytes_downloaded);
            }

            DownloadStatus::Completed => {
                if let Some(bar) = self.take_bar(id) {
                    bar.set_position(progress.bytes_downloaded);
                    bar.set_message(format!(
                        "{SUCCESS}{}",
                        truncate_title(&self.title(id), 40).green()
                    ));
                    bar.finish_and_clear();
                }
            }

            DownloadStatus::Failed => {
                let bar = self.take_bar(id).unwrap_or_else(|| self.get_or_create_bar(id));
                bar.abandon_with_message(format!(
                    "{FAILURE}{} - {}",
                    truncate_title(&self.title(id), 30).red(),
                    progress.error.unwrap_or_default().red()
                ));
            }

            DownloadStatus::Cancelled => {
                if let Some(bar) = self.take_bar(id) {
                    bar.abandon_with_message(format!(
                        "{STOPPED}{}",
                        truncate_title(&self.title(id), 40).yellow()
                    ));
                }
            }
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let kept: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (hours, minutes, secs) = (total / 3600, (total / 60) % 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

fn library_root(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => dirs::data_dir()
            .map(|dir| dir.join("podkeep"))
            .context("Could not determine a data directory; pass --library"),
    }
}

fn open_library(root: &Path, quiet: bool) -> Result<Arc<OfflineLibrary>> {
    let (library, report) = OfflineLibrary::open(root)
        .with_context(|| format!("Failed to open library at {}", root.display()))?;

    if !quiet && report.repaired() > 0 {
        println!(
            "{BROOM}Repaired library: {} leftover files removed",
            report.repaired().to_string().yellow()
        );
    }
    Ok(Arc::new(library))
}

fn load_catalog(path: &Path) -> Result<Vec<Episode>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalogue {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse catalogue {}", path.display()))
}

async fn download(
    library: Arc<OfflineLibrary>,
    catalog: &Path,
    ids: &[String],
    concurrent: usize,
    quiet: bool,
) -> Result<bool> {
    let catalogue = load_catalog(catalog)?;
    let selected: Vec<Episode> = if ids.is_empty() {
        catalogue
    } else {
        for id in ids {
            if !catalogue.iter().any(|e| &e.id == id) {
                warn!(episode_id = %id, "not in catalogue");
            }
        }
        catalogue
            .into_iter()
            .filter(|e| ids.contains(&e.id))
            .collect()
    };

    let manager = DownloadManager::new(ReqwestClient::new(), library);

    let mut to_download = Vec::new();
    let mut already_offline = 0;
    for episode in selected {
        if manager.is_episode_offline(&episode.id).await {
            already_offline += 1;
        } else {
            to_download.push(episode);
        }
    }

    if !quiet {
        println!(
            "{HEADPHONES}{} to download, {} already offline",
            to_download.len().to_string().cyan(),
            already_offline.to_string().yellow()
        );
    }

    let bars = (!quiet).then(|| Arc::new(IndicatifReporter::new()));
    let reporter: SharedProgressReporter = match &bars {
        Some(bars) => bars.clone() as SharedProgressReporter,
        None => NoopReporter::shared(),
    };

    let results: Vec<(&Episode, Result<DownloadOutcome, DownloadError>)> =
        futures::stream::iter(&to_download)
            .map(|episode| {
                let manager = &manager;
                let reporter = &reporter;
                let bars = &bars;
                async move {
                    if let Some(bars) = bars {
                        bars.start(episode);
                    }
                    (episode, manager.download_episode(episode, reporter).await)
                }
            })
            .buffer_unordered(concurrent.max(1))
            .collect()
            .await;

    let downloaded = results
        .iter()
        .filter(|(_, r)| matches!(r, Ok(DownloadOutcome::Completed(_))))
        .count();
    let failures: Vec<_> = results
        .iter()
        .filter_map(|(episode, r)| r.as_ref().err().map(|e| (episode, e)))
        .collect();

    if !quiet {
        println!(
            "\n{PARTY}{} {} downloaded, {} already offline, {} failed",
            "Done:".bold().green(),
            downloaded.to_string().green().bold(),
            already_offline.to_string().yellow(),
            if failures.is_empty() {
                failures.len().to_string().green()
            } else {
                failures.len().to_string().red().bold()
            }
        );

        if !failures.is_empty() {
            println!("\n{}", "Failed episodes:".red().bold());
            for (episode, error) in &failures {
                println!(
                    "  {}{} - {}",
                    CROSS,
                    episode.title.yellow(),
                    error.to_string().dimmed()
                );
            }
        }
    }

    Ok(failures.is_empty() || downloaded > 0)
}

async fn list(library: &OfflineLibrary) -> Result<()> {
    let records = library.list().await.context("Failed to list library")?;
    if records.is_empty() {
        println!("No offline episodes");
        return Ok(());
    }

    for record in records {
        println!(
            "{} {} {}",
            record.id().cyan(),
            truncate_title(&record.episode.title, 50).bold(),
            format!(
                "({}, {})",
                format_bytes(record.file_size),
                record.downloaded_at.format("%Y-%m-%d %H:%M")
            )
            .dimmed()
        );
    }
    Ok(())
}

async fn stats(library: &OfflineLibrary) -> Result<()> {
    let stats = library.stats().await.context("Failed to read library")?;
    let quota = library.quota().await.context("Failed to read library")?;

    println!(
        "{FOLDER}{} episodes, {} used",
        stats.episode_count.to_string().cyan(),
        format_bytes(stats.total_bytes).cyan()
    );
    if quota.is_known() {
        println!(
            "   {} available of {}",
            format_bytes(quota.available).green(),
            format_bytes(quota.total)
        );
    } else {
        println!("   {}", "available space unknown".dimmed());
    }
    Ok(())
}

async fn player(library: Arc<OfflineLibrary>) -> Result<()> {
    let snapshots = SnapshotStore::new(library.snapshot_path());
    let session = MediaSession::global_or_init(|| {
        MediaSession::new(Box::new(HeadlessElement::new()), Some(library.clone()))
    });
    let store = PlayerStore::with_snapshots(session, snapshots, PlayerOptions::default());

    if !store
        .restore()
        .await
        .context("Failed to read saved player state")?
    {
        println!("No saved player state");
        return Ok(());
    }

    let state = store.state();
    match &state.current_episode {
        Some(episode) => {
            let offline = library.is_offline(&episode.id).await;
            println!(
                "{HEADPHONES}{} {}",
                episode.title.bold().green(),
                if offline { "(offline)".cyan() } else { "(stream)".dimmed() }
            );
            println!(
                "   {} / {} at {}x, volume {:.0}%",
                format_clock(state.current_time),
                format_clock(state.duration),
                state.playback_rate,
                state.volume * 100.0
            );
        }
        None => println!("Nothing loaded"),
    }

    if !state.queue.is_empty() {
        println!("\n{}", "Queue:".bold());
        for (index, episode) in state.queue.iter().enumerate() {
            let marker = if state.queue_index == Some(index) {
                ARROW.to_string()
            } else {
                "  ".to_string()
            };
            println!("  {marker}{}", truncate_title(&episode.title, 60));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let root = library_root(args.library)?;
    let library = open_library(&root, args.quiet)?;

    match args.command {
        Command::Download {
            catalog,
            ids,
            concurrent,
        } => {
            let ok = download(library, &catalog, &ids, concurrent, args.quiet).await?;
            if !args.quiet {
                println!("\n{FOLDER}Library: {}\n", root.display().to_string().cyan());
            }
            if !ok {
                std::process::exit(1);
            }
        }
        Command::List => list(&library).await?,
        Command::Delete { id } => {
            let removed = library
                .remove(&id)
                .await
                .with_context(|| format!("Failed to delete {id}"))?;
            if !args.quiet {
                if removed {
                    println!("{SUCCESS}Deleted {}", id.cyan());
                } else {
                    println!("{} is not offline", id.yellow());
                }
            }
        }
        Command::Clear => {
            let removed = library.clear().await.context("Failed to clear library")?;
            if !args.quiet {
                println!("{BROOM}Removed {} episodes", removed.to_string().cyan());
            }
        }
        Command::Stats => stats(&library).await?,
        Command::Player => player(library).await?,
    }

    Ok(())
}
