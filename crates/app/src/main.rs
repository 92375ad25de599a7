use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use soundstage_core::{
    AppConfig, JsonPresetCatalog, Player, PlayerCommand, PlayerHandle, PlayerSnapshot,
    PresetCatalog, TrackSource,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> soundstage_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Play {
            files,
            shuffle,
            random_presets,
            preset,
            seconds,
        } => run_play(&config, files, shuffle, random_presets, preset, seconds).await,
        Commands::Live { device, seconds } => run_live(&config, device, seconds).await,
        Commands::Devices => run_devices(&config).await,
        Commands::Presets => run_presets(&config),
    }
}

async fn run_play(
    config: &AppConfig,
    files: Vec<PathBuf>,
    shuffle: bool,
    random_presets: bool,
    preset: Option<String>,
    seconds: Option<u64>,
) -> soundstage_core::Result<()> {
    tracing::info!(files = files.len(), shuffle, random_presets, "starting playback");

    let (player, handle, _rig) = Player::headless(config)?;
    let task = tokio::spawn(player.run());

    handle.send(PlayerCommand::LoadPlaylist(
        files.iter().map(|path| TrackSource::from_path(path)).collect(),
    ))?;
    if shuffle {
        handle.send(PlayerCommand::ToggleShuffle)?;
    }
    if let Some(name) = preset {
        handle.send(PlayerCommand::SelectPreset(name))?;
    }
    if random_presets {
        handle.send(PlayerCommand::SetAutoRotation(true))?;
    }

    watch_until_done(&handle, seconds).await;

    handle.send(PlayerCommand::Shutdown)?;
    if let Err(err) = task.await {
        tracing::error!(%err, "player task failed");
    }
    Ok(())
}

async fn run_live(
    config: &AppConfig,
    device: Option<String>,
    seconds: Option<u64>,
) -> soundstage_core::Result<()> {
    let device = device.or_else(|| config.input.default_device.clone());
    tracing::info!(?device, "starting live mode");

    let (player, handle, _rig) = Player::headless(config)?;
    let task = tokio::spawn(player.run());

    handle.send(PlayerCommand::SelectDevice(device))?;
    watch_until_done(&handle, seconds).await;

    handle.send(PlayerCommand::Shutdown)?;
    if let Err(err) = task.await {
        tracing::error!(%err, "player task failed");
    }
    Ok(())
}

async fn run_devices(config: &AppConfig) -> soundstage_core::Result<()> {
    let (player, handle, _rig) = Player::headless(config)?;
    let task = tokio::spawn(player.run());

    for device in handle.list_devices().await? {
        println!("{}\t{}", device.device_id, device.display_label());
    }

    handle.send(PlayerCommand::Shutdown)?;
    if let Err(err) = task.await {
        tracing::error!(%err, "player task failed");
    }
    Ok(())
}

fn run_presets(config: &AppConfig) -> soundstage_core::Result<()> {
    let catalog = match &config.presets.catalog {
        Some(path) => JsonPresetCatalog::from_path(path)?,
        None => JsonPresetCatalog::builtin(),
    };
    for (index, name) in catalog.names().iter().enumerate() {
        let marker = if config.presets.deny_list.contains(name) {
            " (not auto-rotated)"
        } else {
            ""
        };
        println!("{index:>3}  {name}{marker}");
    }
    Ok(())
}

/// Logs every snapshot change until the time limit or Ctrl-C.
async fn watch_until_done(handle: &PlayerHandle, seconds: Option<u64>) {
    let mut snapshots = handle.subscribe();
    let limit = async {
        match seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(limit);

    loop {
        tokio::select! {
            _ = &mut limit => break,
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::warn!(%err, "could not listen for ctrl-c");
                }
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                report(&snapshots);
            }
        }
    }
}

fn report(snapshots: &watch::Receiver<PlayerSnapshot>) {
    let snapshot = snapshots.borrow();
    tracing::info!(
        track = snapshot.current_track().unwrap_or("-"),
        playing = snapshot.is_playing,
        shuffle = snapshot.shuffle,
        input = snapshot.input_device.as_deref().unwrap_or("-"),
        preset = snapshot.preset.as_deref().unwrap_or("-"),
        auto_rotation = snapshot.auto_rotation,
        "player state"
    );
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio player with a live music visualiser", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a list of files through the visualiser.
    Play {
        /// Files in playback order.
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Start with shuffle enabled.
        #[arg(long)]
        shuffle: bool,
        /// Rotate presets on a timer.
        #[arg(long)]
        random_presets: bool,
        /// Preset to switch to after startup.
        #[arg(short, long)]
        preset: Option<String>,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Visualise a live capture device.
    Live {
        /// Capture device id; the configured or backend default otherwise.
        #[arg(short, long)]
        device: Option<String>,
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// List capture devices.
    Devices,
    /// List the preset catalog.
    Presets,
}
