// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};
use eyre::{Context, eyre};
use tracing_subscriber::EnvFilter;
use video_wallpaper_config::Config;

use video_wallpaper::{
    content::{self, ContentReference},
    wayland::WallpaperHost,
};

/// Video and image live wallpaper for wlroots compositors.
///
/// Send SIGUSR1 when the screen turns off and SIGUSR2 when it turns back on.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the wallpaper daemon (default).
    Run,
    /// Save a new wallpaper selection. A running daemon picks it up.
    Set {
        /// `scheme://path` or a plain file path.
        url: String,
        /// Restart the video when it ends.
        #[arg(long = "loop")]
        looping: bool,
        /// Type of the media, guessed from the extension when omitted.
        #[arg(long)]
        mime_type: Option<String>,
        /// Redraws per second for still images.
        #[arg(long)]
        frame_rate: Option<u32>,
    },
    /// Print the saved selection.
    Show,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    init_logger();

    match Cli::parse().command.unwrap_or(Command::Run) {
        Command::Run => run(),
        Command::Set {
            url,
            looping,
            mime_type,
            frame_rate,
        } => set(&url, looping, mime_type, frame_rate),
        Command::Show => show(),
    }
}

fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run() -> eyre::Result<()> {
    let config = match Config::try_load() {
        Ok(config) => Some(config),
        Err(why) => {
            tracing::error!(%why, "failed to read the saved selection");
            None
        }
    };

    WallpaperHost::run(config)
}

fn set(
    url: &str,
    looping: bool,
    mime_type: Option<String>,
    frame_rate: Option<u32>,
) -> eyre::Result<()> {
    let config = selection(url, looping, mime_type, frame_rate)?;
    let path = config.save().wrap_err("failed to save the selection")?;
    tracing::info!(url = %config.content_url, path = %path.display(), "wallpaper selected");
    Ok(())
}

/// Build the record to save. File references are stored as absolute paths
/// because the daemon may run from another directory.
fn selection(
    url: &str,
    looping: bool,
    mime_type: Option<String>,
    frame_rate: Option<u32>,
) -> eyre::Result<Config> {
    let reference = ContentReference::parse(url)?.to_absolute();

    let mime_type = match mime_type {
        Some(mime_type) => mime_type,
        None => content::guess_mime_type(url)
            .ok_or_else(|| eyre!("cannot tell the type of {url}, pass --mime-type"))?,
    };

    let mut config = Config::default()
        .content_url(reference.to_string())
        .is_looping(looping)
        .mime_type(mime_type);
    if let Some(frame_rate) = frame_rate {
        config = config.frame_rate(frame_rate);
    }

    Ok(config)
}

fn show() -> eyre::Result<()> {
    let config = Config::try_load().wrap_err("failed to read the saved selection")?;
    println!("content_url: {}", config.content_url);
    println!("is_looping:  {}", config.is_looping);
    println!("mime_type:   {}", config.mime_type);
    println!("frame_rate:  {}", config.frame_rate);
    Ok(())
}
