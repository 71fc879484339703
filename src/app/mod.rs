pub mod checkpoint;
pub mod config;
pub mod discovery;
pub mod download;
pub mod error;
pub mod extract;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;
pub mod runtime;
pub mod surface;
pub mod types;
pub mod verify;
pub mod webdriver;

#[cfg(test)]
pub(crate) mod testing;

use chrono::Local;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use self::config::{Cli, Config};
use self::download::{DownloadManager, HttpFetcher, YtDlp};
use self::error::{Result, ScrapeError};
use self::runtime::{RunSummary, run_session};
use self::surface::RenderingSurface;
use self::webdriver::{WebDriverSurface, ensure_webdriver, stop_webdriver};

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "info,postgrab=debug"
    } else {
        "info,postgrab=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(verbose))
        .init();
}

pub async fn run() -> Result<RunSummary> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = Config::from_cli(&cli, Local::now())?;

    let downloads = DownloadManager::new(
        Box::new(HttpFetcher::new(config.download.image_timeout)?),
        Box::new(YtDlp::new(
            config.download.yt_dlp_binary.clone(),
            config.download.stream_timeout,
        )),
        &config.download,
        config.browser.profile_dir.clone(),
    );

    let (endpoint, driver) = ensure_webdriver(&config.browser).await?;
    let mut surface = match WebDriverSurface::connect(&endpoint, &config.browser).await {
        Ok(surface) => surface,
        Err(err) => {
            stop_webdriver(driver);
            return Err(ScrapeError::Setup(format!("could not open browser session: {err}")));
        }
    };

    let result = tokio::select! {
        res = run_session(&mut surface, &config, &downloads) => res,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received; stopping after saving progress");
            Err(ScrapeError::Interrupted)
        }
    };

    if let Err(err) = surface.close().await {
        warn!("browser session close failed: {err}");
    }
    stop_webdriver(driver);

    if let Ok(summary) = &result {
        eprintln!(
            "finished session: {} output={}",
            summary.describe(),
            config.paths.session_dir.display()
        );
    }
    result
}
