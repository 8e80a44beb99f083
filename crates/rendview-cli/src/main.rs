use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use rendview_core::app::{TaskManager, forward_signals};
use rendview_core::config::RendviewConfig;
use rendview_core::files::FileRegistry;
use rendview_core::impls::ProcessLauncher;
use rendview_core::ldr::LdrSource;

/// Render frames for a remote LDR client.
#[derive(Debug, Parser)]
#[command(name = "rendview", version)]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on for the LDR peer.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// LDR password.
    #[arg(long, env = "RENDVIEW_LDR_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Cap on concurrently running workers.
    #[arg(short = 'j', long)]
    max_jobs: Option<usize>,

    #[arg(long)]
    max_render_jobs: Option<usize>,

    #[arg(long)]
    max_filter_jobs: Option<usize>,

    /// Ask for more work below this many pending tasks.
    #[arg(long)]
    todo_low: Option<usize>,

    /// Never hold more than this many pending tasks.
    #[arg(long)]
    todo_high: Option<usize>,

    /// Quit after this many failures in a row (0: never).
    #[arg(long)]
    max_failed: Option<u32>,

    /// Directory for downloaded and rendered files.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut RendviewConfig) {
        let m = &mut config.manager;
        if let Some(v) = self.max_jobs {
            m.max_jobs = v;
        }
        if let Some(v) = self.max_render_jobs {
            m.max_render_jobs = v;
        }
        if let Some(v) = self.max_filter_jobs {
            m.max_filter_jobs = v;
        }
        if let Some(v) = self.todo_low {
            m.todo_low_thresh = v;
        }
        if let Some(v) = self.todo_high {
            m.todo_high_thresh = v;
        }
        if let Some(v) = self.max_failed {
            m.max_failed_in_sequence = v;
        }

        let l = &mut config.ldr;
        if let Some(addr) = self.listen {
            l.listen = addr;
        }
        if let Some(pw) = &self.password {
            l.password = pw.clone();
        }
        if let Some(dir) = &self.work_dir {
            l.work_dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => RendviewConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RendviewConfig::default(),
    };
    args.apply(&mut config);
    config.validate().context("checking configuration")?;
    if config.renderers.is_empty() && config.filters.is_empty() {
        bail!("nothing to run: no renderers or filters configured");
    }
    let descriptors = config.descriptors().context("registering descriptors")?;

    tokio::fs::create_dir_all(&config.ldr.work_dir)
        .await
        .with_context(|| format!("creating {}", config.ldr.work_dir.display()))?;

    let files = FileRegistry::new();
    let workers = u16::try_from(config.manager.max_jobs).unwrap_or(u16::MAX);
    let source = LdrSource::new(
        config.ldr.clone(),
        Arc::new(descriptors),
        files.clone(),
        workers,
    );
    let launcher = ProcessLauncher::new(config.manager.kill_grace());
    let manager = TaskManager::new(
        config.manager.clone(),
        Box::new(source),
        Box::new(launcher),
        files.clone(),
    );

    let control = manager.control();
    tokio::spawn(async move {
        if let Err(e) = forward_signals(control).await {
            warn!(error = %e, "signal handling unavailable");
        }
    });

    info!(listen = %config.ldr.listen, work_dir = %config.ldr.work_dir.display(), "rendview starting");
    let report = manager.run().await;
    let removed = files.shutdown();
    info!(
        exit = ?report.exit,
        completed = report.stats.completed,
        failed = report.stats.failed,
        reported = report.stats.reported,
        removed,
        "rendview finished"
    );
    Ok(ExitCode::from(report.exit.code()))
}
