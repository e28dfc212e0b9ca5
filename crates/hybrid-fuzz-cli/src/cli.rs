use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use hybrid_fuzz::{
    config::{DEFAULT_INSTANCE_NAME, DEFAULT_LOG_FILE, PutConfig},
    executor::HybridExecutor,
    sampler::walk::WalkKind,
    utils,
};
use tracing::info;
use tracing_subscriber::{
    EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Hybrid fuzzing coordinator: pairs a running AFL instance with
/// concolic execution and constraint-driven input sampling.
#[derive(Debug, clap::Parser)]
#[command(version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    /// Path of the configuration file.
    #[clap(short)]
    config: PathBuf,

    /// Path of the AFL output directory.
    #[clap(short)]
    output: PathBuf,

    /// Name of the AFL fuzzer instance under the output directory.
    #[clap(short = 'a')]
    afl: String,

    /// Name of this coordinator instance.
    #[clap(short, default_value = DEFAULT_INSTANCE_NAME)]
    name: String,

    /// Log file, relative to the coordinator output directory.
    #[clap(short, default_value = DEFAULT_LOG_FILE)]
    log: PathBuf,

    /// Random walk used to sample the constraint polytopes.
    #[clap(short, value_enum, default_value = "hit-and-run")]
    sampler: WalkKind,
}

impl Cli {
    pub(super) fn run(self) -> anyhow::Result<()> {
        let put = PutConfig::load(&self.config)?;
        anyhow::ensure!(
            self.output.is_dir(),
            "{} is not a directory",
            self.output.display()
        );
        let fuzz_out = self.output.join(&self.afl);
        let concolic_out = self.output.join(&self.name);
        utils::init_dir(&concolic_out).context("Creating coordinator output directory")?;
        setup_logger(&concolic_out.join(&self.log)).context("Setting up logger")?;

        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = Arc::clone(&stop);
            ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
                .context("Setting Ctrl-C handler")?;
        }

        let mut executor =
            HybridExecutor::new(&put, &fuzz_out, &concolic_out, self.sampler, stop)?;
        executor.run()?;

        let counters = executor.counters();
        info!(
            interesting = counters.interesting,
            crashes = counters.crashes,
            hangs = counters.hangs,
            "shutting down"
        );
        Ok(())
    }
}

fn setup_logger(log_file: &Path) -> anyhow::Result<()> {
    let file = File::create(log_file)
        .with_context(|| format!("Creating log file {}", log_file.display()))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned())))
        .with(
            fmt::layer()
                .with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned()))
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env()
                .context("Constructing log filter from env.")?,
        )
        .init();
    Ok(())
}
