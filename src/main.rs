use std::path::Path;

use anyhow::Context;
use atomflip::{
    card::Card,
    config::Config,
    driver::{Driver, Strategy},
    gpu::Gpu,
    kms::{AtomicCommitter, DrmKms},
    render::{content_renderer, FrameSource, RawVideo},
};
use kms_scanner::DrmScanner;

fn main() -> anyhow::Result<()> {
    let config = Config::setup();
    let _guard = setup_tracing(config.log_file.as_deref());

    let card = match &config.device {
        Some(path) => Card::open(path),
        None => Card::discover(),
    }
    .context("failed to initialize display")?;
    card.set_client_capabilities(config.atomic).context("failed to initialize display")?;

    let scan = DrmScanner::new()
        .scan(&card, config.mode.as_ref())
        .context("failed to initialize display")?;
    let (w, h) = scan.chain.mode.size;
    let size = (w as u32, h as u32);
    tracing::info!(
        connector = %scan.chain.name,
        monitor = scan.chain.monitor.as_deref().unwrap_or("unknown"),
        mode = %scan.chain.mode,
        "using {}",
        card.path().display(),
    );

    let kms = DrmKms::new(card.clone(), &scan.chain, scan.mode);
    let gpu = Gpu::new(card, size).context("failed to set up gpu")?;

    let video = match &config.video {
        Some(video) => {
            let source = RawVideo::open(&video.path, video.size, &gpu.allocator()).context("failed to open video")?;
            Some(Box::new(source) as Box<dyn FrameSource>)
        }
        None => None,
    };
    let renderer = content_renderer(config.content, &gpu, video).context("failed to set up gpu")?;

    let strategy = match config.atomic {
        true => Strategy::atomic(AtomicCommitter::new(scan.chain), gpu.explicit_fencing()),
        false => Strategy::Legacy,
    };

    let mut driver = Driver::new(kms, gpu, renderer, strategy);
    let result = driver.run(config.frames);
    let teardown = driver.teardown();

    let summary = result.context("render loop aborted")?;
    tracing::info!("{summary}");
    teardown.context("teardown failed")?;
    Ok(())
}

fn setup_tracing(log_file: Option<&Path>) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_appender::{non_blocking, rolling::never};

    let (log, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or(Path::new("."));
            let name = path.file_name().unwrap_or(path.as_os_str());
            std::fs::remove_file(path).ok();
            non_blocking(never(dir, name))
        }
        None => non_blocking(std::io::stderr()),
    };
    tracing_subscriber::fmt()
        .with_writer(log)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    guard
}
