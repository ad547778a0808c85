use std::collections::HashMap;

use leakwatch::{Config, Engine, LeakwatchAllocator};
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;

#[global_allocator]
static HEAP: LeakwatchAllocator = LeakwatchAllocator::init();
static ENGINE: Engine = Engine::new();

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    init_log()?;

    let session = ENGINE.attach(&HEAP, Config::default().with_max_data_dump(32))?;
    // nothing allocated so far is interesting
    ENGINE.mark_all_reported();

    tracing::info!(
        "Starting the application... Allocated {} bytes in {} blocks",
        HEAP.allocated(),
        HEAP.live_count()
    );

    let mut cache = HashMap::new();
    for id in 0..4u32 {
        let task = tokio::spawn(async move { format!("response #{id}") });
        cache.insert(id, task.await?);
    }
    // the cache is never cleaned up
    std::mem::forget(cache);

    tracing::info!("{} leaks so far", ENGINE.leak_count());

    // Report and shut down
    drop(session);

    Ok(())
}

fn init_log() -> Result<(), Box<dyn std::error::Error>> {
    let stdout_logger = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_line_number(true)
        .with_writer(std::io::stdout);

    let registry = tracing_subscriber::registry()
        .with(stdout_logger.with_filter(LevelFilter::from(Level::DEBUG)));

    tracing::subscriber::set_global_default(registry)?;

    Ok(())
}
