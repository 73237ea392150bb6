use anyhow::{Context, Result};
use chunked_upload::{
    client::{
        api::HttpTransferApi,
        resume::ResumeResolver,
        scheduler::{DEFAULT_MAX_PARALLEL, RetryPolicy, Scheduler, SchedulerConfig, SchedulerStatus},
        source::FileSource,
        state::LocalStateStore,
    },
    models::chunk::DEFAULT_CHUNK_SIZE,
};
use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

/// Upload a file in resumable chunks.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked-upload client")]
struct Args {
    /// File to upload
    file: PathBuf,

    /// Server base URL
    #[arg(long, env = "CHUNKED_UPLOAD_SERVER", default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Where the resume record is kept
    #[arg(long, env = "CHUNKED_UPLOAD_STATE_FILE", default_value = ".chunked-upload.json")]
    state_file: PathBuf,

    /// Chunk size in bytes; must match the server
    #[arg(long, env = "CHUNKED_UPLOAD_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    /// Concurrent chunk transfers
    #[arg(long, default_value_t = DEFAULT_MAX_PARALLEL)]
    parallel: usize,

    /// Attempts per chunk before giving up
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Seconds allowed to establish a connection
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Seconds allowed for a whole request, chunk body included
    #[arg(long, env = "CHUNKED_UPLOAD_REQUEST_TIMEOUT", default_value_t = 120)]
    request_timeout_secs: u64,

    /// Discard any existing progress for this file and start over
    #[arg(long)]
    reset: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let api = Arc::new(HttpTransferApi::with_timeouts(
        &args.server,
        Duration::from_secs(args.connect_timeout_secs.max(1)),
        Duration::from_secs(args.request_timeout_secs.max(1)),
    )?);
    let store = Arc::new(LocalStateStore::new(&args.state_file));
    let source = Arc::new(
        FileSource::open(&args.file)
            .await
            .with_context(|| format!("opening {}", args.file.display()))?,
    );
    let resolver = ResumeResolver::new(api.clone(), store.clone(), args.chunk_size);

    let mut plan = resolver.resolve(source.as_ref()).await?;
    if args.reset {
        resolver.reset(&plan).await?;
        plan = resolver.resolve(source.as_ref()).await?;
    }
    tracing::info!(
        upload_id = %plan.upload_id,
        file = %source.path().display(),
        received = plan.received.len(),
        total = plan.layout.total_chunks(),
        "upload ready"
    );

    let config = SchedulerConfig {
        max_parallel: args.parallel,
        retry: RetryPolicy {
            max_attempts: args.max_attempts.max(1),
            ..RetryPolicy::default()
        },
    };
    let scheduler = Scheduler::start(plan, api, source, Some(store), config);

    let mut progress = scheduler.subscribe_progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = *progress.borrow_and_update();
            tracing::info!("{}", snapshot);
        }
    });

    let status = tokio::select! {
        status = scheduler.wait() => status,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, finishing in-flight chunks");
            scheduler.pause();
            scheduler.wait().await
        }
    };
    reporter.abort();

    match status {
        SchedulerStatus::Completed {
            hash,
            entry_names,
            already_completed,
        } => {
            println!("{}  {}", hash, args.file.display());
            if already_completed {
                tracing::info!("server already held this file");
            }
            for name in entry_names {
                println!("  {}", name);
            }
            Ok(())
        }
        SchedulerStatus::Paused => {
            tracing::info!(
                "paused at {}; run again to resume",
                scheduler.progress()
            );
            Ok(())
        }
        SchedulerStatus::Failed { reason } => anyhow::bail!("upload failed: {}", reason),
        other => anyhow::bail!("upload stopped: {:?}", other),
    }
}
