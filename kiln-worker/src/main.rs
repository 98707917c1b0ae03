use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use kiln_core::{
    DeviceMap, HubModelSource, ModelHandle, ModelStore, VolumeLayout, DEFAULT_MODEL,
    DEFAULT_VOLUME_PATH,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod handler;
mod server;

use handler::Handler;
use server::JobRequest;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln serverless image generation worker")]
struct Args {
    /// Mount point of the shared storage volume
    #[arg(long, env = "KILN_VOLUME", default_value = DEFAULT_VOLUME_PATH)]
    volume: PathBuf,

    /// Model repository to serve
    #[arg(long, env = "KILN_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// GPU ordinal to place the model on
    #[arg(long, default_value_t = 0)]
    device_ordinal: usize,

    /// Host address for the local job API
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the local job API
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Run a single job (`{"input": {...}}`), print its output and exit
    #[arg(long, value_name = "JSON")]
    test_input: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(args: Args, layout: VolumeLayout) -> Result<()> {
    let source = HubModelSource {
        model_name: args.model.clone(),
        store: ModelStore::from_layout(&layout),
        device_map: DeviceMap::Ordinal(args.device_ordinal),
    };
    let handler = Arc::new(Handler::new(ModelHandle::new(source)));

    if let Some(raw) = args.test_input {
        let job: JobRequest = serde_json::from_str(&raw).context("failed to parse --test-input")?;
        let response = server::run_job(&handler, job).await;
        println!("{}", serde_json::to_string_pretty(&response.output)?);
        return Ok(());
    }

    let bind_address = format!("{}:{}", args.host, args.port);
    server::serve(handler, &bind_address).await
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    // before the runtime starts any threads
    let layout = VolumeLayout::new(&args.volume);
    layout.export_cache_env();

    info!("Starting {} serverless worker...", args.model);
    info!("Volume path: {}", layout.root().display());
    info!("Models directory: {}", layout.models_dir().display());
    info!("Cache directory: {}", layout.hf_home().display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run(args, layout))
}
