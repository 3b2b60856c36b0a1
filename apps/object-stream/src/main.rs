//! Object Stream Binary
//!
//! Command-line access to the streaming reader and writer.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p object-stream -- cat gs://bucket/object --offset 100 --length 50
//! cargo run -p object-stream -- put gs://bucket/object --file ./data.bin
//! cargo run -p object-stream -- ranges gs://bucket/object 0:10 -16:0
//! cargo run -p object-stream -- stat gs://bucket/object
//! cargo run -p object-stream -- --in-memory cat gs://demo/hello.txt
//! ```
//!
//! # Environment Variables
//!
//! - `STORAGE_GRPC_ENDPOINT`: gRPC endpoint (default: <https://storage.googleapis.com>)
//! - `STORAGE_EMULATOR_HOST`: emulator host; takes precedence over the endpoint
//! - `STORAGE_ACCESS_TOKEN`: OAuth2 bearer token
//! - `STORAGE_USER_PROJECT`: project billed for requests
//! - `STORAGE_CHUNK_SIZE_BYTES`: upload chunk size (0 = one-shot)
//! - `STORAGE_SEND_CRC32C`: send CRC32C with uploads (default: true)
//! - `STORAGE_RETRY_*`: backoff tuning
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use object_stream::infrastructure::telemetry;
use object_stream::{
    ClientConfig, InMemoryTransport, StorageClient, StorageTransport, TonicTransport,
    get_metrics_handle, init_metrics,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Bucket and object served by `--in-memory`.
const DEMO_BUCKET: &str = "demo";
const DEMO_OBJECT: &str = "hello.txt";
const DEMO_CONTENT: &[u8] = b"Hello from the in-memory object store.\n";

#[derive(Debug, Parser)]
#[command(name = "object-stream", version, about = "Stream Cloud Storage objects over gRPC")]
struct Cli {
    /// Serve requests from an in-process store seeded with gs://demo/hello.txt.
    #[arg(long, global = true)]
    in_memory: bool,

    /// Print Prometheus metrics to stderr on exit.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write an object (or a range of it) to stdout.
    Cat {
        /// Object URL, `gs://bucket/object`.
        url: String,
        /// First byte; negative counts from the end.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        offset: i64,
        /// Bytes to read; negative reads to the end.
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        length: i64,
        /// Generation to read.
        #[arg(long)]
        generation: Option<i64>,
    },
    /// Print object attributes as JSON.
    Stat {
        /// Object URL, `gs://bucket/object`.
        url: String,
        /// Generation to describe.
        #[arg(long)]
        generation: Option<i64>,
    },
    /// Upload stdin or a file.
    Put {
        /// Object URL, `gs://bucket/object`.
        url: String,
        /// Read from this file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Chunk size in bytes; 0 sends everything in one stream.
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Create an appendable object.
        #[arg(long)]
        appendable: bool,
        /// Leave an appendable object unfinalized.
        #[arg(long, requires = "appendable")]
        no_finalize: bool,
        /// Content-Type of the new object.
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Append stdin or a file to an unfinalized appendable object.
    Append {
        /// Object URL, `gs://bucket/object`.
        url: String,
        /// Generation of the appendable object.
        #[arg(long)]
        generation: i64,
        /// Read from this file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Finalize the object afterwards.
        #[arg(long)]
        finalize: bool,
    },
    /// Download several ranges over one stream and print their sizes.
    Ranges {
        /// Object URL, `gs://bucket/object`.
        url: String,
        /// Ranges as `offset:length`.
        #[arg(required = true, allow_hyphen_values = true)]
        ranges: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    let cli = Cli::parse();
    if cli.metrics {
        init_metrics().context("installing metrics recorder")?;
    }

    let config = ClientConfig::from_env()?;
    tracing::debug!(
        endpoint = %config.endpoint,
        emulator = config.emulator,
        chunk_size = config.writer.chunk_size,
        "Configuration loaded"
    );

    let transport: Arc<dyn StorageTransport> = if cli.in_memory {
        let store = InMemoryTransport::new();
        store.insert_object(DEMO_BUCKET, DEMO_OBJECT, Bytes::from_static(DEMO_CONTENT));
        Arc::new(store)
    } else {
        Arc::new(TonicTransport::connect(&config).await?)
    };
    let client = StorageClient::new(transport, config.call_settings());

    let result = run(&client, &config, cli.command).await;

    if cli.metrics
        && let Some(handle) = get_metrics_handle()
    {
        eprintln!("{}", handle.render());
    }
    result
}

async fn run(
    client: &StorageClient,
    config: &ClientConfig,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Cat {
            url,
            offset,
            length,
            generation,
        } => {
            let (bucket, name) = parse_url(&url)?;
            let mut object = client.object(bucket, name);
            if let Some(generation) = generation {
                object = object.generation(generation);
            }
            let mut reader = object.new_range_reader(offset, length).await?;
            let mut stdout = tokio::io::stdout();
            let written = reader.write_to(&mut stdout).await?;
            tracing::info!(
                written,
                generation = reader.attrs().generation,
                "Read complete"
            );
        }
        Command::Stat { url, generation } => {
            let (bucket, name) = parse_url(&url)?;
            let mut object = client.object(bucket, name);
            if let Some(generation) = generation {
                object = object.generation(generation);
            }
            let mut reader = object.new_range_reader(0, 0).await?;
            println!("{}", serde_json::to_string_pretty(reader.attrs())?);
            reader.close();
        }
        Command::Put {
            url,
            file,
            chunk_size,
            appendable,
            no_finalize,
            content_type,
        } => {
            let (bucket, name) = parse_url(&url)?;
            let mut options = config.writer_options();
            if let Some(chunk_size) = chunk_size {
                options = options.with_chunk_size(chunk_size);
            }
            if appendable {
                options = options.appendable(!no_finalize);
            }
            if let Some(content_type) = content_type {
                options = options.with_content_type(content_type);
            }
            options = options.with_progress(|persisted| {
                tracing::debug!(persisted, "Upload progress");
            });

            let data = read_input(file.as_ref()).await?;
            let mut writer = client.object(bucket, name).new_writer(options)?;
            writer.write(&data).await?;
            let object = writer.close().await?;
            println!(
                "{} generation={} size={}",
                url, object.generation, object.size
            );
        }
        Command::Append {
            url,
            generation,
            file,
            finalize,
        } => {
            let (bucket, name) = parse_url(&url)?;
            let options = config.writer_options().appendable(finalize);
            let mut writer = client
                .object(bucket, name)
                .generation(generation)
                .takeover_appendable_writer(options)
                .await?;
            let start = writer.offset();
            let data = read_input(file.as_ref()).await?;
            writer.write(&data).await?;
            let object = writer.close().await?;
            println!(
                "{} generation={} appended_at={} size={}",
                url, object.generation, start, object.size
            );
        }
        Command::Ranges { url, ranges } => {
            let (bucket, name) = parse_url(&url)?;
            let ranges = ranges
                .iter()
                .map(|spec| parse_range(spec))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let mut downloader = client.object(bucket, name).new_multi_range_downloader().await?;
            let pending: Vec<_> = ranges
                .iter()
                .map(|&(offset, length)| downloader.add(Vec::new(), offset, length))
                .collect();

            let mut stdout = tokio::io::stdout();
            for ((offset, length), pending) in ranges.into_iter().zip(pending) {
                let outcome = pending.wait().await?;
                match outcome.result {
                    Ok(()) => {
                        let line = format!("{offset}:{length} {} bytes\n", outcome.sink.len());
                        stdout.write_all(line.as_bytes()).await?;
                    }
                    Err(err) => {
                        let line = format!("{offset}:{length} failed: {err}\n");
                        stdout.write_all(line.as_bytes()).await?;
                    }
                }
            }
            stdout.flush().await?;
            downloader.close().await?;
        }
    }
    Ok(())
}

/// Split `gs://bucket/object` into its parts.
fn parse_url(url: &str) -> anyhow::Result<(String, String)> {
    let Some(path) = url.strip_prefix("gs://") else {
        bail!("expected a gs://bucket/object URL, got {url}");
    };
    match path.split_once('/') {
        Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => {
            Ok((bucket.to_string(), object.to_string()))
        }
        _ => bail!("expected a gs://bucket/object URL, got {url}"),
    }
}

/// Parse `offset:length`.
fn parse_range(spec: &str) -> anyhow::Result<(i64, i64)> {
    let (offset, length) = spec
        .split_once(':')
        .with_context(|| format!("range {spec} is not offset:length"))?;
    let offset = offset
        .parse()
        .with_context(|| format!("invalid offset in {spec}"))?;
    let length = length
        .parse()
        .with_context(|| format!("invalid length in {spec}"))?;
    Ok((offset, length))
}

async fn read_input(file: Option<&PathBuf>) -> anyhow::Result<Vec<u8>> {
    match file {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut data = Vec::new();
            tokio::io::stdin().read_to_end(&mut data).await?;
            Ok(data)
        }
    }
}

/// Load .env file if present.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}
