//! Command-line client for cask.

mod encode;

use anyhow::{Context, Result};
use bytes::Bytes;
use cask_bucket::TieredBufferAllocator;
use cask_core::config::AppConfig;
use cask_core::{ClientUri, CompressionCodec, KeyBlock, Metadata, PriorityClass};
use cask_resolver::{
    CodecRegistry, EditionTracker, FetchError, FetchFailure, MemoryArchiveProvider,
    MetadataResolver, ResolverEvent, ResolverServices, Verbosity,
};
use cask_scheduler::{
    InsertEvent, InsertRequest, LoopbackNetwork, RequestScheduler, SendableRequest,
};
use cask_signer::SubspaceSigner;
use cask_storage::{JobRunner, KeyStore};
use clap::{Parser, Subcommand, ValueEnum};
use encode::Encoder;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use futures::StreamExt;
use prometheus::{Encoder as _, Registry, TextEncoder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cask")]
#[command(about = "Fetch and store content on the cask network")]
#[command(version)]
struct Cli {
    /// Configuration file (optional; CASK_* environment variables override it)
    #[arg(long, env = "CASK_CONFIG", default_value = "config/cask.toml", global = true)]
    config: PathBuf,

    /// Print Prometheus metrics to stderr after the command
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a URI and write its content
    Fetch {
        /// URI to resolve, e.g. chk@<hash>/docs/index.html
        uri: ClientUri,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Only use blocks already in the local store
        #[arg(long)]
        local_only: bool,
        /// Largest output accepted, in bytes
        #[arg(long)]
        max_size: Option<u64>,
    },
    /// Insert a file and print its URI
    Put {
        file: PathBuf,
        /// MIME type (default: guessed from the extension)
        #[arg(long)]
        mime: Option<String>,
        /// Compress before inserting
        #[arg(long, value_enum)]
        compress: Option<Compression>,
    },
    /// Insert a directory as a manifest and print its URI
    PutDir { dir: PathBuf },
    /// Generate a subspace signing key
    Keygen {
        /// Output file for the secret key
        #[arg(short, long)]
        output: PathBuf,
        /// Label stored with the key
        #[arg(short, long, default_value = "cask")]
        label: String,
    },
    /// Point a signed document edition at a URI
    Publish {
        /// Secret key file written by `keygen`
        #[arg(long)]
        key: PathBuf,
        /// Document name
        #[arg(long)]
        name: String,
        /// Edition number
        #[arg(long)]
        edition: u64,
        /// Target URI
        uri: ClientUri,
    },
    /// Local block store commands
    Store {
        #[command(subcommand)]
        command: StoreCommands,
    },
}

#[derive(Subcommand)]
enum StoreCommands {
    /// List every stored key
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum Compression {
    Zstd,
    Xz,
    Gzip,
}

impl From<Compression> for CompressionCodec {
    fn from(value: Compression) -> Self {
        match value {
            Compression::Zstd => CompressionCodec::Zstd,
            Compression::Xz => CompressionCodec::Xz,
            Compression::Gzip => CompressionCodec::Gzip,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config: config_path,
        metrics,
        command,
    } = Cli::parse();
    let config = load_config(&config_path)?;

    // Logs go to stderr; stdout carries fetched content.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    tracing::debug!(config = %config_path.display(), "configuration loaded");

    let registry = Registry::new();
    if metrics {
        cask_bucket::metrics::register(&registry).context("failed to register bucket metrics")?;
        cask_scheduler::metrics::register(&registry)
            .context("failed to register scheduler metrics")?;
    }

    match command {
        Commands::Keygen { output, label } => handle_keygen(&output, &label).await?,
        command => {
            let stack = Stack::open(&config).await?;
            let result = run_command(&stack, &config, command).await;
            stack.close().await;
            result?;
        }
    }

    if metrics {
        print_metrics(&registry)?;
    }
    Ok(())
}

/// Merge the optional TOML file with `CASK_<SECTION>__<FIELD>` variables.
fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("CASK_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

/// Everything a command needs, wired from configuration.
struct Stack {
    store: Arc<dyn KeyStore>,
    scheduler: RequestScheduler,
    resolver: MetadataResolver,
    encoder: Encoder,
    jobs: JobRunner,
    worker: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl Stack {
    async fn open(config: &AppConfig) -> Result<Self> {
        let store = cask_storage::from_config(&config.store)
            .await
            .context("failed to open block store")?;
        let snapshots = cask_storage::snapshot_store_from_config(&config.persistence)
            .context("failed to open request snapshots")?;
        let (jobs, worker) = JobRunner::spawn(snapshots);

        let network = Arc::new(LoopbackNetwork::new(store.clone()));
        let scheduler = RequestScheduler::start(
            &config.scheduler,
            &config.checker,
            store.clone(),
            network,
            jobs.clone(),
        )
        .context("failed to start request scheduler")?;

        let allocator = TieredBufferAllocator::new(config.buckets.clone())
            .context("failed to create buffer allocator")?;
        let sweeper = allocator.spawn_sweep_task();

        let codecs = Arc::new(CodecRegistry::default());
        let resolver = MetadataResolver::new(ResolverServices {
            scheduler: scheduler.clone(),
            allocator,
            archives: Arc::new(MemoryArchiveProvider::new()),
            codecs: codecs.clone(),
            editions: Arc::new(EditionTracker::new()),
            verbosity: Verbosity {
                trace_transitions: config.logging.trace_resolver,
            },
            priority: PriorityClass::Interactive,
        });

        Ok(Self {
            store,
            scheduler,
            resolver,
            encoder: Encoder::new(codecs),
            jobs,
            worker,
            sweeper,
        })
    }

    async fn close(self) {
        self.scheduler.shutdown();
        self.sweeper.abort();
        self.jobs.close();
        if let Err(e) = self.worker.await {
            tracing::warn!(error = %e, "persistence worker exited abnormally");
        }
    }
}

async fn run_command(stack: &Stack, config: &AppConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Fetch {
            uri,
            output,
            local_only,
            max_size,
        } => handle_fetch(stack, config, uri, output, local_only, max_size).await,
        Commands::Put {
            file,
            mime,
            compress,
        } => handle_put(stack, &file, mime, compress.map(Into::into)).await,
        Commands::PutDir { dir } => handle_put_dir(stack, &dir).await,
        Commands::Publish {
            key,
            name,
            edition,
            uri,
        } => handle_publish(stack, &key, &name, edition, uri).await,
        Commands::Store {
            command: StoreCommands::List,
        } => handle_store_list(stack).await,
        Commands::Keygen { .. } => anyhow::bail!("keygen runs without the client stack"),
    }
}

async fn handle_fetch(
    stack: &Stack,
    config: &AppConfig,
    uri: ClientUri,
    output: Option<PathBuf>,
    local_only: bool,
    max_size: Option<u64>,
) -> Result<()> {
    let mut builder = config.fetch.builder().local_request_only(local_only);
    if let Some(max) = max_size {
        builder = builder
            .max_output_length(max)
            .max_temp_length(config.fetch.max_temp_length.max(max));
    }
    let ctx = builder.build().context("invalid fetch limits")?;

    let mut events = stack.resolver.start(uri.clone(), ctx).into_stream();
    let mut outcome = None;
    while let Some(event) = events.next().await {
        match event {
            ResolverEvent::Found(found) => outcome = Some(Ok(found)),
            ResolverEvent::FailedRestartable(failure) | ResolverEvent::FailedFatal(failure) => {
                outcome = Some(Err(failure));
            }
            ResolverEvent::ExpectedSize(size) => tracing::info!(size, "expected size"),
            ResolverEvent::ExpectedMime(mime) => tracing::info!(%mime, "expected MIME type"),
            ResolverEvent::Progress { fetched, total } => {
                tracing::info!(fetched, total, "fetching blocks");
            }
            other => tracing::debug!(event = ?other, "resolver event"),
        }
    }

    let found = match outcome {
        Some(Ok(found)) => found,
        Some(Err(failure)) => return Err(fetch_error(&uri, failure)),
        None => anyhow::bail!("resolution of {uri} ended without a result"),
    };
    let data = found.bytes().await.context("failed to read fetched data")?;
    tracing::info!(
        size = data.len(),
        mime = found.mime_type().unwrap_or("unknown"),
        "fetched {uri}"
    );

    match output {
        Some(path) => tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

fn fetch_error(uri: &ClientUri, failure: FetchFailure) -> anyhow::Error {
    let hint = match &failure.error {
        FetchError::PermanentRedirect { uri } => format!(" (newer edition at {uri})"),
        FetchError::TooManyPathComponents {
            suggested: Some(suggested),
            ..
        }
        | FetchError::NotEnoughPathComponents {
            suggested: Some(suggested),
        } => format!(" (try {suggested})"),
        _ if failure.is_restartable() => " (may succeed later)".to_string(),
        _ => String::new(),
    };
    anyhow::Error::new(failure).context(format!("failed to fetch {uri}{hint}"))
}

async fn handle_put(
    stack: &Stack,
    file: &Path,
    mime: Option<String>,
    compression: Option<CompressionCodec>,
) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mime = mime.or_else(|| encode::guess_mime(file).map(str::to_string));
    let encoded = stack
        .encoder
        .encode_bytes(Bytes::from(data), mime.as_deref(), compression)
        .await?;
    let (uri, blocks) = stack.encoder.publish(encoded).await?;
    insert_blocks(&stack.scheduler, blocks).await?;
    println!("{uri}");
    Ok(())
}

async fn handle_put_dir(stack: &Stack, dir: &Path) -> Result<()> {
    let encoded = stack.encoder.encode_dir(dir).await?;
    let (uri, blocks) = stack.encoder.publish(encoded).await?;
    insert_blocks(&stack.scheduler, blocks).await?;
    println!("{uri}");
    Ok(())
}

async fn handle_keygen(output: &Path, label: &str) -> Result<()> {
    let signer = SubspaceSigner::generate(label);
    tokio::fs::write(output, signer.secret_text())
        .await
        .with_context(|| format!("failed to write key to {}", output.display()))?;
    println!("Secret key written to: {}", output.display());
    println!("Public key: {}", signer.public_key().to_text(signer.label()));
    Ok(())
}

async fn handle_publish(
    stack: &Stack,
    key: &Path,
    name: &str,
    edition: u64,
    target: ClientUri,
) -> Result<()> {
    let text = tokio::fs::read_to_string(key)
        .await
        .with_context(|| format!("failed to read key file: {}", key.display()))?;
    let signer =
        SubspaceSigner::from_secret_text(text.trim()).context("failed to parse secret key")?;

    let pointer = Metadata::single_redirect(target, None).to_bytes()?;
    let block = signer
        .sign_block(name, edition, pointer, true)
        .context("failed to sign document")?;
    let uri = signer.uri_for(name, edition)?;
    insert_blocks(&stack.scheduler, vec![block]).await?;
    println!("{uri}");
    Ok(())
}

async fn handle_store_list(stack: &Stack) -> Result<()> {
    let mut keys = stack
        .store
        .list_keys()
        .await
        .context("failed to list stored keys")?;
    let mut count = 0usize;
    while let Some(key) = keys.next().await {
        println!("{}", key.context("failed to read key listing")?);
        count += 1;
    }
    tracing::info!(count, "listed stored keys");
    Ok(())
}

/// Insert `blocks` through the scheduler and wait until every one landed.
async fn insert_blocks(scheduler: &RequestScheduler, blocks: Vec<KeyBlock>) -> Result<()> {
    let (request, mut events) = InsertRequest::new(blocks);
    let mut remaining = request.blocks.len();
    if remaining == 0 {
        return Ok(());
    }
    scheduler
        .register_sendable(
            SendableRequest::Insert(request),
            PriorityClass::Interactive,
            false,
        )
        .context("failed to register insert")?;

    while remaining > 0 {
        match events.recv().await {
            Some(InsertEvent::Inserted(key)) => {
                tracing::debug!(%key, "inserted");
                remaining -= 1;
            }
            Some(InsertEvent::Failed { key, failure }) => {
                anyhow::bail!("failed to insert {key}: {failure}");
            }
            None => anyhow::bail!("insert ended with {remaining} blocks outstanding"),
        }
    }
    Ok(())
}

fn print_metrics(registry: &Registry) -> Result<()> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    eprint!("{}", String::from_utf8_lossy(&buffer));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    async fn test_stack(temp: &TempDir) -> Stack {
        Stack::open(&AppConfig::for_testing(temp.path()))
            .await
            .unwrap()
    }

    async fn resolve(stack: &Stack, uri: ClientUri) -> Bytes {
        let ctx = AppConfig::default().fetch.builder().build().unwrap();
        let found = stack.resolver.resolve(uri, ctx).await.unwrap();
        found.bytes().await.unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_args_parse_uri() {
        let key = cask_core::ContentKey::for_payload(false, b"x");
        let uri = ClientUri::from(cask_core::Key::from(key)).add_meta_strings(["a.txt"]);
        let text = uri.to_string();
        let cli = Cli::try_parse_from(["cask", "fetch", text.as_str(), "--local-only"]).unwrap();
        match cli.command {
            Commands::Fetch {
                uri: parsed,
                local_only,
                ..
            } => {
                assert_eq!(parsed, uri);
                assert!(local_only);
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_load_config_without_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = load_config(&temp.path().join("missing.toml")).unwrap();
        assert_eq!(config.scheduler.max_concurrent_blocks, 32);
    }

    #[test]
    fn test_load_config_reads_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cask.toml");
        std::fs::write(
            &path,
            "[store]\ntype = \"memory\"\n\n[buckets]\nmax_ram_bucket_size = 2048\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert!(matches!(config.store, cask_core::config::StoreConfig::Memory));
        assert_eq!(config.buckets.max_ram_bucket_size, 2048);
    }

    #[test]
    fn test_load_config_rejects_invalid_limits() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cask.toml");
        std::fs::write(&path, "[fetch]\nmax_output_length = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[tokio::test]
    async fn test_put_then_fetch_large_compressed_file() {
        let temp = TempDir::new().unwrap();
        let stack = test_stack(&temp).await;
        // Incompressible, so the result still spans several blocks.
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let data: Vec<u8> = (0..300_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();

        let encoded = stack
            .encoder
            .encode_bytes(Bytes::from(data.clone()), None, Some(CompressionCodec::Xz))
            .await
            .unwrap();
        let (uri, blocks) = stack.encoder.publish(encoded).await.unwrap();
        insert_blocks(&stack.scheduler, blocks).await.unwrap();

        assert_eq!(resolve(&stack, uri).await, Bytes::from(data));
        stack.close().await;
    }

    #[tokio::test]
    async fn test_put_dir_then_fetch_paths() {
        let temp = TempDir::new().unwrap();
        let site = temp.path().join("site");
        tokio::fs::create_dir_all(site.join("docs")).await.unwrap();
        tokio::fs::write(site.join("index.html"), "<h1>home</h1>")
            .await
            .unwrap();
        tokio::fs::write(site.join("docs").join("guide.txt"), "read me")
            .await
            .unwrap();
        let stack = test_stack(&temp).await;

        let encoded = stack.encoder.encode_dir(&site).await.unwrap();
        let (uri, blocks) = stack.encoder.publish(encoded).await.unwrap();
        insert_blocks(&stack.scheduler, blocks).await.unwrap();

        assert_eq!(
            resolve(&stack, uri.add_meta_strings(["docs", "guide.txt"])).await,
            Bytes::from_static(b"read me")
        );
        assert_eq!(
            resolve(&stack, uri.clone()).await,
            Bytes::from_static(b"<h1>home</h1>")
        );
        stack.close().await;
    }

    #[tokio::test]
    async fn test_publish_resolves_through_subspace() {
        let temp = TempDir::new().unwrap();
        let stack = test_stack(&temp).await;
        let key_file = temp.path().join("site.key");
        handle_keygen(&key_file, "site").await.unwrap();

        let target = KeyBlock::content(Bytes::from_static(b"edition one"), false);
        let target_uri = ClientUri::from(target.key().clone());
        insert_blocks(&stack.scheduler, vec![target]).await.unwrap();
        handle_publish(&stack, &key_file, "blog", 1, target_uri)
            .await
            .unwrap();

        let text = tokio::fs::read_to_string(&key_file).await.unwrap();
        let signer = SubspaceSigner::from_secret_text(text.trim()).unwrap();
        let uri = signer.uri_for("blog", 1).unwrap();
        assert_eq!(resolve(&stack, uri).await, Bytes::from_static(b"edition one"));
        stack.close().await;
    }

    #[tokio::test]
    async fn test_insert_lands_in_store() {
        let temp = TempDir::new().unwrap();
        let stack = test_stack(&temp).await;
        let block = KeyBlock::content(Bytes::from_static(b"stored"), false);
        let key = block.key().clone();
        insert_blocks(&stack.scheduler, vec![block]).await.unwrap();

        let keys: Vec<_> = stack
            .store
            .list_keys()
            .await
            .unwrap()
            .map(|k| k.unwrap())
            .collect()
            .await;
        assert_eq!(keys, vec![key]);
        stack.close().await;
    }
}
