//! assetcache
//!
//! Command line front end for the artifact cache.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         assetcache serve                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Election   │───▶│ Coordinator  │───▶│ /metrics     │       │
//! │  │ (unix sock)  │    │ (membuf)     │    │ /healthz     │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          │                  ▲                                    │
//! │          ▼                  │ frames                             │
//! │  ┌──────────────┐           │                                    │
//! │  │ Worker proxy │───────────┘    put / get / info                │
//! │  └──────────────┘                                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use assetcache::cache::{
    backend_by_name, CacheMetrics, MembufBackend, CACHE_MEMBUF, CACHE_PATH_OPTION,
};
use assetcache::cluster::{self, ClusterWorker, Role};
use assetcache::error::{Error, Result};
use assetcache::{CacheBackend, CacheKey, CacheOptions, OptionsBuilder, PartTag};

/// Socket used when none is configured
const DEFAULT_SOCKET: &str = "assetcache.sock";

// =============================================================================
// CLI Arguments
// =============================================================================

/// assetcache - Content-addressed build artifact cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Backend to use (cache_membuf, cache_fs)
    #[arg(long, global = true, env = "CACHE_BACKEND", default_value = CACHE_MEMBUF)]
    backend: String,

    /// Cache working directory; relative paths resolve against the binary's directory
    #[arg(long, global = true, env = "CACHE_PATH")]
    cache_path: Option<String>,

    /// Buffer pool capacity in bytes
    #[arg(long, global = true, env = "CACHE_CAPACITY")]
    capacity: Option<u64>,

    /// Buffer pool page size in bytes
    #[arg(long, global = true, env = "CACHE_PAGE_SIZE")]
    page_size: Option<u64>,

    /// Coordinator socket; client commands go through it when set
    #[arg(long, global = true, env = "CACHE_SOCKET")]
    socket: Option<PathBuf>,

    /// JSON config document with a `cache.options` section
    #[arg(long, global = true, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run as coordinator, or as a worker if one is already running
    Serve {
        /// Metrics and health server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
        metrics_addr: String,
    },
    /// Store an artifact
    Put {
        /// Artifact guid (32 hex chars)
        guid: String,
        /// Version hash (32 hex chars)
        hash: String,
        /// Parts as TAG=FILE, e.g. a=build/out.bin
        #[arg(required = true, value_parser = parse_part_arg)]
        parts: Vec<(PartTag, PathBuf)>,
    },
    /// Read one part of an artifact
    Get {
        guid: String,
        hash: String,
        /// Part tag
        #[arg(long, default_value = "a", value_parser = parse_tag_arg)]
        tag: PartTag,
        /// Output file (stdout if omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Describe an artifact
    Info { guid: String, hash: String },
}

fn parse_tag_arg(value: &str) -> std::result::Result<PartTag, String> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => PartTag::new(c).map_err(|e| e.to_string()),
        _ => Err(format!("part tag must be one character, got '{}'", value)),
    }
}

fn parse_part_arg(value: &str) -> std::result::Result<(PartTag, PathBuf), String> {
    let (tag, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected TAG=FILE, got '{}'", value))?;
    Ok((parse_tag_arg(tag)?, PathBuf::from(path)))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let options = build_options(&args, matches!(args.command, Command::Serve { .. })).await?;

    match &args.command {
        Command::Serve { metrics_addr } => serve(&args, &options, metrics_addr).await,
        Command::Put { guid, hash, parts } => {
            let backend = open_backend(&args, &options).await?;
            let key = CacheKey::from_hex(guid, hash)?;
            put(backend.as_ref(), key, parts).await?;
            backend.shutdown().await
        }
        Command::Get {
            guid,
            hash,
            tag,
            output,
        } => {
            let backend = open_backend(&args, &options).await?;
            let key = CacheKey::from_hex(guid, hash)?;
            get(backend.as_ref(), key, *tag, output.as_ref()).await?;
            backend.shutdown().await
        }
        Command::Info { guid, hash } => {
            let backend = open_backend(&args, &options).await?;
            let key = CacheKey::from_hex(guid, hash)?;
            match backend.get_info(&key).await? {
                Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                None => {
                    backend.shutdown().await?;
                    return Err(Error::NotFound(key.to_string()));
                }
            }
            backend.shutdown().await
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so `get` can stream to stdout
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Options
// =============================================================================

async fn build_options(args: &Args, cluster: bool) -> Result<CacheOptions> {
    let mut builder = OptionsBuilder::new();

    if let Some(path) = &args.config {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let document: serde_json::Value = serde_json::from_slice(&raw)?;
        builder = builder.with_config(&document);
    }
    if let Some(path) = &args.cache_path {
        builder = builder.set(CACHE_PATH_OPTION, path.clone());
    }
    if let Some(capacity) = args.capacity {
        builder = builder.set("cache_membuf.capacity", capacity);
    }
    if let Some(page_size) = args.page_size {
        builder = builder.set("cache_membuf.page_size", page_size);
    }
    if cluster {
        builder = builder.set("cache_membuf.cluster", true);
    }

    builder.build()
}

async fn open_backend(args: &Args, options: &CacheOptions) -> Result<Arc<dyn CacheBackend>> {
    if let Some(socket) = &args.socket {
        let stream = tokio::net::UnixStream::connect(socket).await.map_err(|e| {
            Error::CoordinatorUnavailable(format!("{}: {}", socket.display(), e))
        })?;
        let worker = ClusterWorker::connect(stream)?;
        worker.init(options).await?;
        return Ok(Arc::new(worker));
    }

    let backend = backend_by_name(&args.backend)?;
    backend.init(options).await?;
    Ok(backend)
}

// =============================================================================
// Client Commands
// =============================================================================

async fn put(backend: &dyn CacheBackend, key: CacheKey, parts: &[(PartTag, PathBuf)]) -> Result<()> {
    let trx = backend.create_transaction(key).await?;

    for (tag, path) in parts {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let mut writer = trx.get_write_stream(*tag, size)?;
        tokio::io::copy(&mut file, &mut writer).await?;
        writer.shutdown().await?;
    }

    backend.end_transaction(&trx).await?;
    info!(key = %key, parts = parts.len(), "Stored artifact");
    Ok(())
}

async fn get(
    backend: &dyn CacheBackend,
    key: CacheKey,
    tag: PartTag,
    output: Option<&PathBuf>,
) -> Result<()> {
    let mut stream = backend.get_read_stream(&key, tag).await?;
    let size = stream.size();

    match output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path).await?;
            tokio::io::copy(&mut stream, &mut file).await?;
            file.flush().await?;
        }
        None => {
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut stream, &mut stdout).await?;
            stdout.flush().await?;
        }
    }

    info!(key = %key, part = %tag, bytes = size, "Read artifact part");
    Ok(())
}

// =============================================================================
// Serve
// =============================================================================

/// Join or lead a cache cluster on the configured socket.
///
/// The coordinator owns the buffer pool and serves worker channels. A worker
/// process only holds its [`ClusterWorker`]: the protocol layer in front of
/// the cache plugs in here and serves its clients through that backend,
/// while this loop watches the coordinator link until shutdown.
async fn serve(args: &Args, options: &CacheOptions, metrics_addr: &str) -> Result<()> {
    if args.backend != CACHE_MEMBUF {
        return Err(Error::Config(format!(
            "serve requires the {} backend, got {}",
            CACHE_MEMBUF, args.backend
        )));
    }

    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        signal.cancel();
    });

    match cluster::elect(&socket).await? {
        Role::Coordinator(listener) => {
            let backend = MembufBackend::new();
            backend.init(options).await?;

            let exporter = Arc::new(Exporter::new(backend.metrics())?);
            let addr = metrics_addr.to_string();
            tokio::spawn(async move {
                if let Err(e) = run_http_server(&addr, exporter).await {
                    error!("Metrics server error: {}", e);
                }
            });

            info!(socket = %socket.display(), "Coordinator ready");
            let result = cluster::accept_workers(&listener, &backend, shutdown).await;

            backend.shutdown().await?;
            let _ = std::fs::remove_file(&socket);
            result
        }
        Role::Worker(stream) => {
            let worker = ClusterWorker::connect(stream)?;
            worker.init(options).await?;
            info!(socket = %socket.display(), "Worker ready");

            // Coordinator loss is terminal for this worker
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if worker.is_closed() {
                            return Err(Error::CoordinatorUnavailable("coordinator exited".into()));
                        }
                    }
                }
            }
            worker.shutdown().await
        }
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Mirrors [`CacheMetrics`] into a prometheus registry on every scrape
struct Exporter {
    registry: prometheus::Registry,
    source: Arc<CacheMetrics>,
    hits: prometheus::IntGauge,
    misses: prometheus::IntGauge,
    commits: prometheus::IntGauge,
    aborts: prometheus::IntGauge,
    evictions: prometheus::IntGauge,
    evicted_bytes: prometheus::IntGauge,
    used_bytes: prometheus::IntGauge,
    entries: prometheus::IntGauge,
    hit_ratio: prometheus::Gauge,
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registry: {}", e))
}

impl Exporter {
    fn new(source: Arc<CacheMetrics>) -> Result<Self> {
        let registry = prometheus::Registry::new();
        let int_gauge = |name: &str, help: &str| -> Result<prometheus::IntGauge> {
            let gauge = prometheus::IntGauge::new(name, help).map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            Ok(gauge)
        };

        let hits = int_gauge("assetcache_read_hits", "Reads served from the cache")?;
        let misses = int_gauge("assetcache_read_misses", "Reads of absent parts")?;
        let commits = int_gauge("assetcache_commits", "Committed transactions")?;
        let aborts = int_gauge("assetcache_aborts", "Abandoned transactions")?;
        let evictions = int_gauge("assetcache_evictions", "Entries evicted")?;
        let evicted_bytes = int_gauge("assetcache_evicted_bytes", "Bytes evicted")?;
        let used_bytes = int_gauge("assetcache_used_bytes", "Bytes held by entries")?;
        let entries = int_gauge("assetcache_entries", "Committed entries")?;

        let hit_ratio = prometheus::Gauge::new("assetcache_hit_ratio", "Read hit ratio")
            .map_err(metrics_error)?;
        registry
            .register(Box::new(hit_ratio.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            source,
            hits,
            misses,
            commits,
            aborts,
            evictions,
            evicted_bytes,
            used_bytes,
            entries,
            hit_ratio,
        })
    }

    fn render(&self) -> Result<Vec<u8>> {
        use prometheus::{Encoder, TextEncoder};

        let snapshot = self.source.snapshot();
        let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        self.hits.set(as_i64(snapshot.hits));
        self.misses.set(as_i64(snapshot.misses));
        self.commits.set(as_i64(snapshot.commits));
        self.aborts.set(as_i64(snapshot.aborts));
        self.evictions.set(as_i64(snapshot.evictions));
        self.evicted_bytes.set(as_i64(snapshot.evicted_bytes));
        self.used_bytes.set(as_i64(snapshot.used_bytes));
        self.entries.set(as_i64(snapshot.entries));
        self.hit_ratio.set(snapshot.hit_ratio);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok(buffer)
    }
}

async fn run_http_server(addr: &str, exporter: Arc<Exporter>) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    fn route(exporter: &Exporter, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => text(StatusCode::OK, "ok"),
            "/metrics" => match exporter.render() {
                Ok(buffer) => {
                    let mut response = text(StatusCode::OK, buffer);
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                    response
                }
                Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            _ => text(StatusCode::NOT_FOUND, "not found"),
        }
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let exporter = Arc::clone(&exporter);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = route(&exporter, req);
                async move { Ok::<_, std::convert::Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
