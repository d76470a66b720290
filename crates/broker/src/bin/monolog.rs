#![forbid(unsafe_code)]

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use fs2::FileExt;
use tokio::sync::watch;
use tracing::{error, info};

use monolog_broker::{
    BrokerServer, Config, Engine, Schedulers, StorageBackend, Transport, TransportMetrics,
};
use monolog_storage::{Db, GroupStore, TopicStore};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("serve") => run_serve(&args[1..]),
        Some("version") => {
            println!("monolog {VERSION}");
            ExitCode::SUCCESS
        }
        Some("help") | Some("-h") | Some("--help") | None => {
            print_usage();
            if args.is_empty() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Some(other) => {
            eprintln!("unknown command: {other}");
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!(
        "monolog - Kafka-shaped single-node message broker

Usage:
  monolog <command> [options]

Commands:
  serve     Start the broker
  version   Print version information
  help      Print this help message

Serve options:
  --config <path>       JSONC config file
  --kafka-addr <addr>   Kafka protocol listen address (default :9092)
  --data-dir <path>     Data directory (default ./data)
  --log-level <level>   debug, info, warn or error (default info)
  --storage <backend>   sqlite or sqlite:memory (default sqlite)
  --auth-token <token>  Require SASL PLAIN with this token"
    );
}

struct ServeFlags {
    config_file: Option<PathBuf>,
    kafka_addr: Option<String>,
    data_dir: Option<PathBuf>,
    log_level: Option<String>,
    storage: Option<String>,
    auth_token: Option<String>,
}

fn parse_serve_flags(args: &[String]) -> Result<ServeFlags, String> {
    let mut flags = ServeFlags {
        config_file: None,
        kafka_addr: None,
        data_dir: None,
        log_level: None,
        storage: None,
        auth_token: None,
    };
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value_for = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{name} requires a value"))
        };
        match flag.as_str() {
            "--config" => flags.config_file = Some(PathBuf::from(value_for("--config")?)),
            "--kafka-addr" => flags.kafka_addr = Some(value_for("--kafka-addr")?),
            "--data-dir" => flags.data_dir = Some(PathBuf::from(value_for("--data-dir")?)),
            "--log-level" => flags.log_level = Some(value_for("--log-level")?),
            "--storage" => flags.storage = Some(value_for("--storage")?),
            "--auth-token" => flags.auth_token = Some(value_for("--auth-token")?),
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    Ok(flags)
}

fn run_serve(args: &[String]) -> ExitCode {
    let flags = match parse_serve_flags(args) {
        Ok(flags) => flags,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    // Flags beat env beats file beats defaults.
    let mut config = match Config::load(flags.config_file.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(addr) = flags.kafka_addr {
        config.kafka_addr = addr;
    }
    if let Some(dir) = flags.data_dir {
        config.data_dir = dir;
    }
    if let Some(level) = flags.log_level {
        config.log_level = level;
    }
    if let Some(backend) = flags.storage {
        config.backend = match StorageBackend::parse(&backend) {
            Ok(backend) => backend,
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
        };
    }
    if let Some(token) = flags.auth_token {
        config.auth_token = Some(token);
    }

    init_tracing(&config.log_level);

    // One process per data directory; the lock file outlives everything else.
    let _lock = match config.backend {
        StorageBackend::Disk => match acquire_data_lock(&config.data_dir) {
            Ok(lock) => Some(lock),
            Err(message) => {
                eprintln!("{message}");
                return ExitCode::FAILURE;
            }
        },
        StorageBackend::Memory => None,
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> Result<(), String> {
    let db = match config.backend {
        StorageBackend::Disk => {
            info!(data_dir = %config.data_dir.display(), "using sqlite storage (disk)");
            Db::open(&config.data_dir).map_err(|err| format!("open store: {err}"))?
        }
        StorageBackend::Memory => {
            info!("using sqlite storage (in-memory)");
            Db::open_in_memory().map_err(|err| format!("open store: {err}"))?
        }
    };
    let topics = Arc::new(TopicStore::open(db.clone()).map_err(|err| format!("load topics: {err}"))?);
    let groups = Arc::new(GroupStore::open(db).map_err(|err| format!("load groups: {err}"))?);
    let engine = Arc::new(Engine::new(topics, groups, config.auto_create_topics));

    let metrics = TransportMetrics::new().map_err(|err| format!("metrics: {err}"))?;
    let transport = Arc::new(Transport::new(
        Arc::clone(&engine),
        metrics.clone(),
        &config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let schedulers = Schedulers::start(
        Arc::clone(&engine),
        Arc::clone(&transport),
        &config,
        shutdown_rx.clone(),
    );

    let server = BrokerServer::bind(
        config.listen_addr(),
        transport,
        engine,
        metrics,
        config.limits.max_connections,
        config.limits.max_message_size,
    )
    .await
    .map_err(|err| format!("bind {}: {err}", config.kafka_addr))?;
    info!(addr = %config.kafka_addr, "kafka listener ready");

    let server_handle = tokio::spawn(server.serve(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| format!("wait for signal: {err}"))?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "server exited with error"),
        Err(err) => error!(error = %err, "server task panicked"),
    }
    schedulers.join().await;
    Ok(())
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("monolog_broker={level},monolog_storage={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Exclusive advisory lock on `<data_dir>/.lock`, held for the process
/// lifetime.  A second broker on the same directory fails fast here instead
/// of corrupting the database.
fn acquire_data_lock(data_dir: &Path) -> Result<std::fs::File, String> {
    fs::create_dir_all(data_dir)
        .map_err(|err| format!("create data dir {}: {err}", data_dir.display()))?;
    let lock_path = data_dir.join(".lock");
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|err| format!("open lock file {}: {err}", lock_path.display()))?;
    file.try_lock_exclusive().map_err(|_| {
        format!(
            "another monolog instance is using data directory {}",
            data_dir.display()
        )
    })?;
    Ok(file)
}
