use std::env;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use log::{error, info};
use serde::Deserialize;
use tokio::net::TcpListener;

use fs_meta::{MasterServer, MetadataStore};

const DEFAULT_DATA_DIR: &str = "/var/lib/stripefs";
const DEFAULT_LISTEN: &str = "0.0.0.0:9421";
/// Snapshot the metadata this often.
const SNAPSHOT_INTERVAL_SECS: u64 = 3600;

fn usage() -> String {
    format!(
        "usage: fs-masterd [--data-dir <path>] [--listen <addr:port>] [--config <path>]\n\
         defaults:\n\
         --data-dir {}\n\
         --listen {}",
        DEFAULT_DATA_DIR, DEFAULT_LISTEN
    )
}

#[derive(Debug, Deserialize, Default)]
struct MasterConfig {
    data_dir: Option<PathBuf>,
    listen: Option<String>,
    snapshot_interval_secs: Option<u64>,
}

struct RunOptions {
    data_dir: PathBuf,
    listen: String,
    snapshot_interval_secs: u64,
}

fn parse_args() -> Result<RunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        return Err(usage());
    }

    let mut data_dir: Option<PathBuf> = None;
    let mut listen: Option<String> = None;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --data-dir".to_string())?;
                data_dir = Some(PathBuf::from(value));
            }
            "--listen" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --listen".to_string())?;
                listen = Some(value.clone());
            }
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    let config: MasterConfig = match config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| format!("read config {}: {}", path.display(), e))?;
            serde_json::from_str(&raw)
                .map_err(|e| format!("parse config {}: {}", path.display(), e))?
        }
        None => MasterConfig::default(),
    };

    Ok(RunOptions {
        data_dir: data_dir
            .or(config.data_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
        listen: listen
            .or(config.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
        snapshot_interval_secs: config
            .snapshot_interval_secs
            .unwrap_or(SNAPSHOT_INTERVAL_SECS),
    })
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{}", message);
            exit(2);
        }
    };

    let store = match MetadataStore::open(&options.data_dir) {
        Ok(store) => store,
        Err(err) => {
            error!("cannot open data dir {}: {}", options.data_dir.display(), err);
            exit(1);
        }
    };
    let fs = match store.load() {
        Ok(fs) => fs,
        Err(err) => {
            error!("metadata load failed: {}", err);
            exit(1);
        }
    };
    info!("metadata loaded at version {}", fs.metaversion);

    let server = Arc::new(MasterServer::new(fs));
    let listener = match TcpListener::bind(&options.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot listen on {}: {}", options.listen, err);
            exit(1);
        }
    };

    // Periodic snapshot + changelog rotation.
    let snapshot_server = server.clone();
    let interval = options.snapshot_interval_secs.max(60);
    tokio::spawn(async move {
        let mut timer =
            tokio::time::interval(std::time::Duration::from_secs(interval));
        timer.tick().await; // the immediate first tick
        loop {
            timer.tick().await;
            let fs_arc = snapshot_server.fs();
            let mut fs = fs_arc.lock().unwrap();
            if let Err(err) = store.store(&mut fs) {
                error!("snapshot failed: {}", err);
            }
        }
    });

    if let Err(err) = server.serve(listener).await {
        error!("master terminated: {}", err);
        exit(1);
    }
}
