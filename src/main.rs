pub mod config;
pub mod env_file;
pub mod schema;
pub mod db {
    pub mod metadata;
    pub mod models;
    pub mod readings;
    #[cfg(test)]
    pub mod testing;
}
pub mod services {
    pub mod broker;
    pub mod payload;
    pub mod processor;
    pub mod queue;
    pub mod topic;
}

use crate::config::Config;
use crate::services::broker::BrokerClient;
use crate::services::processor::PayloadProcessor;
use crate::services::queue::{self, QueueMessage, WorkerPool};
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info, warn};
use std::ffi::OsString;
use std::io::BufRead;
use std::path::PathBuf;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Subscribe to the broker and process messages until killed (default)
    Consume,
    /// Process a single message synchronously
    Handle { topic: String, payload: String },
    /// Read `{"t": ..., "p": ...}` lines from stdin into the work queue
    Produce,
}

#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    env_file: Option<PathBuf>,
    command: Command,
}

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
    applied: usize,
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn run(command: Command) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (mqtt={}:{}, tls={}, topics={}, qos={:?}, workers={}, queue_capacity={}, timestamp_source={:?})",
        cfg.mqtt.host,
        cfg.mqtt.port,
        cfg.mqtt.tls,
        cfg.mqtt.topics.join(","),
        cfg.mqtt.qos,
        cfg.worker_count,
        cfg.queue_capacity,
        cfg.timestamp_source
    );

    // 2) Connect DB
    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    apply_database_migrations(&mut conn)?;

    let processor = PayloadProcessor::new(cfg.timestamp_source);

    // 4) Dispatch
    match command {
        Command::Handle { topic, payload } => {
            let rows = processor
                .handle(&mut conn, &QueueMessage::new(topic.as_str(), payload))
                .map_err(|e| format!("handling message on {} failed: {}", topic, e))?;
            info!("Stored {} reading(s) from {}", rows, topic);
            Ok(())
        }
        Command::Produce => {
            drop(conn);
            let (queue, rx) = queue::channel(cfg.queue_capacity);
            let pool = WorkerPool::spawn(cfg.worker_count, rx, &cfg.database_url, processor)?;

            let mut accepted = 0usize;
            for (index, line) in std::io::stdin().lock().lines().enumerate() {
                let line = line.map_err(|e| format!("reading stdin failed: {}", e))?;
                if line.trim().is_empty() {
                    continue;
                }
                match queue::parse_producer_line(&line) {
                    Ok(msg) => {
                        queue
                            .send_blocking(msg)
                            .map_err(|e| format!("queueing line {} failed: {}", index + 1, e))?;
                        accepted += 1;
                    }
                    Err(e) => warn!("Skipping stdin line {}: {}", index + 1, e),
                }
            }
            info!("Queued {} message(s) from stdin; waiting for workers", accepted);

            // closing the queue lets the workers drain and exit
            drop(queue);
            pool.join();
            Ok(())
        }
        Command::Consume => {
            drop(conn);
            let (queue, rx) = queue::channel(cfg.queue_capacity);
            let _pool = WorkerPool::spawn(cfg.worker_count, rx, &cfg.database_url, processor)?;
            BrokerClient::new(cfg.mqtt, queue).run_forever()
        }
    }
}

fn parse_args<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;
    let mut positional: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                env_file = Some(PathBuf::from(path_str));
            }
            Some("--") => {
                for rest in args.by_ref() {
                    positional.push(rest.into_string().map_err(|_| "argument contains invalid UTF-8".to_string())?);
                }
            }
            Some(s) if s.starts_with("--") => return Err(format!("unrecognised argument: {}", s)),
            Some(s) => positional.push(s.to_string()),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }

    let command = match positional.as_slice() {
        [] => Command::Consume,
        [cmd] if cmd == "consume" => Command::Consume,
        [cmd] if cmd == "produce" => Command::Produce,
        [cmd, topic, payload] if cmd == "handle" => Command::Handle {
            topic: topic.clone(),
            payload: payload.clone(),
        },
        [cmd, ..] if cmd == "handle" => return Err("usage: handle <topic> <payload>".to_string()),
        [cmd, ..] if cmd == "consume" || cmd == "produce" => return Err(format!("`{}` takes no arguments", cmd)),
        [cmd, ..] => return Err(format!("unrecognised command: {}", cmd)),
    };

    Ok(CliArgs { env_file, command })
}

fn load_env(explicit: Option<PathBuf>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        let applied = env_file::load(&path)?;
        return Ok(Some(LoadedEnvFile {
            path,
            explicit: true,
            applied,
        }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if !default_path.is_file() {
        return Ok(None);
    }
    let applied = env_file::load(&default_path)?;
    Ok(Some(LoadedEnvFile {
        path: default_path,
        explicit: false,
        applied,
    }))
}

fn main() {
    let (command, loaded_env) = match parse_args(std::env::args_os().skip(1))
        .and_then(|cli| load_env(cli.env_file).map(|env| (cli.command, env)))
    {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!(
            "Environment loaded from {} .env file: {} ({} variable(s) applied)",
            origin,
            info.path.display(),
            info.applied
        );
    }

    info!(
        "mqtt-timescale {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(command) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
