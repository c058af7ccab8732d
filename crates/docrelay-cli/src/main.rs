//! docrelay
//!
//! Keeps a supervised MongoDB connection alive and reports readiness
//! transitions until interrupted.

use anyhow::Context;
use clap::Parser;
use docrelay_common::{logging, LogLevel};
use docrelay_mongodb::{
    ConnectionConfig, Supervisor, SupervisorConfig, SupervisorState, TransportOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "docrelay")]
#[command(about = "Supervised MongoDB connection with automatic reconnect")]
struct Args {
    /// Database user
    #[arg(long, env = "MONGO_USER")]
    user: Option<String>,

    /// Database password
    #[arg(long, env = "MONGO_PASS", hide_env_values = true)]
    password: Option<String>,

    /// Host list, e.g. "db1:27017,db2:27017"
    #[arg(long, env = "MONGO_HOST")]
    host: Option<String>,

    /// Database to operate on
    #[arg(long, env = "MONGO_DB")]
    database: Option<String>,

    /// Authentication database
    #[arg(long, env = "MONGO_AUTH_DB")]
    auth_database: Option<String>,

    /// Replica set name
    #[arg(long, env = "MONGO_REPSET")]
    replica_set: Option<String>,

    /// Log level (error, warn, info, debug)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds between connection attempts
    #[arg(long, default_value = "5")]
    retry_delay_secs: u64,

    /// Seconds between health-check pings, 0 to disable
    #[arg(long, default_value = "30")]
    health_check_secs: u64,

    /// Maximum connection pool size
    #[arg(long, default_value = "200")]
    max_pool_size: u32,
}

impl Args {
    fn connection_config(&self) -> ConnectionConfig {
        let mut builder = ConnectionConfig::builder().transport(TransportOptions {
            max_pool_size: self.max_pool_size,
            ..TransportOptions::default()
        });
        if let Some(user) = &self.user {
            builder = builder.user(user);
        }
        if let Some(password) = &self.password {
            builder = builder.password(password);
        }
        if let Some(host) = &self.host {
            builder = builder.host(host);
        }
        if let Some(database) = &self.database {
            builder = builder.database(database);
        }
        if let Some(auth_database) = &self.auth_database {
            builder = builder.auth_database(auth_database);
        }
        if let Some(replica_set) = &self.replica_set {
            builder = builder.replica_set(replica_set);
        }
        builder.build()
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            health_check_interval: (self.health_check_secs > 0)
                .then(|| Duration::from_secs(self.health_check_secs)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init(LogLevel::parse(&args.log_level)).context("Failed to install logger")?;

    let config = args.connection_config();
    if let Err(e) = config.validate() {
        warn!("{}", e);
    }

    let supervisor =
        Arc::new(Supervisor::mongo(config).with_settings(args.supervisor_config()));
    let supervisor_task = supervisor.spawn();

    // Report readiness transitions
    let mut states = supervisor.subscribe();
    let watcher = tokio::spawn(async move {
        let mut was_ready = false;
        while states.changed().await.is_ok() {
            let ready = *states.borrow_and_update() == SupervisorState::Ready;
            if ready != was_ready {
                info!(ready, "Mongo status changed");
                was_ready = ready;
            }
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => warn!("Unable to listen for shutdown signal: {}", err),
    }

    supervisor.shutdown();
    supervisor_task
        .await
        .context("Supervisor task panicked")?;
    watcher.abort();
    info!("docrelay stopped");

    Ok(())
}
