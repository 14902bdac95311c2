//! qrc-client command-line tool.
//!
//! Connects to a Q-SYS Core over QRC, optionally logs in, and runs one
//! command.
//!
//! # Usage
//!
//! ```text
//! qrc-client [OPTIONS] <COMMAND>
//!
//! Commands:
//!   status                              Print the StatusGet result
//!   watch --component <NAME> --control <CTRL>...
//!                                       Auto-poll controls until Ctrl-C
//!   call <METHOD> [--params <JSON>]     Send any method, print its result
//!
//! Options:
//!   --config   <PATH>   Config file [default: platform config dir]
//!   --host     <HOST>   Core hostname or IP
//!   --port     <PORT>   QRC port
//!   --username <USER>   Logon user
//!   --password <PASS>   Logon password
//! ```
//!
//! # Environment variable overrides
//!
//! CLI args take precedence over environment variables, which take
//! precedence over the config file.
//!
//! | Variable        | Overrides               |
//! |-----------------|-------------------------|
//! | `QSYS_CONFIG`   | config file path        |
//! | `QSYS_HOST`     | `core.host`             |
//! | `QSYS_PORT`     | `core.port`             |
//! | `QSYS_USERNAME` | `credentials.username`  |
//! | `QSYS_PASSWORD` | `credentials.password`  |
//!
//! When the primary Core refuses the connection and `core.redundant_host`
//! is set, the backup Core is tried.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use qrc_client::infrastructure::storage::config::{load_config, load_config_from, AppConfig};
use qrc_client::{Connection, ConnectionEvent, QrcClient};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Q-SYS Remote Control (QRC) client.
#[derive(Debug, Parser)]
#[command(name = "qrc-client", about = "Command-line client for the Q-SYS QRC protocol", version)]
struct Cli {
    /// Config file to read instead of the platform default.
    #[arg(long, env = "QSYS_CONFIG")]
    config: Option<PathBuf>,

    /// Hostname or IP address of the Core.
    #[arg(long, env = "QSYS_HOST")]
    host: Option<String>,

    /// QRC port of the Core.
    #[arg(long, env = "QSYS_PORT")]
    port: Option<u16>,

    /// User for `Logon`.  Omit on Cores without access control.
    #[arg(long, env = "QSYS_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "QSYS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the Core's StatusGet result.
    Status,

    /// Create a change group, auto-poll it, and print updates until Ctrl-C.
    Watch {
        /// Named component holding the controls.
        #[arg(long)]
        component: String,

        /// Control to watch; repeat for several.
        #[arg(long = "control", required = true)]
        controls: Vec<String>,

        #[arg(long, default_value = "qrc-client")]
        group_id: String,

        /// Auto-poll interval in seconds.
        #[arg(long, default_value_t = 1.0)]
        rate: f64,
    },

    /// Send any QRC method and print its result.
    Call {
        method: String,

        /// JSON object passed as params.
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("failed to load configuration")?;
    apply_overrides(&mut config, &cli);
    config.validate().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    info!(host = %config.core.host, port = config.core.port, "qrc-client starting");

    let (client, events) = connect_with_failover(&config).await?;
    tokio::spawn(log_events(events));

    let result = run(&client, &config, cli.command).await;
    client.disconnect().await;
    result
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(host) = &cli.host {
        config.core.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.core.port = port;
    }
    if let Some(username) = &cli.username {
        config.credentials.username = Some(username.clone());
    }
    if let Some(password) = &cli.password {
        config.credentials.password = Some(password.clone());
    }
}

/// Connects to the primary Core, then to the redundant one if configured.
async fn connect_with_failover(
    config: &AppConfig,
) -> anyhow::Result<(QrcClient<Connection>, mpsc::Receiver<ConnectionEvent>)> {
    let hosts = std::iter::once(config.core.host.as_str()).chain(config.core.redundant_host.as_deref());
    let mut last_error = None;

    for host in hosts {
        let (connection, events) = Connection::new(config.connection_config_for(host));
        let client = QrcClient::new(connection, config.request_timeout());
        match client.connect().await {
            Ok(()) => return Ok((client, events)),
            Err(e) => {
                warn!(host, error = %e, "could not reach Core");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(e).context("no Core reachable"),
        None => bail!("no Core host configured"),
    }
}

async fn run(client: &QrcClient<Connection>, config: &AppConfig, command: Command) -> anyhow::Result<()> {
    if let Some(user) = &config.credentials.username {
        let password = config.credentials.password.as_deref().unwrap_or_default();
        client.login(user, password).await.context("login failed")?;
    }

    match command {
        Command::Status => {
            let status = client.request_status().await.context("StatusGet failed")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Call { method, params } => {
            let params: Value = serde_json::from_str(&params).context("--params is not valid JSON")?;
            let result = client.call(&method, params).await.with_context(|| format!("{method} failed"))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Watch {
            component,
            controls,
            group_id,
            rate,
        } => watch(client, &group_id, &component, controls, rate).await?,
    }
    Ok(())
}

async fn watch(
    client: &QrcClient<Connection>,
    group_id: &str,
    component: &str,
    controls: Vec<String>,
    rate: f64,
) -> anyhow::Result<()> {
    // Subscribe first so the initial push is not missed.
    let mut updates = client.change_group_updates(group_id);
    client
        .create_change_group(group_id, component, controls)
        .await
        .context("failed to create change group")?;
    client
        .set_auto_poll(group_id, rate)
        .await
        .context("failed to enable auto-poll")?;
    info!(group = group_id, "watching; press Ctrl-C to stop");

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    warn!("update stream ended");
                    break;
                };
                for change in update.changes {
                    let name = match &change.component {
                        Some(component) => format!("{component}.{}", change.name),
                        None => change.name.clone(),
                    };
                    let shown = change
                        .string
                        .clone()
                        .or_else(|| change.value.as_ref().map(Value::to_string))
                        .unwrap_or_default();
                    println!("{name} = {shown}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    if let Err(e) = client.destroy_change_group(group_id).await {
        warn!(group = group_id, error = %e, "could not destroy change group");
    }
    Ok(())
}

async fn log_events(mut events: mpsc::Receiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::StateChanged(state) => info!(?state, "connection state"),
            ConnectionEvent::Notification(notification) => {
                info!(method = %notification.method, params = %notification.params, "notification")
            }
            ConnectionEvent::Failed(reason) => error!(%reason, "connection failed"),
        }
    }
}
