//! `ember-chat`: console chat on the Ember runtime, or the TCP broker hub
//! that lets several chat processes talk to each other.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ember_runtime::chat::Chat;
use ember_runtime::config::{BROKER_URI_KEY, SHUTDOWN_TIMEOUT_KEY};
use ember_runtime::logging::{self, LogFormat};
use ember_runtime::{BrokerHub, HubConfig, RuntimeConfig, ServiceRunner};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ember-chat", version, about = "Console chat on the Ember service runtime")]
struct Cli {
    /// Log filter directives. Overrides `RUST_LOG`.
    #[arg(long, global = true)]
    log: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join the chat from this console.
    Chat {
        /// Broker connection URI: `memory://` or `tcp://host:port`.
        #[arg(long, env = "EMBER_BROKER_URI", default_value = "memory://")]
        broker_uri: String,

        /// How long shutdown waits for running work, in milliseconds.
        #[arg(long, env = "EMBER_SHUTDOWN_TIMEOUT_MS", default_value_t = 5000)]
        shutdown_timeout_ms: u64,
    },

    /// Run a broker hub for `tcp://` chat processes.
    Hub {
        #[arg(long, env = "EMBER_HUB_LISTEN", default_value = "127.0.0.1:7878")]
        listen: SocketAddr,

        /// Frames queued per connection before further ones are dropped.
        #[arg(long, default_value_t = 256)]
        outbound_capacity: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init(cli.log.as_deref(), cli.log_format) {
        eprintln!("ember-chat: {err:#}");
        return ExitCode::FAILURE;
    }

    let outcome = match cli.command {
        Command::Chat {
            broker_uri,
            shutdown_timeout_ms,
        } => run_chat(&chat_settings(broker_uri, shutdown_timeout_ms)).await,
        Command::Hub {
            listen,
            outbound_capacity,
        } => {
            run_hub(HubConfig {
                host: listen.ip().to_string(),
                port: listen.port(),
                outbound_channel_capacity: outbound_capacity,
                ..HubConfig::default()
            })
            .await
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "ember-chat failed");
            eprintln!("ember-chat: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Configuration map handed to [`RuntimeConfig::from_map`].
fn chat_settings(broker_uri: String, shutdown_timeout_ms: u64) -> HashMap<String, String> {
    HashMap::from([
        (BROKER_URI_KEY.to_string(), broker_uri),
        (SHUTDOWN_TIMEOUT_KEY.to_string(), shutdown_timeout_ms.to_string()),
    ])
}

async fn run_chat(settings: &HashMap<String, String>) -> anyhow::Result<()> {
    let config = RuntimeConfig::from_map(settings)?;
    info!(broker = %config.broker_uri, "starting chat");
    let mut runner = ServiceRunner::new(config);
    runner.add_service(Chat::console())?;
    runner.start().await?;

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            signal.map_err(anyhow::Error::from)
        }
        result = runner.wait() => result,
    };

    runner.stop().await;
    outcome
}

async fn run_hub(config: HubConfig) -> anyhow::Result<()> {
    let host = config.host.clone();
    let mut hub = BrokerHub::new(config);
    let port = hub.start().await?;
    println!("broker hub listening on {host}:{port}");

    hub.serve(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ember_core::BrokerUri;

    use super::*;

    fn chat_config(args: &[&str]) -> anyhow::Result<RuntimeConfig> {
        let cli = Cli::try_parse_from(args)?;
        let Command::Chat {
            broker_uri,
            shutdown_timeout_ms,
        } = cli.command
        else {
            anyhow::bail!("not the chat subcommand");
        };
        Ok(RuntimeConfig::from_map(&chat_settings(
            broker_uri,
            shutdown_timeout_ms,
        ))?)
    }

    #[test]
    fn chat_flags_become_runtime_config() {
        let config = chat_config(&[
            "ember-chat",
            "chat",
            "--broker-uri",
            "tcp://localhost:7878",
            "--shutdown-timeout-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(
            config.broker_uri,
            BrokerUri::Tcp {
                host: "localhost".into(),
                port: 7878
            }
        );
        assert_eq!(config.container.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn bad_broker_uri_is_a_config_error() {
        let err = chat_config(&["ember-chat", "chat", "--broker-uri", "amqp://localhost"])
            .unwrap_err();
        assert!(err.downcast_ref::<ember_runtime::ConfigError>().is_some());
    }
}
