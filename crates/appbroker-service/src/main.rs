use anyhow::{Context, Result};
use appbroker_core::{CreationRequest, InstanceId};
use appbroker_service::{create_broker, monitoring_config, BrokerConfig};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// One JSON command per input line, e.g.
/// `{"create": {"instance_id": "svc-1", "service_id": "database", "plan_id": "small"}}`
/// or `{"last_operation": {"instance_id": "svc-1"}}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Command {
    Create(CreationRequest),
    LastOperation { instance_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = BrokerConfig::load().context("Failed to load configuration")?;

    appbroker_monitoring::init_logging(&monitoring_config(&config))
        .context("Failed to initialize monitoring")?;

    if let Some(listen) = config.metrics_listen_addr()? {
        appbroker_monitoring::metrics::install_prometheus_exporter(listen)?;
    }

    let broker = create_broker(&config).context("Failed to create broker")?;
    info!("App broker ready, reading commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read command")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command: Command = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed command");
                continue;
            }
        };

        let report = match command {
            Command::Create(request) => broker.create_service_instance(request).await,
            Command::LastOperation { instance_id } => {
                broker.last_operation(&InstanceId(instance_id)).await
            }
        };

        println!("{}", serde_json::to_string(&report)?);
    }

    Ok(())
}
