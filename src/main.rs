/**
 * main.rs
 *
 * Standalone service binary: wires the location broker to a TCP
 * channel and a logging event sink, then runs until Ctrl-C.
 */

use anyhow::Result;
use lodestone::{EventSink, LocationBroker, LocationResponse, ServerConfig, TcpChannel};
use std::env;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Sink for running without a host event bus: responses go to the log
/// instead of an event store.
struct LogSink;

impl EventSink for LogSink {
    fn submit(&self, response: LocationResponse) -> Result<()> {
        info!(
            "Location response: group={} success={} lat={} lon={} elev={} facing={}",
            response.group_id,
            response.success,
            response.latitude,
            response.longitude,
            response.elevation,
            response.facing,
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = match env::var("LODESTONE_LOG").as_deref() {
        Ok("debug") => Level::DEBUG,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("lodestone starting");

    let config = ServerConfig::from_env();
    info!(
        "Connection server: {}:{}, channel {:?}",
        config.connection_address, config.connection_port, config.channel
    );

    let broker = LocationBroker::spawn(config, TcpChannel::new(), Arc::new(LogSink));

    tokio::signal::ctrl_c().await?;

    info!("Terminating service");
    broker.shutdown().await;

    Ok(())
}
