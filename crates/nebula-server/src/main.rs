//! The binary entry point for the Nebula session server.

mod client_session;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser;
use nebula_config::{CliArgs, Config, ConfigError};
use nebula_net::{Framed, Listener, ListenerConfig, SessionConfig};

use client_session::{ClientSession, EchoStats};

/// Map validated server settings onto the transport configuration.
fn listener_config(config: &Config) -> Result<ListenerConfig, ConfigError> {
    config.validate()?;
    Ok(ListenerConfig {
        bind_addr: config.bind_addr()?,
        max_connections: config.network.max_connections,
        nodelay: config.network.nodelay,
        session: SessionConfig {
            recv_buffer_size: config.session.recv_buffer_size,
            recv_low_water: config.session.recv_low_water,
            max_recv_buffer_size: config.session.max_recv_buffer_size,
            max_send_queue: config.session.max_send_queue,
        },
    })
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(Config::default_dir);

    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_dir.display());
            std::process::exit(1);
        }
    };
    config.apply_cli_overrides(&args);

    let listener_config = match listener_config(&config) {
        Ok(listener_config) => listener_config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let log_dir = config_dir.join("logs");
    nebula_log::init_logging(Some(&log_dir), config.log.file_logging, Some(&config));

    let stats = Arc::new(EchoStats::default());
    let factory_stats = Arc::clone(&stats);
    let listener = Listener::new(listener_config, move |peer| {
        Framed::new(ClientSession::new(peer, Arc::clone(&factory_stats)))
    });

    let run = listener.run();
    tokio::pin!(run);

    let finished = tokio::select! {
        result = &mut run => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::info!("Interrupt received");
            listener.shutdown();
            run.await
        }
    };

    tracing::info!(
        "Served {} sessions, echoed {} packets ({} bytes)",
        stats.connected.load(Ordering::Relaxed),
        stats.packets.load(Ordering::Relaxed),
        stats.bytes_sent.load(Ordering::Relaxed)
    );

    if let Err(e) = result {
        tracing::error!("Listener failed: {e}");
        std::process::exit(1);
    }
}
