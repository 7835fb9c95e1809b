use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::*;

use cs_client::Task;
use cs_frames::TransformBuffer;

mod config;

#[derive(Parser, Debug)]
#[command(name = "copter-system")]
struct MainArgs {
    /// Path to the configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = MainArgs::parse();
    let config = match &args.config {
        Some(path) => {
            debug!("reading config from {:?}", path);
            config::CopterSystemConfig::read_from_path(path)
        }
        None => {
            debug!("reading config from the default location");
            config::CopterSystemConfig::read()
        }
    }
    .context("failed to read config file")?;

    let cancel = CancellationToken::new();
    let frames = Arc::new(TransformBuffer::default());

    let bridge = cs_bridge::create_task(config.bridge, config.offboard.local_frame.clone());
    let telemetry =
        cs_telemetry::create_task(config.telemetry.clone(), bridge.events(), frames.clone());
    let setpoint = cs_offboard::SetpointHandle::new();
    let publisher = cs_offboard::create_publisher_task(
        config.offboard.clone(),
        setpoint.clone(),
        frames.clone(),
        bridge.setpoints(),
    );
    let control = cs_offboard::create_control_task(
        config.offboard,
        config.telemetry,
        bridge.services(),
        telemetry.telemetry(),
        frames,
        setpoint,
    );
    let server = cs_server::create_task(config.server, control.cmd());

    let tasks: Vec<Box<dyn Task + Send>> = vec![
        Box::new(bridge),
        Box::new(telemetry),
        Box::new(publisher),
        Box::new(control),
        Box::new(server),
    ];

    let mut names = Vec::new();
    let mut futures = Vec::new();
    for task in tasks {
        let name = task.name();
        debug!("starting {}", name);
        names.push(name);
        futures.push(tokio::spawn(task.run(cancel.clone())));
    }

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, shutting down");
                cancel.cancel();
            }
        }
    });

    info!("ready");

    while !futures.is_empty() {
        let (result, index, remaining) = futures::future::select_all(futures).await;
        let name = names.remove(index);
        futures = remaining;

        match result {
            Ok(Ok(())) => info!("{} task ended, {} remaining", name, futures.len()),
            Ok(Err(err)) => {
                error!("{} task failed, shutting down: {:?}", name, err);
                cancel.cancel();
            }
            Err(err) => {
                error!("{} task panicked, shutting down: {:?}", name, err);
                cancel.cancel();
            }
        }
    }

    info!("exit");

    Ok(())
}
