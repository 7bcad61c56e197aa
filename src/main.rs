use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use fleetnet::cli::{format_dry_run, Args};
use fleetnet::config::load_node_config_file;
use fleetnet::logging::init_logging;
use fleetnet::node::CloudNode;
use fleetnet::process::{LocalTemplateStorage, ProcessServiceManager};
use fleetnet::scheduler::LoadScoringScheduler;
use fleetnet::server::create_router;
use fleetnet::service::StaticBlueprints;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_level = init_logging(args.verbose);

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let config_path = args.config_path();
    let config = load_node_config_file(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    // Dry-run mode: print node info and exit
    if args.dry_run {
        println!("{}", format_dry_run(&config, &args));
        return Ok(());
    }

    let templates = LocalTemplateStorage::new(config.templates_dir());
    let manager = Arc::new(ProcessServiceManager::new(config.process_manager(), templates));
    let blueprints = Arc::new(StaticBlueprints::new(
        config.tasks.clone(),
        config.groups.clone(),
    ));

    let node = CloudNode::new(
        &config,
        manager,
        Arc::new(LoadScoringScheduler::default()),
        blueprints,
    );
    node.set_log_level_handle(log_level);
    node.refresh_node_info();
    let heartbeat = node.start_heartbeat(config.heartbeat());

    let addr = args.bind_addr(&config);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Node {} listening on {}", node.local_id(), addr);
    info!("Endpoints:");
    info!("  GET  /health                - Health check");
    info!("  GET  /status                - Node status");
    info!("  POST /v1/cluster/authorize  - Node admission");
    info!("  POST /v1/cluster/packets    - Node packets");

    let app = create_router(node.clone());
    let mut server_shutdown = node.shutdown_signal();
    let server = tokio::spawn(async move {
        let stopped = async move {
            let _ = server_shutdown.wait_for(|stopped| *stopped).await;
        };
        axum::serve(listener, app).with_graceful_shutdown(stopped).await
    });

    let console = tokio::spawn(run_console(node.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = console => info!("Console closed"),
    }

    node.shutdown().await;
    let _ = heartbeat.await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
    }
    Ok(())
}

/// Read operator commands from stdin until `stop` or end of input
async fn run_console(node: Arc<CloudNode>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line == "stop" || line == "shutdown" {
            break;
        }
        for output in node.execute_command_line(line).await {
            println!("{}", output);
        }
    }
}
