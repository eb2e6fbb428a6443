mod config;
mod dispatch;
mod handlers;
mod metrics;
mod node;
mod peer;
mod registry;
mod relay;
mod session;
mod sweeper;
mod util;
mod worker;

use node::NodeState;
use std::env;
use std::path::Path;
use tokio::runtime::Builder;
use tracing::info;

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("PORTICO_CONFIG").unwrap_or_else(|_| "portico.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let node = NodeState::init(config).await.expect("node state");
        let _listeners = node::run_listeners(&node).await.expect("listeners");
        worker::spawn_worker(node.clone());
        sweeper::spawn_sweeper(node.clone());
        peer::spawn_neighbor_bootstrap(&node);
        info!(
            server = %util::abbrev_id(&node.server_id),
            "portico server running"
        );
        tokio::signal::ctrl_c().await.expect("signal");
        info!("shutdown requested");
    });
}
