use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::watch;

use bridge_common::common::Result;
use bridge_common::config::config::BridgeConfig;
use bridge_common::service::Service;

use bridge_database::discovery::backend::BackendRegistry;
use bridge_database::script::ScriptHost;
use bridge_database::service::mysql::{MasterService, ProxyService};

fn load_script(path: &Option<String>) -> Result<Arc<ScriptHost>> {
    match path {
        Some(path) if !path.is_empty() => {
            info!("loading connection script {}", path);
            Ok(Arc::new(ScriptHost::from_file(path)?))
        }
        _ => Ok(Arc::new(ScriptHost::disabled())),
    }
}

/// Start both listeners and run until ctrl-c, then signal every connection
/// to wind down through its cleanup hook.
pub async fn run(config: Arc<BridgeConfig>) -> Result<()> {
    let backends = Arc::new(BackendRegistry::from_config(
        &config.proxy.backend_addresses,
        &config.proxy.read_only_backend_addresses,
    ));
    let proxy_script = load_script(&config.proxy.script)?;
    let master_script = load_script(&config.master.script)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = ProxyService::new(
        config.clone(),
        backends.clone(),
        proxy_script,
        shutdown_rx.clone(),
    );
    let master = MasterService::new(config.clone(), master_script, shutdown_rx);

    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy.serve().await {
            error!("proxy listener failed: {}", e);
        }
    });
    let master_task = tokio::spawn(async move {
        if let Err(e) = master.serve().await {
            error!("master listener failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        let _ = proxy_task.await;
        let _ = master_task.await;
    })
    .await;

    for status in backends.stats() {
        info!(
            "backend {} {:?} clients={} pooled={}",
            status.addr, status.state, status.connected_clients, status.pooled
        );
    }
    Ok(())
}
