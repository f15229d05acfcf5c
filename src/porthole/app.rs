use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::porthole::{config, logging, tunnel};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(&path)
        .with_context(|| format!("load config: {}", path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let relay_enabled = cfg.relay.is_some();
    let agent_enabled = cfg.agent.is_some();
    if !relay_enabled && !agent_enabled {
        anyhow::bail!("config: nothing to run (set [relay] and/or [agent])");
    }

    tracing::info!(
        config = %path.display(),
        relay_enabled,
        agent_enabled,
        "porthole: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    if let Some(relay_cfg) = cfg.relay.clone() {
        let state = tunnel::relay::RelayState::new(relay_cfg);
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { tunnel::relay::serve(state, shutdown).await });
    }

    if let Some(agent_cfg) = cfg.agent.clone() {
        let supervisor = tunnel::session::Supervisor::new(agent_cfg)?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { supervisor.run(shutdown).await });
    }

    // Wait for a shutdown signal or an unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks; only enforce a timeout if something hangs.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
