use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::lantern::{api, client, config, logging, net, server};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let server_enabled = cfg.server.is_some();
    let client_enabled = cfg.client.is_some();
    let api_enabled = !cfg.api_addr.trim().is_empty() && server_enabled;

    if !server_enabled && !client_enabled {
        anyhow::bail!("config: nothing to run (set [server] and/or [client])");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        server_enabled,
        client_enabled,
        api_enabled,
        "lantern: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    if let Some(sc) = &cfg.server {
        let broker = server::Server::new(server::ServerOptions {
            bind_addr: sc.bind_addr.clone(),
            http_bind_addr: sc.http_addr.clone(),
            auth_token: sc.auth_token.clone(),
            allow_ports: sc.allow_ports.clone(),
            reader_idle: sc.reader_idle,
            writer_idle: sc.writer_idle,
            max_payload_bytes: sc.max_payload_bytes,
            max_header_bytes: sc.max_header_bytes,
            buffer_size: sc.buffer_size,
        });

        if api_enabled {
            let api_addr = net::normalize_bind_addr(&cfg.api_addr);
            let addr: SocketAddr = api_addr
                .parse()
                .with_context(|| format!("invalid api_addr: {}", cfg.api_addr))?;
            let state = api::ApiState {
                registry: broker.registry(),
            };
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { api::serve(addr, state, shutdown).await });
        }

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { broker.listen_and_serve(shutdown).await });
    }

    if let Some(cc) = &cfg.client {
        let tunnel_client = client::Client::new(client::ClientOptions {
            server_addr: cc.server_addr.clone(),
            tunnels: cc.tunnels.clone(),
            dial_timeout: cc.dial_timeout,
            request_timeout: cc.request_timeout,
            reader_idle: cc.reader_idle,
            writer_idle: cc.writer_idle,
            max_payload_bytes: cc.max_payload_bytes,
            buffer_size: cc.buffer_size,
        })?;

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { tunnel_client.run(shutdown).await.map_err(Into::into) });
    }

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

    // Drain tasks: exit as soon as they complete; only enforce a timeout if
    // something hangs teardown.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
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
