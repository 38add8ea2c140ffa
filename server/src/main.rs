//! Standalone webmux server binary. Configuration comes from WEBMUX_*
//! environment variables; --host and --port override the bind address.

use std::net::SocketAddr;

use common::config;
use common::mux::MuxAdapter;
use common::store::Store;

use server::lifecycle;
use server::web_server::{run_web_server, AppState};

fn main() -> anyhow::Result<()> {
    // Flag overrides must land before the config singleton is built.
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--host" && i + 1 < args.len() {
            std::env::set_var("WEBMUX_HOST", &args[i + 1]);
            i += 2;
            continue;
        }
        if args[i] == "--port" && i + 1 < args.len() {
            std::env::set_var("WEBMUX_PORT", &args[i + 1]);
            i += 2;
            continue;
        }
        i += 1;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::ensure_loaded();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        // The gateway is useless without a working multiplexer; refuse to
        // accept traffic rather than fail every attach.
        match MuxAdapter::new().server_version().await {
            Ok(version) => tracing::info!(%version, "multiplexer available"),
            Err(e) => {
                tracing::error!(error = %e, "tmux is not available, exiting");
                anyhow::bail!("tmux is not available: {e}");
            }
        }

        let store = Store::open(&cfg.data_dir)
            .map_err(|e| anyhow::anyhow!("failed to open store: {e}"))?;
        let state = AppState::new(store);

        lifecycle::spawn_supervisors(&state);

        // Signal → cancel token → gateways close 1001, serve loop drains.
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            lifecycle::shutdown_signal().await;
            tracing::info!("shutdown signal received");
            lifecycle::spawn_shutdown_watchdog();
            shutdown.cancel();
        });

        let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address: {e}"))?;
        run_web_server(state, addr).await?;

        // Grace period for close frames still in socket buffers; the store
        // closes when it drops at the end of this block.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        tracing::info!("webmux stopped");
        Ok(())
    })
}
