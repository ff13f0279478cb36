use std::{io, process::exit};

use burrow_tunnel::{app::AppContext, server::run_server, tls};
use tokio::{net::TcpListener, task::LocalSet};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(config)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        eprintln!("Server finished with error: {error}\n\nDebug print: {error:?}");
        exit(1);
    }
}

async fn async_main(config: Config) -> io::Result<()> {
    let tls_config = tls::server_config(&config.server_cert, &config.server_key, config.root_ca.as_deref())?;

    let listener = TcpListener::bind(&config.listen_addr).await?;

    let ctx = AppContext::new();
    let cancel = ctx.cancel.clone();
    tokio::task::spawn_local(async move {
        wait_for_shutdown_signal().await;
        cancel.cancel();
    });

    run_server(listener, tls_config, ctx).await
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
