use std::{io, process::exit};

use burrow_tunnel::{
    address::TargetAddress,
    app::AppContext,
    forwarder::{run_forwarder, Remote},
    tls,
};
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
        eprintln!("Forwarder finished with error: {error}\n\nDebug print: {error:?}");
        exit(1);
    }
}

async fn async_main(config: Config) -> io::Result<()> {
    let remote_target = TargetAddress::from_url(&config.remote_url)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error.to_string()))?;

    let (tls_config, server_name) = tls::client_config(
        config.root_ca.as_deref(),
        &config.client_cert,
        &config.client_key,
        &remote_target.host,
        config.insecure_skip_verify,
    )?;

    let listener = TcpListener::bind(&config.listen_addr).await?;

    let ctx = AppContext::new();
    let cancel = ctx.cancel.clone();
    tokio::task::spawn_local(async move {
        wait_for_shutdown_signal().await;
        cancel.cancel();
    });

    run_forwarder(listener, Remote::new(&remote_target, tls_config, server_name), ctx).await
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
