// Natter Linux: discovery, link transport and the background messaging service.

mod config;
mod console;
mod discovery;
mod radio;
mod service;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use natter_core::ConversationStore;

use crate::radio::{LanRadio, LocalIdentity};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("natter-linux {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    let cfg = config::load(config_path.as_deref())?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.log_level))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let identity = LocalIdentity {
        address: cfg.device_address()?,
        display_name: cfg.display_name.clone(),
    };
    let radio = LanRadio::bind(identity.clone(), cfg.lan_settings())
        .await
        .with_context(|| format!("binding link port {}", cfg.link_port))?;
    log::info!(
        "Link service listening on port {} as {} ({})",
        radio.link_port(),
        identity.address,
        identity.display_name
    );
    let settings = cfg.service_settings();
    let store = match &settings.data_file {
        Some(path) => ConversationStore::load_or_default(path),
        None => ConversationStore::new(),
    };
    let (handle, service) = service::spawn(Arc::new(radio), store, settings);

    tokio::select! {
        r = console::run(handle.clone()) => {
            if let Err(e) = r {
                log::warn!("Console stopped: {:#}", e);
            }
        }
        r = shutdown_signal() => r?,
    }
    handle.shutdown().await;
    if let Err(e) = service.await {
        log::error!("Service task ended abnormally: {}", e);
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
