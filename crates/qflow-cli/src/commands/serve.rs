//! Serve command implementation.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use qflow_core::transfer::TransferCoordinator;
use qflow_core::web::WebServer;

use super::{GlobalArgs, ServeArgs};

/// Run the serve command.
pub async fn run(args: ServeArgs, global: &GlobalArgs) -> Result<()> {
    let mut config = super::load_config(args.config.as_ref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.localhost_only {
        config.server.localhost_only = true;
    }
    if let Some(root) = args.root {
        config.storage.root = root;
    }
    config.validate()?;

    let coordinator = Arc::new(
        TransferCoordinator::new(config)
            .await
            .context("Failed to start transfer coordinator")?,
    );
    let restored = coordinator
        .restore()
        .await
        .context("Failed to restore upload sessions")?;

    let server = WebServer::new(Arc::clone(&coordinator));
    let addr = server.addr();

    if global.human() {
        crate::ui::banner();
        println!("  Listening on http://{}", addr);
        println!(
            "  Storage root: {}",
            coordinator.config().storage.root.display()
        );
        if restored > 0 {
            println!("  Restored {} interrupted upload(s)", restored);
        }
        println!();
        println!("  Press Ctrl+C to stop");
        println!();
    } else if global.json {
        let output = serde_json::json!({
            "listening": addr.to_string(),
            "root": coordinator.config().storage.root,
            "restored": restored,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    let token = CancellationToken::new();
    let sweeper = coordinator.spawn_sweeper(token.clone());

    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        ctrl_c_token.cancel();
    });

    let served = server.serve(token.clone().cancelled_owned()).await;

    token.cancel();
    let _ = sweeper.await;
    let persisted = coordinator.persist_all().await;
    tracing::info!(persisted, "Server stopped");

    if global.human() {
        println!();
        println!("  Server stopped.");
        if persisted > 0 {
            println!("  {} upload(s) saved for resumption.", persisted);
        }
        println!();
    }

    served.context("Server error")
}
