//! Watch command implementation.

use anyhow::Result;
use futures::StreamExt;

use super::{GlobalArgs, WatchArgs};
use crate::ui::ProgressLine;

/// Run the watch command.
pub async fn run(args: WatchArgs, global: &GlobalArgs) -> Result<()> {
    let (client, credentials) = super::connect(global, None)?;

    let mut events = Box::pin(client.watch(&credentials, &args.task_id).await?);
    let progress = ProgressLine::new(&args.task_id, global.human());

    while let Some(event) = events.next().await {
        let event = event?;

        if global.json {
            let output = serde_json::json!({
                "type": event.kind,
                "task": event.snapshot,
                "message": event.message,
            });
            println!("{}", serde_json::to_string(&output)?);
        } else {
            progress.update_from(&event.snapshot);
        }

        match event.kind.as_str() {
            "complete" => {
                progress.finish();
                if global.human() {
                    println!();
                    println!("  Transfer {}.", event.snapshot.state);
                    println!();
                }
                return Ok(());
            }
            "error" => {
                progress.finish();
                let message = event
                    .message
                    .unwrap_or_else(|| format!("transfer {}", event.snapshot.state));
                anyhow::bail!("Task {} failed: {}", args.task_id, message);
            }
            _ => {}
        }
    }

    progress.finish();
    anyhow::bail!("Event stream for {} ended early", args.task_id)
}
