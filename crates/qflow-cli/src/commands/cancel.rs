//! Cancel command implementation.

use anyhow::Result;

use super::{CancelArgs, GlobalArgs};

/// Run the cancel command.
pub async fn run(args: CancelArgs, global: &GlobalArgs) -> Result<()> {
    let (client, credentials) = super::connect(global, None)?;

    if args.download {
        client.cancel_download(&credentials, &args.task_id).await?;
    } else {
        client.cancel_upload(&credentials, &args.task_id).await?;
    }

    if global.json {
        let output = serde_json::json!({
            "task_id": args.task_id,
            "status": "cancelled",
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !global.quiet {
        println!("Cancelled {}", args.task_id);
    }
    Ok(())
}
