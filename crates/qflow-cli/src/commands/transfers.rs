//! Transfers command implementation.

use anyhow::Result;

use qflow_core::transfer::TransferQuery;

use super::{GlobalArgs, TransfersArgs};

/// Run the transfers command.
pub async fn run(args: TransfersArgs, global: &GlobalArgs) -> Result<()> {
    let (client, credentials) = super::connect(global, None)?;

    let query = TransferQuery {
        direction: args.direction,
        status: args.status,
        limit: args.limit,
        offset: args.offset,
    };
    let list = client.list_transfers(&credentials, &query).await?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if global.quiet {
        for task in &list.tasks {
            println!("{} {}", task.progress.task_id, task.progress.state);
        }
        return Ok(());
    }

    println!();
    if list.tasks.is_empty() {
        println!("  No transfers.");
    }
    for task in &list.tasks {
        println!("{}  {}", crate::ui::status_row(&task.progress), task.file_path);
        if let Some(error) = &task.error {
            println!("  {:<36}  error: {}", "", error);
        }
    }
    if list.total > list.tasks.len() {
        println!();
        println!("  Showing {} of {} transfers.", list.tasks.len(), list.total);
    }
    println!();
    Ok(())
}
