//! Status command implementation.

use anyhow::Result;

use qflow_core::transfer::progress::format_bytes;

use super::{GlobalArgs, StatusArgs};

/// Run the status command.
pub async fn run(args: StatusArgs, global: &GlobalArgs) -> Result<()> {
    let (client, credentials) = super::connect(global, None)?;

    let tasks = client.batch_status(&credentials, &args.task_ids).await?;

    let mut reports = Vec::new();
    if args.ranges {
        for task in &tasks {
            reports.push(client.ranges(&credentials, &task.task_id).await?);
        }
    }

    if global.json {
        let output = serde_json::json!({
            "tasks": tasks,
            "ranges": reports,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let unknown: Vec<_> = args
        .task_ids
        .iter()
        .filter(|id| !tasks.iter().any(|t| &t.task_id == *id))
        .collect();

    if global.quiet {
        for task in &tasks {
            println!("{} {}", task.task_id, task.state);
        }
    } else {
        println!();
        for task in &tasks {
            println!("{}", crate::ui::status_row(task));
        }
        for id in &unknown {
            println!("  {:<36}  unknown", id);
        }

        for report in &reports {
            println!();
            println!(
                "  {} ({} in chunks of {})",
                report.task_id,
                format_bytes(report.total),
                format_bytes(report.chunk_size)
            );
            println!("    received: {}", spans(&report.received));
            println!("    missing:  {}", spans(&report.missing));
        }
        println!();
    }

    if tasks.is_empty() {
        anyhow::bail!("No such task");
    }
    Ok(())
}

fn spans(ranges: &[(u64, u64)]) -> String {
    if ranges.is_empty() {
        return "none".to_string();
    }
    ranges
        .iter()
        .map(|(start, end)| format!("{start}..{end}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans() {
        assert_eq!(spans(&[]), "none");
        assert_eq!(spans(&[(0, 10), (20, 30)]), "0..10, 20..30");
    }
}
