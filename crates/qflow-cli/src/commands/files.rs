//! Files and quota command implementations.

use anyhow::Result;

use qflow_core::catalog::FileInfo;
use qflow_core::transfer::progress::format_bytes;
use qflow_core::transfer::FileQuery;

use super::{FilesAction, FilesArgs, GlobalArgs};

/// Run the files command.
pub async fn run(args: FilesArgs, global: &GlobalArgs) -> Result<()> {
    let (client, credentials) = super::connect(global, None)?;

    match args.action {
        FilesAction::List { dir, limit } => {
            let list = client
                .list_files(&credentials, &FileQuery { path: dir, limit })
                .await?;

            if global.json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if global.quiet {
                for file in &list.files {
                    println!("{} {}", file.file_id.as_deref().unwrap_or("-"), file.file_path);
                }
            } else {
                println!();
                if list.files.is_empty() {
                    println!("  No files.");
                }
                for file in &list.files {
                    println!("{}", file_row(file));
                }
                if list.total > list.files.len() {
                    println!();
                    println!("  Showing {} of {} files.", list.files.len(), list.total);
                }
                println!();
            }
        }
        FilesAction::Rm { file_id } => {
            let removed = client.delete_file(&credentials, &file_id).await?;
            if global.json {
                println!("{}", serde_json::to_string_pretty(&removed)?);
            } else if !global.quiet {
                println!("Deleted {} ({})", removed.file_path, file_id);
            }
        }
    }
    Ok(())
}

/// Run the quota command.
pub async fn quota(global: &GlobalArgs) -> Result<()> {
    let (client, credentials) = super::connect(global, None)?;

    let quota = client.quota(&credentials).await?;
    let limits = client.limits(&credentials).await?;

    if global.json {
        let output = serde_json::json!({
            "quota": quota,
            "limits": limits,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if global.quiet {
        println!("{} {} {}", quota.used, quota.reserved, quota.total);
        return Ok(());
    }

    println!();
    println!("  Storage");
    println!(
        "    used:       {} of {} ({:.1}%)",
        quota.formatted.used, quota.formatted.total, quota.usage_percentage
    );
    println!("    reserved:   {}", format_bytes(quota.reserved));
    println!("    available:  {}", quota.formatted.available);
    if limits.storage.retention_days > 0 {
        println!("    retention:  {} days", limits.storage.retention_days);
    }
    println!();
    println!("  Limits");
    println!("    max file:   {}", format_bytes(limits.upload.max_file_size));
    println!(
        "    chunks:     {} ({} to {})",
        format_bytes(limits.upload.chunk_size),
        format_bytes(limits.upload.min_chunk_size),
        format_bytes(limits.upload.max_chunk_size)
    );
    println!(
        "    threads:    {} (max {})",
        limits.download.threads, limits.download.max_threads
    );
    println!("    transfers:  {}", limits.upload.max_concurrent_transfers);
    println!(
        "    resume:     {}",
        if limits.download.resume_support { "yes" } else { "no" }
    );
    println!();
    Ok(())
}

/// One table row describing a stored file.
fn file_row(file: &FileInfo) -> String {
    format!(
        "  {:<36}  {:>10}  {}  {}",
        file.file_id.as_deref().unwrap_or("-"),
        format_bytes(file.file_size),
        file.created_at.format("%Y-%m-%d %H:%M"),
        file.file_path
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_row() {
        let file = FileInfo {
            file_id: Some("f-1".into()),
            file_name: "a.txt".into(),
            file_path: "docs/a.txt".into(),
            file_size: 3 * 1024,
            content_type: None,
            checksum: None,
            metadata: std::collections::HashMap::new(),
            created_at: chrono::Utc::now(),
        };
        let row = file_row(&file);
        assert!(row.starts_with("  f-1"));
        assert!(row.contains("3.0 KB"));
        assert!(row.ends_with("docs/a.txt"));
    }
}
