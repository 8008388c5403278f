//! Upload command implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

use qflow_core::client::UploadOptions;
use qflow_core::transfer::progress::format_bytes;
use qflow_core::transfer::{ChunkAck, CompletedUpload};

use super::{GlobalArgs, UploadArgs};
use crate::ui::ProgressLine;

/// Run the upload command.
pub async fn run(args: UploadArgs, global: &GlobalArgs) -> Result<()> {
    let (client, credentials) = super::connect(global, args.threads)?;

    let total = tokio::fs::metadata(&args.file)
        .await
        .with_context(|| format!("Cannot read {}", args.file.display()))?
        .len();

    if global.human() {
        crate::ui::banner();
        println!("  Uploading {} ({})", args.file.display(), format_bytes(total));
        println!();
    }

    let label = args
        .file
        .file_name()
        .map_or_else(|| "upload".to_string(), |n| n.to_string_lossy().into_owned());
    let progress = ProgressLine::new(label, global.human());
    let sent = AtomicU64::new(0);
    let on_ack = |ack: &ChunkAck| {
        let done = sent.fetch_max(ack.total_received, Ordering::Relaxed).max(ack.total_received);
        progress.update(done, total);
    };

    let result = match &args.resume {
        Some(task_id) => {
            client
                .resume_upload(&credentials, task_id, &args.file, on_ack)
                .await
        }
        None => {
            let mut options = UploadOptions {
                file_name: args.name.clone(),
                remote_dir: args.dir.clone(),
                ..UploadOptions::default()
            };
            options.transfer.overwrite = args.overwrite;
            options.transfer.threads = args.threads;
            if args.no_verify {
                options.transfer.verify_checksum = Some(false);
            }
            client
                .upload_file(&credentials, &args.file, options, on_ack)
                .await
        }
    };
    progress.finish();

    match result {
        Ok(completed) => {
            report(&completed, global)?;
            Ok(())
        }
        Err(e) => {
            if global.human() {
                eprintln!();
                eprintln!("  Upload failed: {}", e);
                if let Some(hint) = e.suggestion() {
                    eprintln!("  {}", hint);
                }
                if e.is_recoverable() {
                    eprintln!("  The task is kept on the server; retry with --resume <TASK_ID>.");
                }
                eprintln!();
            }
            Err(e.into())
        }
    }
}

fn report(completed: &CompletedUpload, global: &GlobalArgs) -> Result<()> {
    if global.json {
        println!("{}", serde_json::to_string_pretty(completed)?);
    } else if global.quiet {
        println!("{}", completed.file_info.file_id.as_deref().unwrap_or(&completed.task_id));
    } else {
        let info = &completed.file_info;
        println!();
        println!("  Upload complete!");
        println!();
        println!("  Task:     {}", completed.task_id);
        if let Some(file_id) = &info.file_id {
            println!("  File id:  {}", file_id);
        }
        println!("  Path:     {}", info.file_path);
        println!("  Size:     {}", format_bytes(info.file_size));
        if let Some(checksum) = &info.checksum {
            println!("  Checksum: {}", checksum);
        }
        println!(
            "  Speed:    {}/s average",
            format_bytes(completed.transfer_stats.average_speed)
        );
        println!();
    }
    Ok(())
}
