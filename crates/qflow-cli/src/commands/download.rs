//! Download command implementation.

use anyhow::Result;

use qflow_core::client::DownloadOutcome;
use qflow_core::transfer::progress::format_bytes;
use qflow_core::transfer::DownloadRequest;

use super::{DownloadArgs, GlobalArgs};
use crate::ui::ProgressLine;

/// Run the download command.
pub async fn run(args: DownloadArgs, global: &GlobalArgs) -> Result<()> {
    let (client, credentials) = super::connect(global, args.threads)?;

    let mut request = match (&args.file_id, &args.path) {
        (Some(file_id), _) => DownloadRequest::by_id(file_id),
        (None, Some(path)) => DownloadRequest::by_path(path),
        (None, None) => anyhow::bail!("Either --file-id or --path is required"),
    };
    request.options.resume = args.resume;
    request.options.overwrite = args.overwrite;
    request.options.threads = args.threads;
    request.local_path = Some(args.output.display().to_string());

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    if global.human() {
        crate::ui::banner();
        println!("  Downloading to {}", args.output.display());
        println!();
    }

    let label = args
        .output
        .file_name()
        .map_or_else(|| "download".to_string(), |n| n.to_string_lossy().into_owned());
    let progress = ProgressLine::new(label, global.human());

    let result = client
        .download_file(&credentials, request, &args.output, |done, total| {
            progress.update(done, total);
        })
        .await;
    progress.finish();

    match result {
        Ok(outcome) => report(&outcome, global),
        Err(e) => {
            if global.human() {
                eprintln!();
                eprintln!("  Download failed: {}", e);
                if let Some(hint) = e.suggestion() {
                    eprintln!("  {}", hint);
                }
                if e.is_recoverable() {
                    eprintln!("  Run again with --resume to continue where it stopped.");
                }
                eprintln!();
            }
            Err(e.into())
        }
    }
}

fn report(outcome: &DownloadOutcome, global: &GlobalArgs) -> Result<()> {
    if global.json {
        let output = serde_json::json!({
            "task_id": outcome.task_id,
            "path": outcome.path,
            "size": outcome.size,
            "resumed_from": outcome.resumed_from,
            "checksum": outcome.checksum,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if global.quiet {
        println!("{}", outcome.path.display());
    } else {
        println!();
        println!("  Download complete!");
        println!();
        println!("  Saved to: {}", outcome.path.display());
        println!("  Size:     {}", format_bytes(outcome.size));
        if outcome.resumed_from > 0 {
            println!("  Resumed:  from {}", format_bytes(outcome.resumed_from));
        }
        if let Some(checksum) = &outcome.checksum {
            println!("  Checksum: {} (verified)", checksum);
        }
        println!();
    }
    Ok(())
}
