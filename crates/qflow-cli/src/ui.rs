//! UI utilities for qflow CLI.

use std::io::{self, Write};
use std::time::Instant;

use qflow_core::transfer::progress::{format_bytes, format_speed, percent};
use qflow_core::transfer::ProgressSnapshot;

const BAR_WIDTH: usize = 24;

/// Single-line progress display rewritten in place.
pub struct ProgressLine {
    label: String,
    started: Instant,
    enabled: bool,
}

impl ProgressLine {
    /// Create a progress line; a disabled one prints nothing.
    #[must_use]
    pub fn new(label: impl Into<String>, enabled: bool) -> Self {
        Self {
            label: label.into(),
            started: Instant::now(),
            enabled,
        }
    }

    /// Redraw with `done` of `total` bytes.
    pub fn update(&self, done: u64, total: u64) {
        if !self.enabled {
            return;
        }
        let secs = self.started.elapsed().as_secs_f64();
        let speed = if secs > 0.0 { (done as f64 / secs) as u64 } else { 0 };
        print!(
            "\r  {} {} {:>3}% {} / {} - {}    ",
            self.label,
            bar(percent(done, total)),
            percent(done, total),
            format_bytes(done),
            format_bytes(total),
            format_speed(speed)
        );
        let _ = io::stdout().flush();
    }

    /// Redraw from a server snapshot.
    pub fn update_from(&self, snapshot: &ProgressSnapshot) {
        if !self.enabled {
            return;
        }
        let eta = snapshot.eta_human.as_deref().unwrap_or("--");
        print!(
            "\r  {} {} {:>3}% {} / {} - {} - ETA: {}    ",
            self.label,
            bar(snapshot.progress),
            snapshot.progress,
            format_bytes(snapshot.transferred),
            format_bytes(snapshot.total),
            snapshot.speed_human,
            eta
        );
        let _ = io::stdout().flush();
    }

    /// End the line.
    pub fn finish(&self) {
        if self.enabled {
            println!();
        }
    }
}

/// Render a percentage as a fixed-width bar.
fn bar(percent: u8) -> String {
    let filled = usize::from(percent.min(100)) * BAR_WIDTH / 100;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

/// Print the startup banner.
pub fn banner() {
    println!();
    println!("qflow v{}", qflow_core::VERSION);
    println!("{}", "-".repeat(37));
    println!();
}

/// One table row describing a task.
#[must_use]
pub fn status_row(snapshot: &ProgressSnapshot) -> String {
    format!(
        "  {:<36}  {:<8}  {:<9}  {:>3}%  {:>10} / {:<10}  {}",
        snapshot.task_id,
        snapshot.direction,
        snapshot.state,
        snapshot.progress,
        format_bytes(snapshot.transferred),
        format_bytes(snapshot.total),
        snapshot.speed_human
    )
}
