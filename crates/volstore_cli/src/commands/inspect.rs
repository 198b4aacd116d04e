//! Inspect command implementation.

use super::Context;
use serde::Serialize;
use volstore_core::VolumeInfo;

/// Volume inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Volume directory.
    pub path: String,
    /// Volume id.
    pub volume: u32,
    /// Generation being served.
    pub generation: u64,
    /// Data file size in bytes.
    pub size: u64,
    /// Number of live needles.
    pub needle_count: usize,
    /// Bytes of records backing live needles.
    pub live_bytes: u64,
    /// Bytes compaction can reclaim.
    pub garbage_bytes: u64,
    /// Reclaimable fraction of the data file.
    pub garbage_ratio: f64,
    /// Whether writes are refused.
    pub read_only: bool,
    /// Whether the volume is sealed.
    pub sealed: bool,
    /// Vacuum phase.
    pub phase: String,
}

impl InspectResult {
    fn new(path: String, info: &VolumeInfo) -> Self {
        Self {
            path,
            volume: info.id.as_u32(),
            generation: info.generation.as_u64(),
            size: info.size,
            needle_count: info.needle_count,
            live_bytes: info.live_bytes,
            garbage_bytes: info.garbage_bytes,
            garbage_ratio: info.garbage_ratio,
            read_only: info.read_only,
            sealed: info.sealed,
            phase: info.phase.to_string(),
        }
    }
}

/// Runs the inspect command.
pub fn run(ctx: &Context, volume: u32, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let info = ctx.volume(volume)?.info();
    let result = InspectResult::new(ctx.path().display().to_string(), &info);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("volstore Volume Inspection");
    println!("==========================");
    println!("Path:          {}", result.path);
    println!("Volume:        {}", result.volume);
    println!("Generation:    {}", result.generation);
    println!();
    println!("Size:          {}", format_bytes(result.size));
    println!("Needles:       {}", result.needle_count);
    println!("Live bytes:    {}", format_bytes(result.live_bytes));
    println!("Garbage bytes: {}", format_bytes(result.garbage_bytes));
    println!("Garbage ratio: {:.3}", result.garbage_ratio);
    println!();
    println!("Read-only:     {}", result.read_only);
    println!("Sealed:        {}", result.sealed);
    println!("Vacuum phase:  {}", result.phase);
}

/// Formats a byte count with a binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
