//! Vacuum phase commands.

use super::inspect::format_bytes;
use super::Context;
use std::sync::Arc;
use tracing::info;
use volstore_core::{CompactProgress, VacuumCoordinator, VolumeId};

fn coordinator(ctx: &Context) -> VacuumCoordinator {
    VacuumCoordinator::new(Arc::clone(ctx.store()))
}

/// Runs the check command.
pub fn check(ctx: &Context, volume: u32) -> Result<(), Box<dyn std::error::Error>> {
    let ratio = coordinator(ctx).check(VolumeId::new(volume))?;
    println!("Volume {volume} garbage ratio: {ratio:.4}");
    Ok(())
}

fn run_compaction(
    vacuum: &VacuumCoordinator,
    volume: VolumeId,
    preallocate: u64,
) -> Result<Option<CompactProgress>, Box<dyn std::error::Error>> {
    let mut last = None;
    for progress in vacuum.compact(volume, preallocate)? {
        let progress = progress?;
        info!(
            volume = %volume,
            processed = progress.processed_bytes,
            load = progress.load_avg_1m,
            "compacting"
        );
        last = Some(progress);
    }
    Ok(last)
}

/// Runs the compact command.
pub fn compact(
    ctx: &Context,
    volume: u32,
    preallocate: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let last = run_compaction(&coordinator(ctx), VolumeId::new(volume), preallocate)?;
    let copied = last.map_or(0, |p| p.processed_bytes);
    println!(
        "Compacted volume {volume}: copied {}; run `commit` to make it current",
        format_bytes(copied)
    );
    Ok(())
}

/// Runs the commit command.
pub fn commit(ctx: &Context, volume: u32) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = coordinator(ctx).commit(VolumeId::new(volume))?;
    println!(
        "Committed volume {volume}: size {}, read-only {}",
        format_bytes(outcome.volume_size),
        outcome.is_read_only
    );
    Ok(())
}

/// Runs the cleanup command.
pub fn cleanup(ctx: &Context, volume: u32) -> Result<(), Box<dyn std::error::Error>> {
    coordinator(ctx).cleanup(VolumeId::new(volume))?;
    println!("Cleaned up volume {volume}");
    Ok(())
}

/// Runs all four phases when the garbage ratio reaches `threshold`.
pub fn run(ctx: &Context, volume: u32, threshold: f64) -> Result<(), Box<dyn std::error::Error>> {
    let vid = VolumeId::new(volume);
    let vacuum = coordinator(ctx);

    let ratio = vacuum.check(vid)?;
    if ratio < threshold {
        println!("Volume {volume} garbage ratio {ratio:.4} is below {threshold}; nothing to do");
        return Ok(());
    }

    let before = ctx.volume(volume)?.content_size();
    run_compaction(&vacuum, vid, before)?;
    let outcome = vacuum.commit(vid)?;
    vacuum.cleanup(vid)?;

    println!(
        "Vacuumed volume {volume}: {} -> {} (ratio was {ratio:.4})",
        format_bytes(before),
        format_bytes(outcome.volume_size)
    );
    Ok(())
}
