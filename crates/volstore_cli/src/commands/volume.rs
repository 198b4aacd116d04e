//! Volume lifecycle commands.

use super::Context;
use volstore_core::VolumeId;

/// Runs the create command.
pub fn create(ctx: &Context, volume: u32) -> Result<(), Box<dyn std::error::Error>> {
    let created = ctx.store().create_volume(VolumeId::new(volume))?;
    created.sync()?;
    println!("Created volume {volume} in {}", ctx.path().display());
    Ok(())
}

/// Runs the seal command.
pub fn seal(ctx: &Context, volume: u32) -> Result<(), Box<dyn std::error::Error>> {
    let target = ctx.volume(volume)?;
    target.seal()?;
    println!(
        "Sealed volume {volume} ({} bytes, {} needles)",
        target.content_size(),
        target.needle_count()
    );
    Ok(())
}
