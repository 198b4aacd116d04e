//! Needle access commands.

use super::Context;
use std::io::Write;
use std::path::Path;
use volstore_core::NeedleId;

/// Runs the put command.
pub fn put(
    ctx: &Context,
    volume: u32,
    needle: u64,
    file: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(file)?;
    let target = ctx.volume(volume)?;
    let location = target.write_needle(NeedleId::new(needle), &data)?;
    target.sync()?;

    println!(
        "Stored needle {} ({} bytes) at offset {}",
        NeedleId::new(needle),
        data.len(),
        location.offset
    );
    Ok(())
}

/// Runs the get command.
pub fn get(
    ctx: &Context,
    volume: u32,
    needle: u64,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = ctx.volume(volume)?.read_needle(NeedleId::new(needle))?;
    match output {
        Some(path) => std::fs::write(path, &data)?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

/// Runs the delete command.
pub fn delete(ctx: &Context, volume: u32, needle: u64) -> Result<(), Box<dyn std::error::Error>> {
    let target = ctx.volume(volume)?;
    target.delete_needle(NeedleId::new(needle))?;
    target.sync()?;
    println!("Deleted needle {}", NeedleId::new(needle));
    Ok(())
}
