//! Upload command implementation.

use super::inspect::format_bytes;
use super::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use volstore_core::VolumeId;
use volstore_storage::{ArchivalUploader, DirObjectStore, UploadConfig, UploadJob};

/// Runs the upload command.
pub fn run(
    ctx: &Context,
    volume: u32,
    store: &Path,
    bucket: &str,
    key: &str,
    storage_class: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let objects = Arc::new(DirObjectStore::open(store)?);
    let uploader = ArchivalUploader::new(objects, UploadConfig::default());

    let mut job = UploadJob::new(bucket, key);
    if let Some(class) = storage_class {
        job = job.storage_class(class);
    }

    let mut last_reported = 0u32;
    let report = ctx.store().archive_volume(
        VolumeId::new(volume),
        &uploader,
        &job,
        |sent, percent| {
            // One log line per 10%.
            let step = (percent / 10.0) as u32;
            if step > last_reported {
                last_reported = step;
                info!(sent, percent = format!("{percent:.1}"), "upload progress");
            }
            Ok(())
        },
    )?;

    println!(
        "Uploaded volume {volume} to {} ({}, {} parts of {})",
        report.location,
        format_bytes(report.size),
        report.parts,
        format_bytes(report.part_size)
    );
    Ok(())
}
