//! `mim status`: print the advisory snapshot.

use anyhow::Result;
use mim_core::paths::StateLayout;
use mim_core::supervisor::PipelineSnapshot;

pub fn run_status(layout: &StateLayout) -> Result<()> {
    let Some(snapshot) = PipelineSnapshot::read(&layout.snapshot_file())? else {
        println!("no snapshot yet; is the pipeline running?");
        return Ok(());
    };

    let age = mim_core::task::unix_now() - snapshot.written_at;
    println!("snapshot age: {age}s");
    for (name, stage) in [
        ("download", &snapshot.download),
        ("process", &snapshot.process),
        ("upload", &snapshot.upload),
    ] {
        println!("{name:>9}: {} queued", stage.depth);
        for task in &stage.in_flight {
            println!("           in-flight: {task}");
        }
    }
    println!("    retry: {} waiting", snapshot.retry_depth);
    println!(" deferred: {} pending conversions", snapshot.deferred_pending);
    println!("    cache: {} fingerprints", snapshot.cache_entries);
    Ok(())
}
