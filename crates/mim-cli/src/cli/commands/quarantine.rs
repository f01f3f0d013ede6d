//! `mim quarantine`: list permanently failed tasks.

use anyhow::Result;
use mim_core::paths::StateLayout;
use mim_core::supervisor::QuarantineIndex;

pub fn run_quarantine(layout: &StateLayout) -> Result<()> {
    let index = QuarantineIndex::load(&layout.quarantine_index());
    if index.entries().is_empty() {
        println!("quarantine is empty");
        return Ok(());
    }
    for entry in index.entries() {
        println!(
            "task #{} [{}] {} at {}",
            entry.task_id, entry.class, entry.op, entry.at
        );
        if let Some(detail) = &entry.detail {
            println!("    {detail}");
        }
        for path in &entry.preserved {
            println!("    preserved: {}", path.display());
        }
    }
    Ok(())
}
