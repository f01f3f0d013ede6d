//! `mim add`: drop a text-link event into the spool for the running
//! pipeline to pick up.

use anyhow::{Context, Result};
use mim_core::events::InboundEvent;
use mim_core::paths::StateLayout;

pub fn run_add(layout: &StateLayout, url: &str, auth_token: Option<String>) -> Result<()> {
    layout.ensure_dirs()?;
    let event = InboundEvent::Text {
        text: url.to_string(),
        source_ref: None,
        auth_token,
    };
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let name = format!("add-{}-{:09}.json", stamp.as_secs(), stamp.subsec_nanos());
    let path = layout.spool_dir().join(name);
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&event)?)
        .with_context(|| format!("write spool event: {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)?;
    println!("queued {url}");
    Ok(())
}
