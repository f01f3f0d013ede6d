//! Archive expansion: stream one media entry at a time out of a container,
//! pausing under a free-disk floor and tracking progress in a per-archive
//! manifest so a crash resumes mid-archive.

mod formats;
mod manifest;

pub use formats::{
    extract_member, list_members, needs_secret, ArchiveFormat, ExpandError, ExtractedMember,
    MemberInfo,
};
pub use manifest::{manifest_id_for, ExpansionManifest};

use std::path::Path;

/// Free bytes on the filesystem holding `path`.
pub fn free_space(path: &Path) -> std::io::Result<u64> {
    fs2::available_space(path)
}

/// True when extracting `upcoming` more bytes keeps the filesystem above
/// the configured floor. Producers poll this and enter a backpressure wait
/// when it turns false.
pub fn has_headroom(path: &Path, floor: u64, upcoming: u64) -> bool {
    match free_space(path) {
        Ok(free) => free.saturating_sub(upcoming) >= floor,
        // An unreadable statfs should not wedge expansion forever.
        Err(e) => {
            tracing::warn!("free-space probe failed for {}: {}", path.display(), e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headroom_against_zero_floor_is_always_true() {
        let dir = tempfile::tempdir().unwrap();
        assert!(has_headroom(dir.path(), 0, 0));
    }

    #[test]
    fn absurd_floor_reports_no_headroom() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_headroom(dir.path(), u64::MAX / 2, 0));
    }
}
