//! Free-space probe for the workspace volume.

use std::io;
use std::path::Path;

pub trait DiskProbe: Send + Sync {
    /// Bytes available to unprivileged users on the volume holding `path`.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Reads free space with `statvfs` (or the platform equivalent).
#[derive(Debug, Clone, Copy, Default)]
pub struct Fs2DiskProbe;

impl DiskProbe for Fs2DiskProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        // The workspace root may not exist before the first clone.
        let probe_path = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("."));
        fs2::available_space(probe_path)
    }
}
