use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

use crate::contract::DiskSpaceProbe;

/// Headroom required on top of the remote bucket size (10%).
pub const SPACE_HEADROOM_NUMERATOR: u64 = 11;
pub const SPACE_HEADROOM_DENOMINATOR: u64 = 10;

/// Space a bucket of `remote_bytes` needs locally, including headroom.
pub fn required_space(remote_bytes: u64) -> u64 {
    let needed =
        remote_bytes as u128 * SPACE_HEADROOM_NUMERATOR as u128 / SPACE_HEADROOM_DENOMINATOR as u128;
    needed.min(u64::MAX as u128) as u64
}

/// Reads free space from the mounted volumes via `sysinfo`.
#[derive(Debug, Default)]
pub struct SystemDiskProbe;

impl DiskSpaceProbe for SystemDiskProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let existing = nearest_existing_ancestor(path)?;
        let disks = Disks::new_with_refreshed_list();
        // Longest mount point that prefixes the path wins.
        disks
            .list()
            .iter()
            .filter(|d| existing.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted volume holds {}", existing.display()),
                )
            })
    }
}

/// Destinations are probed before they are created.
fn nearest_existing_ancestor(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut current = absolute.as_path();
    loop {
        if current.exists() {
            return current.canonicalize();
        }
        current = current.parent().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no existing ancestor of {}", absolute.display()),
            )
        })?;
    }
}
