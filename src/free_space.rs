use std::path::Path;

use sysinfo::Disks;

/// Free-space snapshot of the single volume holding the given path.
///
/// Admission checks compare a required byte total against this one volume;
/// nothing is reserved, the value is only a snapshot.
///
/// Returns `None` when no mounted disk prefixes the path.
pub fn available(path: impl AsRef<Path>) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();

    // Resolve a symlinked install directory to where the bytes really land
    let path = path.as_ref()
        .read_link()
        .unwrap_or_else(|_| path.as_ref().to_path_buf());

    // Deepest matching mount point wins so nested mounts shadow their parents
    disks.iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
