use std::path::Path;

use log::warn;

/// Total size in bytes of everything under `dir_path`, 0 if it can not be read.
pub fn dir_disk_size<P>(dir_path: P) -> u64
where
  P: AsRef<Path>,
{
  match fs_extra::dir::get_size(dir_path.as_ref()) {
    Ok(size) => size,
    Err(e) => {
      warn!("failed to get size of {:?}: {}", dir_path.as_ref(), e);
      0
    }
  }
}

/// Free bytes on the file system holding `dir_path`, `u64::MAX` if unknown.
pub fn available_disk_space<P>(dir_path: P) -> u64
where
  P: AsRef<Path>,
{
  match fs2::available_space(dir_path.as_ref()) {
    Ok(size) => size,
    Err(e) => {
      warn!("failed to get available space of {:?}: {}", dir_path.as_ref(), e);
      u64::MAX
    }
  }
}
