use std::{fs::File, path::Path};

use log::error;
use memmap2::Mmap;

use crate::errors::{Errors, Result};

use super::IOManager;

/// Read-only mapping of a sealed segment. The file is never appended to
/// again, so the map is shared by readers without a lock.
pub struct MMapIO {
  map: Mmap,
}

impl MMapIO {
  pub fn new<P>(file_name: P) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    let file = match File::open(file_name.as_ref()) {
      Ok(file) => file,
      Err(e) => {
        error!("failed to open segment {:?}: {}", file_name.as_ref(), e);
        return Err(Errors::FailedToOpenDataFile);
      }
    };
    // safety: sealed segments are only replaced by merge while no engine has
    // the directory open
    match unsafe { Mmap::map(&file) } {
      Ok(map) => Ok(MMapIO { map }),
      Err(e) => {
        error!("failed to map segment {:?}: {}", file_name.as_ref(), e);
        Err(Errors::FailedToOpenDataFile)
      }
    }
  }
}

impl IOManager for MMapIO {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    let start = offset as usize;
    let Some(src) = start
      .checked_add(buf.len())
      .and_then(|end| self.map.get(start..end))
    else {
      return Err(Errors::ReadDataFileEOF);
    };
    buf.copy_from_slice(src);
    Ok(src.len())
  }

  fn write(&self, _buf: &[u8]) -> Result<usize> {
    error!("mapped segments are read only");
    Err(Errors::FailedToWriteToDataFile)
  }

  fn sync(&self) -> Result<()> {
    Ok(())
  }

  fn size(&self) -> u64 {
    self.map.len() as u64
  }
}
