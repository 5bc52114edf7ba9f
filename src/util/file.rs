use std::{
    fmt::Display,
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};

pub(crate) fn sync_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    File::open(&dir)?
        .sync_all()
        .map_err(|e| anyhow!("Sync {:?} error: {}", dir.as_ref(), e))
}

/// Maps a whole file read-only. An empty file yields `None` since there is
/// nothing to map.
pub(crate) fn map_read_only(fd: &File, path: &Path) -> Result<Option<memmap2::Mmap>> {
    let len = fd.metadata()?.len();
    if len == 0 {
        return Ok(None);
    }
    let mmap = unsafe {
        memmap2::MmapOptions::new()
            .len(len as usize)
            .map(fd)
            .map_err(|e| anyhow!("Mmapping {:?} with size {} error: {}", path, len, e))?
    };
    Ok(Some(mmap))
}

/// A file mapped read-write in its entirety. The mapping is rebuilt whenever
/// the file is resized.
pub(crate) struct MmapFile {
    data: memmap2::MmapMut,
    fd: File,
    path: PathBuf,
}

impl AsRef<[u8]> for MmapFile {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for MmapFile {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl MmapFile {
    pub fn sync(&self) -> Result<()> {
        self.data
            .flush()
            .map_err(|e| anyhow!("Flush mmapfile {:?} error: {}", self.path, e))
    }

    pub fn truncate(&mut self, max_size: u64) -> Result<()> {
        self.sync()?;
        self.fd
            .set_len(max_size)
            .map_err(|e| anyhow!("Truncate mmapfile {:?} error: {}", self.path, e))?;
        self.data = unsafe {
            memmap2::MmapOptions::new()
                .len(max_size as usize)
                .map_mut(&self.fd)
                .map_err(|e| anyhow!("Remap file {:?} error: {}", self.path, e))?
        };
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Display for MmapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(data: [u8;{}], path: {:?})", self.data.len(), self.path)
    }
}

/// Opens (or creates) `path` and maps it. A new or empty file is first
/// extended to `sz` bytes; the returned flag tells whether that happened.
pub(crate) fn open_mmap_file<P: AsRef<Path>>(
    path: P,
    oopt: &std::fs::OpenOptions,
    sz: usize,
) -> Result<(MmapFile, bool)> {
    let mut is_new_file = false;
    let fd = oopt
        .open(&path)
        .map_err(|e| anyhow!("Open file({:?}) error: {}", path.as_ref(), e))?;
    let meta = fd.metadata()?;

    let mut file_size = meta.len() as usize;
    if sz > 0 && file_size == 0 {
        fd.set_len(sz as u64)
            .map_err(|e| anyhow!("Truncate error: {}", e))?;
        file_size = sz;
        is_new_file = true;
    }

    let path = path.as_ref().to_path_buf();
    let data = unsafe {
        memmap2::MmapOptions::new()
            .len(file_size)
            .map_mut(&fd)
            .map_err(|e| anyhow!("Mmapping {:?} with size {} error: {}", path, file_size, e))?
    };

    if is_new_file {
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
    }

    Ok((MmapFile { data, fd, path }, is_new_file))
}
