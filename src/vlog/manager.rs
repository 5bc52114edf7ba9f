use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, File},
    path::{Path, PathBuf},
    sync::{atomic, Arc, Mutex, RwLock},
};

use anyhow::{anyhow, bail, Result};
use hashlink::LruCache;
use log::info;
use scopeguard::ScopeGuard;

use crate::{error::Error, util::file::sync_dir, util::MEM_ORDERING};

use super::{
    logfile::{ActiveFile, LogFile, SegmentRef},
    VLOG_FILE_EXT,
};

/// Owns every value log file of a directory and the handles used to read
/// them.
pub(crate) struct SegmentManager {
    dir: PathBuf,
    files_map: RwLock<BTreeMap<u32, Arc<LogFile>>>,
    next_fid: atomic::AtomicU32,
    handles: Mutex<HandleCache>,
}

/// Read handles of sealed files, least recently used evicted first. The
/// active file's handle is kept aside and never evicted.
struct HandleCache {
    lru: LruCache<u32, Arc<File>>,
    pinned: Option<(u32, Arc<File>)>,
}

impl SegmentManager {
    pub(crate) fn new<P: AsRef<Path>>(dir: P, max_open_files: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            files_map: RwLock::new(BTreeMap::new()),
            next_fid: 0.into(),
            handles: Mutex::new(HandleCache {
                lru: LruCache::new(max_open_files),
                pinned: None,
            }),
        }
    }

    pub(crate) fn fpath(&self, fid: u32) -> PathBuf {
        self.dir.join(format!("{:06}{}", fid, VLOG_FILE_EXT))
    }

    /// Returns the sorted ids of the value log files found in `dir`.
    pub(crate) fn populate_files_map<P: AsRef<Path>>(dir: P) -> Result<Vec<u32>> {
        let entries = fs::read_dir(dir.as_ref())
            .map_err(|e| anyhow!("Unable to open log dir: {:?}. Error={}", dir.as_ref(), e))?;
        let mut fids = HashSet::new();
        for entry in entries {
            let filename = match entry?.file_name().into_string() {
                Ok(s) => s,
                Err(_) => continue,
            };
            let Some(stem) = filename.strip_suffix(VLOG_FILE_EXT) else {
                continue;
            };
            let fid = stem
                .parse::<u32>()
                .map_err(|e| anyhow!("Unable to parse log id: {}. Error={}", filename, e))?;
            if !fids.insert(fid) {
                bail!("Duplicate file found: {}. Please delete one.", filename)
            }
        }

        let mut fids: Vec<u32> = fids.into_iter().collect();
        fids.sort();
        Ok(fids)
    }

    /// Registers an existing file found at startup.
    pub(crate) fn insert(&self, fid: u32, size: u32) -> Result<Arc<LogFile>> {
        let Some(next_fid) = fid.checked_add(1) else {
            bail!("Value log file id out of range: {}", fid)
        };
        let lf = Arc::new(LogFile::new(fid, self.fpath(fid), size));
        self.files_map
            .write()
            .map_err(|e| anyhow!("Get files map error: {}", e))?
            .insert(fid, Arc::clone(&lf));
        self.next_fid.fetch_max(next_fid, MEM_ORDERING);
        Ok(lf)
    }

    /// Creates the next value log file and makes its handle the pinned one.
    pub(crate) fn create(&self) -> Result<ActiveFile> {
        let fid = self
            .next_fid
            .fetch_update(MEM_ORDERING, MEM_ORDERING, |fid| fid.checked_add(1))
            .map_err(|fid| anyhow!("Value log file ids exhausted at {}", fid))?;
        let path = self.fpath(fid);
        let fd = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| anyhow!("Unable to create value log file {:?}: {}", path, e))?;

        // Don't leave a file behind that was never registered.
        let cleanup = scopeguard::guard(path.clone(), |p| {
            let _ = fs::remove_file(p);
        });
        sync_dir(&self.dir)?;
        let path = ScopeGuard::into_inner(cleanup);

        let lf = Arc::new(LogFile::new(fid, path, 0));
        self.files_map
            .write()
            .map_err(|e| anyhow!("Get files map error: {}", e))?
            .insert(fid, Arc::clone(&lf));

        let fd = Arc::new(fd);
        self.pin(fid, Arc::clone(&fd))?;
        info!("Created value log file {:?}", lf.get_path());
        Ok(ActiveFile::new(lf, fd, 0))
    }

    /// Opens a registered file for appending at `offset`, pinning its handle.
    pub(crate) fn open_active(&self, lf: &Arc<LogFile>, offset: u32) -> Result<ActiveFile> {
        let fd = File::options()
            .read(true)
            .write(true)
            .open(lf.get_path())
            .map_err(|e| anyhow!("Unable to open log file: {:?}. Error={}", lf.get_path(), e))?;
        let fd = Arc::new(fd);
        self.pin(lf.get_fid(), Arc::clone(&fd))?;
        Ok(ActiveFile::new(Arc::clone(lf), fd, offset))
    }

    pub(crate) fn pin(&self, fid: u32, fd: Arc<File>) -> Result<()> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|e| anyhow!("Get handle cache error: {}", e))?;
        handles.lru.remove(&fid);
        if let Some((old_fid, old_fd)) = handles.pinned.replace((fid, fd)) {
            if old_fid != fid {
                handles.lru.insert(old_fid, old_fd);
            }
        }
        Ok(())
    }

    /// Looks `fid` up and marks it in use. The file can't be deleted until
    /// the returned reference is dropped.
    pub(crate) fn acquire(&self, fid: u32) -> Result<SegmentRef> {
        let files = self
            .files_map
            .read()
            .map_err(|e| anyhow!("Get files map error: {}", e))?;
        match files.get(&fid) {
            Some(lf) => Ok(lf.acquire()),
            None => bail!(Error::SegmentNotFound(fid)),
        }
    }

    /// Returns a read handle for `lf`, opening the file if it isn't cached.
    pub(crate) fn handle(&self, lf: &LogFile) -> Result<Arc<File>> {
        let fid = lf.get_fid();
        let mut handles = self
            .handles
            .lock()
            .map_err(|e| anyhow!("Get handle cache error: {}", e))?;
        if let Some((pinned_fid, fd)) = &handles.pinned {
            if *pinned_fid == fid {
                return Ok(Arc::clone(fd));
            }
        }
        if let Some(fd) = handles.lru.get(&fid) {
            return Ok(Arc::clone(fd));
        }

        let fd = Arc::new(
            File::open(lf.get_path())
                .map_err(|e| anyhow!("Unable to open log file: {:?}. Error={}", lf.get_path(), e))?,
        );
        handles.lru.insert(fid, Arc::clone(&fd));
        Ok(fd)
    }

    #[cfg(test)]
    pub(crate) fn open_handles(&self) -> Result<usize> {
        let handles = self
            .handles
            .lock()
            .map_err(|e| anyhow!("Get handle cache error: {}", e))?;
        Ok(handles.lru.len() + handles.pinned.iter().count())
    }

    /// Sealed files in ascending id order.
    pub(crate) fn sealed(&self) -> Result<Vec<Arc<LogFile>>> {
        let files = self
            .files_map
            .read()
            .map_err(|e| anyhow!("Get files map error: {}", e))?;
        Ok(files.values().filter(|lf| lf.is_sealed()).cloned().collect())
    }

    pub(crate) fn fids(&self) -> Result<Vec<u32>> {
        let files = self
            .files_map
            .read()
            .map_err(|e| anyhow!("Get files map error: {}", e))?;
        Ok(files.keys().copied().collect())
    }

    /// Unregisters `fid`, waits for in-flight reads of it to finish and
    /// removes the file.
    pub(crate) async fn delete(&self, fid: u32) -> Result<()> {
        let lf = self
            .files_map
            .write()
            .map_err(|e| anyhow!("Get files map error: {}", e))?
            .remove(&fid);
        let Some(lf) = lf else {
            bail!(Error::SegmentNotFound(fid))
        };

        lf.wait_idle().await;

        {
            let mut handles = self
                .handles
                .lock()
                .map_err(|e| anyhow!("Get handle cache error: {}", e))?;
            handles.lru.remove(&fid);
            if matches!(&handles.pinned, Some((pinned_fid, _)) if *pinned_fid == fid) {
                handles.pinned = None;
            }
        }

        let path = lf.get_path().to_path_buf();
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            fs::remove_file(&path)
                .map_err(|e| anyhow!("Remove file({:?}) error: {}", path, e))?;
            sync_dir(dir)
        })
        .await
        .map_err(|e| anyhow!("Delete task error: {}", e))??;
        info!("Deleted value log file {:?}", lf.get_path());
        Ok(())
    }

    /// Drops every cached handle.
    pub(crate) fn close(&self) -> Result<()> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|e| anyhow!("Get handle cache error: {}", e))?;
        handles.lru.clear();
        handles.pinned = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::*;

    #[test]
    fn test_populate_files_map() {
        let test_dir = TempDir::new().unwrap();
        for name in ["000002.vlog", "000000.vlog", "000010.vlog", "DISCARD", "x.sst"] {
            std::fs::write(test_dir.path().join(name), b"").unwrap();
        }
        let fids = SegmentManager::populate_files_map(test_dir.path()).unwrap();
        assert_eq!(fids, vec![0, 2, 10]);

        std::fs::write(test_dir.path().join("00002.vlog"), b"").unwrap();
        assert!(SegmentManager::populate_files_map(test_dir.path()).is_err());
    }

    #[test]
    fn test_create_assigns_increasing_ids() {
        let test_dir = TempDir::new().unwrap();
        let manager = SegmentManager::new(test_dir.path(), 4);
        manager.insert(5, 0).unwrap();

        let a = manager.create().unwrap();
        let b = manager.create().unwrap();
        assert_eq!(a.fid(), 6);
        assert_eq!(b.fid(), 7);
        assert!(b.log_file().get_path().ends_with("000007.vlog"));
        assert_eq!(manager.fids().unwrap(), vec![5, 6, 7]);
        // Only the newest handle stays pinned, the old one moved to the LRU.
        assert_eq!(manager.open_handles().unwrap(), 2);
    }

    #[test]
    fn test_handle_cache_is_bounded() {
        let test_dir = TempDir::new().unwrap();
        let manager = SegmentManager::new(test_dir.path(), 2);
        let mut files = vec![];
        for _ in 0..4 {
            let mut af = manager.create().unwrap();
            af.seal().unwrap();
            af.log_file().mark_sealed();
            files.push(Arc::clone(af.log_file()));
        }
        let active = manager.create().unwrap();

        for lf in &files {
            manager.handle(lf).unwrap();
        }
        // Two LRU slots plus the pinned active handle.
        assert_eq!(manager.open_handles().unwrap(), 3);

        let fd = manager.handle(active.log_file()).unwrap();
        assert!(Arc::ptr_eq(&fd, active.fd()));
        assert_eq!(manager.sealed().unwrap().len(), 4);
    }

    #[test]
    fn test_file_id_out_of_range() {
        let test_dir = TempDir::new().unwrap();
        let manager = SegmentManager::new(test_dir.path(), 4);
        assert!(manager.insert(u32::MAX, 0).is_err());
        assert!(manager.fids().unwrap().is_empty());

        manager.insert(u32::MAX - 1, 0).unwrap();
        // The last id left can't be handed out, nothing would follow it.
        assert!(manager.create().is_err());
        assert_eq!(manager.fids().unwrap(), vec![u32::MAX - 1]);
    }

    #[tokio::test]
    async fn test_delete_waits_for_readers() {
        let test_dir = TempDir::new().unwrap();
        let manager = Arc::new(SegmentManager::new(test_dir.path(), 4));
        let af = manager.create().unwrap();
        let fid = af.fid();
        let path = af.log_file().get_path().to_path_buf();
        drop(af);

        let reader = manager.acquire(fid).unwrap();
        let m = Arc::clone(&manager);
        let deletion = tokio::spawn(async move { m.delete(fid).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // Unregistered at once, but the file outlives the reader.
        let err = manager.acquire(fid).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::SegmentNotFound(f)) if *f == fid
        ));
        assert!(path.exists());

        drop(reader);
        deletion.await.unwrap().unwrap();
        assert!(!path.exists());
        assert_eq!(manager.open_handles().unwrap(), 0);
    }
}
