use std::{
    fmt::Display,
    fs::File,
    ops::Deref,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{atomic, Arc},
};

use anyhow::{anyhow, bail, Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::{
    entry::{Entry, ValuePointer},
    error::Error,
    util::{file::map_read_only, MEM_ORDERING},
};

/// One value log file.
///
/// `size` is the published end of the file: every byte below it has been
/// synced and may be handed to readers. Only the writer moves it.
pub(crate) struct LogFile {
    fid: u32,
    path: PathBuf,
    size: atomic::AtomicU32,
    sealed: atomic::AtomicBool,

    // Reads and scans in flight, see `SegmentRef`.
    refs: atomic::AtomicUsize,
    idle: Notify,
}

impl LogFile {
    pub(crate) fn new(fid: u32, path: PathBuf, size: u32) -> Self {
        Self {
            fid,
            path,
            size: size.into(),
            sealed: false.into(),
            refs: 0.into(),
            idle: Notify::new(),
        }
    }

    pub(crate) fn get_fid(&self) -> u32 {
        self.fid
    }

    pub(crate) fn get_path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn get_size(&self) -> u32 {
        self.size.load(MEM_ORDERING)
    }

    pub(crate) fn set_size(&self, s: u32) {
        self.size.store(s, MEM_ORDERING);
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed.load(MEM_ORDERING)
    }

    pub(crate) fn mark_sealed(&self) {
        self.sealed.store(true, MEM_ORDERING);
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> SegmentRef {
        self.refs.fetch_add(1, MEM_ORDERING);
        SegmentRef(Arc::clone(self))
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.refs.load(MEM_ORDERING)
    }

    /// Resolves once no `SegmentRef` to this file is alive.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Reads the bytes `vp` points at. Nothing past the published size is
    /// ever returned.
    pub(crate) fn read_at(&self, fd: &File, vp: &ValuePointer) -> Result<Bytes> {
        let size = self.get_size();
        if vp.end() > size as u64 {
            bail!(Error::OutOfRange {
                fid: self.fid,
                offset: vp.offset,
                len: vp.len,
                size,
            })
        }

        let mut buf = BytesMut::zeroed(vp.len as usize);
        fd.read_exact_at(&mut buf, vp.offset as u64)
            .with_context(|| format!("Read {} from {:?}", vp, self.path))?;
        Ok(buf.freeze())
    }

    /// Decodes the file's entries in order, starting at offset 0.
    pub(crate) fn scan(&self, fd: &File) -> Result<Scan> {
        Ok(Scan {
            fid: self.fid,
            data: map_read_only(fd, &self.path)?,
            offset: 0,
            failed: false,
        })
    }
}

impl Display for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(path: {:?}, fid: {}, size: {}, sealed: {}, refs: {})",
            self.path,
            self.fid,
            self.get_size(),
            self.is_sealed(),
            self.in_flight()
        )
    }
}

/// Keeps a file from being deleted while it is read.
pub(crate) struct SegmentRef(Arc<LogFile>);

impl Deref for SegmentRef {
    type Target = LogFile;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for SegmentRef {
    fn drop(&mut self) {
        if self.0.refs.fetch_sub(1, MEM_ORDERING) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Sequential decoder over a read-only mapping of a whole file. It stops at
/// the end of the file, or after yielding the first decoding error.
pub(crate) struct Scan {
    fid: u32,
    data: Option<memmap2::Mmap>,
    offset: usize,
    failed: bool,
}

impl Scan {
    /// End of the last entry yielded so far.
    pub(crate) fn offset(&self) -> u32 {
        self.offset as u32
    }
}

impl Iterator for Scan {
    type Item = Result<(Entry, ValuePointer)>;

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.data.as_ref()?;
        if self.failed || self.offset >= data.len() {
            return None;
        }

        match Entry::decode(&data[self.offset..]) {
            Ok((ent, n)) => {
                let vp = ValuePointer::new(self.fid, n as u32, self.offset as u32);
                self.offset += n;
                Some(Ok((ent, vp)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// The file currently appended to, together with its write handle.
///
/// `write_at` is where the next entry goes, `synced_at` how far the file is
/// known to be durable.
pub(crate) struct ActiveFile {
    lf: Arc<LogFile>,
    fd: Arc<File>,
    write_at: u32,
    synced_at: u32,
}

impl ActiveFile {
    pub(crate) fn new(lf: Arc<LogFile>, fd: Arc<File>, offset: u32) -> Self {
        lf.set_size(offset);
        Self {
            lf,
            fd,
            write_at: offset,
            synced_at: offset,
        }
    }

    pub(crate) fn log_file(&self) -> &Arc<LogFile> {
        &self.lf
    }

    pub(crate) fn fd(&self) -> &Arc<File> {
        &self.fd
    }

    pub(crate) fn fid(&self) -> u32 {
        self.lf.get_fid()
    }

    pub(crate) fn write_at(&self) -> u32 {
        self.write_at
    }

    /// Writes `buf` at the cursor and returns the offset it landed at.
    pub(crate) fn append(&mut self, buf: &[u8]) -> Result<u32> {
        let offset = self.write_at;
        let end = offset as u64 + buf.len() as u64;
        if end > u32::MAX as u64 {
            bail!(Error::OversizedEntry {
                size: buf.len() as u64,
                max: (u32::MAX - offset) as u64,
            })
        }

        self.fd
            .write_all_at(buf, offset as u64)
            .with_context(|| format!("Write {} bytes to {:?}", buf.len(), self.lf.get_path()))?;
        self.write_at = end as u32;
        Ok(offset)
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        if self.synced_at == self.write_at {
            return Ok(());
        }
        self.fd
            .sync_data()
            .with_context(|| format!("Sync {:?}", self.lf.get_path()))?;
        self.synced_at = self.write_at;
        Ok(())
    }

    /// Same as `sync`, with the fdatasync run on tokio's blocking pool so
    /// that it doesn't stall the runtime.
    pub(crate) async fn sync_blocking(&mut self) -> Result<()> {
        if self.synced_at == self.write_at {
            return Ok(());
        }
        let fd = Arc::clone(&self.fd);
        let path = self.lf.get_path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            fd.sync_data()
                .with_context(|| format!("Sync {:?}", path))
        })
        .await
        .map_err(|e| anyhow!("Sync task error: {}", e))??;
        self.synced_at = self.write_at;
        Ok(())
    }

    /// Makes everything synced so far visible to readers.
    pub(crate) fn publish(&self) {
        self.lf.set_size(self.synced_at);
    }

    /// Syncs and publishes all appended bytes. The file is not marked sealed
    /// here; the writer does that once the batch that filled it succeeds.
    pub(crate) fn seal(&mut self) -> Result<()> {
        self.sync()?;
        self.publish();
        Ok(())
    }

    /// Cuts the file back to `offset`, discarding anything after it.
    pub(crate) fn truncate(&mut self, offset: u32) -> Result<()> {
        self.fd
            .set_len(offset as u64)
            .with_context(|| format!("Truncate {:?} to {}", self.lf.get_path(), offset))?;
        self.fd
            .sync_all()
            .with_context(|| format!("Sync {:?}", self.lf.get_path()))?;
        self.write_at = offset;
        self.synced_at = offset;
        self.lf.set_size(offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use temp_dir::TempDir;

    use super::*;

    fn active_file(dir: &TempDir, fid: u32) -> ActiveFile {
        let path = dir.path().join(format!("{:06}.vlog", fid));
        let fd = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        ActiveFile::new(Arc::new(LogFile::new(fid, path, 0)), Arc::new(fd), 0)
    }

    fn append_entry(af: &mut ActiveFile, ent: &Entry) -> ValuePointer {
        let mut buf = BytesMut::new();
        let n = ent.encode_with_buf(&mut buf);
        let offset = af.append(&buf).unwrap();
        ValuePointer::new(af.fid(), n as u32, offset)
    }

    #[test]
    fn test_append_publish_read() {
        let test_dir = TempDir::new().unwrap();
        let mut af = active_file(&test_dir, 3);

        let a = Entry::new("a", "first");
        let b = Entry::new("b", "second");
        let vp_a = append_entry(&mut af, &a);
        let vp_b = append_entry(&mut af, &b);
        assert_eq!(vp_a.offset, 0);
        assert_eq!(vp_b.offset, vp_a.len);

        // Nothing is visible before the sync.
        let lf = Arc::clone(af.log_file());
        let err = lf.read_at(af.fd(), &vp_a).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::OutOfRange { fid: 3, .. })
        ));

        af.sync().unwrap();
        af.publish();
        assert_eq!(lf.get_size() as u64, vp_b.end());

        let buf = lf.read_at(af.fd(), &vp_b).unwrap();
        let (got, n) = Entry::decode_bytes(&buf).unwrap();
        assert_eq!(got, b);
        assert_eq!(n, vp_b.len as usize);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_sync_blocking_publishes() {
        let test_dir = TempDir::new().unwrap();
        let mut af = active_file(&test_dir, 5);
        let ent = Entry::new("key", "value");
        let vp = append_entry(&mut af, &ent);

        af.sync_blocking().await.unwrap();
        af.publish();
        let lf = Arc::clone(af.log_file());
        assert_eq!(lf.get_size() as u64, vp.end());
        let buf = lf.read_at(af.fd(), &vp).unwrap();
        assert_eq!(Entry::decode_bytes(&buf).unwrap().0, ent);

        // Nothing new to sync.
        af.sync_blocking().await.unwrap();
    }

    #[test]
    fn test_scan_stops_at_garbage() {
        let test_dir = TempDir::new().unwrap();
        let mut af = active_file(&test_dir, 0);
        let vps: Vec<ValuePointer> = (0..5)
            .map(|i| append_entry(&mut af, &Entry::new(format!("key{}", i), "v")))
            .collect();
        af.append(&[0xff, 0xff, 0xff]).unwrap();
        af.seal().unwrap();

        let lf = Arc::clone(af.log_file());
        let mut scan = lf.scan(af.fd()).unwrap();
        for vp in &vps {
            let (_, got) = scan.next().unwrap().unwrap();
            assert_eq!(&got, vp);
        }
        assert!(scan.next().unwrap().is_err());
        assert!(scan.next().is_none());
        assert_eq!(scan.offset() as u64, vps[4].end());
    }

    #[test]
    fn test_truncate() {
        let test_dir = TempDir::new().unwrap();
        let mut af = active_file(&test_dir, 1);
        let vp = append_entry(&mut af, &Entry::new("k", "v"));
        append_entry(&mut af, &Entry::new("k2", "v2"));
        af.seal().unwrap();

        af.truncate(vp.len).unwrap();
        assert_eq!(af.write_at(), vp.len);
        assert_eq!(af.log_file().get_size(), vp.len);
        let len = std::fs::metadata(af.log_file().get_path()).unwrap().len();
        assert_eq!(len, vp.len as u64);
    }

    #[test]
    fn test_scan_empty_file() {
        let test_dir = TempDir::new().unwrap();
        let af = active_file(&test_dir, 2);
        let mut scan = af.log_file().scan(af.fd()).unwrap();
        assert!(scan.next().is_none());
        assert_eq!(scan.offset(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let test_dir = TempDir::new().unwrap();
        let af = active_file(&test_dir, 4);
        let lf = Arc::clone(af.log_file());

        let guard = lf.acquire();
        assert_eq!(lf.in_flight(), 1);

        let waiter = Arc::clone(&lf);
        let handle = tokio::spawn(async move { waiter.wait_idle().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        drop(guard);
        handle.await.unwrap();
        assert_eq!(lf.in_flight(), 0);
    }
}
