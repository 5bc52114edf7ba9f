use std::{collections::VecDeque, fs, fs::File, sync::Arc};

use anyhow::{anyhow, bail, Result};
use log::{info, warn};

use crate::{
    entry::{Entry, ValuePointer},
    error::Error,
    option::{check_options, Options},
    util::file::sync_dir,
};

use super::{
    discard::DiscardStats,
    logfile::{ActiveFile, LogFile, Scan},
    manager::SegmentManager,
    ValueLog,
};

/// Entries found in the value log at startup, in file and offset order.
///
/// Sealed files must decode completely. The last file is read up to its
/// first bad record, cut back to there, and becomes the file new writes go
/// to. The stream is consumed once; `finish` opens the log afterwards.
pub struct Replay {
    vlog: ValueLog,
    pending: VecDeque<Arc<LogFile>>,
    current: Option<Current>,
    active: Option<ActiveFile>,
    num_entries_written: u32,
    failed: bool,
}

struct Current {
    lf: Arc<LogFile>,
    scan: Scan,
    last: bool,
    count: u32,
}

impl ValueLog {
    /// Prepares the value log in `opt.dir` for replay. Nothing can be read
    /// or written until the returned stream is finished.
    pub fn recover(opt: Options) -> Result<Replay> {
        check_options(&opt)?;
        fs::create_dir_all(&opt.dir)
            .map_err(|e| anyhow!("Create value log dir {:?} error: {}", opt.dir, e))?;

        let discard_stats = DiscardStats::new(&opt.dir)?;
        let manager = Arc::new(SegmentManager::new(&opt.dir, opt.max_open_files));

        let fids = SegmentManager::populate_files_map(&opt.dir)?;
        let mut pending = VecDeque::with_capacity(fids.len());
        for (i, &fid) in fids.iter().enumerate() {
            let path = manager.fpath(fid);
            let len = fs::metadata(&path)
                .map_err(|e| anyhow!("Stat value log file {:?} error: {}", path, e))?
                .len();
            let last = i == fids.len() - 1;

            if len == 0 && !last {
                // Left behind by a crash right after rotation.
                fs::remove_file(&path)
                    .map_err(|e| anyhow!("Remove file({:?}) error: {}", path, e))?;
                sync_dir(&opt.dir)?;
                info!("Deleted empty value log file {:?}", path);
                continue;
            }
            let size = u32::try_from(len)
                .map_err(|_| anyhow!("Value log file {:?} is too big: {}", path, len))?;

            let lf = manager.insert(fid, size)?;
            if !last {
                lf.mark_sealed();
            }
            pending.push_back(lf);
        }

        let mut active = None;
        if pending.is_empty() {
            active = Some(manager.create()?);
        }
        info!(
            "Replaying {} value log files in {:?}",
            pending.len(),
            opt.dir
        );

        Ok(Replay {
            vlog: ValueLog::new(opt, manager, discard_stats),
            pending,
            current: None,
            active,
            num_entries_written: 0,
            failed: false,
        })
    }

    /// Recovers the value log in `opt.dir`, handing every entry found to
    /// `f`, and opens it.
    pub async fn open<F>(opt: Options, mut f: F) -> Result<ValueLog>
    where
        F: FnMut(Entry, ValuePointer) -> Result<()>,
    {
        let mut replay = Self::recover(opt)?;
        for item in replay.by_ref() {
            let (ent, vp) = item?;
            f(ent, vp)?;
        }
        replay.finish().await
    }
}

impl Replay {
    /// Drains whatever hasn't been replayed yet and opens the value log.
    pub async fn finish(mut self) -> Result<ValueLog> {
        for item in self.by_ref() {
            item?;
        }
        let Some(active) = self.active.take() else {
            bail!("Value log replay failed, it can't be finished")
        };
        self.vlog.start(active, self.num_entries_written).await?;
        Ok(self.vlog)
    }

    fn open_next(&mut self) -> Result<Option<Current>> {
        let Some(lf) = self.pending.pop_front() else {
            return Ok(None);
        };
        let fd = File::open(lf.get_path()).map_err(|e| {
            anyhow!("Unable to open log file: {:?}. Error={}", lf.get_path(), e)
        })?;
        let scan = lf.scan(&fd)?;
        Ok(Some(Current {
            lf,
            scan,
            last: self.pending.is_empty(),
            count: 0,
        }))
    }

    /// Cuts the last file back to the end of its last valid entry and opens
    /// it for appending.
    fn activate(&mut self, cur: Current) -> Result<()> {
        let Current { lf, scan, count, .. } = cur;
        let end = scan.offset();
        drop(scan);

        let size = lf.get_size();
        let mut af = self.vlog.inner.manager.open_active(&lf, size)?;
        if end < size {
            warn!(
                "Truncating value log file {:?} from {} to {} bytes",
                lf.get_path(),
                size,
                end
            );
            af.truncate(end)?;
        }
        self.active = Some(af);
        self.num_entries_written = count;
        Ok(())
    }
}

impl Iterator for Replay {
    type Item = Result<(Entry, ValuePointer)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            let mut cur = match self.current.take() {
                Some(cur) => cur,
                None => match self.open_next() {
                    Ok(Some(cur)) => cur,
                    Ok(None) => return None,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                },
            };

            match cur.scan.next() {
                Some(Ok(item)) => {
                    cur.count += 1;
                    self.current = Some(cur);
                    return Some(Ok(item));
                }
                Some(Err(e)) if !cur.last => {
                    self.failed = true;
                    let e = match e.downcast_ref::<Error>() {
                        Some(Error::Truncated) => {
                            anyhow!(Error::Corrupt("sealed value log file ends mid-entry"))
                        }
                        _ => e,
                    };
                    return Some(Err(e.context(format!(
                        "Replay value log file {:?} at offset {}",
                        cur.lf.get_path(),
                        cur.scan.offset()
                    ))));
                }
                // A bad record in the last file is the tail of an
                // interrupted write.
                Some(Err(_)) | None if cur.last => {
                    if let Err(e) = self.activate(cur) {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileExt;

    use temp_dir::TempDir;

    use super::*;
    use crate::{
        entry::Entry,
        test::{open_vlog, test_options},
        util::closer::Closer,
    };

    #[tokio::test]
    async fn test_replay_empty_dir() {
        let test_dir = TempDir::new().unwrap();
        let mut replay = ValueLog::recover(test_options(&test_dir)).unwrap();
        assert!(replay.next().is_none());
        let vlog = replay.finish().await.unwrap();
        assert_eq!(vlog.fids().unwrap(), vec![0]);
        assert!(test_dir.path().join("000000.vlog").exists());
        vlog.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_order_across_files() {
        let test_dir = TempDir::new().unwrap();
        let mut opt = test_options(&test_dir);
        opt.value_log_max_entries = 4;

        let vlog = open_vlog(opt.clone()).await;
        let entries: Vec<Entry> = (0..10).map(|i| Entry::new(vec![i], vec![i; 3])).collect();
        let vptrs = vlog.write(entries.clone(), &Closer::new()).await.unwrap();
        vlog.close().await.unwrap();

        let mut replay = ValueLog::recover(opt).unwrap();
        let got: Vec<(Entry, ValuePointer)> = replay.by_ref().map(|r| r.unwrap()).collect();
        let want: Vec<(Entry, ValuePointer)> = entries.into_iter().zip(vptrs).collect();
        assert_eq!(got, want);

        let vlog = replay.finish().await.unwrap();
        // Two entries already in the last file, two more fit before rotating.
        let more: Vec<Entry> = (0..3).map(|i| Entry::new(vec![100 + i], "x")).collect();
        let vptrs = vlog.write(more, &Closer::new()).await.unwrap();
        let fids: Vec<u32> = vptrs.iter().map(|vp| vp.fid).collect();
        assert_eq!(fids, vec![2, 2, 3]);
        vlog.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_corrupt_sealed_file() {
        let test_dir = TempDir::new().unwrap();
        let mut opt = test_options(&test_dir);
        opt.value_log_max_entries = 2;

        let vlog = open_vlog(opt.clone()).await;
        let entries: Vec<Entry> = (0..5).map(|i| Entry::new(vec![i], "value")).collect();
        let vptrs = vlog.write(entries, &Closer::new()).await.unwrap();
        vlog.close().await.unwrap();

        let path = test_dir.path().join("000000.vlog");
        let fd = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        fd.write_all_at(b"X", vptrs[1].offset as u64 + 5).unwrap();
        drop(fd);

        let mut replay = ValueLog::recover(opt.clone()).unwrap();
        assert!(replay.next().unwrap().is_ok());
        let err = replay.next().unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Corrupt(_))));
        assert!(replay.next().is_none());
        assert!(replay.finish().await.is_err());

        let res = ValueLog::open(opt, |_, _| Ok(())).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_replay_removes_empty_files() {
        let test_dir = TempDir::new().unwrap();
        let opt = test_options(&test_dir);
        let vlog = open_vlog(opt.clone()).await;
        let vptrs = vlog
            .write(vec![Entry::new("k", "v")], &Closer::new())
            .await
            .unwrap();
        vlog.close().await.unwrap();

        // An empty file in the middle and a fresh one at the end.
        std::fs::rename(
            test_dir.path().join("000000.vlog"),
            test_dir.path().join("000002.vlog"),
        )
        .unwrap();
        std::fs::write(test_dir.path().join("000000.vlog"), b"").unwrap();
        std::fs::write(test_dir.path().join("000005.vlog"), b"").unwrap();

        let mut seen = vec![];
        let vlog = ValueLog::open(opt, |ent, vp| {
            seen.push((ent, vp));
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(vlog.fids().unwrap(), vec![2, 5]);
        assert!(!test_dir.path().join("000000.vlog").exists());
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, ValuePointer::new(2, vptrs[0].len, 0));

        let vp = vlog
            .write(vec![Entry::new("k2", "v2")], &Closer::new())
            .await
            .unwrap();
        assert_eq!(vp[0].fid, 5);
        vlog.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_callback_error() {
        let test_dir = TempDir::new().unwrap();
        let opt = test_options(&test_dir);
        let vlog = open_vlog(opt.clone()).await;
        vlog.write(vec![Entry::new("k", "v")], &Closer::new())
            .await
            .unwrap();
        vlog.close().await.unwrap();

        let res = ValueLog::open(opt, |_, _| Err(anyhow!("index full"))).await;
        assert!(res.is_err());
    }
}
