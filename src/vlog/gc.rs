use std::{collections::HashMap, fs::File, sync::Arc};

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use log::{debug, error, info};
use tokio::{select, task::JoinHandle, time::sleep};

use crate::{
    entry::{Entry, ValuePointer},
    error::Error,
    util::closer::Closer,
};

use super::{logfile::LogFile, LogState, ValueLog};

/// Answers whether the index still refers to an entry at exactly this
/// location.
pub trait LivenessOracle: Send + Sync {
    fn is_live(&self, key: &[u8], vp: &ValuePointer) -> Result<bool>;
}

/// Moves the index from `old`, the location GC found live, to `new`. The
/// swap must be conditional: if the index no longer holds `old` for `key`,
/// the key was rewritten meanwhile and its current pointer stays.
pub trait PointerUpdater: Send + Sync {
    fn update(&self, key: &[u8], old: &ValuePointer, new: ValuePointer) -> Result<()>;
}

/// A sealed value log file offered to a [`GcPicker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStats {
    pub fid: u32,
    pub size: u32,
    /// Stale bytes reported through `ValueLog::update_discard_stats`.
    pub discard: u64,
}

/// Chooses which file a GC pass rewrites. Candidates come in ascending id
/// order; returning `None` skips the pass.
pub trait GcPicker: Send + Sync {
    fn pick(&self, candidates: &[SegmentStats]) -> Option<u32>;
}

/// The file with the most discarded bytes, or the oldest one when nothing
/// has been reported.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPicker;

impl GcPicker for DefaultPicker {
    fn pick(&self, candidates: &[SegmentStats]) -> Option<u32> {
        let mut best: Option<&SegmentStats> = None;
        for s in candidates.iter().filter(|s| s.discard > 0) {
            if best.map_or(true, |b| s.discard > b.discard) {
                best = Some(s);
            }
        }
        best.or_else(|| candidates.first()).map(|s| s.fid)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OldestPicker;

impl GcPicker for OldestPicker {
    fn pick(&self, candidates: &[SegmentStats]) -> Option<u32> {
        candidates.first().map(|s| s.fid)
    }
}

impl ValueLog {
    pub fn set_gc_picker(&self, picker: Arc<dyn GcPicker>) -> Result<()> {
        *self
            .inner
            .gc_picker
            .write()
            .map_err(|e| anyhow!("Get gc picker error: {}", e))? = picker;
        Ok(())
    }

    /// Rewrites one value log file if at least `discard_ratio` of it is
    /// stale: live entries are appended again, the index is pointed at
    /// their new location, and the file is deleted.
    ///
    /// Returns `Error::NoRewrite` when no file qualifies. Any other failure
    /// leaves the file in place, so the pass can simply be run again.
    pub async fn run_gc(
        &self,
        discard_ratio: f64,
        oracle: &dyn LivenessOracle,
        updater: &dyn PointerUpdater,
        cancel: &Closer,
    ) -> Result<()> {
        if discard_ratio == 0.0 {
            bail!(Error::ThresholdZero)
        }
        if !(discard_ratio > 0.0 && discard_ratio < 1.0) {
            bail!(Error::InvalidRequest)
        }
        if self.state() != LogState::Open {
            bail!(Error::Rejected)
        }
        let Ok(_guard) = self.inner.gc_lock.try_lock() else {
            bail!(Error::Rejected)
        };

        let Some(fid) = self.pick_log()? else {
            bail!(Error::NoRewrite)
        };
        let lf = self.inner.manager.acquire(fid)?;
        let fd = self.inner.manager.handle(&lf)?;

        self.sample(&lf, &fd, discard_ratio, oracle, cancel)?;
        self.rewrite(&lf, &fd, oracle, updater, cancel).await?;

        // Our own reference would keep the deletion waiting.
        drop(fd);
        drop(lf);
        self.inner.discard_stats.update(fid, -1)?;
        self.inner.manager.delete(fid).await?;
        info!("Value log GC rewrote and deleted file {}", fid);
        Ok(())
    }

    /// Runs a GC pass every `gc_interval`, repeating it as long as files get
    /// rewritten, until the value log is closed.
    pub fn spawn_gc(
        &self,
        oracle: Arc<dyn LivenessOracle>,
        updater: Arc<dyn PointerUpdater>,
    ) -> JoinHandle<()> {
        let vlog = self.clone();
        tokio::spawn(async move {
            let closer = vlog.inner.closer.clone();
            let ratio = vlog.inner.opt.gc_discard_ratio;
            let interval = vlog.inner.opt.gc_interval;

            loop {
                select! {
                    _ = closer.wait() => break,
                    _ = sleep(interval) => {}
                }
                loop {
                    let res = vlog
                        .run_gc(ratio, oracle.as_ref(), updater.as_ref(), &closer)
                        .await;
                    let Err(e) = res else { continue };
                    match e.downcast_ref::<Error>() {
                        Some(Error::NoRewrite) | Some(Error::Rejected) => {}
                        _ if closer.is_signalled() => {}
                        _ => error!("Value log GC failed: {:#}", e),
                    }
                    break;
                }
            }
            debug!("Value log GC stopped");
        })
    }

    fn pick_log(&self) -> Result<Option<u32>> {
        let mut discards = HashMap::new();
        self.inner
            .discard_stats
            .iterate(|fid, discard| {
                discards.insert(fid, discard);
            })?;
        let candidates: Vec<SegmentStats> = self
            .inner
            .manager
            .sealed()?
            .iter()
            .map(|lf| SegmentStats {
                fid: lf.get_fid(),
                size: lf.get_size(),
                discard: discards.get(&lf.get_fid()).copied().unwrap_or_default(),
            })
            .collect();

        let picker = Arc::clone(
            &*self
                .inner
                .gc_picker
                .read()
                .map_err(|e| anyhow!("Get gc picker error: {}", e))?,
        );
        let fid = picker.pick(&candidates);
        debug!("Value log GC picked {:?} out of {:?}", fid, candidates);
        Ok(fid.filter(|fid| candidates.iter().any(|s| s.fid == *fid)))
    }

    fn check_cancel(&self, cancel: &Closer) -> Result<()> {
        if self.inner.closer.is_signalled() {
            bail!(Error::Rejected)
        }
        if cancel.is_signalled() {
            bail!(Error::Cancelled)
        }
        Ok(())
    }

    fn is_stale(&self, oracle: &dyn LivenessOracle, ent: &Entry, vp: &ValuePointer) -> Result<bool> {
        Ok(ent.is_expired() || !oracle.is_live(&ent.key, vp)?)
    }

    /// Looks at the first tenth of the file, at least one entry, and bails
    /// with `NoRewrite` unless enough of it is stale.
    fn sample(
        &self,
        lf: &LogFile,
        fd: &File,
        discard_ratio: f64,
        oracle: &dyn LivenessOracle,
        cancel: &Closer,
    ) -> Result<()> {
        let window = (lf.get_size() as u64 / 10).max(1);
        let (mut total, mut stale) = (0_u64, 0_u64);
        for item in lf.scan(fd)? {
            self.check_cancel(cancel)?;
            let (ent, vp) = item?;
            total += vp.len as u64;
            if self.is_stale(oracle, &ent, &vp)? {
                stale += vp.len as u64;
            }
            if total >= window {
                break;
            }
        }

        debug!(
            "Value log GC sampled file {}: {} of {} bytes stale",
            lf.get_fid(),
            stale,
            total
        );
        if total == 0 || (stale as f64) < discard_ratio * total as f64 {
            bail!(Error::NoRewrite)
        }
        Ok(())
    }

    async fn rewrite(
        &self,
        lf: &LogFile,
        fd: &File,
        oracle: &dyn LivenessOracle,
        updater: &dyn PointerUpdater,
        cancel: &Closer,
    ) -> Result<()> {
        let max_batch = self.inner.opt.gc_rewrite_batch_size as u64;
        let mut batch = vec![];
        let mut batch_size = 0_u64;
        let (mut moved, mut dropped) = (0_usize, 0_usize);

        for item in lf.scan(fd)? {
            self.check_cancel(cancel)?;
            let (ent, vp) = item?;
            if self.is_stale(oracle, &ent, &vp)? {
                dropped += 1;
                continue;
            }

            batch_size += ent.encoded_size();
            batch.push((ent, vp));
            if batch_size >= max_batch {
                moved += self
                    .relocate(std::mem::take(&mut batch), updater, cancel)
                    .await?;
                batch_size = 0;
            }
        }
        if !batch.is_empty() {
            moved += self.relocate(batch, updater, cancel).await?;
        }

        debug!(
            "Value log GC of file {}: {} entries moved, {} dropped",
            lf.get_fid(),
            moved,
            dropped
        );
        Ok(())
    }

    async fn relocate(
        &self,
        batch: Vec<(Entry, ValuePointer)>,
        updater: &dyn PointerUpdater,
        cancel: &Closer,
    ) -> Result<usize> {
        let (entries, olds): (Vec<Entry>, Vec<ValuePointer>) = batch.into_iter().unzip();
        let keys: Vec<Bytes> = entries.iter().map(|ent| ent.key.clone()).collect();
        let vptrs = match self.write(entries, cancel).await {
            Ok(vptrs) => vptrs,
            Err(e) => match e.downcast_ref::<Error>() {
                Some(Error::Closed) => bail!(Error::Rejected),
                _ => return Err(e),
            },
        };
        for ((key, old), vp) in keys.iter().zip(&olds).zip(vptrs) {
            updater.update(key, old, vp)?;
        }
        Ok(keys.len())
    }
}
