use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use bytes::BytesMut;
use log::{debug, error};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::sleep,
};

use crate::{
    entry::{Entry, ValuePointer},
    error::Error,
    option::{Options, SyncPolicy},
    util::closer::Closer,
};

use super::{
    logfile::{ActiveFile, LogFile},
    manager::SegmentManager,
    LogState, ValueLog, MAX_VLOG_FILE_SIZE,
};

pub(crate) const KV_WRITE_CH_CAPACITY: usize = 1000;

const DEFAULT_PAGE_SIZE: usize = 4096;

pub(crate) struct WriteReq {
    entries: Vec<Entry>,
    cancel: Closer,
    result_tx: oneshot::Sender<Result<Vec<ValuePointer>>>,
}

impl WriteReq {
    fn estimate_size(&self) -> u64 {
        self.entries.iter().map(Entry::encoded_size).sum()
    }
}

impl ValueLog {
    /// Appends `entries` and returns one pointer per entry, in order. The
    /// pointers are returned only once the bytes they address are durable;
    /// on failure nothing of the batch stays in the log.
    pub async fn write(&self, entries: Vec<Entry>, cancel: &Closer) -> Result<Vec<ValuePointer>> {
        if self.state() != LogState::Open {
            bail!(Error::Closed)
        }
        if cancel.is_signalled() {
            bail!(Error::Cancelled)
        }
        if entries.is_empty() {
            return Ok(vec![]);
        }

        let write_tx = self
            .inner
            .write_tx
            .lock()
            .map_err(|e| anyhow!("Get write channel error: {}", e))?
            .clone();
        let Some(write_tx) = write_tx else {
            bail!(Error::Closed)
        };

        let (result_tx, result_rx) = oneshot::channel();
        let req = WriteReq {
            entries,
            cancel: cancel.clone(),
            result_tx,
        };
        if write_tx.send(req).await.is_err() {
            bail!(Error::Closed)
        }
        drop(write_tx);

        select! {
            biased;
            res = result_rx => match res {
                Ok(res) => res,
                Err(_) => bail!(Error::Closed),
            },
            _ = cancel.wait() => bail!(Error::Cancelled),
        }
    }
}

/// The only place where value log files grow. Runs as a single task fed by
/// the write channel, so offsets are handed out one batch at a time.
pub(crate) struct Writer {
    manager: Arc<SegmentManager>,
    opt: Options,
    active: ActiveFile,
    num_entries_written: u32,
    buf: BytesMut,
}

/// What a batch changed, so that a failure can undo it.
struct Group {
    start: u32,
    start_entries: u32,
    // The file that was active when the batch began, once rotated away.
    first: Option<ActiveFile>,
    rotated: Vec<Arc<LogFile>>,
    created: Vec<u32>,
}

impl Group {
    fn new(active: &ActiveFile, num_entries_written: u32) -> Self {
        Self {
            start: active.write_at(),
            start_entries: num_entries_written,
            first: None,
            rotated: vec![],
            created: vec![],
        }
    }

    fn retire(&mut self, prev: ActiveFile) {
        self.rotated.push(Arc::clone(prev.log_file()));
        if self.first.is_none() {
            self.first = Some(prev);
        }
    }

    fn commit(self) {
        for lf in self.rotated {
            lf.mark_sealed();
        }
    }
}

impl Writer {
    pub(crate) fn new(
        manager: Arc<SegmentManager>,
        opt: Options,
        active: ActiveFile,
        num_entries_written: u32,
    ) -> Self {
        Self {
            manager,
            opt,
            active,
            num_entries_written,
            buf: BytesMut::with_capacity(DEFAULT_PAGE_SIZE),
        }
    }

    pub(crate) async fn do_writes(mut self, mut write_rx: mpsc::Receiver<WriteReq>) -> Result<()> {
        while let Some(req) = write_rx.recv().await {
            let mut reqs = vec![req];
            self.gather(&mut write_rx, &mut reqs).await;
            self.write_requests(reqs).await;
        }

        debug!("Write channel closed, syncing value log file {}", self.active.fid());
        self.active.sync_blocking().await?;
        self.active.publish();
        Ok(())
    }

    /// Pulls more queued requests into the batch according to the sync
    /// policy.
    async fn gather(&self, write_rx: &mut mpsc::Receiver<WriteReq>, reqs: &mut Vec<WriteReq>) {
        match self.opt.sync_policy {
            SyncPolicy::EveryBatch => {
                while reqs.len() < KV_WRITE_CH_CAPACITY {
                    match write_rx.try_recv() {
                        Ok(req) => reqs.push(req),
                        Err(_) => break,
                    }
                }
            }
            SyncPolicy::GroupCommit {
                interval,
                max_bytes,
            } => {
                let mut size: u64 = reqs.iter().map(WriteReq::estimate_size).sum();
                let deadline = sleep(interval);
                tokio::pin!(deadline);

                while size < max_bytes as u64 && reqs.len() < KV_WRITE_CH_CAPACITY {
                    select! {
                        biased;
                        _ = &mut deadline => break,
                        req = write_rx.recv() => match req {
                            Some(req) => {
                                size += req.estimate_size();
                                reqs.push(req);
                            }
                            None => break,
                        },
                    }
                }
            }
        }
    }

    async fn write_requests(&mut self, reqs: Vec<WriteReq>) {
        debug!("write_requests called with {} requests", reqs.len());
        let mut group = Group::new(&self.active, self.num_entries_written);
        let mut results = Vec::with_capacity(reqs.len());
        let mut failure = None;

        for req in reqs.iter() {
            if req.cancel.is_signalled() {
                results.push(Err(anyhow!(Error::Cancelled)));
                continue;
            }
            if let Err(e) = self.validate(req) {
                results.push(Err(e));
                continue;
            }
            match self.write_entries(&req.entries, &mut group) {
                Ok(vptrs) => results.push(Ok(vptrs)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if failure.is_none() {
            if let Err(e) = self.active.sync_blocking().await {
                failure = Some(e);
            }
        }

        let Some(e) = failure else {
            self.active.publish();
            group.commit();
            let count: usize = results.iter().flatten().map(Vec::len).sum();
            debug!("{} entries written", count);
            for (req, res) in reqs.into_iter().zip(results) {
                let _ = req.result_tx.send(res);
            }
            return;
        };

        error!(
            "Value log write failed, rolling back to offset {}: {:#}",
            group.start, e
        );
        if let Err(re) = self.rollback(group).await {
            error!("Value log rollback failed: {:#}", re);
        }
        let mut results = results.into_iter();
        for req in reqs {
            let res = match results.next() {
                Some(Err(own)) => Err(own),
                _ => Err(share_error(&e)),
            };
            let _ = req.result_tx.send(res);
        }
    }

    fn validate(&self, req: &WriteReq) -> Result<()> {
        let max = if self.opt.allow_oversized_entries {
            MAX_VLOG_FILE_SIZE as u64
        } else {
            self.opt.value_log_file_size as u64
        };
        for ent in &req.entries {
            let size = ent.encoded_size();
            if size > max {
                bail!(Error::OversizedEntry { size, max })
            }
        }
        Ok(())
    }

    fn write_entries(&mut self, entries: &[Entry], group: &mut Group) -> Result<Vec<ValuePointer>> {
        let mut vptrs = Vec::with_capacity(entries.len());
        for ent in entries {
            self.buf.clear();
            let n = ent.encode_with_buf(&mut self.buf) as u64;

            if self.should_rotate(n) {
                self.rotate(group)?;
            }

            let offset = self.active.append(&self.buf)?;
            self.num_entries_written += 1;
            vptrs.push(ValuePointer::new(self.active.fid(), n as u32, offset));
        }
        Ok(vptrs)
    }

    // An empty file takes any entry, which is how an oversized entry ends
    // up with a file of its own.
    fn should_rotate(&self, n: u64) -> bool {
        let woffset = self.active.write_at() as u64;
        woffset > 0
            && (woffset + n > self.opt.value_log_file_size as u64
                || self.num_entries_written as usize >= self.opt.value_log_max_entries)
    }

    fn rotate(&mut self, group: &mut Group) -> Result<()> {
        self.active.seal()?;
        let next = self.manager.create()?;
        group.created.push(next.fid());

        let prev = std::mem::replace(&mut self.active, next);
        debug!(
            "Rotated value log file {} at offset {}",
            prev.fid(),
            prev.write_at()
        );
        group.retire(prev);
        self.num_entries_written = 0;
        Ok(())
    }

    async fn rollback(&mut self, group: Group) -> Result<()> {
        let Group {
            start,
            start_entries,
            first,
            created,
            ..
        } = group;

        if let Some(first) = first {
            self.active = first;
        }
        for fid in created {
            self.manager.delete(fid).await?;
        }
        self.active.truncate(start)?;
        self.manager
            .pin(self.active.fid(), Arc::clone(self.active.fd()))?;
        self.num_entries_written = start_entries;
        Ok(())
    }
}

/// Copies a batch failure for every request of the batch, keeping I/O
/// errors recognizable as such.
fn share_error(e: &anyhow::Error) -> anyhow::Error {
    match e.downcast_ref::<std::io::Error>() {
        Some(io) => anyhow::Error::new(std::io::Error::new(io.kind(), format!("{:#}", e))),
        None => anyhow!("{:#}", e),
    }
}
