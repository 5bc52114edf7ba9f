mod discard;
mod gc;
mod logfile;
mod manager;
mod read;
mod replay;
mod write;

use std::{
    collections::HashMap,
    sync::{atomic, Arc, Mutex, RwLock},
};

use anyhow::{anyhow, bail, Result};
use log::{debug, info};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{error::Error, option::Options, util::closer::Closer, util::MEM_ORDERING};

use self::{
    discard::DiscardStats,
    logfile::ActiveFile,
    manager::SegmentManager,
    write::{WriteReq, Writer, KV_WRITE_CH_CAPACITY},
};

pub use self::{
    gc::{DefaultPicker, GcPicker, LivenessOracle, OldestPicker, PointerUpdater, SegmentStats},
    replay::Replay,
};

/// Offsets are u32, so no value log file can grow past this.
pub const MAX_VLOG_FILE_SIZE: u32 = u32::MAX;

pub const VLOG_FILE_EXT: &str = ".vlog";

/// Lifecycle of a value log: `Closed -> Recovering -> Open -> Closing ->
/// Closed`. Reads and writes are only served while `Open`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Closed = 0,
    Recovering = 1,
    Open = 2,
    Closing = 3,
}

impl From<u8> for LogState {
    fn from(v: u8) -> Self {
        match v {
            1 => LogState::Recovering,
            2 => LogState::Open,
            3 => LogState::Closing,
            _ => LogState::Closed,
        }
    }
}

/// Handle to an open value log. Clones share the same log.
#[derive(Clone)]
pub struct ValueLog {
    inner: Arc<ValueLogInner>,
}

pub(crate) struct ValueLogInner {
    opt: Options,
    manager: Arc<SegmentManager>,
    discard_stats: DiscardStats,
    state: atomic::AtomicU8,

    write_tx: Mutex<Option<mpsc::Sender<WriteReq>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,

    // Held for the whole of a GC pass.
    gc_lock: tokio::sync::Mutex<()>,
    gc_picker: RwLock<Arc<dyn GcPicker>>,

    // Raised on close, stops background and running GC.
    closer: Closer,
}

impl ValueLog {
    fn new(opt: Options, manager: Arc<SegmentManager>, discard_stats: DiscardStats) -> Self {
        Self {
            inner: Arc::new(ValueLogInner {
                opt,
                manager,
                discard_stats,
                state: (LogState::Recovering as u8).into(),
                write_tx: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                gc_lock: tokio::sync::Mutex::new(()),
                gc_picker: RwLock::new(Arc::new(DefaultPicker)),
                closer: Closer::new(),
            }),
        }
    }

    /// Hands `active` to a new writer task and opens the log for reads and
    /// writes.
    async fn start(&self, active: ActiveFile, num_entries_written: u32) -> Result<()> {
        let fid = active.fid();
        let offset = active.write_at();
        let (write_tx, write_rx) = mpsc::channel(KV_WRITE_CH_CAPACITY);
        let writer = Writer::new(
            Arc::clone(&self.inner.manager),
            self.inner.opt.clone(),
            active,
            num_entries_written,
        );
        let handle = tokio::spawn(writer.do_writes(write_rx));

        *self
            .inner
            .write_tx
            .lock()
            .map_err(|e| anyhow!("Get write channel error: {}", e))? = Some(write_tx);
        *self.inner.writer.lock().await = Some(handle);
        self.set_state(LogState::Open);

        info!(
            "Value log opened in {:?}, appending to file {} at offset {}",
            self.inner.opt.dir, fid, offset
        );
        Ok(())
    }

    pub fn state(&self) -> LogState {
        self.inner.state.load(MEM_ORDERING).into()
    }

    fn set_state(&self, state: LogState) {
        self.inner.state.store(state as u8, MEM_ORDERING);
    }

    pub fn get_opt(&self) -> &Options {
        &self.inner.opt
    }

    /// Ids of every value log file, in ascending order.
    pub fn fids(&self) -> Result<Vec<u32>> {
        self.inner.manager.fids()
    }

    /// Records bytes made stale per file, as seen by the index. Positive
    /// counts add up, a negative count resets the file's total.
    pub fn update_discard_stats(&self, stats: &HashMap<u32, i64>) -> Result<()> {
        for (&fid, &discard) in stats {
            self.inner.discard_stats.update(fid, discard)?;
        }
        Ok(())
    }

    /// Discarded bytes recorded for `fid`.
    pub fn discard_stats(&self, fid: u32) -> Result<u64> {
        self.inner.discard_stats.get(fid)
    }

    /// Stops accepting requests, waits for queued writes to be synced and
    /// for a running GC pass to stop, and releases every file.
    pub async fn close(&self) -> Result<()> {
        if self
            .inner
            .state
            .compare_exchange(
                LogState::Open as u8,
                LogState::Closing as u8,
                MEM_ORDERING,
                MEM_ORDERING,
            )
            .is_err()
        {
            bail!(Error::Closed)
        }
        debug!("Closing value log {:?}", self.inner.opt.dir);
        self.inner.closer.signal();

        // The writer exits once the last sender is gone.
        self.inner
            .write_tx
            .lock()
            .map_err(|e| anyhow!("Get write channel error: {}", e))?
            .take();
        let handle = self.inner.writer.lock().await.take();
        let res = match handle {
            Some(handle) => handle
                .await
                .map_err(|e| anyhow!("Value log writer task error: {}", e))
                .and_then(|r| r),
            None => Ok(()),
        };

        let _gc = self.inner.gc_lock.lock().await;
        self.inner.discard_stats.sync()?;
        self.inner.manager.close()?;
        self.set_state(LogState::Closed);
        info!("Value log {:?} closed", self.inner.opt.dir);
        res
    }
}
