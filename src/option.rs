use std::time::Duration;

use anyhow::{bail, Result};

use crate::error::Error;

/// Default ceiling of a single value log file: 1GB.
const DEFAULT_VALUE_LOG_FILE_SIZE: usize = (1 << 30) - 1;

#[derive(Debug, Clone)]
pub struct Options {
    // required options.
    pub dir: String,

    // usually modified options.
    pub sync_policy: SyncPolicy,

    // find tuning options.
    /// A value log file is rotated once appending the next entry would take
    /// it past this size. An entry that is bigger on its own gets a file to
    /// itself, see `allow_oversized_entries`.
    pub value_log_file_size: usize,
    pub value_log_max_entries: usize,

    /// How many read handles of sealed files are kept open. The handle of
    /// the file being written is never counted.
    pub max_open_files: usize,

    /// When unset, writing an entry bigger than `value_log_file_size` fails
    /// with [`Error::OversizedEntry`].
    pub allow_oversized_entries: bool,

    // value log GC options.
    pub gc_discard_ratio: f64,
    pub gc_interval: Duration,
    pub gc_rewrite_batch_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: "/tmp/vlog".to_string(),

            sync_policy: Default::default(),

            value_log_file_size: DEFAULT_VALUE_LOG_FILE_SIZE,
            value_log_max_entries: 1000000,

            max_open_files: 64,
            allow_oversized_entries: true,

            gc_discard_ratio: 0.5,
            gc_interval: Duration::from_secs(10 * 60),
            gc_rewrite_batch_size: 4 << 20,
        }
    }
}

/// When written bytes are made durable, and therefore when their pointers
/// are handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Every batch taken off the write queue is synced before replying.
    EveryBatch,
    /// Requests are gathered for up to `interval`, or until `max_bytes` of
    /// encoded entries are queued, and share a single sync.
    GroupCommit { interval: Duration, max_bytes: usize },
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::EveryBatch
    }
}

pub(crate) fn check_options(opt: &Options) -> Result<()> {
    if !(opt.value_log_file_size > 0 && opt.value_log_file_size < u32::MAX as usize) {
        bail!(Error::ValueLogSize(opt.value_log_file_size))
    }
    if opt.value_log_max_entries == 0 {
        bail!(Error::InvalidOption("`value_log_max_entries` must be positive"))
    }
    if opt.max_open_files == 0 {
        bail!(Error::InvalidOption("`max_open_files` must be positive"))
    }
    if !(opt.gc_discard_ratio > 0.0 && opt.gc_discard_ratio < 1.0) {
        bail!(Error::InvalidOption("`gc_discard_ratio` must be in range (0, 1)"))
    }
    if opt.gc_rewrite_batch_size == 0 {
        bail!(Error::InvalidOption("`gc_rewrite_batch_size` must be positive"))
    }
    if let SyncPolicy::GroupCommit { max_bytes, .. } = opt.sync_policy {
        if max_bytes == 0 {
            bail!(Error::InvalidOption("group commit `max_bytes` must be positive"))
        }
    }
    Ok(())
}
