#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The `value_log_file_size` option is not within the valid range.
    #[error("Invalid `value_log_file_size`: {0}, must be in range [1B, 4GB)")]
    ValueLogSize(usize),

    /// Some other option holds a value the value log can't work with.
    #[error("Invalid option: {0}")]
    InvalidOption(&'static str),

    /// A record failed validation: checksum mismatch or a malformed header.
    #[error("Corrupt value log entry: {0}")]
    Corrupt(&'static str),

    /// The bytes end in the middle of a record. Only the recovery path
    /// handles this, by truncating the tail of the last file.
    #[error("Value log entry is truncated")]
    Truncated,

    /// A pointer names bytes outside of what its file has made visible.
    #[error("Pointer out of range: fid={fid}, offset={offset}, len={len}, file size={size}")]
    OutOfRange {
        fid: u32,
        offset: u32,
        len: u32,
        size: u32,
    },

    /// The file a pointer names doesn't exist, usually because value log GC
    /// already deleted it.
    #[error("Value log file {0} not found")]
    SegmentNotFound(u32),

    /// A single entry is bigger than `value_log_file_size` and oversized
    /// entries are disabled, or it can't be addressed by a u32 offset.
    #[error("Entry of {size} bytes exceeds the maximum of {max} bytes")]
    OversizedEntry { size: u64, max: u64 },

    /// The caller's cancellation signal was raised.
    #[error("Operation cancelled")]
    Cancelled,

    /// A read or write is performed after closing the value log.
    #[error("Value log closed")]
    Closed,

    /// Threshold is set to zero, and value log GC is called. In such a case,
    /// GC can't be run.
    #[error("Value log GC can't run because `threshold` is set to zero")]
    ThresholdZero,

    /// A call for value log GC doesn't result in a log file rewrite.
    #[error("Value log GC attempt didn't result in any clean up")]
    NoRewrite,

    /// A value log GC is called either while another GC is running, or
    /// after ValueLog::close has been called.
    #[error("Value log GC request rejected")]
    Rejected,

    /// The user request is invalid.
    #[error("Invalid request")]
    InvalidRequest,
}
