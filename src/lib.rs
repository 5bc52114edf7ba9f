pub mod entry;
pub mod error;
pub mod option;
pub mod util;
pub mod vlog;


pub use entry::{Entry, Meta, ValuePointer};
pub use error::Error;
pub use option::{Options, SyncPolicy};
pub use util::closer::Closer;
pub use vlog::{
    DefaultPicker, GcPicker, LivenessOracle, LogState, OldestPicker, PointerUpdater, Replay,
    SegmentStats, ValueLog,
};
