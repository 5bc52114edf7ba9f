pub mod closer;
pub mod file;

use std::sync::atomic::Ordering;

use crc::{Crc, CRC_32_ISCSI};

pub(crate) const MEM_ORDERING: Ordering = Ordering::SeqCst;

pub const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
