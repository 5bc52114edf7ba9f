use std::{path::Path, sync::Mutex};

use anyhow::{anyhow, Result};
use log::info;

use crate::util::file::{open_mmap_file, MmapFile};

const DISCARD_FNAME: &str = "DISCARD";
const DISCARD_FILE_SIZE: usize = 1 << 20;

/// fid(8 bytes) + discard(8 bytes)
const SLOT_SIZE: usize = 16;

/// Stale bytes per value log file, as reported by the index. Kept in a
/// memory-mapped file of slots sorted by file id:
/// +---------------------+-------------------------+
/// | fid + 1 (u64, BE)   | discarded bytes (u64 BE)|
/// +---------------------+-------------------------+
/// Ids are stored off by one so that a zero key marks the first empty slot.
pub(crate) struct DiscardStats(Mutex<DiscardStatsInner>);

struct DiscardStatsInner {
    mfile: MmapFile,
    next_empty_slot: usize,
}

impl DiscardStats {
    pub(crate) fn new(dir: &str) -> Result<Self> {
        Ok(DiscardStats(Mutex::new(DiscardStatsInner::new(
            dir,
            DISCARD_FILE_SIZE,
        )?)))
    }

    /// Adds `discard` bytes to `fid` and returns the new total. A zero
    /// `discard` only reads the total, a negative one resets it.
    pub(crate) fn update(&self, fid: u32, discard: i64) -> Result<u64> {
        self.0
            .lock()
            .map_err(|e| anyhow!("Get discard stats error: {}", e))?
            .update(fid as u64 + 1, discard)
    }

    pub(crate) fn get(&self, fid: u32) -> Result<u64> {
        self.update(fid, 0)
    }

    pub(crate) fn iterate<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u32, u64),
    {
        self.0
            .lock()
            .map_err(|e| anyhow!("Get discard stats error: {}", e))?
            .iterate(|key, val| f((key - 1) as u32, val))
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.0
            .lock()
            .map_err(|e| anyhow!("Get discard stats error: {}", e))?
            .mfile
            .sync()
    }
}

impl DiscardStatsInner {
    fn new(dir: &str, size: usize) -> Result<Self> {
        let fname = Path::new(dir).join(DISCARD_FNAME);

        let (mfile, is_new) = open_mmap_file(
            fname,
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true),
            size,
        )?;

        let mut lf = DiscardStatsInner {
            mfile,
            next_empty_slot: 0,
        };
        if is_new {
            lf.zero_out();
        }

        lf.next_empty_slot = lf.max_slot();
        for slot in 0..lf.max_slot() {
            if lf.get(SLOT_SIZE * slot) == 0 {
                lf.next_empty_slot = slot;
                break;
            }
        }

        lf.sort();
        info!(
            "Discard stats {:?} next_empty_slot: {}",
            lf.mfile.path(),
            lf.next_empty_slot
        );

        Ok(lf)
    }

    fn update(&mut self, key: u64, discard: i64) -> Result<u64> {
        if let Ok(idx) = self.search(key) {
            let off = idx * SLOT_SIZE + 8;
            let cur_disc = self.get(off);
            if discard == 0 {
                return Ok(cur_disc);
            }
            if discard < 0 {
                self.set(off, 0);
                return Ok(0);
            }
            let total = cur_disc.saturating_add(discard as u64);
            self.set(off, total);
            return Ok(total);
        }

        if discard <= 0 {
            return Ok(0);
        }

        let idx = self.next_empty_slot;
        self.set(idx * SLOT_SIZE, key);
        self.set(idx * SLOT_SIZE + 8, discard as u64);

        self.next_empty_slot += 1;
        while self.next_empty_slot >= self.max_slot() {
            let l = self.mfile.as_ref().len() as u64;
            self.mfile.truncate(l * 2)?;
        }
        self.zero_out();

        self.sort();

        Ok(discard as u64)
    }

    fn search(&self, key: u64) -> std::result::Result<usize, usize> {
        let (mut lo, mut hi) = (0, self.next_empty_slot);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.get(mid * SLOT_SIZE).cmp(&key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    fn iterate<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u64, u64),
    {
        for slot in 0..self.next_empty_slot {
            let idx = SLOT_SIZE * slot;
            f(self.get(idx), self.get(idx + 8));
        }
        Ok(())
    }

    fn zero_out(&mut self) {
        self.set(self.next_empty_slot * SLOT_SIZE, 0);
        self.set(self.next_empty_slot * SLOT_SIZE + 8, 0);
    }

    fn max_slot(&self) -> usize {
        self.mfile.as_ref().len() / SLOT_SIZE
    }

    fn get(&self, offset: usize) -> u64 {
        let mut buf = [0; 8];
        buf.copy_from_slice(&self.mfile.as_ref()[offset..offset + 8]);
        u64::from_be_bytes(buf)
    }

    fn set(&mut self, offset: usize, value: u64) {
        self.mfile.as_mut()[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    fn sort(&mut self) {
        let mut slots: Vec<(u64, u64)> = (0..self.next_empty_slot)
            .map(|slot| (self.get(slot * SLOT_SIZE), self.get(slot * SLOT_SIZE + 8)))
            .collect();
        slots.sort_unstable_by_key(|&(key, _)| key);
        for (slot, (key, val)) in slots.into_iter().enumerate() {
            self.set(slot * SLOT_SIZE, key);
            self.set(slot * SLOT_SIZE + 8, val);
        }
    }
}
