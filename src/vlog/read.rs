use anyhow::{bail, Result};

use crate::{
    entry::{Entry, ValuePointer},
    error::Error,
    util::closer::Closer,
};

use super::{LogState, ValueLog};

impl ValueLog {
    /// Reads the entry `vp` points at. Reads never wait for the writer, and
    /// the file they read from can't be deleted until they return.
    pub fn read(&self, vp: ValuePointer, cancel: &Closer) -> Result<Entry> {
        if self.state() == LogState::Closed {
            bail!(Error::Closed)
        }
        if cancel.is_signalled() {
            bail!(Error::Cancelled)
        }

        let lf = self.inner.manager.acquire(vp.fid)?;
        let fd = self.inner.manager.handle(&lf)?;
        if cancel.is_signalled() {
            bail!(Error::Cancelled)
        }
        let buf = lf.read_at(&fd, &vp)?;

        let (ent, n) = match Entry::decode_bytes(&buf) {
            Ok(res) => res,
            Err(e) => match e.downcast_ref::<Error>() {
                Some(Error::Truncated) => bail!(Error::Corrupt("entry is longer than its pointer")),
                _ => return Err(e),
            },
        };
        if n != vp.len as usize {
            bail!(Error::Corrupt("entry is shorter than its pointer"))
        }
        Ok(ent)
    }
}
