use std::{
    fmt::Display,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Result};
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;

use crate::{error::Error, util::CASTAGNOLI};

pub const CRC_SIZE: usize = 4;

/// key_len(5) + value_len(5) + meta(1) + expires_at(10)
pub const MAX_HEADER_SIZE: usize = 21;

/// fid(4) + len(4) + offset(4)
pub const VALUE_POINTER_SIZE: usize = 12;

const MAX_VARINT_LEN_64: usize = 10;

bitflags! {
    /// Flags stored next to every entry. Bits without a name here are kept
    /// as they are, so callers may use them for their own purposes.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Meta: u8 {
        /// The entry is a tombstone.
        const DELETE = 1 << 0;
        const DISCARD_EARLIER_VERSIONS = 1 << 2;
        const MERGE_ENTRY = 1 << 3;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub key_len: u32,
    pub value_len: u32,
    pub meta: u8,
    pub expires_at: u64,
}

impl Header {
    /// Appends the header to `buf` and returns the number of bytes written.
    /// The encoded header looks like
    /// +------------+--------------+------+-----------+
    /// | Key Length | Value Length | Meta | ExpiresAt |
    /// +------------+--------------+------+-----------+
    /// Lengths and ExpiresAt are varints, Meta is a single byte.
    pub fn encode(&self, buf: &mut BytesMut) -> usize {
        let start = buf.len();
        put_varint(buf, self.key_len as u64);
        put_varint(buf, self.value_len as u64);
        buf.put_u8(self.meta);
        put_varint(buf, self.expires_at);
        buf.len() - start
    }

    /// Decodes a header from the front of `buf`, returning it along with its
    /// encoded length.
    pub fn decode(buf: &[u8]) -> Result<(Header, usize)> {
        let mut off = 0;
        let key_len = get_varint(buf, &mut off)?;
        let value_len = get_varint(buf, &mut off)?;
        let meta = match buf.get(off) {
            Some(&b) => b,
            None => bail!(Error::Truncated),
        };
        off += 1;
        let expires_at = get_varint(buf, &mut off)?;

        let header = Header {
            key_len: u32::try_from(key_len)
                .map_err(|_| Error::Corrupt("key length overflows u32"))?,
            value_len: u32::try_from(value_len)
                .map_err(|_| Error::Corrupt("value length overflows u32"))?,
            meta,
            expires_at,
        };
        Ok((header, off))
    }
}

fn put_varint(buf: &mut BytesMut, v: u64) {
    let mut tmp = [0_u8; MAX_VARINT_LEN_64];
    let n = v.encode_var(&mut tmp);
    buf.put_slice(&tmp[..n]);
}

fn get_varint(buf: &[u8], off: &mut usize) -> Result<u64> {
    let rest = &buf[*off..];
    match u64::decode_var(rest) {
        Some((v, n)) => {
            *off += n;
            Ok(v)
        }
        // A terminating byte within reach means the varint itself is bad,
        // otherwise the bytes simply ran out.
        None if rest.iter().take(MAX_VARINT_LEN_64).any(|b| b & 0x80 == 0) => {
            bail!(Error::Corrupt("malformed varint"))
        }
        None if rest.len() < MAX_VARINT_LEN_64 => bail!(Error::Truncated),
        None => bail!(Error::Corrupt("malformed varint")),
    }
}

/// Entry is the unit stored in and retrieved from the value log.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
    pub meta: Meta,
    /// Unix timestamp in seconds, zero means the entry never expires.
    pub expires_at: u64,
}

impl Entry {
    pub fn new<K: Into<Bytes>, V: Into<Bytes>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Entry::default()
        }
    }

    pub fn delete<K: Into<Bytes>>(key: K) -> Self {
        Self {
            key: key.into(),
            meta: Meta::DELETE,
            ..Entry::default()
        }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_expired(&self) -> bool {
        if self.expires_at == 0 {
            return false;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.expires_at <= now
    }

    /// Number of bytes `encode_with_buf` will produce. Computed in u64 so
    /// that keys or values beyond u32 can be rejected before encoding.
    pub fn encoded_size(&self) -> u64 {
        let header = (self.key.len() as u64).required_space()
            + (self.value.len() as u64).required_space()
            + 1
            + self.expires_at.required_space();
        header as u64 + self.key.len() as u64 + self.value.len() as u64 + CRC_SIZE as u64
    }

    fn header(&self) -> Header {
        Header {
            key_len: self.key.len() as u32,
            value_len: self.value.len() as u32,
            meta: self.meta.bits(),
            expires_at: self.expires_at,
        }
    }

    /// Appends the encoded entry to `buf` and returns its length.
    /// +--------+-----+-------+-------------------+
    /// | header | key | value | crc32 (4 bytes)   |
    /// +--------+-----+-------+-------------------+
    /// The checksum covers header, key and value, and is stored big-endian.
    pub fn encode_with_buf(&self, buf: &mut BytesMut) -> usize {
        let start = buf.len();
        buf.reserve(self.encoded_size() as usize);

        self.header().encode(buf);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);

        let crc = CASTAGNOLI.checksum(&buf[start..]);
        buf.put_u32(crc);

        buf.len() - start
    }

    /// Decodes the entry at the front of `buf`, returning it along with the
    /// number of bytes it occupies. Key and value are copied out of `buf`.
    pub fn decode(buf: &[u8]) -> Result<(Entry, usize)> {
        let (header, header_len, total) = verify_record(buf)?;
        let key_end = header_len + header.key_len as usize;
        let value_end = key_end + header.value_len as usize;

        let ent = Entry {
            key: Bytes::copy_from_slice(&buf[header_len..key_end]),
            value: Bytes::copy_from_slice(&buf[key_end..value_end]),
            meta: Meta::from_bits_retain(header.meta),
            expires_at: header.expires_at,
        };
        Ok((ent, total))
    }

    /// Like [`Entry::decode`], but key and value share `buf`'s storage.
    pub fn decode_bytes(buf: &Bytes) -> Result<(Entry, usize)> {
        let (header, header_len, total) = verify_record(buf)?;
        let key_end = header_len + header.key_len as usize;
        let value_end = key_end + header.value_len as usize;

        let ent = Entry {
            key: buf.slice(header_len..key_end),
            value: buf.slice(key_end..value_end),
            meta: Meta::from_bits_retain(header.meta),
            expires_at: header.expires_at,
        };
        Ok((ent, total))
    }
}

/// Checks that a whole record fits in `buf` and that its checksum matches.
/// Returns the header, the header length and the record length.
fn verify_record(buf: &[u8]) -> Result<(Header, usize, usize)> {
    let (header, header_len) = Header::decode(buf)?;

    let kv_end = header_len as u64 + header.key_len as u64 + header.value_len as u64;
    let total = kv_end + CRC_SIZE as u64;
    if total > buf.len() as u64 {
        bail!(Error::Truncated)
    }
    let (kv_end, total) = (kv_end as usize, total as usize);

    let mut crc = [0_u8; CRC_SIZE];
    crc.copy_from_slice(&buf[kv_end..total]);
    if CASTAGNOLI.checksum(&buf[..kv_end]) != u32::from_be_bytes(crc) {
        bail!(Error::Corrupt("checksum mismatch"))
    }

    Ok((header, header_len, total))
}

/// Locates one entry in the value log. Callers store the encoded form in
/// their index and hand it back to read the entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValuePointer {
    pub fid: u32,
    pub len: u32,
    pub offset: u32,
}

impl ValuePointer {
    pub fn new(fid: u32, len: u32, offset: u32) -> Self {
        Self { fid, len, offset }
    }

    pub fn is_zero(&self) -> bool {
        self.fid == 0 && self.len == 0 && self.offset == 0
    }

    /// Offset just past the entry.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.len as u64
    }

    /// +-----------+-----------+--------------+
    /// | fid (u32) | len (u32) | offset (u32) |
    /// +-----------+-----------+--------------+
    /// All fields big-endian.
    pub fn encode(&self) -> [u8; VALUE_POINTER_SIZE] {
        let mut buf = [0; VALUE_POINTER_SIZE];
        buf[..4].copy_from_slice(&self.fid.to_be_bytes());
        buf[4..8].copy_from_slice(&self.len.to_be_bytes());
        buf[8..].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != VALUE_POINTER_SIZE {
            bail!(Error::InvalidRequest)
        }
        let mut word = [0; 4];
        let mut next = |at: usize| {
            word.copy_from_slice(&buf[at..at + 4]);
            u32::from_be_bytes(word)
        };
        Ok(Self {
            fid: next(0),
            len: next(4),
            offset: next(8),
        })
    }
}

impl Display for ValuePointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(fid: {}, offset: {}, len: {})",
            self.fid, self.offset, self.len
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(ent: &Entry) -> BytesMut {
        let mut buf = BytesMut::new();
        ent.encode_with_buf(&mut buf);
        buf
    }

    fn decode_err(buf: &[u8]) -> Error {
        let err = Entry::decode(buf).unwrap_err();
        match err.downcast::<Error>() {
            Ok(e) => e,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_entry() {
        let ent = Entry::new("key", "value").with_expires_at(42);
        let buf = encode(&ent);
        assert_eq!(buf.len() as u64, ent.encoded_size());

        let (ent_1, n) = Entry::decode(&buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(ent.key, ent_1.key, "key mismatch");
        assert_eq!(ent.value, ent_1.value, "value mismatch");
        assert_eq!(ent.meta, ent_1.meta, "meta mismatch");
        assert_eq!(ent.expires_at, ent_1.expires_at, "expires_at mismatch");

        let (ent_2, n) = Entry::decode_bytes(&buf.freeze()).unwrap();
        assert_eq!(ent, ent_2);
        assert_eq!(n as u64, ent.encoded_size());
    }

    #[test]
    fn test_unknown_meta_bits_retained() {
        let ent = Entry::new("samplekey", "sampleval").with_meta(Meta::from_bits_retain(123));
        let (got, _) = Entry::decode(&encode(&ent)).unwrap();
        assert_eq!(got.meta.bits(), 123);
        assert!(got.meta.contains(Meta::DELETE));
    }

    #[test]
    fn test_layout() {
        let ent = Entry::new("ab", "xyz").with_meta(Meta::DELETE);
        let buf = encode(&ent);
        assert_eq!(&buf[..4], &[2, 3, 1, 0]);
        assert_eq!(&buf[4..9], b"abxyz");
        let crc = CASTAGNOLI.checksum(&buf[..9]);
        assert_eq!(&buf[9..], &crc.to_be_bytes());
    }

    #[test]
    fn test_consecutive_records() {
        let a = Entry::new("a", "1");
        let b = Entry::delete("b");
        let mut buf = encode(&a);
        b.encode_with_buf(&mut buf);

        let (got_a, n) = Entry::decode(&buf).unwrap();
        let (got_b, m) = Entry::decode(&buf[n..]).unwrap();
        assert_eq!(got_a, a);
        assert_eq!(got_b, b);
        assert_eq!(n + m, buf.len());
    }

    #[test]
    fn test_decode_truncated() {
        let buf = encode(&Entry::new("key", vec![7_u8; 300]));
        assert!(matches!(decode_err(&[]), Error::Truncated));
        // Every strict prefix is an incomplete record.
        for cut in [1, 2, 3, 4, 10, buf.len() - 1] {
            assert!(
                matches!(decode_err(&buf[..cut]), Error::Truncated),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let mut buf = encode(&Entry::new("key", "value"));
        let last = buf.len() - CRC_SIZE - 1;
        buf[last] ^= 0xff;
        assert!(matches!(decode_err(&buf), Error::Corrupt(_)));

        let mut buf = encode(&Entry::new("key", "value"));
        let n = buf.len();
        buf[n - 1] ^= 0x01;
        assert!(matches!(decode_err(&buf), Error::Corrupt(_)));
    }

    #[test]
    fn test_decode_bogus_lengths() {
        // key_len = u32::MAX with only a handful of bytes behind it.
        let mut buf = BytesMut::new();
        put_varint(&mut buf, u32::MAX as u64);
        put_varint(&mut buf, 1);
        buf.put_u8(0);
        put_varint(&mut buf, 0);
        buf.put_slice(b"tiny");
        assert!(matches!(decode_err(&buf), Error::Truncated));

        // A length that doesn't fit in u32 at all.
        let mut buf = BytesMut::new();
        put_varint(&mut buf, u64::MAX);
        buf.put_slice(&[0; 16]);
        assert!(matches!(decode_err(&buf), Error::Corrupt(_)));

        // All zero bytes decode to an empty header whose checksum is wrong.
        assert!(matches!(decode_err(&[0; 16]), Error::Corrupt(_)));
    }

    #[test]
    fn test_is_expired() {
        assert!(!Entry::new("k", "v").is_expired());
        assert!(Entry::new("k", "v").with_expires_at(1).is_expired());
        assert!(!Entry::new("k", "v").with_expires_at(u64::MAX).is_expired());
    }

    #[test]
    fn test_value_pointer() {
        let vp = ValuePointer::new(7, 100, 4096);
        let buf = vp.encode();
        assert_eq!(&buf[..4], &7_u32.to_be_bytes());
        assert_eq!(ValuePointer::decode(&buf).unwrap(), vp);
        assert_eq!(vp.end(), 4196);
        assert!(ValuePointer::decode(&buf[..11]).is_err());
        assert!(ValuePointer::default().is_zero());
    }
}
