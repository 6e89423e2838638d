//! Fixed-endian record codec.
//!
//! Every persistent record is framed as `<version:u16><size:u32><payload>`,
//! all little-endian. Payload fields are appended in per-version order:
//! newer versions only ever append, so an older reader stops at its known
//! field set and a newer reader fills the gap with defaults. The header
//! alone is enough to predict the encoded size of a record, which lets the
//! index layer step over records without decoding them.
//!
//! Strings are a u32 byte length followed by raw bytes, no terminator.
//! Timestamps serialize as a null flag plus seven calendar fields including
//! the UTC offset in minutes.

use std::cmp::Ordering;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::tstamp::Tstamp;

/// Bytes occupied by the record header.
pub const NODE_HDR_SIZE: usize = 6;

/// Encoded size of a timestamp.
pub const TSTAMP_SIZE: usize = 10;

/// Serialized payload of one node kind.
///
/// `VERSION` is the version this build writes. `unpack_data` receives the
/// version read from the record header and must tolerate every older
/// version of its kind.
pub trait NodeData: Sized {
    const VERSION: u16;

    /// Payload size in bytes, excluding the record header.
    fn data_size(&self) -> usize;

    fn pack_data(&self, w: &mut Writer);

    fn unpack_data(r: &mut Reader, version: u16) -> Result<Self>;
}

/// Encodes a record with its header.
pub fn pack_record<T: NodeData>(node: &T) -> Vec<u8> {
    let size = node.data_size();
    let mut w = Writer::with_capacity(NODE_HDR_SIZE + size);
    w.put_u16(T::VERSION);
    w.put_u32(size as u32);
    node.pack_data(&mut w);
    w.into_vec()
}

/// Decodes a record, rejecting versions newer than this build writes.
/// Trailing payload bytes beyond the known field set are ignored.
pub fn unpack_record<T: NodeData>(buf: &[u8]) -> Result<T> {
    let mut r = Reader::new(buf);
    let version = r.get_u16()?;
    let size = r.get_u32()? as usize;
    if version > T::VERSION {
        return Err(Error::InvalidData(format!(
            "record version {version} is newer than supported version {}",
            T::VERSION
        )));
    }
    if buf.len() < NODE_HDR_SIZE + size {
        return Err(Error::InvalidData(format!(
            "record truncated: header claims {size} payload bytes, {} available",
            buf.len() - NODE_HDR_SIZE
        )));
    }
    T::unpack_data(&mut r, version)
}

/// Decodes a headerless record written before version bytes existed.
/// The whole buffer is the payload and the version is forced to 1.
pub fn unpack_record_fixver<T: NodeData>(buf: &[u8]) -> Result<T> {
    let mut r = Reader::new(buf);
    T::unpack_data(&mut r, 1)
}

/// Predicts the full encoded size from the header without decoding.
pub fn encoded_size(buf: &[u8]) -> Result<usize> {
    if buf.len() < NODE_HDR_SIZE {
        return Err(Error::InvalidData(format!(
            "record shorter than its header: {} bytes",
            buf.len()
        )));
    }
    let mut r = Reader::new(buf);
    r.get_u16()?;
    Ok(NODE_HDR_SIZE + r.get_u32()? as usize)
}

/// Version tag of an encoded record.
pub fn node_version(buf: &[u8]) -> Result<u16> {
    Reader::new(buf).get_u16()
}

/// Encoded size of a string field.
pub fn str_size(s: &str) -> usize {
    4 + s.len()
}

/// Orders two encoded u64 fields.
pub fn compare_u64(a: &[u8], b: &[u8]) -> Result<Ordering> {
    let a = Reader::new(a).get_u64()?;
    let b = Reader::new(b).get_u64()?;
    Ok(a.cmp(&b))
}

/// Orders two encoded string fields.
pub fn compare_str(a: &[u8], b: &[u8]) -> Result<Ordering> {
    let a = Reader::new(a).get_str()?;
    let b = Reader::new(b).get_str()?;
    Ok(a.cmp(&b))
}

/// Appends primitives to a growing buffer.
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    // Writes into a Vec cannot fail.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.write_u8(v).unwrap();
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.write_u16::<LittleEndian>(v).unwrap();
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.write_u32::<LittleEndian>(v).unwrap();
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.write_u64::<LittleEndian>(v).unwrap();
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.write_i16::<LittleEndian>(v).unwrap();
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.write_f64::<LittleEndian>(v).unwrap();
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn put_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn put_tstamp(&mut self, ts: &Tstamp) {
        self.put_bool(ts.null);
        self.put_u16(ts.year);
        self.put_u8(ts.month);
        self.put_u8(ts.day);
        self.put_u8(ts.hour);
        self.put_u8(ts.min);
        self.put_u8(ts.sec);
        self.put_i16(ts.offset_min);
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads primitives from an encoded buffer, tracking its position.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::InvalidData(format!(
                "record truncated: need {len} bytes at offset {}, {} available",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?.read_u8()?)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(self.take(2)?.read_u16::<LittleEndian>()?)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(self.take(4)?.read_u32::<LittleEndian>()?)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(self.take(8)?.read_u64::<LittleEndian>()?)
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(self.take(2)?.read_i16::<LittleEndian>()?)
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(self.take(8)?.read_f64::<LittleEndian>()?)
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::InvalidData(format!("string field is not UTF-8: {e}")))
    }

    pub fn get_tstamp(&mut self) -> Result<Tstamp> {
        let null = self.get_bool()?;
        let ts = Tstamp {
            year: self.get_u16()?,
            month: self.get_u8()?,
            day: self.get_u8()?,
            hour: self.get_u8()?,
            min: self.get_u8()?,
            sec: self.get_u8()?,
            offset_min: self.get_i16()?,
            null,
        };
        Ok(ts)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    /// Steps over a string field without materializing it.
    pub fn skip_str(&mut self) -> Result<()> {
        let len = self.get_u32()? as usize;
        self.skip(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sample {
        name: String,
        hits: u64,
        ratio: f64,
        seen: Tstamp,
        // appended at version 2
        robot: bool,
    }

    impl NodeData for Sample {
        const VERSION: u16 = 2;

        fn data_size(&self) -> usize {
            str_size(&self.name) + 8 + 8 + TSTAMP_SIZE + 1
        }

        fn pack_data(&self, w: &mut Writer) {
            w.put_str(&self.name);
            w.put_u64(self.hits);
            w.put_f64(self.ratio);
            w.put_tstamp(&self.seen);
            w.put_bool(self.robot);
        }

        fn unpack_data(r: &mut Reader, version: u16) -> Result<Self> {
            let name = r.get_str()?;
            let hits = r.get_u64()?;
            let ratio = r.get_f64()?;
            let seen = r.get_tstamp()?;
            let robot = if version >= 2 { r.get_bool()? } else { false };
            Ok(Self {
                name,
                hits,
                ratio,
                seen,
                robot,
            })
        }
    }

    fn sample() -> Sample {
        Sample {
            name: "10.0.0.1".to_string(),
            hits: 42,
            ratio: 2.5,
            seen: Tstamp::new(2020, 6, 15, 10, 0, 0, -300),
            robot: true,
        }
    }

    #[test]
    fn test_record_round_trip() {
        let buf = pack_record(&sample());
        let back: Sample = unpack_record(&buf).unwrap();
        assert_eq!(back.name, "10.0.0.1");
        assert_eq!(back.hits, 42);
        assert_eq!(back.ratio, 2.5);
        assert_eq!(back.seen, Tstamp::new(2020, 6, 15, 10, 0, 0, -300));
        assert!(back.robot);
    }

    #[test]
    fn test_encoded_size_matches_buffer() {
        let buf = pack_record(&sample());
        assert_eq!(encoded_size(&buf).unwrap(), buf.len());
    }

    #[test]
    fn test_old_version_decodes_with_defaults() {
        // Hand-encode a version 1 record: no robot byte.
        let node = sample();
        let mut w = Writer::new();
        w.put_u16(1);
        w.put_u32((node.data_size() - 1) as u32);
        w.put_str(&node.name);
        w.put_u64(node.hits);
        w.put_f64(node.ratio);
        w.put_tstamp(&node.seen);
        let back: Sample = unpack_record(&w.into_vec()).unwrap();
        assert_eq!(back.hits, 42);
        assert!(!back.robot);
    }

    #[test]
    fn test_newer_version_is_fatal() {
        let mut buf = pack_record(&sample());
        buf[0] = 99;
        assert!(unpack_record::<Sample>(&buf).is_err());
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        // A future version appended a field this build does not know about.
        let node = sample();
        let mut w = Writer::new();
        w.put_u16(2);
        w.put_u32((node.data_size() + 8) as u32);
        node.pack_data(&mut w);
        w.put_u64(7); // unknown trailing field
        let back: Sample = unpack_record(&w.into_vec()).unwrap();
        assert_eq!(back.hits, 42);
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let buf = pack_record(&sample());
        assert!(unpack_record::<Sample>(&buf[..buf.len() - 3]).is_err());
    }

    #[test]
    fn test_compare_helpers() {
        let mut a = Writer::new();
        a.put_u64(10);
        let mut b = Writer::new();
        b.put_u64(20);
        assert_eq!(
            compare_u64(&a.into_vec(), &b.into_vec()).unwrap(),
            std::cmp::Ordering::Less
        );

        let mut a = Writer::new();
        a.put_str("alpha");
        let mut b = Writer::new();
        b.put_str("beta");
        assert_eq!(
            compare_str(&a.into_vec(), &b.into_vec()).unwrap(),
            std::cmp::Ordering::Less
        );
    }
}
