//! The system node.
//!
//! A singleton record written on every save. It captures which application
//! version created and last wrote the database, the run mode flags, and a
//! signature of the writing process (byte-order sentinel, primitive widths,
//! time settings) that is verified on every open. Databases whose signature
//! does not match the current process are rejected outright; among other
//! things this shuts out pre-v4 databases, which wrote narrower counters.

use crate::config::RunConfig;
use crate::encoding::{NodeData, Reader, Writer, TSTAMP_SIZE};
use crate::error::{Error, Result};
use crate::node::{NodeKind, StoreNode};

/// Packs an application version into one u32, one byte per part.
pub const fn app_version(major: u8, minor: u8, patch: u8, build: u8) -> u32 {
    (major as u32) << 24 | (minor as u32) << 16 | (patch as u32) << 8 | build as u32
}

/// Version of this build, stamped into every database it writes.
pub const VERSION: u32 = app_version(4, 0, 1, 0);

/// Daily/hourly rows written before this version carry no version header.
pub const VERSION_3_3_1_5: u32 = app_version(3, 3, 1, 5);

/// Hosts written before this version carry no last-hit timestamp.
pub const VERSION_3_4_1_1: u32 = app_version(3, 4, 1, 1);

/// Totals written before this version lack several record counts.
pub const VERSION_3_5_1_1: u32 = app_version(3, 5, 1, 1);

/// Sequence ids at or before this version could be drawn from the wrong
/// sequence tables.
pub const VERSION_3_8_0_4: u32 = app_version(3, 8, 0, 4);

/// Value an in-order reader sees; a foreign-endian writer produces the
/// byte-swapped form.
const BYTE_ORDER_MAGIC: u32 = 0x1234_5678;

/// Widths of the primitive types this build writes.
const SIZEOF_COUNTER: u16 = 8;
const SIZEOF_FLOAT: u16 = 8;
const SIZEOF_TSTAMP: u16 = TSTAMP_SIZE as u16;

#[derive(Debug, Clone, Default)]
pub struct SysNode {
    /// Version that created the database; immutable once set
    pub appver: u32,
    /// Version that last wrote the database
    pub appver_last: u32,
    pub incremental: bool,
    pub batch: bool,
    pub utc_time: bool,
    pub utc_offset: i16,
    pub byte_order: u32,
    pub sizeof_counter: u16,
    pub sizeof_float: u16,
    pub sizeof_tstamp: u16,
    /// One-shot fixup: daily/hourly rows have been rewritten with versions
    pub fixed_dhv: bool,
}

impl SysNode {
    /// Resets to what a fresh database written by this process would hold.
    pub fn reset(&mut self, config: &RunConfig) {
        self.appver = 0;
        self.appver_last = 0;
        self.incremental = config.incremental;
        self.batch = config.batch;
        self.utc_time = config.utc_time;
        self.utc_offset = config.utc_offset;
        self.byte_order = BYTE_ORDER_MAGIC;
        self.sizeof_counter = SIZEOF_COUNTER;
        self.sizeof_float = SIZEOF_FLOAT;
        self.sizeof_tstamp = SIZEOF_TSTAMP;
        // nothing to fix in a database this build creates
        self.fixed_dhv = true;
    }

    pub fn check_byte_order(&self) -> Result<()> {
        if self.byte_order != BYTE_ORDER_MAGIC {
            return Err(Error::Incompatible(format!(
                "byte order sentinel {:#010x} does not match {:#010x}",
                self.byte_order, BYTE_ORDER_MAGIC
            )));
        }
        Ok(())
    }

    pub fn check_sizeof(&self) -> Result<()> {
        if self.sizeof_counter != SIZEOF_COUNTER
            || self.sizeof_float != SIZEOF_FLOAT
            || self.sizeof_tstamp != SIZEOF_TSTAMP
        {
            return Err(Error::Incompatible(format!(
                "data type sizes {}:{}:{} do not match {}:{}:{}",
                self.sizeof_counter,
                self.sizeof_float,
                self.sizeof_tstamp,
                SIZEOF_COUNTER,
                SIZEOF_FLOAT,
                SIZEOF_TSTAMP
            )));
        }
        Ok(())
    }

    pub fn check_time_settings(&self, config: &RunConfig) -> Result<()> {
        if self.utc_time != config.utc_time || self.utc_offset != config.utc_offset {
            return Err(Error::Incompatible(format!(
                "time settings utc={}/{:+} do not match the run's utc={}/{:+}",
                self.utc_time, self.utc_offset, config.utc_time, config.utc_offset
            )));
        }
        Ok(())
    }
}

impl NodeData for SysNode {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        4 + 4 + 3 + 2 + 4 + 2 * 3 + 1
    }

    fn pack_data(&self, w: &mut Writer) {
        w.put_u32(self.appver);
        w.put_u32(self.appver_last);
        w.put_bool(self.incremental);
        w.put_bool(self.batch);
        w.put_bool(self.utc_time);
        w.put_i16(self.utc_offset);
        w.put_u32(self.byte_order);
        w.put_u16(self.sizeof_counter);
        w.put_u16(self.sizeof_float);
        w.put_u16(self.sizeof_tstamp);
        w.put_bool(self.fixed_dhv);
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let mut node = Self::default();
        node.appver = r.get_u32()?;
        node.appver_last = r.get_u32()?;
        node.incremental = r.get_bool()?;
        node.batch = r.get_bool()?;
        node.utc_time = r.get_bool()?;
        node.utc_offset = r.get_i16()?;
        node.byte_order = r.get_u32()?;
        node.sizeof_counter = r.get_u16()?;
        node.sizeof_float = r.get_u16()?;
        node.sizeof_tstamp = r.get_u16()?;
        node.fixed_dhv = r.get_bool()?;
        Ok(node)
    }
}

impl StoreNode for SysNode {
    const KIND: NodeKind = NodeKind::System;

    fn node_id(&self) -> u64 {
        1
    }

    fn set_node_id(&mut self, _id: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{pack_record, unpack_record};

    #[test]
    fn test_version_packing_orders() {
        assert!(VERSION > VERSION_3_8_0_4);
        assert!(VERSION_3_8_0_4 > VERSION_3_5_1_1);
        assert!(VERSION_3_5_1_1 > VERSION_3_4_1_1);
        assert!(VERSION_3_4_1_1 > VERSION_3_3_1_5);
    }

    #[test]
    fn test_round_trip() {
        let mut node = SysNode::default();
        node.reset(&RunConfig::default().incremental(true));
        node.appver = VERSION;
        node.appver_last = VERSION;
        let buf = pack_record(&node);
        let back: SysNode = unpack_record(&buf).unwrap();
        assert_eq!(back.appver, VERSION);
        assert!(back.incremental);
        assert!(back.fixed_dhv);
        assert!(back.check_byte_order().is_ok());
        assert!(back.check_sizeof().is_ok());
    }

    #[test]
    fn test_signature_checks_reject_mismatch() {
        let mut node = SysNode::default();
        node.reset(&RunConfig::default());
        node.byte_order = BYTE_ORDER_MAGIC.swap_bytes();
        assert!(node.check_byte_order().is_err());

        node.reset(&RunConfig::default());
        // a pre-v4 database wrote 32-bit counters
        node.sizeof_counter = 4;
        assert!(node.check_sizeof().is_err());
    }

    #[test]
    fn test_time_settings_check() {
        let config = RunConfig::default().utc(true, 120);
        let mut node = SysNode::default();
        node.reset(&config);
        assert!(node.check_time_settings(&config).is_ok());
        assert!(node
            .check_time_settings(&RunConfig::default())
            .is_err());
    }
}
