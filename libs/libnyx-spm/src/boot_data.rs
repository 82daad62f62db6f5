//! Bootloader shared data
//!
//! The bootloader leaves a TLV area behind for runtime firmware:
//!
//! ```text
//! header: magic: u16 = 0x2016 | tot_len: u16 (header included)
//! entry:  type: u16 (major = type >> 12) | len: u16 | len bytes of value
//! ```
//!
//! All fields are little-endian. A partition may read the entries of a
//! major type only if the access policy table pairs it with that type.

use crate::service::PartitionId;
use crate::status::PsaError;

/// TLV area magic
pub const SHARED_DATA_TLV_INFO_MAGIC: u16 = 0x2016;

/// Size of the area header
pub const SHARED_DATA_HEADER_SIZE: usize = 4;

/// Size of an entry header
pub const SHARED_DATA_ENTRY_HEADER_SIZE: usize = 4;

/// Major type of boot-time core data
pub const TLV_MAJOR_CORE: u8 = 0x0;
/// Major type of initial attestation data
pub const TLV_MAJOR_IAS: u8 = 0x1;
/// Major type of firmware update data
pub const TLV_MAJOR_FWU: u8 = 0x2;
/// Major type of measured boot data
pub const TLV_MAJOR_MBS: u8 = 0x3;

/// Major type of a TLV type field
#[inline]
pub const fn major_type(tlv_type: u16) -> u8 {
    (tlv_type >> 12) as u8
}

/// One `(partition, major type)` grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Partition granted access
    pub partition_id: PartitionId,
    /// Major type it may read
    pub major_type: u8,
}

/// One entry of the TLV area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvEntry<'a> {
    /// Full type field
    pub tlv_type: u16,
    /// Value bytes
    pub value: &'a [u8],
    /// Entry header and value, as stored
    raw: &'a [u8],
}

impl TlvEntry<'_> {
    /// Major type of this entry
    pub fn major(&self) -> u8 {
        major_type(self.tlv_type)
    }
}

/// Iterator over the entries of a TLV area
///
/// Stops at the declared end of the area or at the first entry that would
/// run past it.
pub struct TlvIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = TlvEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = self
            .data
            .get(self.offset..self.offset + SHARED_DATA_ENTRY_HEADER_SIZE)?;
        let tlv_type = u16::from_le_bytes([header[0], header[1]]);
        let len = usize::from(u16::from_le_bytes([header[2], header[3]]));

        let end = self.offset + SHARED_DATA_ENTRY_HEADER_SIZE + len;
        let raw = self.data.get(self.offset..end)?;
        self.offset = end;
        Some(TlvEntry {
            tlv_type,
            value: &raw[SHARED_DATA_ENTRY_HEADER_SIZE..],
            raw,
        })
    }
}

/// Validated view of the shared data area
pub struct BootData<'a> {
    area: &'a [u8],
    policy: &'a [AccessPolicy],
    valid: bool,
}

impl<'a> BootData<'a> {
    /// Check `area` and pair it with `policy`
    ///
    /// An area with a bad magic or length is kept but refuses every read.
    pub fn validate(area: &'a [u8], policy: &'a [AccessPolicy]) -> Self {
        let valid = match Self::header(area) {
            Some((magic, tot_len)) => {
                magic == SHARED_DATA_TLV_INFO_MAGIC
                    && tot_len >= SHARED_DATA_HEADER_SIZE
                    && tot_len <= area.len()
            }
            None => false,
        };
        if !valid {
            log::warn!("boot data: shared area failed validation");
        }
        Self { area, policy, valid }
    }

    /// Whether the area passed validation
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether `partition` may read `major`
    pub fn may_access(&self, partition: PartitionId, major: u8) -> bool {
        self.policy
            .iter()
            .any(|p| p.partition_id == partition && p.major_type == major)
    }

    /// Entries of the area; empty when the area is invalid
    pub fn entries(&self) -> TlvIter<'a> {
        let area: &'a [u8] = self.area;
        let data = match (self.valid, Self::header(area)) {
            (true, Some((_, tot_len))) => &area[..tot_len],
            _ => &[],
        };
        TlvIter {
            data,
            offset: SHARED_DATA_HEADER_SIZE,
        }
    }

    /// Copy the entries of major type `major` into `buf` for `partition`
    ///
    /// `buf` receives a fresh header followed by the matching entries.
    /// Returns the number of bytes written.
    pub fn read(&self, partition: PartitionId, major: u8, buf: &mut [u8]) -> Result<usize, PsaError> {
        if !self.valid {
            return Err(PsaError::InvalidArgument);
        }
        if !self.may_access(partition, major) {
            log::warn!("boot data: partition {} denied major type {}", partition, major);
            return Err(PsaError::InvalidArgument);
        }
        if buf.len() < SHARED_DATA_HEADER_SIZE {
            return Err(PsaError::InvalidArgument);
        }

        let mut len = SHARED_DATA_HEADER_SIZE;
        for entry in self.entries().filter(|e| e.major() == major) {
            let end = len + entry.raw.len();
            let dst = buf.get_mut(len..end).ok_or(PsaError::InvalidArgument)?;
            dst.copy_from_slice(entry.raw);
            len = end;
        }
        let tot_len = u16::try_from(len).map_err(|_| PsaError::InvalidArgument)?;

        buf[..2].copy_from_slice(&SHARED_DATA_TLV_INFO_MAGIC.to_le_bytes());
        buf[2..4].copy_from_slice(&tot_len.to_le_bytes());
        Ok(len)
    }

    fn header(area: &[u8]) -> Option<(u16, usize)> {
        let header = area.get(..SHARED_DATA_HEADER_SIZE)?;
        Some((
            u16::from_le_bytes([header[0], header[1]]),
            usize::from(u16::from_le_bytes([header[2], header[3]])),
        ))
    }
}
