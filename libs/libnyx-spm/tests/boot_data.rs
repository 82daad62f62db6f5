//! Boot shared-data access tests

use libnyx_spm::boot_data::{
    AccessPolicy, BootData, SHARED_DATA_HEADER_SIZE, SHARED_DATA_TLV_INFO_MAGIC, TLV_MAJOR_FWU,
    TLV_MAJOR_IAS, TLV_MAJOR_MBS,
};
use libnyx_spm::PsaError;

const ATTESTATION: i32 = 0x100;
const MEASURED_BOOT: i32 = 0x101;

const POLICY: &[AccessPolicy] = &[
    AccessPolicy {
        partition_id: ATTESTATION,
        major_type: TLV_MAJOR_IAS,
    },
    AccessPolicy {
        partition_id: MEASURED_BOOT,
        major_type: TLV_MAJOR_MBS,
    },
];

fn entry(tlv_type: u16, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&tlv_type.to_le_bytes());
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
    out
}

fn area() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(entry(0x1001, &[1, 2, 3, 4]));
    body.extend(entry(0x3001, &[9; 8]));
    body.extend(entry(0x1002, &[5, 6]));
    body.extend(entry(0x2001, &[7]));

    let mut area = Vec::new();
    area.extend_from_slice(&SHARED_DATA_TLV_INFO_MAGIC.to_le_bytes());
    area.extend_from_slice(&((SHARED_DATA_HEADER_SIZE + body.len()) as u16).to_le_bytes());
    area.extend(body);
    // Trailing bytes past tot_len are ignored
    area.extend_from_slice(&[0xFF; 8]);
    area
}

#[test]
fn test_read_collects_matching_entries() {
    let area = area();
    let boot = BootData::validate(&area, POLICY);
    assert!(boot.is_valid());

    let mut buf = [0u8; 64];
    let len = boot.read(ATTESTATION, TLV_MAJOR_IAS, &mut buf).unwrap();

    let mut expected = Vec::new();
    expected.extend_from_slice(&SHARED_DATA_TLV_INFO_MAGIC.to_le_bytes());
    expected.extend_from_slice(&(4u16 + 8 + 6).to_le_bytes());
    expected.extend(entry(0x1001, &[1, 2, 3, 4]));
    expected.extend(entry(0x1002, &[5, 6]));
    assert_eq!(len, expected.len());
    assert_eq!(&buf[..len], expected.as_slice());
}

#[test]
fn test_unauthorized_major_type_is_rejected() {
    let area = area();
    let boot = BootData::validate(&area, POLICY);
    let mut buf = [0u8; 64];

    assert_eq!(
        boot.read(ATTESTATION, TLV_MAJOR_MBS, &mut buf),
        Err(PsaError::InvalidArgument)
    );
    assert_eq!(
        boot.read(MEASURED_BOOT, TLV_MAJOR_FWU, &mut buf),
        Err(PsaError::InvalidArgument)
    );
    assert!(boot.read(MEASURED_BOOT, TLV_MAJOR_MBS, &mut buf).is_ok());
}

#[test]
fn test_small_buffers_are_rejected() {
    let area = area();
    let boot = BootData::validate(&area, POLICY);

    let mut tiny = [0u8; SHARED_DATA_HEADER_SIZE - 1];
    assert_eq!(
        boot.read(ATTESTATION, TLV_MAJOR_IAS, &mut tiny),
        Err(PsaError::InvalidArgument)
    );

    // Room for the header and the first entry only
    let mut short = [0u8; SHARED_DATA_HEADER_SIZE + 8];
    assert_eq!(
        boot.read(ATTESTATION, TLV_MAJOR_IAS, &mut short),
        Err(PsaError::InvalidArgument)
    );
}

#[test]
fn test_empty_match_writes_header_only() {
    let area = area();
    let policy = [AccessPolicy {
        partition_id: ATTESTATION,
        major_type: 0xE,
    }];
    let boot = BootData::validate(&area, &policy);
    let mut buf = [0u8; 16];

    assert_eq!(boot.read(ATTESTATION, 0xE, &mut buf), Ok(SHARED_DATA_HEADER_SIZE));
    assert_eq!(&buf[..4], &[0x16, 0x20, 4, 0]);
}

#[test]
fn test_invalid_area_refuses_reads() {
    let mut area = area();
    area[0] = 0;
    let boot = BootData::validate(&area, POLICY);
    let mut buf = [0u8; 64];

    assert!(!boot.is_valid());
    assert_eq!(boot.entries().count(), 0);
    assert_eq!(
        boot.read(ATTESTATION, TLV_MAJOR_IAS, &mut buf),
        Err(PsaError::InvalidArgument)
    );
}

#[test]
fn test_declared_length_past_area_is_invalid() {
    let area = [0x16, 0x20, 0xFF, 0x00];
    assert!(!BootData::validate(&area, POLICY).is_valid());
}
