//! Intel-HEX input and output.
//!
//! Record-level parsing (checksum, length and character validation) is done
//! by the [`ihex`] crate; this module layers the extended-address tracking
//! and the EOF discipline on top, and provides the record helpers used by
//! the flash-image builder.

use std::fs;
use std::path::Path;

use ihex::{Reader, ReaderOptions, Record};

use crate::{Error, Result};

/// A single data record: a byte address and the bytes stored there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub address: u32,
    pub data: Vec<u8>,
}

/// A parsed Intel-HEX file, flattened to absolute-addressed data records.
#[derive(Debug, Clone)]
pub struct HexFile {
    records: Vec<HexRecord>,
}

impl HexFile {
    /// Reads and parses the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses hex records from `text`.
    ///
    /// Handles data (0), EOF (1), extended-segment (2) and extended-linear
    /// (4) records. Any record after the EOF marker, and any other record
    /// type, is an error.
    pub fn parse(text: &str) -> Result<Self> {
        let mut records = Vec::new();
        let mut ext_address: u32 = 0;
        let mut eof = false;

        let reader = Reader::new_with_options(
            text,
            ReaderOptions {
                stop_after_first_error: true,
                stop_after_eof: false,
            },
        );
        for item in reader {
            let record = item.map_err(|err| match err {
                ihex::ReaderError::ChecksumMismatch(found, expected) => Error::InvalidChecksum(
                    format!("calculated {:#04x}, record says {:#04x}", expected, found),
                ),
                other => Error::InvalidRecord(format!("{:?}", other)),
            })?;

            if eof {
                return Err(Error::InvalidRecord(
                    "extra record after EOF record".to_string(),
                ));
            }

            match record {
                Record::Data { offset, value } => records.push(HexRecord {
                    address: ext_address | u32::from(offset),
                    data: value,
                }),
                Record::EndOfFile => eof = true,
                Record::ExtendedSegmentAddress(segment) => {
                    ext_address = u32::from(segment) << 4;
                }
                Record::ExtendedLinearAddress(upper) => {
                    ext_address = u32::from(upper) << 16;
                }
                Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {
                    return Err(Error::InvalidRecord(
                        "unsupported start-address record".to_string(),
                    ));
                }
            }
        }

        Ok(HexFile { records })
    }

    pub fn records(&self) -> &[HexRecord] {
        &self.records
    }

    /// Contiguous address ranges covered by the file, as `(first, end)`
    /// byte-address pairs sorted ascending.
    pub fn segments(&self) -> Vec<(u32, u32)> {
        let mut ranges: Vec<(u32, u32)> = self
            .records
            .iter()
            .filter(|r| !r.data.is_empty())
            .map(|r| (r.address, r.address + r.data.len() as u32))
            .collect();
        ranges.sort_unstable();

        let mut segments: Vec<(u32, u32)> = Vec::new();
        for (first, end) in ranges {
            match segments.last_mut() {
                Some(last) if first <= last.1 => last.1 = last.1.max(end),
                _ => segments.push((first, end)),
            }
        }
        segments
    }
}

/// Returns only the portions of `records` that fall in `[lower, upper)`,
/// slicing records that straddle either bound.
pub fn range_filter_records(records: &[HexRecord], lower: u32, upper: u32) -> Vec<HexRecord> {
    let mut result = Vec::new();
    for record in records {
        let start = record.address;
        let end = start + record.data.len() as u32;
        if start >= lower && start < upper {
            if end <= upper {
                result.push(record.clone());
            } else {
                let keep = (upper - start) as usize;
                result.push(HexRecord {
                    address: start,
                    data: record.data[..keep].to_vec(),
                });
            }
        } else if start < lower && lower < end {
            let skip = (lower - start) as usize;
            result.push(HexRecord {
                address: lower,
                data: record.data[skip..].to_vec(),
            });
        }
    }
    result
}

/// Merges `records` into a copy of `default_data`, which starts at
/// `base_address`. A record that does not fit in the buffer means the hex
/// file holds data the target chip does not have.
pub fn merge_records(
    records: &[HexRecord],
    default_data: &[u8],
    base_address: u32,
) -> Result<Vec<u8>> {
    let mut result = default_data.to_vec();
    for record in records {
        if record.address < base_address {
            return Err(Error::value(format!(
                "record at {:#x} is below the region base {:#x}",
                record.address, base_address
            )));
        }
        let offset = (record.address - base_address) as usize;
        let end = offset + record.data.len();
        if end > result.len() {
            return Err(Error::value(format!(
                "record at {:#x} ({} bytes) exceeds the region size {:#x}",
                record.address,
                record.data.len(),
                result.len()
            )));
        }
        result[offset..end].copy_from_slice(&record.data);
    }
    Ok(result)
}

/// Renders `data` as Intel-HEX text, 16 bytes per record, inserting
/// extended-linear address records at every 64 KiB boundary crossed.
pub fn write_ihex(data: &[u8]) -> Result<String> {
    let mut records = Vec::new();
    let mut upper_word: u16 = 0;
    for (index, chunk) in data.chunks(16).enumerate() {
        let address = index as u32 * 16;
        let upper = (address >> 16) as u16;
        if upper != upper_word {
            records.push(Record::ExtendedLinearAddress(upper));
            upper_word = upper;
        }
        records.push(Record::Data {
            offset: address as u16,
            value: chunk.to_vec(),
        });
    }
    records.push(Record::EndOfFile);

    ihex::create_object_file_representation(&records)
        .map_err(|err| Error::value(format!("cannot format hex output: {:?}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_data_record() {
        let hex = ":0C000000280F3FFF3FFF3FFF00A0080358\n:00000001FF\n";
        let file = HexFile::parse(hex).unwrap();
        assert_eq!(
            file.records(),
            &[HexRecord {
                address: 0,
                data: vec![
                    0x28, 0x0f, 0x3f, 0xff, 0x3f, 0xff, 0x3f, 0xff, 0x00, 0xa0, 0x08, 0x03
                ],
            }]
        );
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let hex = ":0C000000280F3FFF3FFF3FFF00A0080357\n";
        match HexFile::parse(hex) {
            Err(Error::InvalidChecksum(_)) => {}
            other => panic!("expected checksum error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_wrong_declared_length() {
        // Length byte says 0x10 but only 12 data bytes follow; the
        // checksum is valid so the length check is what trips.
        let hex = ":10000000280F3FFF3FFF3FFF00A0080354\n";
        match HexFile::parse(hex) {
            Err(Error::InvalidRecord(_)) => {}
            other => panic!("expected record error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_garbage_lines() {
        match HexFile::parse("hello world\n") {
            Err(Error::InvalidRecord(_)) => {}
            other => panic!("expected record error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_records_after_eof() {
        let hex = ":00000001FF\n:020000000102FB\n";
        assert!(HexFile::parse(hex).is_err());
    }

    #[test]
    fn applies_extended_linear_addresses() {
        let hex = ":020000040030CA\n:02000000FFFF00\n:00000001FF\n";
        let file = HexFile::parse(hex).unwrap();
        assert_eq!(file.records()[0].address, 0x30_0000);
    }

    #[test]
    fn applies_extended_segment_addresses() {
        let hex = ":020000021000EC\n:02000000AABB99\n:00000001FF\n";
        let file = HexFile::parse(hex).unwrap();
        assert_eq!(file.records()[0].address, 0x1_0000);
    }

    #[test]
    fn range_filter_slices_straddling_records() {
        let records = vec![HexRecord {
            address: 8,
            data: (0u8..8).collect(),
        }];
        let filtered = range_filter_records(&records, 10, 14);
        assert_eq!(
            filtered,
            vec![HexRecord {
                address: 10,
                data: vec![2, 3, 4, 5],
            }]
        );
    }

    #[test]
    fn merge_fills_gaps_with_default_data() {
        let records = vec![HexRecord {
            address: 0x102,
            data: vec![1, 2],
        }];
        let merged = merge_records(&records, &[0xff; 6], 0x100).unwrap();
        assert_eq!(merged, vec![0xff, 0xff, 1, 2, 0xff, 0xff]);
    }

    #[test]
    fn merge_rejects_out_of_range_records() {
        let records = vec![HexRecord {
            address: 0x105,
            data: vec![1, 2],
        }];
        assert!(merge_records(&records, &[0xff; 6], 0x100).is_err());
    }

    #[test]
    fn segments_are_merged_and_sorted() {
        let file = HexFile {
            records: vec![
                HexRecord {
                    address: 16,
                    data: vec![0; 16],
                },
                HexRecord {
                    address: 0,
                    data: vec![0; 16],
                },
                HexRecord {
                    address: 0x100,
                    data: vec![0; 4],
                },
            ],
        };
        assert_eq!(file.segments(), vec![(0, 32), (0x100, 0x104)]);
    }

    #[test]
    fn ihex_output_round_trips() {
        let data: Vec<u8> = (0u8..40).collect();
        let text = write_ihex(&data).unwrap();
        let reparsed = HexFile::parse(&text).unwrap();
        assert_eq!(merge_records(reparsed.records(), &[0; 40], 0).unwrap(), data);
    }
}
