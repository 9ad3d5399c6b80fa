//! Parser for the XML output of `pdata_tools thin_delta`.
//!
//! `thin_delta` dumps the difference between two thin devices as a
//! `<superblock>` element containing a `<diff>` with `same`, `different`,
//! `left_only` and `right_only` ranges, all expressed in units of the pool's
//! data block size. This crate turns that output into byte-granular
//! [`Mappings`] suitable for a block-level backup walk.

use serde::Deserialize;
use thiserror::Error;

/// Sector size used by device-mapper metadata.
const SECTOR_SIZE: u64 = 512;

/// One live byte range of the newer snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub offset: u64,
    pub size: u64,
}

/// Block-granular delta between two snapshots.
///
/// `mappings` is sorted by `offset` with no overlaps; every `offset` and
/// `size` is a multiple of `block_size` (bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mappings {
    pub mappings: Vec<Mapping>,
    pub block_size: u64,
}

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("failed to parse thin_delta output: {0}")]
    Parse(#[from] quick_xml::DeError),

    #[error("metadata block size is {actual} bytes, pool configured for {expected}")]
    BlockSizeMismatch { actual: u64, expected: u64 },

    #[error("invalid block size {0}, must be a positive multiple of {SECTOR_SIZE}")]
    InvalidBlockSize(u64),
}

#[derive(Debug, Deserialize)]
struct Superblock {
    #[serde(rename = "@data_block_size")]
    data_block_size: u64,
    diff: Diff,
}

#[derive(Debug, Deserialize)]
struct Diff {
    #[serde(rename = "$value", default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Entry {
    Same(Range),
    Different(Range),
    LeftOnly(Range),
    RightOnly(Range),
}

#[derive(Debug, Deserialize)]
struct Range {
    #[serde(rename = "@begin")]
    begin: u64,
    #[serde(rename = "@length")]
    length: u64,
}

/// Parse `thin_delta` output into byte-granular mappings.
///
/// `block_size` is the pool block size in bytes; it is checked against the
/// superblock's `data_block_size` attribute (sectors). Ranges present only
/// in the older snapshot (`left_only`) are never included. `same` ranges are
/// included only when `include_same` is set, which is how a full backup is
/// produced from a self-comparison.
pub fn parse(output: &str, block_size: u64, include_same: bool) -> Result<Mappings, DeltaError> {
    if block_size == 0 || block_size % SECTOR_SIZE != 0 {
        return Err(DeltaError::InvalidBlockSize(block_size));
    }

    let superblock: Superblock = quick_xml::de::from_str(output)?;
    let metadata_block_size = superblock.data_block_size * SECTOR_SIZE;
    if metadata_block_size != block_size {
        return Err(DeltaError::BlockSizeMismatch {
            actual: metadata_block_size,
            expected: block_size,
        });
    }

    let mut ranges: Vec<&Range> = superblock
        .diff
        .entries
        .iter()
        .filter_map(|entry| match entry {
            Entry::Different(r) | Entry::RightOnly(r) => Some(r),
            Entry::Same(r) if include_same => Some(r),
            Entry::Same(_) | Entry::LeftOnly(_) => None,
        })
        .filter(|r| r.length > 0)
        .collect();
    ranges.sort_by_key(|r| r.begin);

    // Coalesce contiguous ranges so the backup walk issues fewer, larger
    // passes over the snapshot device.
    let mut mappings: Vec<Mapping> = Vec::with_capacity(ranges.len());
    for range in ranges {
        let offset = range.begin * block_size;
        let size = range.length * block_size;
        match mappings.last_mut() {
            Some(last) if last.offset + last.size == offset => last.size += size,
            _ => mappings.push(Mapping { offset, size }),
        }
    }

    Ok(Mappings {
        mappings,
        block_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: u64 = 2 * 1024 * 1024;

    #[test]
    fn empty_diff() {
        let out = r#"<superblock uuid="" time="1" transaction="2" data_block_size="4096" nr_data_blocks="24576">
  <diff left="1" right="2">
  </diff>
</superblock>"#;
        let mappings = parse(out, BLOCK_SIZE, false).unwrap();
        assert!(mappings.mappings.is_empty());
        assert_eq!(mappings.block_size, BLOCK_SIZE);
    }

    #[test]
    fn rejects_mismatched_pool_block_size() {
        let out = r#"<superblock uuid="" time="1" transaction="2" data_block_size="128" nr_data_blocks="24576">
  <diff left="1" right="2"/>
</superblock>"#;
        assert!(matches!(
            parse(out, BLOCK_SIZE, false),
            Err(DeltaError::BlockSizeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_unaligned_block_size() {
        assert!(matches!(
            parse("<superblock/>", 1000, false),
            Err(DeltaError::InvalidBlockSize(1000))
        ));
    }

    #[test]
    fn coalesces_adjacent_ranges() {
        let out = r#"<superblock uuid="" time="1" transaction="2" data_block_size="4096" nr_data_blocks="24576">
  <diff left="1" right="2">
    <different begin="0" length="1"/>
    <right_only begin="1" length="2"/>
    <same begin="3" length="1"/>
    <different begin="5" length="1"/>
  </diff>
</superblock>"#;
        let mappings = parse(out, BLOCK_SIZE, false).unwrap();
        assert_eq!(
            mappings.mappings,
            vec![
                Mapping {
                    offset: 0,
                    size: 3 * BLOCK_SIZE
                },
                Mapping {
                    offset: 5 * BLOCK_SIZE,
                    size: BLOCK_SIZE
                },
            ]
        );
    }

    #[test]
    fn include_same_covers_full_device() {
        let out = r#"<superblock uuid="" time="1" transaction="2" data_block_size="4096" nr_data_blocks="24576">
  <diff left="1" right="1">
    <same begin="0" length="4"/>
  </diff>
</superblock>"#;
        let full = parse(out, BLOCK_SIZE, true).unwrap();
        assert_eq!(
            full.mappings,
            vec![Mapping {
                offset: 0,
                size: 4 * BLOCK_SIZE
            }]
        );

        let incremental = parse(out, BLOCK_SIZE, false).unwrap();
        assert!(incremental.mappings.is_empty());
    }

    #[test]
    fn excludes_left_only() {
        let out = r#"<superblock uuid="" time="1" transaction="2" data_block_size="4096" nr_data_blocks="24576">
  <diff left="1" right="2">
    <left_only begin="0" length="2"/>
    <different begin="2" length="1"/>
  </diff>
</superblock>"#;
        let mappings = parse(out, BLOCK_SIZE, false).unwrap();
        assert_eq!(
            mappings.mappings,
            vec![Mapping {
                offset: 2 * BLOCK_SIZE,
                size: BLOCK_SIZE
            }]
        );
    }
}
