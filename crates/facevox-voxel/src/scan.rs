//! BNT face-scan decoding.
//!
//! A BNT file is a little-endian record:
//!
//! | field      | type            |
//! |------------|-----------------|
//! | nrows      | `i16`           |
//! | ncols      | `i16`           |
//! | zmin       | `f64`           |
//! | name len   | `i16`           |
//! | image file | `name len` bytes |
//! | count      | `u32`           |
//! | data       | `count × f64`   |
//!
//! `data` holds five rows of `count / 5` values each (`x`, `y`, `z`, `u`, `v`).

use std::path::Path;

use facevox_core::{Error, PointSample, ScanPoint};
use serde::{Deserialize, Serialize};

/// Number of values stored per scan point
pub const BNT_FIELDS: usize = 5;

/// Header fields of a BNT scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMetadata {
    pub nrows: i16,
    pub ncols: i16,
    pub zmin: f64,
    /// Companion image file name as stored in the scan
    pub image_file: String,
}

/// A decoded scan
#[derive(Debug, Clone, PartialEq)]
pub struct BntScan {
    pub metadata: ScanMetadata,
    pub points: PointSample,
}

/// Sequential little-endian reader over a byte slice
struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize, field: &str) -> facevox_core::Result<&'a [u8]> {
        let end = self.offset.checked_add(len).filter(|&end| end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.offset..end];
                self.offset = end;
                Ok(slice)
            }
            None => Err(Error::ScanFormat(format!(
                "truncated scan: `{}` needs {} bytes at offset {}, {} available",
                field,
                len,
                self.offset,
                self.bytes.len().saturating_sub(self.offset)
            ))),
        }
    }

    fn array<const N: usize>(&mut self, field: &str) -> facevox_core::Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn i16(&mut self, field: &str) -> facevox_core::Result<i16> {
        Ok(i16::from_le_bytes(self.array(field)?))
    }

    fn u32(&mut self, field: &str) -> facevox_core::Result<u32> {
        Ok(u32::from_le_bytes(self.array(field)?))
    }

    fn f64(&mut self, field: &str) -> facevox_core::Result<f64> {
        Ok(f64::from_le_bytes(self.array(field)?))
    }
}

/// Decode a BNT scan from raw bytes.
pub fn read_bnt(bytes: &[u8]) -> facevox_core::Result<BntScan> {
    let mut cursor = Cursor::new(bytes);

    let nrows = cursor.i16("nrows")?;
    let ncols = cursor.i16("ncols")?;
    let zmin = cursor.f64("zmin")?;

    let name_len = cursor.i16("name length")?;
    if name_len < 0 {
        return Err(Error::ScanFormat(format!("negative image name length {}", name_len)));
    }
    let image_file = String::from_utf8_lossy(cursor.take(name_len as usize, "image file")?)
        .trim_end_matches('\0')
        .to_string();

    let count = cursor.u32("point data length")? as usize;
    if count % BNT_FIELDS != 0 {
        return Err(Error::ScanFormat(format!(
            "point data length {} is not a multiple of {}",
            count, BNT_FIELDS
        )));
    }

    let raw = cursor.take(count.saturating_mul(8), "point data")?;
    let values: Vec<f64> = raw
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            f64::from_le_bytes(word)
        })
        .collect();

    let n = count / BNT_FIELDS;
    let points = (0..n)
        .map(|i| {
            ScanPoint::new(
                values[i],
                values[n + i],
                values[2 * n + i],
                values[3 * n + i],
                values[4 * n + i],
            )
        })
        .collect();

    Ok(BntScan {
        metadata: ScanMetadata {
            nrows,
            ncols,
            zmin,
            image_file,
        },
        points: PointSample::new(points),
    })
}

/// Read and decode a BNT scan from disk.
pub fn load_bnt<P: AsRef<Path>>(path: P) -> facevox_core::Result<BntScan> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let scan = read_bnt(&bytes)?;
    tracing::debug!(
        path = %path.display(),
        points = scan.points.len(),
        image = %scan.metadata.image_file,
        "decoded scan"
    );
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(name: &str, columns: &[[f64; 5]]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&480i16.to_le_bytes());
        bytes.extend_from_slice(&640i16.to_le_bytes());
        bytes.extend_from_slice(&(-1.0e9f64).to_le_bytes());
        bytes.extend_from_slice(&(name.len() as i16).to_le_bytes());
        bytes.extend_from_slice(name.as_bytes());
        bytes.extend_from_slice(&((columns.len() * 5) as u32).to_le_bytes());
        for field in 0..5 {
            for column in columns {
                bytes.extend_from_slice(&column[field].to_le_bytes());
            }
        }
        bytes
    }

    #[test]
    fn test_decodes_row_major_fields() {
        let bytes = encode("bs000_N_N_0.png", &[[1.0, 2.0, 3.0, 0.1, 0.2], [4.0, 5.0, 6.0, 0.3, 0.4]]);
        let scan = read_bnt(&bytes).unwrap();
        assert_eq!(scan.metadata.nrows, 480);
        assert_eq!(scan.metadata.ncols, 640);
        assert_eq!(scan.metadata.image_file, "bs000_N_N_0.png");
        assert_eq!(scan.points.len(), 2);
        assert_eq!(scan.points.points[1], ScanPoint::new(4.0, 5.0, 6.0, 0.3, 0.4));
    }

    #[test]
    fn test_truncated_data_is_rejected() {
        let mut bytes = encode("a.png", &[[1.0, 2.0, 3.0, 0.1, 0.2]]);
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(read_bnt(&bytes), Err(Error::ScanFormat(_))));
        assert!(matches!(read_bnt(&bytes[..5]), Err(Error::ScanFormat(_))));
    }

    #[test]
    fn test_count_must_be_multiple_of_five() {
        let mut bytes = encode("", &[]);
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&7u32.to_le_bytes());
        bytes.extend(std::iter::repeat(0u8).take(7 * 8));
        assert!(matches!(read_bnt(&bytes), Err(Error::ScanFormat(_))));
    }
}
