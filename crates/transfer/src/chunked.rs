use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;

/// Byte range of one multipart part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// 1-based part number as the server counts them.
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

/// Split of a file into fixed-size parts.
///
/// The part count is `max(1, floor(size / chunk_size))`: the remainder is
/// folded into the final part, which may therefore exceed `chunk_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    file_size: u64,
    chunk_size: u64,
    count: u32,
}

impl PartPlan {
    /// Plans parts for `file_size` bytes. A zero `chunk_size` yields a
    /// single part.
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        let count = if chunk_size == 0 {
            1
        } else {
            (file_size / chunk_size).max(1)
        };
        Self {
            file_size,
            chunk_size: if chunk_size == 0 { file_size } else { chunk_size },
            count: u32::try_from(count).unwrap_or(u32::MAX),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Range of part `number` (1-based), `None` when out of range.
    pub fn part(&self, number: u32) -> Option<PartRange> {
        if number == 0 || number > self.count {
            return None;
        }
        let offset = (number as u64 - 1) * self.chunk_size;
        let len = if number == self.count {
            self.file_size - offset
        } else {
            self.chunk_size
        };
        Some(PartRange {
            number,
            offset,
            len,
        })
    }

    /// All parts in order.
    pub fn parts(&self) -> impl Iterator<Item = PartRange> + '_ {
        (1..=self.count).filter_map(|n| self.part(n))
    }
}

/// Reads the bytes of one part from `path`.
pub async fn read_part(path: &Path, range: PartRange) -> Result<Vec<u8>, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.offset)).await?;
    let len = usize::try_from(range.len)
        .map_err(|_| TransferError::InvalidFile(format!("part {} too large", range.number)))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
