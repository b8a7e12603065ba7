//! Rolling-checksum signatures.
//!
//! A signature lists, for every `block_size` block of a reference file, the
//! weak rolling checksum and a truncated SHA-256. It lets a peer compute a
//! delta without holding the reference bytes.
//!
//! File layout (big-endian): `DPSG`, format version, `u32` block size,
//! `u64` reference length, `u32` block count, then `u32` weak + 16-byte
//! strong per block.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::{CancelOnRead, or_cancelled};
use crate::rolling::weak_checksum;
use crate::{DEFAULT_BLOCK_SIZE, TransferError};

const MAGIC: &[u8; 4] = b"DPSG";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4 + 8 + 4;

/// Length of the truncated strong hash.
pub const STRONG_LEN: usize = 16;

/// Checksums of one reference block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSignature {
    pub weak: u32,
    pub strong: [u8; STRONG_LEN],
}

impl BlockSignature {
    pub fn of(block: &[u8]) -> Self {
        Self {
            weak: weak_checksum(block),
            strong: strong_hash(block),
        }
    }
}

pub(crate) fn strong_hash(block: &[u8]) -> [u8; STRONG_LEN] {
    let full = Sha256::digest(block);
    let mut out = [0u8; STRONG_LEN];
    out.copy_from_slice(&full[..STRONG_LEN]);
    out
}

/// In-memory signature with a weak-checksum index.
#[derive(Debug, Clone)]
pub struct Signature {
    block_size: usize,
    file_len: u64,
    blocks: Vec<BlockSignature>,
    index: HashMap<u32, Vec<u32>>,
}

impl Signature {
    /// Builds a signature from reference bytes.
    pub fn from_bytes(data: &[u8], block_size: usize) -> Self {
        let block_size = effective_block_size(block_size);
        let blocks = data.chunks(block_size).map(BlockSignature::of).collect();
        Self::from_parts(block_size, data.len() as u64, blocks)
    }

    fn from_parts(block_size: usize, file_len: u64, blocks: Vec<BlockSignature>) -> Self {
        let mut index: HashMap<u32, Vec<u32>> = HashMap::new();
        for (i, block) in blocks.iter().enumerate() {
            index.entry(block.weak).or_default().push(i as u32);
        }
        Self {
            block_size,
            file_len,
            blocks,
            index,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Length of the reference file the signature describes.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn blocks(&self) -> &[BlockSignature] {
        &self.blocks
    }

    /// Length of block `index` (the final block may be short).
    pub fn block_len(&self, index: u32) -> usize {
        let start = index as u64 * self.block_size as u64;
        (self.file_len.saturating_sub(start)).min(self.block_size as u64) as usize
    }

    /// Finds a reference block whose checksums and length match `window`.
    pub fn find(&self, weak: u32, window: &[u8]) -> Option<u32> {
        let candidates = self.index.get(&weak)?;
        let mut strong = None;
        candidates.iter().copied().find(|&i| {
            if self.block_len(i) != window.len() {
                return false;
            }
            let s = strong.get_or_insert_with(|| strong_hash(window));
            self.blocks[i as usize].strong == *s
        })
    }

    /// Serializes the signature.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), TransferError> {
        write_header(&mut w, self.block_size, self.file_len, self.blocks.len())?;
        for block in &self.blocks {
            write_block(&mut w, block)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Parses a serialized signature.
    pub fn read_from<R: Read>(mut r: R) -> Result<Self, TransferError> {
        let mut header = [0u8; HEADER_LEN];
        r.read_exact(&mut header)
            .map_err(|e| TransferError::InvalidSignature(format!("truncated header: {e}")))?;
        if &header[..4] != MAGIC {
            return Err(TransferError::InvalidSignature("bad magic".into()));
        }
        if header[4] != FORMAT_VERSION {
            return Err(TransferError::InvalidSignature(format!(
                "unsupported format version {}",
                header[4]
            )));
        }
        let block_size = u32::from_be_bytes(header[5..9].try_into().unwrap_or_default()) as usize;
        let file_len = u64::from_be_bytes(header[9..17].try_into().unwrap_or_default());
        let count = u32::from_be_bytes(header[17..21].try_into().unwrap_or_default()) as u64;

        if block_size == 0 {
            return Err(TransferError::InvalidSignature("zero block size".into()));
        }
        if count != file_len.div_ceil(block_size as u64) {
            return Err(TransferError::InvalidSignature(format!(
                "{count} blocks do not cover {file_len} bytes"
            )));
        }

        let mut blocks = Vec::with_capacity(count as usize);
        let mut entry = [0u8; 4 + STRONG_LEN];
        for _ in 0..count {
            r.read_exact(&mut entry)
                .map_err(|e| TransferError::InvalidSignature(format!("truncated blocks: {e}")))?;
            let mut strong = [0u8; STRONG_LEN];
            strong.copy_from_slice(&entry[4..]);
            blocks.push(BlockSignature {
                weak: u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]),
                strong,
            });
        }
        Ok(Self::from_parts(block_size, file_len, blocks))
    }

    /// Loads a signature file.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        Self::read_from(BufReader::new(file))
    }
}

fn effective_block_size(block_size: usize) -> usize {
    if block_size == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        block_size
    }
}

fn write_header<W: Write>(
    w: &mut W,
    block_size: usize,
    file_len: u64,
    count: usize,
) -> Result<(), TransferError> {
    w.write_all(MAGIC)?;
    w.write_all(&[FORMAT_VERSION])?;
    w.write_all(&(block_size as u32).to_be_bytes())?;
    w.write_all(&file_len.to_be_bytes())?;
    w.write_all(&(count as u32).to_be_bytes())?;
    Ok(())
}

fn write_block<W: Write>(w: &mut W, block: &BlockSignature) -> Result<(), TransferError> {
    w.write_all(&block.weak.to_be_bytes())?;
    w.write_all(&block.strong)?;
    Ok(())
}

/// Streams `source` into a signature file at `output`.
///
/// Output is written to a sibling `.part` file and renamed on success, so a
/// failure never leaves a partial signature behind. Returns the signature
/// size in bytes.
pub fn generate_signature_blocking(
    source: &Path,
    output: &Path,
    block_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let block_size = effective_block_size(block_size);
    let partial = partial_path(output);

    let result = write_signature(source, &partial, block_size, cancel);
    match result {
        Ok(()) => {
            std::fs::rename(&partial, output)?;
            let size = std::fs::metadata(output)?.len();
            debug!(
                source = %source.display(),
                signature_bytes = size,
                block_size,
                "signature generated"
            );
            Ok(size)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            Err(or_cancelled(e, cancel))
        }
    }
}

fn write_signature(
    source: &Path,
    partial: &Path,
    block_size: usize,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let file = std::fs::File::open(source)?;
    let file_len = file.metadata()?.len();
    let count = file_len.div_ceil(block_size as u64) as usize;
    let mut reader = BufReader::with_capacity(256 * 1024, CancelOnRead::new(file, cancel));
    let mut writer = BufWriter::new(std::fs::File::create(partial)?);

    write_header(&mut writer, block_size, file_len, count)?;
    let mut block = vec![0u8; block_size];
    let mut written = 0usize;
    loop {
        let n = read_full(&mut reader, &mut block)?;
        if n == 0 {
            break;
        }
        write_block(&mut writer, &BlockSignature::of(&block[..n]))?;
        written += 1;
    }
    if written != count {
        return Err(TransferError::InvalidFile(format!(
            "{} changed while generating signature",
            source.display()
        )));
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Fills `buf` unless EOF is hit first; returns the bytes read.
pub(crate) fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub(crate) fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Generates a signature on the blocking pool and returns its path.
pub async fn generate_signature(
    source: &Path,
    output: &Path,
    block_size: usize,
    cancel: &CancellationToken,
) -> Result<PathBuf, TransferError> {
    let source = source.to_path_buf();
    let output = output.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || {
        generate_signature_blocking(&source, &output, block_size, &cancel).map(|_| output)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 7 + i / 13) % 256) as u8).collect()
    }

    #[test]
    fn file_signature_matches_in_memory() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("ref.bin");
        let out = dir.path().join("ref.sig");
        let data = sample(10_000);
        std::fs::write(&src, &data).unwrap();

        let size = generate_signature_blocking(&src, &out, 1024, &CancellationToken::new()).unwrap();
        assert_eq!(size, std::fs::metadata(&out).unwrap().len());
        assert!(!partial_path(&out).exists());

        let loaded = Signature::load(&out).unwrap();
        let expected = Signature::from_bytes(&data, 1024);
        assert_eq!(loaded.block_size(), 1024);
        assert_eq!(loaded.file_len(), 10_000);
        assert_eq!(loaded.blocks(), expected.blocks());
        assert_eq!(loaded.blocks().len(), 10);
        assert_eq!(loaded.block_len(9), 10_000 - 9 * 1024);
    }

    #[test]
    fn empty_reference_has_no_blocks() {
        let sig = Signature::from_bytes(&[], 0);
        assert_eq!(sig.block_size(), DEFAULT_BLOCK_SIZE);
        assert!(sig.blocks().is_empty());
        let mut buf = Vec::new();
        sig.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        assert!(Signature::read_from(&buf[..]).unwrap().blocks().is_empty());
    }

    #[test]
    fn find_checks_strong_hash_and_length() {
        let data = sample(4096);
        let sig = Signature::from_bytes(&data, 1024);
        let block = &data[1024..2048];
        assert_eq!(sig.find(weak_checksum(block), block), Some(1));

        let mut tampered = block.to_vec();
        tampered.swap(0, 1);
        assert_eq!(sig.find(weak_checksum(block), &tampered), None);
        assert_eq!(sig.find(weak_checksum(block), &block[..10]), None);
    }

    #[test]
    fn missing_source_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("x.sig");
        let result = generate_signature_blocking(
            &dir.path().join("missing"),
            &out,
            1024,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(TransferError::Io(_))));
        assert!(!out.exists());
        assert!(!partial_path(&out).exists());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Signature::read_from(&b"nope"[..]),
            Err(TransferError::InvalidSignature(_))
        ));
        let mut buf = Vec::new();
        Signature::from_bytes(&sample(3000), 1024)
            .write_to(&mut buf)
            .unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            Signature::read_from(&buf[..]),
            Err(TransferError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn async_generation_returns_path() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("ref.bin");
        std::fs::write(&src, sample(5000)).unwrap();
        let out = dir.path().join("ref.sig");
        let path = generate_signature(&src, &out, 0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, out);
        assert!(out.exists());
    }

    #[tokio::test]
    async fn cancelled_generation_removes_partial_output() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("ref.bin");
        std::fs::write(&src, sample(600_000)).unwrap();
        let out = dir.path().join("ref.sig");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = generate_signature(&src, &out, 1024, &cancel).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(!out.exists());
        assert!(!partial_path(&out).exists());
    }
}
