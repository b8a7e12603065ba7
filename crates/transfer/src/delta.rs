//! Binary delta encoding against a signature, and delta application.
//!
//! The encoder slides a block-sized window over the new content. Whenever
//! the window's weak checksum hits the signature index and the strong hash
//! agrees, it emits a copy of that reference block; bytes in between become
//! literals. Adjacent copies are coalesced.
//!
//! File layout: `DPDL`, format version, then ops until an end marker:
//! `0x01` copy (`u64` offset, `u64` length), `0x02` literal (`u32` length
//! followed by the bytes), `0x00` end. Integers are big-endian.

use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TransferError;
use crate::cancel::{CancelOnRead, or_cancelled};
use crate::rolling::{RollingChecksum, weak_checksum};
use crate::signature::{Signature, partial_path};

const MAGIC: &[u8; 4] = b"DPDL";
const FORMAT_VERSION: u8 = 1;

const OP_END: u8 = 0x00;
const OP_COPY: u8 = 0x01;
const OP_LITERAL: u8 = 0x02;

/// Literal runs are flushed once they reach this size.
const MAX_LITERAL: usize = 64 * 1024;
/// Read granularity of the encoder.
const READ_CHUNK: usize = 256 * 1024;
/// Consumed bytes are dropped from the scan buffer past this point.
const COMPACT_AT: usize = 1024 * 1024;

/// A delta instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
    /// Copy `len` bytes of the reference starting at `offset`.
    Copy { offset: u64, len: u64 },
    /// Insert bytes verbatim.
    Literal(Vec<u8>),
}

/// Summary of an encoded delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaStats {
    pub copied_bytes: u64,
    pub literal_bytes: u64,
    pub ops: u64,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct DeltaWriter<W: Write> {
    w: W,
    pending_copy: Option<(u64, u64)>,
    stats: DeltaStats,
}

impl<W: Write> DeltaWriter<W> {
    fn new(mut w: W) -> Result<Self, TransferError> {
        w.write_all(MAGIC)?;
        w.write_all(&[FORMAT_VERSION])?;
        Ok(Self {
            w,
            pending_copy: None,
            stats: DeltaStats::default(),
        })
    }

    fn copy(&mut self, offset: u64, len: u64) -> Result<(), TransferError> {
        match self.pending_copy {
            Some((start, run)) if start + run == offset => {
                self.pending_copy = Some((start, run + len));
            }
            _ => {
                self.flush_copy()?;
                self.pending_copy = Some((offset, len));
            }
        }
        self.stats.copied_bytes += len;
        Ok(())
    }

    fn literal(&mut self, data: &[u8]) -> Result<(), TransferError> {
        if data.is_empty() {
            return Ok(());
        }
        self.flush_copy()?;
        for piece in data.chunks(MAX_LITERAL) {
            self.w.write_all(&[OP_LITERAL])?;
            self.w.write_all(&(piece.len() as u32).to_be_bytes())?;
            self.w.write_all(piece)?;
            self.stats.ops += 1;
        }
        self.stats.literal_bytes += data.len() as u64;
        Ok(())
    }

    fn flush_copy(&mut self) -> Result<(), TransferError> {
        if let Some((offset, len)) = self.pending_copy.take() {
            self.w.write_all(&[OP_COPY])?;
            self.w.write_all(&offset.to_be_bytes())?;
            self.w.write_all(&len.to_be_bytes())?;
            self.stats.ops += 1;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(DeltaStats, W), TransferError> {
        self.flush_copy()?;
        self.w.write_all(&[OP_END])?;
        self.w.flush()?;
        Ok((self.stats, self.w))
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Reads until `buf` holds `target` bytes; returns `true` at EOF.
fn fill<R: Read>(r: &mut R, buf: &mut Vec<u8>, target: usize) -> Result<bool, TransferError> {
    while buf.len() < target {
        let old = buf.len();
        buf.resize(old + READ_CHUNK, 0);
        let n = loop {
            match r.read(&mut buf[old..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    buf.truncate(old);
                    return Err(e.into());
                }
            }
        };
        buf.truncate(old + n);
        if n == 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Encodes the content of `reader` against `sig` into `writer`.
pub(crate) fn encode<R: Read, W: Write>(
    sig: &Signature,
    mut reader: R,
    writer: W,
) -> Result<(DeltaStats, W), TransferError> {
    let bs = sig.block_size();
    let mut out = DeltaWriter::new(writer)?;
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK + bs);
    let mut eof = false;
    // Window start and start of the not-yet-emitted literal run.
    let mut pos = 0usize;
    let mut lit = 0usize;
    let mut rolling: Option<RollingChecksum> = None;

    if sig.blocks().is_empty() {
        loop {
            eof = fill(&mut reader, &mut buf, READ_CHUNK)?;
            out.literal(&buf)?;
            buf.clear();
            if eof {
                return out.finish();
            }
        }
    }

    loop {
        if !eof && buf.len() < pos + bs + 1 {
            eof = fill(&mut reader, &mut buf, pos + bs + 1)?;
        }
        if buf.len() < pos + bs {
            break;
        }

        let window = &buf[pos..pos + bs];
        let weak = match rolling {
            Some(r) => r.value(),
            None => {
                let r = RollingChecksum::new(window);
                rolling = Some(r);
                r.value()
            }
        };

        if let Some(index) = sig.find(weak, window) {
            out.literal(&buf[lit..pos])?;
            out.copy(index as u64 * bs as u64, bs as u64)?;
            pos += bs;
            lit = pos;
            rolling = None;
        } else {
            if buf.len() > pos + bs {
                if let Some(r) = rolling.as_mut() {
                    r.roll(buf[pos], buf[pos + bs]);
                }
            } else {
                rolling = None;
            }
            pos += 1;
            if pos - lit >= MAX_LITERAL {
                out.literal(&buf[lit..pos])?;
                lit = pos;
            }
        }

        if lit >= COMPACT_AT {
            buf.drain(..lit);
            pos -= lit;
            lit = 0;
        }
    }

    // Tail shorter than a block: it may still equal the reference's short
    // final block.
    let tail = &buf[pos..];
    match (!tail.is_empty())
        .then(|| sig.find(weak_checksum(tail), tail))
        .flatten()
    {
        Some(index) => {
            out.literal(&buf[lit..pos])?;
            out.copy(index as u64 * bs as u64, tail.len() as u64)?;
        }
        None => out.literal(&buf[lit..])?,
    }
    out.finish()
}

/// Encodes `data` against `sig` in memory.
pub fn encode_delta_bytes(sig: &Signature, data: &[u8]) -> Result<Vec<u8>, TransferError> {
    let (_, out) = encode(sig, Cursor::new(data), Vec::new())?;
    Ok(out)
}

/// Streams `new_file` against the signature at `signature` into a delta
/// file at `output`. Returns the delta size in bytes.
///
/// Like signature generation, the output only appears on success.
pub fn compute_delta_blocking(
    new_file: &Path,
    signature: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let sig = Signature::load(signature)?;
    let reader = BufReader::new(CancelOnRead::new(std::fs::File::open(new_file)?, cancel));
    let partial = partial_path(output);

    let result = std::fs::File::create(&partial)
        .map_err(TransferError::from)
        .and_then(|file| encode(&sig, reader, BufWriter::new(file)))
        .and_then(|(stats, writer)| {
            let file = writer
                .into_inner()
                .map_err(|e| TransferError::Io(e.into_error()))?;
            file.sync_all()?;
            Ok(stats)
        });

    match result {
        Ok(stats) => {
            std::fs::rename(&partial, output)?;
            let size = std::fs::metadata(output)?.len();
            debug!(
                new_file = %new_file.display(),
                delta_bytes = size,
                copied = stats.copied_bytes,
                literal = stats.literal_bytes,
                "delta computed"
            );
            Ok(size)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            Err(or_cancelled(e, cancel))
        }
    }
}

/// Computes a delta on the blocking pool and returns its path.
pub async fn compute_delta(
    new_file: &Path,
    signature: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, TransferError> {
    let new_file = new_file.to_path_buf();
    let signature = signature.to_path_buf();
    let output = output.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || {
        compute_delta_blocking(&new_file, &signature, &output, &cancel).map(|_| output)
    })
    .await?
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

fn truncated(e: std::io::Error) -> TransferError {
    TransferError::InvalidDelta(format!("truncated delta: {e}"))
}

fn read_header<R: Read>(r: &mut R) -> Result<(), TransferError> {
    let mut header = [0u8; 5];
    r.read_exact(&mut header).map_err(truncated)?;
    if &header[..4] != MAGIC {
        return Err(TransferError::InvalidDelta("bad magic".into()));
    }
    if header[4] != FORMAT_VERSION {
        return Err(TransferError::InvalidDelta(format!(
            "unsupported format version {}",
            header[4]
        )));
    }
    Ok(())
}

/// Reads the next op; `None` at the end marker.
fn read_op<R: Read>(r: &mut R) -> Result<Option<DeltaOp>, TransferError> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag).map_err(truncated)?;
    match tag[0] {
        OP_END => Ok(None),
        OP_COPY => {
            let mut raw = [0u8; 16];
            r.read_exact(&mut raw).map_err(truncated)?;
            let mut offset = [0u8; 8];
            let mut len = [0u8; 8];
            offset.copy_from_slice(&raw[..8]);
            len.copy_from_slice(&raw[8..]);
            Ok(Some(DeltaOp::Copy {
                offset: u64::from_be_bytes(offset),
                len: u64::from_be_bytes(len),
            }))
        }
        OP_LITERAL => {
            let mut len = [0u8; 4];
            r.read_exact(&mut len).map_err(truncated)?;
            let mut data = vec![0u8; u32::from_be_bytes(len) as usize];
            r.read_exact(&mut data).map_err(truncated)?;
            Ok(Some(DeltaOp::Literal(data)))
        }
        other => Err(TransferError::InvalidDelta(format!("unknown op 0x{other:02x}"))),
    }
}

/// Parses a serialized delta into its ops.
pub fn parse_delta(delta: &[u8]) -> Result<Vec<DeltaOp>, TransferError> {
    let mut r = Cursor::new(delta);
    read_header(&mut r)?;
    let mut ops = Vec::new();
    while let Some(op) = read_op(&mut r)? {
        ops.push(op);
    }
    Ok(ops)
}

fn apply<S: Read + Seek, D: Read, W: Write>(
    reference: &mut S,
    delta: &mut D,
    out: &mut W,
) -> Result<u64, TransferError> {
    read_header(delta)?;
    let reference_len = reference.seek(SeekFrom::End(0))?;
    let mut written = 0u64;
    while let Some(op) = read_op(delta)? {
        match op {
            DeltaOp::Copy { offset, len } => {
                if offset.checked_add(len).is_none_or(|end| end > reference_len) {
                    return Err(TransferError::InvalidDelta(format!(
                        "copy {offset}+{len} beyond reference of {reference_len} bytes"
                    )));
                }
                reference.seek(SeekFrom::Start(offset))?;
                let copied = std::io::copy(&mut reference.by_ref().take(len), out)?;
                written += copied;
            }
            DeltaOp::Literal(data) => {
                out.write_all(&data)?;
                written += data.len() as u64;
            }
        }
    }
    out.flush()?;
    Ok(written)
}

/// Reconstructs new content from reference bytes and a delta.
pub fn apply_delta_bytes(reference: &[u8], delta: &[u8]) -> Result<Vec<u8>, TransferError> {
    let mut out = Vec::new();
    apply(&mut Cursor::new(reference), &mut Cursor::new(delta), &mut out)?;
    Ok(out)
}

/// Reconstructs new content from files. Returns the bytes written.
pub fn apply_delta(reference: &Path, delta: &Path, output: &Path) -> Result<u64, TransferError> {
    let mut reference = BufReader::new(std::fs::File::open(reference)?);
    let mut delta = BufReader::new(std::fs::File::open(delta)?);
    let mut out = BufWriter::new(std::fs::File::create(output)?);
    apply(&mut reference, &mut delta, &mut out)
}
