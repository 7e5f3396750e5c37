//! Byte-budgeted snapshot codec.
//!
//! Records are appended whole into a buffer capped at a fixed uncompressed
//! size. When the next record would not fit, the buffer is DEFLATE-compressed
//! on its own (no shared dictionary) and emitted as a [`SnapshotChunk`]
//! tagged with its record count and uncompressed size, so every chunk
//! decodes independently and in order.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};

use crate::math::pack_pos;

/// Default uncompressed ceiling per snapshot buffer.
pub const DEFAULT_MAX_SNAPSHOT_SIZE: usize = 430;

/// Largest ceiling a chunk header's `u16` size field can describe.
pub const MAX_SNAPSHOT_CEILING: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("record of {size} bytes exceeds snapshot ceiling of {ceiling} bytes")]
    RecordTooLarge { size: usize, ceiling: usize },
    #[error("chunk holds {0} records, more than a chunk header can count")]
    TooManyRecords(usize),
    #[error("snapshot ceiling {0} exceeds {MAX_SNAPSHOT_CEILING} bytes")]
    CeilingTooLarge(usize),
    #[error("{what} of {len} does not fit a u16 length prefix")]
    LengthOverflow { what: &'static str, len: usize },
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("decompressed {actual} bytes, header says {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("truncated record: {0}")]
    Truncated(&'static str),
}

/// A value that can be written into (and read back from) a snapshot buffer.
pub trait SnapshotRecord: Sized {
    fn write(&self, out: &mut BytesMut) -> Result<(), SnapshotError>;
    fn read(buf: &mut Bytes) -> Result<Self, SnapshotError>;
}

/// One compressed, independently decodable buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    pub count: u16,
    pub original_size: u16,
    pub data: Vec<u8>,
}

/// Splits an ordered record stream into ceiling-bounded compressed chunks.
pub struct SnapshotEncoder {
    ceiling: usize,
    current: BytesMut,
    scratch: BytesMut,
    count: usize,
    chunks: Vec<SnapshotChunk>,
}

impl SnapshotEncoder {
    pub fn new(ceiling: usize) -> Result<Self, SnapshotError> {
        if ceiling > MAX_SNAPSHOT_CEILING {
            return Err(SnapshotError::CeilingTooLarge(ceiling));
        }
        Ok(Self {
            ceiling,
            current: BytesMut::with_capacity(ceiling),
            scratch: BytesMut::new(),
            count: 0,
            chunks: Vec::new(),
        })
    }

    /// Appends one record. A record that cannot fit even in an empty buffer
    /// is rejected and leaves the encoder unchanged.
    pub fn push<R: SnapshotRecord>(&mut self, record: &R) -> Result<(), SnapshotError> {
        self.scratch.clear();
        record.write(&mut self.scratch)?;
        let size = self.scratch.len();
        if size > self.ceiling {
            return Err(SnapshotError::RecordTooLarge {
                size,
                ceiling: self.ceiling,
            });
        }

        if self.current.len() + size > self.ceiling {
            self.flush()?;
        }

        self.current.extend_from_slice(&self.scratch);
        self.count += 1;
        Ok(())
    }

    /// Emits the trailing partial buffer and returns every chunk in order.
    pub fn finish(mut self) -> Result<Vec<SnapshotChunk>, SnapshotError> {
        if self.count > 0 {
            self.flush()?;
        }
        Ok(self.chunks)
    }

    fn flush(&mut self) -> Result<(), SnapshotError> {
        let count =
            u16::try_from(self.count).map_err(|_| SnapshotError::TooManyRecords(self.count))?;
        let original_size = u16::try_from(self.current.len()).map_err(|_| SnapshotError::LengthOverflow {
            what: "chunk",
            len: self.current.len(),
        })?;
        let data = compress(&self.current)?;
        self.chunks.push(SnapshotChunk {
            count,
            original_size,
            data,
        });
        self.current.clear();
        self.count = 0;
        Ok(())
    }
}

/// Encodes a whole record sequence in one call.
pub fn encode_records<'a, R, I>(ceiling: usize, records: I) -> Result<Vec<SnapshotChunk>, SnapshotError>
where
    R: SnapshotRecord + 'a,
    I: IntoIterator<Item = &'a R>,
{
    let mut encoder = SnapshotEncoder::new(ceiling)?;
    for record in records {
        encoder.push(record)?;
    }
    encoder.finish()
}

/// Decodes every record in one chunk.
pub fn decode_chunk<R: SnapshotRecord>(chunk: &SnapshotChunk) -> Result<Vec<R>, SnapshotError> {
    let raw = decompress(&chunk.data)?;
    if raw.len() != chunk.original_size as usize {
        return Err(SnapshotError::SizeMismatch {
            expected: chunk.original_size as usize,
            actual: raw.len(),
        });
    }
    let mut buf = Bytes::from(raw);
    let mut out = Vec::with_capacity(chunk.count as usize);
    for _ in 0..chunk.count {
        out.push(R::read(&mut buf)?);
    }
    Ok(out)
}

/// Compresses one standalone buffer.
pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn need(buf: &Bytes, n: usize, what: &'static str) -> Result<(), SnapshotError> {
    if buf.remaining() < n {
        Err(SnapshotError::Truncated(what))
    } else {
        Ok(())
    }
}

fn put_len(out: &mut BytesMut, len: usize, what: &'static str) -> Result<(), SnapshotError> {
    let len = u16::try_from(len).map_err(|_| SnapshotError::LengthOverflow { what, len })?;
    out.put_u16(len);
    Ok(())
}

fn read_state(buf: &mut Bytes, what: &'static str) -> Result<Bytes, SnapshotError> {
    need(buf, 2, what)?;
    let len = buf.get_u16() as usize;
    need(buf, len, what)?;
    Ok(buf.split_to(len))
}

/// Identity-mapped entity state: id, type tag, opaque length-prefixed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: u32,
    pub type_tag: u8,
    pub state: Bytes,
}

impl SnapshotRecord for EntityRecord {
    fn write(&self, out: &mut BytesMut) -> Result<(), SnapshotError> {
        out.put_u32(self.id);
        out.put_u8(self.type_tag);
        put_len(out, self.state.len(), "entity state")?;
        out.extend_from_slice(&self.state);
        Ok(())
    }

    fn read(buf: &mut Bytes) -> Result<Self, SnapshotError> {
        need(buf, 5, "entity header")?;
        let id = buf.get_u32();
        let type_tag = buf.get_u8();
        let state = read_state(buf, "entity state")?;
        Ok(Self { id, type_tag, state })
    }
}

/// Synchronizable building state keyed by packed tile position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub pos: u32,
    pub state: Bytes,
}

impl SnapshotRecord for BlockRecord {
    fn write(&self, out: &mut BytesMut) -> Result<(), SnapshotError> {
        out.put_u32(self.pos);
        put_len(out, self.state.len(), "block state")?;
        out.extend_from_slice(&self.state);
        Ok(())
    }

    fn read(buf: &mut Bytes) -> Result<Self, SnapshotError> {
        need(buf, 4, "block pos")?;
        let pos = buf.get_u32();
        let state = read_state(buf, "block state")?;
        Ok(Self { pos, state })
    }
}

/// Resources held by one core structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreRecord {
    pub pos: u32,
    /// `(item id, amount)` pairs.
    pub items: Vec<(u16, u32)>,
}

impl CoreRecord {
    pub fn at(x: u16, y: u16, items: Vec<(u16, u32)>) -> Self {
        Self {
            pos: pack_pos(x, y),
            items,
        }
    }
}

impl SnapshotRecord for CoreRecord {
    fn write(&self, out: &mut BytesMut) -> Result<(), SnapshotError> {
        out.put_u32(self.pos);
        put_len(out, self.items.len(), "core items")?;
        for (item, amount) in &self.items {
            out.put_u16(*item);
            out.put_u32(*amount);
        }
        Ok(())
    }

    fn read(buf: &mut Bytes) -> Result<Self, SnapshotError> {
        need(buf, 6, "core header")?;
        let pos = buf.get_u32();
        let n = buf.get_u16() as usize;
        need(buf, n * 6, "core items")?;
        let items = (0..n).map(|_| (buf.get_u16(), buf.get_u32())).collect();
        Ok(Self { pos, items })
    }
}

/// Writes a count-prefixed core list into one uncompressed buffer.
pub fn write_core_list(cores: &[CoreRecord]) -> Result<BytesMut, SnapshotError> {
    let mut out = BytesMut::new();
    out.put_u8(cores.len().min(u8::MAX as usize) as u8);
    for core in cores.iter().take(u8::MAX as usize) {
        core.write(&mut out)?;
    }
    Ok(out)
}

pub fn read_core_list(raw: &[u8]) -> Result<Vec<CoreRecord>, SnapshotError> {
    let mut buf = Bytes::copy_from_slice(raw);
    need(&buf, 1, "core count")?;
    let n = buf.get_u8();
    (0..n).map(|_| CoreRecord::read(&mut buf)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: u32, state_len: usize) -> EntityRecord {
        EntityRecord {
            id,
            type_tag: (id % 7) as u8,
            state: Bytes::from(vec![id as u8; state_len]),
        }
    }

    fn decode_all(chunks: &[SnapshotChunk]) -> Vec<EntityRecord> {
        chunks
            .iter()
            .flat_map(|c| decode_chunk::<EntityRecord>(c).unwrap())
            .collect()
    }

    #[test]
    fn zero_records_emit_zero_chunks() {
        let chunks = encode_records::<EntityRecord, _>(430, []).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn under_ceiling_emits_single_chunk() {
        let records: Vec<_> = (0..5).map(|i| entity(i, 10)).collect();
        let chunks = encode_records(430, &records).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].count, 5);
        assert_eq!(decode_all(&chunks), records);
    }

    #[test]
    fn roundtrip_preserves_order_across_chunks() {
        for n in [1usize, 2, 17, 100, 333] {
            let records: Vec<_> = (0..n as u32).map(|i| entity(i, (i as usize * 13) % 90)).collect();
            let chunks = encode_records(430, &records).unwrap();
            assert_eq!(decode_all(&chunks), records, "n = {n}");
            let total: usize = chunks.iter().map(|c| c.count as usize).sum();
            assert_eq!(total, n);
        }
    }

    #[test]
    fn no_chunk_exceeds_ceiling() {
        let records: Vec<_> = (0..200).map(|i| entity(i, 40 + (i as usize % 50))).collect();
        let chunks = encode_records(256, &records).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.original_size as usize <= 256);
        }
    }

    #[test]
    fn record_exactly_at_ceiling_fits() {
        // 4 id + 1 tag + 2 len + 93 state = 100
        let records = vec![entity(1, 93), entity(2, 93)];
        let chunks = encode_records(100, &records).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.original_size == 100 && c.count == 1));
        assert_eq!(decode_all(&chunks), records);
    }

    #[test]
    fn oversized_record_is_rejected_without_corrupting_stream() {
        let mut encoder = SnapshotEncoder::new(64).unwrap();
        encoder.push(&entity(1, 8)).unwrap();
        let err = encoder.push(&entity(2, 200)).unwrap_err();
        assert!(matches!(err, SnapshotError::RecordTooLarge { .. }));
        encoder.push(&entity(3, 8)).unwrap();
        let chunks = encoder.finish().unwrap();
        let ids: Vec<u32> = decode_all(&chunks).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn core_list_roundtrip() {
        let cores = vec![
            CoreRecord::at(3, 4, vec![(0, 100), (5, 2)]),
            CoreRecord::at(60, 60, vec![]),
        ];
        let raw = write_core_list(&cores).unwrap();
        assert_eq!(read_core_list(&raw).unwrap(), cores);
    }

    #[test]
    fn corrupted_size_header_is_detected() {
        let records = vec![entity(1, 4)];
        let mut chunks = encode_records(430, &records).unwrap();
        chunks[0].original_size += 1;
        assert!(matches!(
            decode_chunk::<EntityRecord>(&chunks[0]),
            Err(SnapshotError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn ceiling_beyond_u16_is_rejected() {
        assert!(matches!(
            SnapshotEncoder::new(100_000),
            Err(SnapshotError::CeilingTooLarge(100_000))
        ));
        assert!(SnapshotEncoder::new(MAX_SNAPSHOT_CEILING).is_ok());
    }

    #[test]
    fn state_longer_than_u16_is_an_error() {
        let mut encoder = SnapshotEncoder::new(MAX_SNAPSHOT_CEILING).unwrap();
        let err = encoder.push(&entity(1, 70_000)).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::LengthOverflow {
                what: "entity state",
                len: 70_000
            }
        ));
        encoder.push(&entity(2, 8)).unwrap();
        let ids: Vec<u32> = decode_all(&encoder.finish().unwrap()).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2]);

        let block = BlockRecord {
            pos: 1,
            state: Bytes::from(vec![0; 65_536]),
        };
        assert!(block.write(&mut BytesMut::new()).is_err());
    }
}
