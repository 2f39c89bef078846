//! Binary snapshot codec for initial hydration.
//!
//! Hydration bypasses the per-operation path: the relay dumps its `nodes`
//! and `op_log` tables as a stream of binary rows and the client writes
//! them verbatim, without replay.
//!
//! # Wire Format
//!
//! - 19-byte header: an 11-byte signature, a `u32` flags word (zero) and a
//!   `u32` extension length (zero), all big-endian.
//! - Rows: `i16` column count, then per column an `i32` byte length
//!   (−1 = NULL) followed by that many bytes of UTF-8 payload. The first
//!   column of every row is a one-byte discriminator: `n` for a node row,
//!   `o` for an op-log row.
//! - End of data is a bare `i16` −1.
//!
//! The decoder is incremental: feed it whatever arrived from the socket
//! and drain complete rows. A consumer that stops draining stops feeding,
//! which pushes back on the TCP stream instead of buffering unboundedly.

use crate::error::{ArborError, Result};
use crate::op::{MoveOp, Timestamp};
use crate::store::NodeRow;

/// Leading signature of a snapshot stream.
pub const SNAPSHOT_SIGNATURE: [u8; 11] = *b"ARBORSNAP\x00\x01";

const HEADER_LEN: usize = SNAPSHOT_SIGNATURE.len() + 4 + 4;

const DISCRIMINATOR_NODE: &str = "n";
const DISCRIMINATOR_OP: &str = "o";

/// One decoded snapshot row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRow {
    Node(NodeRow),
    Op(MoveOp),
}

/// Streaming encoder. Call [`SnapshotEncoder::take`] between row batches
/// to drain the bytes accumulated so far into one transport chunk.
pub struct SnapshotEncoder {
    buf: Vec<u8>,
}

impl SnapshotEncoder {
    /// Start a stream: the returned encoder already holds the header.
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&SNAPSHOT_SIGNATURE);
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        Self { buf }
    }

    pub fn push_node(&mut self, row: &NodeRow) {
        self.put_row(
            DISCRIMINATOR_NODE,
            &[Some(row.id.as_str()), row.parent_id.as_deref()],
        );
    }

    pub fn push_op(&mut self, op: &MoveOp) {
        self.put_row(
            DISCRIMINATOR_OP,
            &[
                Some(op.timestamp.as_str()),
                Some(op.node_id.as_str()),
                op.old_parent_id.as_deref(),
                Some(op.new_parent_id.as_str()),
                Some(op.client_id.as_str()),
                op.sync_timestamp.as_ref().map(Timestamp::as_str),
                op.last_sync_timestamp.as_ref().map(Timestamp::as_str),
            ],
        );
    }

    /// Write the end-of-data trailer.
    pub fn finish(&mut self) {
        self.buf.extend_from_slice(&(-1i16).to_be_bytes());
    }

    /// Drain everything encoded so far.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn put_row(&mut self, discriminator: &str, cols: &[Option<&str>]) {
        self.buf
            .extend_from_slice(&((cols.len() as i16) + 1).to_be_bytes());
        self.put_col(Some(discriminator));
        for col in cols {
            self.put_col(*col);
        }
    }

    fn put_col(&mut self, col: Option<&str>) {
        match col {
            Some(value) => {
                self.buf
                    .extend_from_slice(&(value.len() as i32).to_be_bytes());
                self.buf.extend_from_slice(value.as_bytes());
            }
            None => self.buf.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
}

impl Default for SnapshotEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental decoder for a snapshot stream.
pub struct SnapshotDecoder {
    buf: Vec<u8>,
    pos: usize,
    header_seen: bool,
    finished: bool,
}

impl SnapshotDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            header_seen: false,
            finished: false,
        }
    }

    /// Buffer more bytes from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Whether the end-of-data trailer was consumed.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Decode the next complete row. `Ok(None)` means more bytes are
    /// needed, or the stream already finished.
    pub fn next_row(&mut self) -> Result<Option<SnapshotRow>> {
        if self.finished {
            return Ok(None);
        }
        if !self.header_seen {
            if self.buf.len() - self.pos < HEADER_LEN {
                return Ok(None);
            }
            if self.buf[self.pos..self.pos + SNAPSHOT_SIGNATURE.len()] != SNAPSHOT_SIGNATURE {
                return Err(ArborError::Hydration("bad snapshot signature".into()));
            }
            self.pos += HEADER_LEN;
            self.header_seen = true;
        }

        let mut reader = Reader {
            buf: &self.buf,
            pos: self.pos,
        };
        let Some(ncols) = reader.i16() else {
            return Ok(None);
        };
        if ncols == -1 {
            self.pos = reader.pos;
            self.finished = true;
            self.compact();
            return Ok(None);
        }
        if ncols <= 0 {
            return Err(ArborError::Hydration(format!(
                "invalid column count {ncols}"
            )));
        }

        let mut cols: Vec<Option<String>> = Vec::with_capacity(ncols as usize);
        for _ in 0..ncols {
            let Some(len) = reader.i32() else {
                return Ok(None);
            };
            if len == -1 {
                cols.push(None);
                continue;
            }
            if len < 0 {
                return Err(ArborError::Hydration(format!("invalid column length {len}")));
            }
            let Some(bytes) = reader.bytes(len as usize) else {
                return Ok(None);
            };
            let value = std::str::from_utf8(bytes)
                .map_err(|e| ArborError::Hydration(format!("non-UTF-8 column: {e}")))?;
            cols.push(Some(value.to_string()));
        }

        self.pos = reader.pos;
        self.compact();
        row_from_cols(cols).map(Some)
    }

    fn compact(&mut self) {
        if self.pos >= 4096 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

impl Default for SnapshotDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn row_from_cols(cols: Vec<Option<String>>) -> Result<SnapshotRow> {
    let mut cols = cols.into_iter();
    let discriminator = cols
        .next()
        .flatten()
        .ok_or_else(|| ArborError::Hydration("missing row discriminator".into()))?;
    let rest: Vec<Option<String>> = cols.collect();

    match discriminator.as_str() {
        DISCRIMINATOR_NODE => {
            let [id, parent_id]: [Option<String>; 2] = rest
                .try_into()
                .map_err(|_| ArborError::Hydration("node row needs 2 columns".into()))?;
            Ok(SnapshotRow::Node(NodeRow {
                id: id.ok_or_else(|| ArborError::Hydration("node row without id".into()))?,
                parent_id,
            }))
        }
        DISCRIMINATOR_OP => {
            let [timestamp, node_id, old_parent_id, new_parent_id, client_id, sync_timestamp, last_sync_timestamp]:
                [Option<String>; 7] = rest
                .try_into()
                .map_err(|_| ArborError::Hydration("op row needs 7 columns".into()))?;
            let required = |field: &str, value: Option<String>| {
                value.ok_or_else(|| ArborError::Hydration(format!("op row without {field}")))
            };
            Ok(SnapshotRow::Op(MoveOp {
                timestamp: Timestamp::parse(&required("timestamp", timestamp)?)?,
                node_id: required("node_id", node_id)?,
                old_parent_id,
                new_parent_id: required("new_parent_id", new_parent_id)?,
                client_id: required("client_id", client_id)?,
                sync_timestamp: sync_timestamp.map(|s| Timestamp::parse(&s)).transpose()?,
                last_sync_timestamp: last_sync_timestamp
                    .map(|s| Timestamp::parse(&s))
                    .transpose()?,
            }))
        }
        other => Err(ArborError::Hydration(format!(
            "unknown row discriminator {other:?}"
        ))),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn i16(&mut self) -> Option<i16> {
        let bytes = self.bytes(2)?;
        Some(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn i32(&mut self) -> Option<i32> {
        let bytes = self.bytes(4)?;
        Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::ROOT;

    fn sample_op() -> MoveOp {
        MoveOp {
            timestamp: Timestamp::new(1, "a"),
            node_id: "n1".into(),
            old_parent_id: None,
            new_parent_id: ROOT.into(),
            client_id: "a".into(),
            sync_timestamp: Some(Timestamp::new(2, "server")),
            last_sync_timestamp: None,
        }
    }

    fn encode_all() -> Vec<u8> {
        let mut enc = SnapshotEncoder::new();
        enc.push_node(&NodeRow {
            id: ROOT.into(),
            parent_id: None,
        });
        enc.push_node(&NodeRow {
            id: "n1".into(),
            parent_id: Some(ROOT.into()),
        });
        enc.push_op(&sample_op());
        enc.finish();
        enc.take()
    }

    #[test]
    fn round_trip_including_null_columns() {
        let bytes = encode_all();
        let mut dec = SnapshotDecoder::new();
        dec.feed(&bytes);

        let mut rows = Vec::new();
        while let Some(row) = dec.next_row().unwrap() {
            rows.push(row);
        }
        assert!(dec.finished());
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0],
            SnapshotRow::Node(NodeRow {
                id: ROOT.into(),
                parent_id: None
            })
        );
        assert_eq!(rows[2], SnapshotRow::Op(sample_op()));
    }

    #[test]
    fn decoder_handles_byte_at_a_time_feeding() {
        let bytes = encode_all();
        let mut dec = SnapshotDecoder::new();
        let mut rows = Vec::new();
        for byte in bytes {
            dec.feed(&[byte]);
            while let Some(row) = dec.next_row().unwrap() {
                rows.push(row);
            }
        }
        assert!(dec.finished());
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut bytes = encode_all();
        bytes[0] = b'X';
        let mut dec = SnapshotDecoder::new();
        dec.feed(&bytes);
        assert!(dec.next_row().is_err());
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let mut enc = SnapshotEncoder::new();
        enc.put_row("x", &[Some("whatever")]);
        enc.finish();
        let bytes = enc.take();

        let mut dec = SnapshotDecoder::new();
        dec.feed(&bytes);
        assert!(dec.next_row().is_err());
    }

    #[test]
    fn incomplete_stream_waits_for_more_data() {
        let bytes = encode_all();
        let mut dec = SnapshotDecoder::new();
        dec.feed(&bytes[..HEADER_LEN + 3]);
        assert!(dec.next_row().unwrap().is_none());
        assert!(!dec.finished());
    }
}
