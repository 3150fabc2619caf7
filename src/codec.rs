// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Journal pack wire format.
//!
//! A pack is a gzip stream over newline-terminated records:
//!
//! ```text
//! ~h:deadbeef<US>hello\n                          chunk record
//! {"_id":"test.md","_rev":"1-abc",...}\n          document record
//! ```
//!
//! `<US>` is the unit separator (0x1F). Chunk payloads have their newlines
//! escaped (`\` → `\\`, LF → `\n`) so a record never spans lines; document
//! records rely on JSON string escaping for the same property.
//!
//! Compression uses a fixed level and a zeroed gzip header timestamp, so the
//! same records always produce the same bytes.

use crate::config::MAX_PACK_BYTES;
use crate::document::{ChunkDoc, Document, RegularDoc};
use crate::error::{JournalError, Result};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use std::borrow::Cow;
use std::io::{Read, Write};

/// First byte of a chunk record.
pub const CHUNK_SENTINEL: char = '~';

/// Separates a chunk id from its payload.
pub const UNIT_SEPARATOR: char = '\u{1F}';

/// Terminates every record.
pub const RECORD_TERMINATOR: u8 = b'\n';

/// Fixed gzip quality level for packs.
pub const PACK_COMPRESSION_LEVEL: u32 = 6;

/// Largest payload a downloaded pack may inflate to.
///
/// Packs flush just past the byte threshold, so anything this far beyond it
/// did not come from a packer.
pub const MAX_DECOMPRESSED_PACK_BYTES: usize = 16 * MAX_PACK_BYTES;

/// gzip magic bytes
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Escape newlines (and the escape character itself) in a chunk payload.
pub fn escape_newlines(data: &str) -> Cow<'_, str> {
    if !data.contains(['\n', '\\']) {
        return Cow::Borrowed(data);
    }
    let mut out = String::with_capacity(data.len() + 8);
    for c in data.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Exact inverse of [`escape_newlines`].
///
/// Unknown escape sequences are kept verbatim.
pub fn unescape_newlines(data: &str) -> Cow<'_, str> {
    if !data.contains('\\') {
        return Cow::Borrowed(data);
    }
    let mut out = String::with_capacity(data.len());
    let mut chars = data.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Cow::Owned(out)
}

/// Append one record (terminator included) to `out`.
///
/// Returns the number of bytes written.
pub fn encode_record(doc: &Document, out: &mut Vec<u8>) -> Result<usize> {
    let start = out.len();
    match doc {
        Document::Chunk(chunk) => {
            if chunk.id.contains(['\n', UNIT_SEPARATOR]) {
                return Err(JournalError::Decode(format!(
                    "chunk id {:?} contains a reserved character",
                    chunk.id
                )));
            }
            let mut line = String::with_capacity(chunk.id.len() + chunk.data.len() + 2);
            line.push(CHUNK_SENTINEL);
            line.push_str(&chunk.id);
            line.push(UNIT_SEPARATOR);
            line.push_str(&escape_newlines(&chunk.data));
            out.extend_from_slice(line.as_bytes());
        }
        Document::Regular(regular) => {
            serde_json::to_writer(&mut *out, regular)?;
        }
    }
    out.push(RECORD_TERMINATOR);
    Ok(out.len() - start)
}

/// Decode a single record line (without its terminator).
pub fn decode_record(line: &str) -> Result<Document> {
    if let Some(rest) = line.strip_prefix(CHUNK_SENTINEL) {
        let (id, data) = rest.split_once(UNIT_SEPARATOR).ok_or_else(|| {
            JournalError::Decode("chunk record without unit separator".to_string())
        })?;
        if id.is_empty() {
            return Err(JournalError::Decode("chunk record with empty id".to_string()));
        }
        return Ok(Document::Chunk(ChunkDoc {
            id: id.to_string(),
            data: unescape_newlines(data).into_owned(),
        }));
    }

    let regular: RegularDoc = serde_json::from_str(line)
        .map_err(|e| JournalError::Decode(format!("document record: {}", e)))?;
    Ok(Document::Regular(regular))
}

/// Split a decompressed pack into records, in order.
pub fn decode_records(payload: &[u8]) -> Result<Vec<Document>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| JournalError::Decode(format!("pack is not UTF-8: {}", e)))?;

    text.split(RECORD_TERMINATOR as char)
        .filter(|line| !line.is_empty())
        .map(decode_record)
        .collect()
}

/// Compress a pack payload.
pub fn compress_pack(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::with_capacity(payload.len() / 4 + 64), Compression::new(PACK_COMPRESSION_LEVEL));
    encoder
        .write_all(payload)
        .map_err(|e| JournalError::Internal(format!("gzip write failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| JournalError::Internal(format!("gzip finish failed: {}", e)))
}

/// Decompress a downloaded pack.
///
/// An empty blob decompresses to an empty payload. Payloads larger than
/// [`MAX_DECOMPRESSED_PACK_BYTES`] are rejected.
pub fn decompress_pack(data: &[u8]) -> Result<Vec<u8>> {
    decompress_pack_bounded(data, MAX_DECOMPRESSED_PACK_BYTES)
}

/// [`decompress_pack`] with an explicit payload ceiling.
pub fn decompress_pack_bounded(data: &[u8], max_payload: usize) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < GZIP_MAGIC.len() || data[..2] != GZIP_MAGIC {
        return Err(JournalError::Decompression("missing gzip header".to_string()));
    }

    // one byte over the ceiling is enough to tell it was crossed
    let limit = u64::try_from(max_payload).unwrap_or(u64::MAX).saturating_add(1);
    let mut decoder = GzDecoder::new(data).take(limit);
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(max_payload));
    decoder
        .read_to_end(&mut out)
        .map_err(|e| JournalError::Decompression(e.to_string()))?;
    if out.len() > max_payload {
        return Err(JournalError::Decompression(format!(
            "pack inflates past {} bytes",
            max_payload
        )));
    }
    Ok(out)
}

/// In-memory pack under construction.
///
/// Tracks the dockeys of buffered records so the packer can mark exactly
/// what was enqueued as sent.
#[derive(Debug, Default)]
pub struct PackBuffer {
    payload: Vec<u8>,
    dockeys: Vec<String>,
}

impl PackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, doc: &Document) -> Result<usize> {
        let written = encode_record(doc, &mut self.payload)?;
        self.dockeys.push(doc.dockey());
        Ok(written)
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.dockeys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dockeys.is_empty()
    }

    /// Uncompressed size of the buffered records.
    pub fn bytes(&self) -> usize {
        self.payload.len()
    }

    pub fn contains(&self, dockey: &str) -> bool {
        self.dockeys.iter().any(|k| k == dockey)
    }

    pub fn exceeds(&self, max_records: usize, max_bytes: usize) -> bool {
        self.len() > max_records || self.bytes() > max_bytes
    }

    /// Compress the buffered records and reset the buffer.
    ///
    /// Returns the compressed pack and the dockeys it holds.
    pub fn take_compressed(&mut self) -> Result<(Vec<u8>, Vec<String>)> {
        let compressed = compress_pack(&self.payload)?;
        self.payload.clear();
        Ok((compressed, std::mem::take(&mut self.dockeys)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode_all(docs: &[Document]) -> Vec<u8> {
        let mut out = Vec::new();
        for doc in docs {
            encode_record(doc, &mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_chunk_record_bytes() {
        let doc = Document::from(ChunkDoc::new("h:deadbeef", "hello"));
        let bytes = encode_all(&[doc]);
        assert_eq!(bytes, b"~h:deadbeef\x1Fhello\n");
    }

    #[test]
    fn test_document_record_is_single_json_line() {
        let doc = Document::from(
            RegularDoc::new("test.md", "1-abc").with_field("body", json!("line one\nline two")),
        );
        let bytes = encode_all(&[doc]);
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(*bytes.last().unwrap(), b'\n');
        assert_eq!(bytes[0], b'{');
    }

    #[test]
    fn test_escape_roundtrip_with_newlines_and_backslashes() {
        let cases = ["", "plain", "a\nb", "\n\n", "c:\\path\\n", "tail\\", "ümlaut\n日本語"];
        for case in cases {
            let escaped = escape_newlines(case);
            assert!(!escaped.contains('\n'), "escaped form of {:?} has a newline", case);
            assert_eq!(unescape_newlines(&escaped), case);
        }
    }

    #[test]
    fn test_unescape_keeps_unknown_sequences() {
        assert_eq!(unescape_newlines("a\\tb"), "a\\tb");
        assert_eq!(unescape_newlines("end\\"), "end\\");
    }

    #[test]
    fn test_decode_records_preserves_order() {
        let docs = vec![
            Document::from(ChunkDoc::new("h:1", "first\nchunk")),
            Document::from(RegularDoc::new("a.md", "1-x").with_field("children", json!(["h:1"]))),
            Document::from(ChunkDoc::new("h:2", "second")),
        ];
        let decoded = decode_records(&encode_all(&docs)).unwrap();
        assert_eq!(decoded, docs);
    }

    #[test]
    fn test_chunk_payload_may_contain_unit_separator() {
        let doc = Document::from(ChunkDoc::new("h:us", "a\u{1F}b"));
        let decoded = decode_records(&encode_all(&[doc.clone()])).unwrap();
        assert_eq!(decoded, vec![doc]);
    }

    #[test]
    fn test_chunk_id_with_separator_rejected() {
        let doc = Document::from(ChunkDoc::new("h:\u{1F}bad", "x"));
        assert!(encode_record(&doc, &mut Vec::new()).is_err());
    }

    #[test]
    fn test_decode_rejects_malformed_lines() {
        assert!(matches!(decode_records(b"~h:nosep\n"), Err(JournalError::Decode(_))));
        assert!(matches!(decode_records(b"{not json}\n"), Err(JournalError::Decode(_))));
        assert!(matches!(decode_records(&[0xFF, 0xFE, b'\n']), Err(JournalError::Decode(_))));
    }

    #[test]
    fn test_decode_empty_payload() {
        assert!(decode_records(b"").unwrap().is_empty());
    }

    #[test]
    fn test_compress_is_deterministic_and_reversible() {
        let payload = encode_all(&[Document::from(ChunkDoc::new("h:1", "hello"))]);
        let a = compress_pack(&payload).unwrap();
        let b = compress_pack(&payload).unwrap();
        assert_eq!(a, b);
        assert_eq!(decompress_pack(&a).unwrap(), payload);
    }

    #[test]
    fn test_decompress_stops_at_payload_ceiling() {
        // highly compressible, so the blob is tiny next to what it inflates to
        let payload = vec![b'a'; 64 * 1024];
        let pack = compress_pack(&payload).unwrap();
        assert!(pack.len() < 1024);

        let err = decompress_pack_bounded(&pack, 4096).unwrap_err();
        assert!(matches!(err, JournalError::Decompression(_)));
        assert_eq!(decompress_pack_bounded(&pack, payload.len()).unwrap(), payload);
    }

    #[test]
    fn test_decompress_empty_blob() {
        assert!(decompress_pack(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(matches!(decompress_pack(b"not gzip"), Err(JournalError::Decompression(_))));
        assert!(matches!(
            decompress_pack(&[0x1F, 0x8B, 0x08, 0x00]),
            Err(JournalError::Decompression(_))
        ));
    }

    #[test]
    fn test_pack_buffer_thresholds() {
        let mut buffer = PackBuffer::new();
        assert!(buffer.is_empty());
        for i in 0..3 {
            buffer.push(&Document::from(ChunkDoc::new(format!("h:{}", i), "xx"))).unwrap();
        }
        assert_eq!(buffer.len(), 3);
        assert!(buffer.contains("h:1"));
        assert!(!buffer.exceeds(3, 1024));
        assert!(buffer.exceeds(2, 1024));
        assert!(buffer.exceeds(10, 5));

        let (pack, keys) = buffer.take_compressed().unwrap();
        assert_eq!(keys, vec!["h:0", "h:1", "h:2"]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.bytes(), 0);
        assert_eq!(decode_records(&decompress_pack(&pack).unwrap()).unwrap().len(), 3);
    }
}
