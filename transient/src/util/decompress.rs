//! Auto-detecting, incremental stream decompressor.
//!
//! Sniffs the compression family from the first bytes ever fed in — gzip
//! (`1f 8b`), bzip2 (`42 5a 68`), xz (`fd 37 7a 58 5a 00`) — and otherwise
//! passes bytes through unchanged. Used for every byte stream that flows
//! into the backend store: HTTP bodies, local files, vagrant tarball
//! members.

use std::io::Write;

use bzip2::write::BzDecoder;
use flate2::write::GzDecoder;
use xz2::write::XzDecoder;

const SNIFF_LEN: usize = 6;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = &[0x42, 0x5a, 0x68];
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];

enum State {
    Sniffing(Vec<u8>),
    Gzip(GzDecoder<Vec<u8>>),
    Bzip2(BzDecoder<Vec<u8>>),
    Xz(XzDecoder<Vec<u8>>),
    Passthrough,
}

pub struct StreamDecompressor {
    state: State,
}

impl Default for StreamDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecompressor {
    pub fn new() -> Self {
        StreamDecompressor {
            state: State::Sniffing(Vec::new()),
        }
    }

    /// Feed the next chunk of source bytes; returns whatever decompressed
    /// output is ready so far (may be empty while still sniffing).
    pub fn decompress(&mut self, chunk: &[u8]) -> std::io::Result<Vec<u8>> {
        if let State::Sniffing(buf) = &mut self.state {
            buf.extend_from_slice(chunk);
            if buf.len() < SNIFF_LEN && !Self::definitely_not_compressed(buf) {
                return Ok(Vec::new());
            }
            let sniffed = std::mem::take(buf);
            self.state = if sniffed.starts_with(GZIP_MAGIC) {
                State::Gzip(GzDecoder::new(Vec::new()))
            } else if sniffed.starts_with(BZIP2_MAGIC) {
                State::Bzip2(BzDecoder::new(Vec::new()))
            } else if sniffed.starts_with(XZ_MAGIC) {
                State::Xz(XzDecoder::new(Vec::new()))
            } else {
                State::Passthrough
            };
            return self.feed(&sniffed);
        }
        self.feed(chunk)
    }

    /// Flush any buffered-but-undecided prefix (stream ended before
    /// `SNIFF_LEN` bytes arrived) as passthrough.
    pub fn finish(&mut self) -> std::io::Result<Vec<u8>> {
        if let State::Sniffing(buf) = &mut self.state {
            let sniffed = std::mem::take(buf);
            self.state = State::Passthrough;
            return Ok(sniffed);
        }
        Ok(Vec::new())
    }

    fn definitely_not_compressed(buf: &[u8]) -> bool {
        let candidates = [GZIP_MAGIC, BZIP2_MAGIC, XZ_MAGIC];
        !candidates
            .iter()
            .any(|magic| buf.len() <= magic.len() && magic.starts_with(buf))
    }

    fn feed(&mut self, chunk: &[u8]) -> std::io::Result<Vec<u8>> {
        match &mut self.state {
            State::Sniffing(_) => unreachable!("sniffing resolved before feed"),
            State::Gzip(dec) => {
                dec.write_all(chunk)?;
                dec.flush()?;
                Ok(std::mem::take(dec.get_mut()))
            }
            State::Bzip2(dec) => {
                dec.write_all(chunk)?;
                dec.flush()?;
                Ok(std::mem::take(dec.get_mut()))
            }
            State::Xz(dec) => {
                dec.write_all(chunk)?;
                dec.flush()?;
                Ok(std::mem::take(dec.get_mut()))
            }
            State::Passthrough => Ok(chunk.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn passthrough_for_plain_bytes() {
        let mut d = StreamDecompressor::new();
        let mut out = d.decompress(b"hello world, not compressed").unwrap();
        out.extend(d.finish().unwrap());
        assert_eq!(out, b"hello world, not compressed");
    }

    #[test]
    fn short_plain_stream_flushes_on_finish() {
        let mut d = StreamDecompressor::new();
        let mut out = d.decompress(b"hi").unwrap();
        assert!(out.is_empty(), "should still be sniffing");
        out.extend(d.finish().unwrap());
        assert_eq!(out, b"hi");
    }

    #[test]
    fn gzip_round_trip() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"some disk image bytes").unwrap();
        let compressed = enc.finish().unwrap();

        let mut d = StreamDecompressor::new();
        let mut out = Vec::new();
        for chunk in compressed.chunks(4) {
            out.extend(d.decompress(chunk).unwrap());
        }
        out.extend(d.finish().unwrap());
        assert_eq!(out, b"some disk image bytes");
    }
}
