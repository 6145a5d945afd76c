// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use std::io::{self, BufRead, ErrorKind, Read};

use crate::io::{PeekReader, XzStreamDecoder, ZstdStreamDecoder};

enum CompressDecoder<R: Read> {
    Uncompressed(PeekReader<R>),
    Xz(XzStreamDecoder<PeekReader<R>>),
    Zstd(ZstdStreamDecoder<'static, R>),
}

/// Format-sniffing decompressor for `.ko`/`.ko.xz`/`.ko.zst` kernel
/// modules (§4.C). Unlike the teacher's `DecompressReader`, this has no
/// Gzip variant — the image's module compressor only ever emits xz or
/// zstd — and is built on `PeekReader` rather than a plain `BufRead` so
/// the zstd magic-number sniff doesn't need its own peek buffer.
pub struct DecompressReader<R: Read> {
    decoder: CompressDecoder<R>,
    allow_trailing: bool,
}

impl<R: Read> DecompressReader<R> {
    pub fn new(source: R) -> Result<Self> {
        Self::new_full(source, false)
    }

    pub fn for_concatenated(source: R) -> Result<Self> {
        Self::new_full(source, true)
    }

    fn new_full(source: R, allow_trailing: bool) -> Result<Self> {
        use CompressDecoder::*;
        let mut peek = PeekReader::with_capacity(8192, source);
        let sniff = peek.peek(6).context("sniffing module header")?;
        let decoder = if sniff.len() >= 6 && &sniff[0..6] == b"\xfd7zXZ\x00" {
            Xz(XzStreamDecoder::new(peek))
        } else if sniff.len() >= 4 && crate::io::is_zstd_magic(sniff[0..4].try_into().unwrap()) {
            Zstd(ZstdStreamDecoder::new(peek).context("creating zstd decoder")?)
        } else {
            Uncompressed(peek)
        };
        Ok(Self {
            decoder,
            allow_trailing,
        })
    }

    pub fn compressed(&self) -> bool {
        !matches!(self.decoder, CompressDecoder::Uncompressed(_))
    }

    fn get_mut_peek(&mut self) -> &mut dyn Read {
        use CompressDecoder::*;
        match &mut self.decoder {
            Uncompressed(d) => d,
            Xz(d) => d.get_mut(),
            Zstd(d) => d.get_mut(),
        }
    }
}

impl<R: Read> Read for DecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use CompressDecoder::*;
        let count = match &mut self.decoder {
            Uncompressed(d) => d.read(buf)?,
            Xz(d) => d.read(buf)?,
            Zstd(d) => d.read(buf)?,
        };
        if count == 0 && !buf.is_empty() && self.compressed() && !self.allow_trailing {
            // Decompressors stop reading as soon as they hit the
            // compression trailer, so trailing data after it goes
            // unnoticed unless we probe for one more byte.
            let mut probe = [0; 1];
            if self.get_mut_peek().read(&mut probe)? > 0 {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "found trailing data after compressed module",
                ));
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use xz2::write::XzEncoder;

    fn xz(data: &[u8]) -> Vec<u8> {
        let mut e = XzEncoder::new(Vec::new(), 6);
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    #[test]
    fn decompresses_uncompressed() {
        let data = b"hello module".to_vec();
        let mut out = Vec::new();
        DecompressReader::new(&data[..])
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn decompresses_xz() {
        let data = b"hello module".repeat(50);
        let compressed = xz(&data);
        let mut out = Vec::new();
        DecompressReader::new(&compressed[..])
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn decompresses_zstd() {
        let data = b"hello module".repeat(50);
        let compressed = zstd::stream::encode_all(&data[..], 3).unwrap();
        let mut out = Vec::new();
        DecompressReader::new(&compressed[..])
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn rejects_trailing_data() {
        let data = b"hello module".repeat(50);
        let mut compressed = xz(&data);
        compressed.push(0);
        let mut out = Vec::new();
        assert!(DecompressReader::new(&compressed[..])
            .unwrap()
            .read_to_end(&mut out)
            .is_err());
    }
}
