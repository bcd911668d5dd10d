use std::io::{self, Write};

use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};

/// Compression used for chunk pack caches and region payloads. Any
/// stable round-tripping algorithm satisfies the engine; zlib matches
/// the persisted format.
pub trait Codec {
    /// Compress `raw` into `out`, reusing its allocation.
    fn compress(&self, raw: &[u8], out: &mut Vec<u8>) -> io::Result<()>;
    /// Decompress `blob` into `out`, reusing its allocation.
    fn decompress(&self, blob: &[u8], out: &mut Vec<u8>) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ZlibCodec;

impl Codec for ZlibCodec {
    fn compress(&self, raw: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        out.clear();
        let mut enc = ZlibEncoder::new(std::mem::take(out), Compression::default());
        enc.write_all(raw)?;
        *out = enc.finish()?;
        Ok(())
    }

    fn decompress(&self, blob: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        out.clear();
        let mut dec = ZlibDecoder::new(std::mem::take(out));
        dec.write_all(blob)?;
        *out = dec.finish()?;
        Ok(())
    }
}
