//! Shard decoding: pick the codec from the file name, decompress, and stream CSV rows.
//!
//! End of data is whatever the decoder/reader reports as end of stream (`Ok(0)` reads,
//! `None` records, no more archive entries). Any I/O error is a real error.

use crate::mem::MemoryThrottle;
use crate::row::{Header, RawRow};
use crate::util::open_with_backoff;
use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord};
use flate2::read::MultiGzDecoder;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

/// Compression container of a shard file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardCodec {
    Zip,
    Gzip,
    Zstd,
    Plain,
}

impl ShardCodec {
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            ShardCodec::Zip
        } else if lower.ends_with(".gz") {
            ShardCodec::Gzip
        } else if lower.ends_with(".zst") {
            ShardCodec::Zstd
        } else {
            ShardCodec::Plain
        }
    }
}

/// What one pass over a shard saw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub streams: u64,
    pub rows: u64,
    pub bad_records: u64,
    pub compressed_bytes: u64,
}

/// A `Read` wrapper that counts compressed bytes read.
struct CountingReader<R: Read> {
    inner: R,
    count: u64,
}
impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Decode `path` and call `on_row` for every data row of every CSV stream in it.
/// `on_row` returning `Err` aborts the shard; row-level problems must be handled inside it.
pub fn for_each_row(
    path: &Path,
    read_buf_bytes: usize,
    throttle: &MemoryThrottle,
    mut on_row: impl FnMut(RawRow) -> Result<()>,
) -> Result<DecodeStats> {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let file = open_with_backoff(path, 16, 50).with_context(|| format!("open {}", path.display()))?;
    let mut stats = DecodeStats::default();

    match ShardCodec::from_name(&name) {
        ShardCodec::Zip => {
            let mut archive = zip::ZipArchive::new(BufReader::with_capacity(read_buf_bytes, file))
                .with_context(|| format!("read zip archive {}", path.display()))?;
            for i in 0..archive.len() {
                let entry = archive
                    .by_index(i)
                    .with_context(|| format!("zip entry #{} of {}", i, path.display()))?;
                if entry.is_dir() {
                    continue;
                }
                let entry_name = entry.name().to_string();
                let compressed = entry.compressed_size();
                tracing::debug!("{}: entry {}", name, entry_name);
                read_csv_stream(entry, &entry_name, read_buf_bytes, throttle, &mut stats, &mut on_row)
                    .with_context(|| format!("{} entry {}", path.display(), entry_name))?;
                stats.compressed_bytes += compressed;
            }
        }
        ShardCodec::Gzip => {
            let mut counted = CountingReader { inner: file, count: 0 };
            read_csv_stream(MultiGzDecoder::new(&mut counted), &name, read_buf_bytes, throttle, &mut stats, &mut on_row)
                .with_context(|| format!("gzip shard {}", path.display()))?;
            stats.compressed_bytes += counted.count;
        }
        ShardCodec::Zstd => {
            let mut counted = CountingReader { inner: file, count: 0 };
            let mut decoder = zstd::stream::read::Decoder::new(&mut counted)?;
            // avoid "Frame requires too much memory" on large frames
            decoder.window_log_max(31)?;
            read_csv_stream(decoder, &name, read_buf_bytes, throttle, &mut stats, &mut on_row)
                .with_context(|| format!("zstd shard {}", path.display()))?;
            stats.compressed_bytes += counted.count;
        }
        ShardCodec::Plain => {
            let mut counted = CountingReader { inner: file, count: 0 };
            read_csv_stream(&mut counted, &name, read_buf_bytes, throttle, &mut stats, &mut on_row)
                .with_context(|| format!("csv shard {}", path.display()))?;
            stats.compressed_bytes += counted.count;
        }
    }
    Ok(stats)
}

/// One CSV stream: first record is the header, the rest are rows.
fn read_csv_stream<R: Read>(
    input: R,
    stream_name: &str,
    read_buf_bytes: usize,
    throttle: &MemoryThrottle,
    stats: &mut DecodeStats,
    on_row: &mut impl FnMut(RawRow) -> Result<()>,
) -> Result<()> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .buffer_capacity(read_buf_bytes)
        .from_reader(input);

    stats.streams += 1;
    let mut header: Option<Arc<Header>> = None;
    let mut record = StringRecord::new();
    let mut line: u64 = 0;
    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) => {
                if matches!(e.kind(), csv::ErrorKind::Io(_)) {
                    return Err(e).with_context(|| format!("{} at record {}", stream_name, line + 1));
                }
                // malformed record (e.g. invalid UTF-8): skip it, keep reading
                stats.bad_records += 1;
                tracing::warn!("{}: skipping unreadable record {}: {}", stream_name, line + 1, e);
                line += 1;
                continue;
            }
        }
        line += 1;
        let layout = match &header {
            Some(h) => h.clone(),
            None => {
                header = Some(Arc::new(Header::from_record(&record)));
                continue;
            }
        };
        stats.rows += 1;
        on_row(RawRow::new(layout, record.clone()))?;
        throttle.maybe_pause(line);
    }
    Ok(())
}
