use std::fs::File;
use std::io::Read;
use std::path::Path;

use fastcdc::v2020::StreamCDC;

use crate::config::ChunkerConfig;
use backy_types::error::{BackyError, Result};

/// One content-defined chunk of a source stream.
///
/// `data` is transient: it is dropped once the chunk has been persisted.
#[derive(Debug)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lazy chunk iterator over a byte stream.
///
/// Single pass with bounded memory: at most one chunk (at most `max_size`
/// bytes) is materialized at a time. Boundaries are content-defined, so an
/// edit in one part of the stream leaves unrelated boundaries stable and
/// keeps their chunks deduplicatable.
pub struct ChunkStream<R: Read> {
    inner: StreamCDC<R>,
}

/// Chunk `reader` with the configured size bounds.
///
/// An empty stream yields no chunks; a stream shorter than `min_size`
/// yields exactly one. Restart by constructing a new stream from the start.
pub fn chunk_stream<R: Read>(reader: R, config: &ChunkerConfig) -> ChunkStream<R> {
    ChunkStream {
        inner: StreamCDC::new(reader, config.min_size, config.avg_size, config.max_size),
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.inner.next()?;
        Some(
            chunk
                .map(|c| Chunk {
                    offset: c.offset,
                    data: c.data,
                })
                .map_err(|e| match e {
                    fastcdc::v2020::Error::IoError(io) => BackyError::Io(io),
                    fastcdc::v2020::Error::Empty => {
                        BackyError::Storage("chunking failed: empty stream".into())
                    }
                    fastcdc::v2020::Error::Other(msg) => {
                        BackyError::Storage(format!("chunking failed: {msg}"))
                    }
                }),
        )
    }
}

/// Chunk a file and report only the resulting chunk count, persisting
/// nothing. Used for inspection and dedup estimation.
pub fn count_chunks(path: &Path, config: &ChunkerConfig) -> Result<usize> {
    let file =
        File::open(path).map_err(|e| BackyError::NotFound(format!("{}: {e}", path.display())))?;
    let mut count = 0;
    for chunk in chunk_stream(file, config) {
        chunk?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn small_config() -> ChunkerConfig {
        ChunkerConfig {
            min_size: 256,
            avg_size: 1024,
            max_size: 4096,
        }
    }

    /// Deterministic pseudo-random bytes (xorshift) so boundary placement is
    /// reproducible without fixture files.
    fn gen_data(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        let mut out = Vec::with_capacity(len + 8);
        while out.len() < len {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    fn collect(data: &[u8], config: &ChunkerConfig) -> Vec<Chunk> {
        chunk_stream(Cursor::new(data.to_vec()), config)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn concatenation_reconstructs_input() {
        let data = gen_data(100 * 1024, 7);
        let chunks = collect(&data, &small_config());
        assert!(chunks.len() > 1, "expected multiple chunks");

        let mut rebuilt = Vec::new();
        let mut expected_offset = 0u64;
        for chunk in &chunks {
            assert_eq!(chunk.offset, expected_offset, "no gaps or overlaps");
            expected_offset += chunk.len();
            rebuilt.extend_from_slice(&chunk.data);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn boundaries_are_deterministic() {
        let data = gen_data(64 * 1024, 42);
        let config = small_config();
        let first: Vec<(u64, u64)> = collect(&data, &config)
            .iter()
            .map(|c| (c.offset, c.len()))
            .collect();
        let second: Vec<(u64, u64)> = collect(&data, &config)
            .iter()
            .map(|c| (c.offset, c.len()))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn chunk_sizes_respect_bounds() {
        let data = gen_data(256 * 1024, 3);
        let config = small_config();
        let chunks = collect(&data, &config);
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.len() <= config.max_size as u64);
            if i + 1 < chunks.len() {
                assert!(chunk.len() >= config.min_size as u64);
            }
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunks = collect(&[], &small_config());
        assert!(chunks.is_empty());
    }

    #[test]
    fn input_below_min_size_yields_one_chunk() {
        let data = gen_data(100, 9);
        let chunks = collect(&data, &small_config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, data);
    }

    #[test]
    fn input_of_exactly_min_size_yields_one_chunk() {
        let config = small_config();
        let data = gen_data(config.min_size as usize, 11);
        let chunks = collect(&data, &config);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn localized_edit_leaves_distant_boundaries_stable() {
        let config = small_config();
        let original = gen_data(128 * 1024, 21);
        let mut edited = original.clone();
        // Flip a few bytes near the start; the tail boundaries should survive.
        for byte in &mut edited[0..8] {
            *byte ^= 0xFF;
        }

        let tail_cuts = |data: &[u8]| -> Vec<u64> {
            collect(data, &config)
                .iter()
                .map(|c| c.offset + c.len())
                .filter(|end| *end > 64 * 1024)
                .collect()
        };
        assert_eq!(tail_cuts(&original), tail_cuts(&edited));
    }

    #[test]
    fn count_chunks_missing_path_is_not_found() {
        let err = count_chunks(Path::new("/no/such/file"), &small_config()).unwrap_err();
        assert!(matches!(err, BackyError::NotFound(_)));
    }
}
