use bytes::{Bytes, BytesMut};

/// Accepted input format: 16 kHz, signed 16-bit little-endian, mono.
pub const SAMPLE_RATE_HZ: usize = 16_000;
pub const BYTES_PER_SAMPLE: usize = 2;
/// Emitted chunk duration.
pub const CHUNK_MS: usize = 100;
/// Emitted chunk size in bytes, derived from the sample rate.
pub const CHUNK_BYTES: usize = SAMPLE_RATE_HZ * BYTES_PER_SAMPLE * CHUNK_MS / 1000;
/// Per-stream buffer bound: 30 seconds of audio. Frames beyond this are
/// dropped rather than buffered (the STT is not keeping up).
pub const MAX_BUFFER_BYTES: usize = SAMPLE_RATE_HZ * BYTES_PER_SAMPLE * 30;

/// Buffers an incoming PCM byte stream and re-emits it as fixed-duration
/// chunks sized for the STT provider.
#[derive(Debug, Default)]
pub struct AudioFramer {
    buffer: BytesMut,
    dropped_bytes: u64,
}

impl AudioFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an arbitrary-sized frame and drain every complete chunk.
    ///
    /// Input that would push the buffer past [`MAX_BUFFER_BYTES`] is dropped
    /// whole; a partial chunk stays buffered until more audio arrives.
    pub fn push(&mut self, frame: &[u8]) -> Vec<Bytes> {
        if self.buffer.len() + frame.len() > MAX_BUFFER_BYTES {
            self.dropped_bytes += frame.len() as u64;
            return Vec::new();
        }
        self.buffer.extend_from_slice(frame);

        let mut chunks = Vec::new();
        while self.buffer.len() >= CHUNK_BYTES {
            chunks.push(self.buffer.split_to(CHUNK_BYTES).freeze());
        }
        chunks
    }

    /// Flush whatever remains, zero-padded to a full chunk. Used on stream
    /// end so the tail of speech is not lost.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut tail = self.buffer.split().to_vec();
        tail.resize(CHUNK_BYTES, 0);
        Some(Bytes::from(tail))
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_fixed_size_chunks() {
        let mut framer = AudioFramer::new();
        let chunks = framer.push(&vec![0u8; CHUNK_BYTES * 2 + 10]);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == CHUNK_BYTES));
        assert_eq!(framer.buffered_bytes(), 10);
    }

    #[test]
    fn small_frames_accumulate() {
        let mut framer = AudioFramer::new();
        assert!(framer.push(&vec![0u8; CHUNK_BYTES / 2]).is_empty());
        let chunks = framer.push(&vec![0u8; CHUNK_BYTES / 2]);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn overflow_drops_the_incoming_frame() {
        let mut framer = AudioFramer::new();
        // Fill to just under the bound with an unaligned tail.
        framer.push(&vec![0u8; MAX_BUFFER_BYTES - 1]);
        let before = framer.buffered_bytes();
        assert!(framer.push(&vec![0u8; CHUNK_BYTES]).is_empty());
        assert_eq!(framer.buffered_bytes(), before);
        assert_eq!(framer.dropped_bytes(), CHUNK_BYTES as u64);
    }

    #[test]
    fn buffer_never_exceeds_bound() {
        let mut framer = AudioFramer::new();
        for _ in 0..500 {
            framer.push(&vec![0u8; 7_919]);
            assert!(framer.buffered_bytes() <= MAX_BUFFER_BYTES);
        }
    }

    #[test]
    fn flush_pads_to_chunk_size() {
        let mut framer = AudioFramer::new();
        framer.push(&vec![1u8; 100]);
        let tail = framer.flush().unwrap();
        assert_eq!(tail.len(), CHUNK_BYTES);
        assert!(framer.flush().is_none());
    }
}
