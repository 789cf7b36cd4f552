pub mod framer;
pub mod relay;

pub use framer::{AudioFramer, CHUNK_BYTES, MAX_BUFFER_BYTES};
pub use relay::AudioRelay;
