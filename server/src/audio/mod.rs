//! Audio timeline, Ogg Opus parsing, and the live-stream tee.

mod cursor;
mod header_collector;
mod packet_reader;
mod seek;
mod tee;

pub use cursor::{Cursor, CursorSnapshot};
pub use header_collector::OpusHeaderCollector;
pub use packet_reader::{
    OggOpusPacketReader, OpusPacket, DEFAULT_SAMPLE_RATE, FALLBACK_PACKET_DURATION,
};
pub use seek::{read_header_pages, seek_offset, SeekState};
pub use tee::{ByteSink, Tee, TeeReader};
