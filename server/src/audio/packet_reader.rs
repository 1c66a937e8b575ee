//! Ogg Opus packet extraction.
//!
//! Parses Ogg pages from a byte stream, reassembles Opus packets across
//! page boundaries, filters out the OpusHead/OpusTags header packets, and
//! derives a per-packet duration from the page granule delta. This is the
//! source the playlist driver paces the whole station from.

use std::collections::VecDeque;
use std::io::{self, BufReader, Read};
use std::time::Duration;

use bytes::Bytes;

/// Opus streams are timed in 48 kHz samples regardless of the input rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Duration assigned when the granule math yields nothing usable.
pub const FALLBACK_PACKET_DURATION: Duration = Duration::from_millis(20);

/// Samples in a canonical 20 ms Opus frame at 48 kHz.
const SAMPLES_PER_DEFAULT_FRAME: u64 = 960;

pub(crate) const OPUS_HEAD_SIG: &[u8; 8] = b"OpusHead";
pub(crate) const OPUS_TAGS_SIG: &[u8; 8] = b"OpusTags";

/// One reconstructed audio packet.
#[derive(Debug, Clone)]
pub struct OpusPacket {
    pub data: Bytes,
    pub duration: Duration,
    pub granule: u64,
}

/// Outcome of trying to fill a buffer from the underlying stream.
enum Fill {
    Complete,
    CleanEof,
}

/// Streaming reader that turns Ogg pages into timed Opus packets.
///
/// Header packets (OpusHead/OpusTags) are consumed, not emitted; OpusHead is
/// additionally parsed for the declared sample rate and pre-skip. A packet
/// whose final segment has not arrived yet is carried into the next page.
pub struct OggOpusPacketReader<R> {
    // ---
    reader: BufReader<R>,

    // In-progress audio packet that continues across pages.
    carry: Vec<u8>,

    // A header packet (OpusHead/OpusTags) is being discarded and has not yet
    // reached its terminating segment, possibly several pages away.
    discarding_header: bool,

    prev_granule: u64,
    sample_rate: u32,
    pre_skip: u64,

    // Completed packets not yet handed to the caller.
    queue: VecDeque<OpusPacket>,

    // Reused per-page buffers.
    header: [u8; 27],
    seg_table: [u8; 255],
    page_buf: Vec<u8>,
}

impl<R: Read> OggOpusPacketReader<R> {
    // ---
    pub fn new(inner: R) -> Self {
        Self::with_sample_rate(inner, DEFAULT_SAMPLE_RATE)
    }

    pub fn with_sample_rate(inner: R, sample_rate: u32) -> Self {
        let sample_rate = if sample_rate == 0 {
            DEFAULT_SAMPLE_RATE
        } else {
            sample_rate
        };

        Self {
            reader: BufReader::with_capacity(256 * 1024, inner),
            carry: Vec::new(),
            discarding_header: false,
            prev_granule: 0,
            sample_rate,
            pre_skip: 0,
            queue: VecDeque::new(),
            header: [0u8; 27],
            seg_table: [0u8; 255],
            page_buf: Vec::with_capacity(255 * 255),
        }
    }

    /// Primes granule bookkeeping after a forward seek so the first page's
    /// duration is computed against the pre-seek granule, not zero.
    pub fn set_seek_state(&mut self, prev_granule: u64, pre_skip: u64) {
        self.prev_granule = prev_granule;
        self.pre_skip = pre_skip;
    }

    /// Sample rate declared by OpusHead (48 kHz until one is seen).
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Pre-skip declared by OpusHead, in 48 kHz samples.
    pub fn pre_skip(&self) -> u64 {
        self.pre_skip
    }

    /// Returns the next audio packet, or `None` at end of stream.
    ///
    /// A truncated page or a bad capture pattern surfaces as an error; the
    /// caller treats either as the end of the current track.
    pub fn next_packet(&mut self) -> io::Result<Option<OpusPacket>> {
        loop {
            if let Some(pkt) = self.queue.pop_front() {
                return Ok(Some(pkt));
            }

            let (granule, added) = match self.read_page_into_queue()? {
                Some(page) => page,
                None => return Ok(None),
            };
            if added == 0 {
                continue;
            }

            self.assign_durations(granule, added);
        }
    }

    /// Spreads the page duration over the packets the page completed. The
    /// last packet absorbs the division remainder so the per-packet sum
    /// equals the page duration.
    fn assign_durations(&mut self, granule: u64, added: usize) {
        let page_samples = if granule > self.prev_granule {
            granule - self.prev_granule
        } else {
            SAMPLES_PER_DEFAULT_FRAME * added as u64
        };
        self.prev_granule = granule;

        let rate = if self.sample_rate == 0 {
            DEFAULT_SAMPLE_RATE
        } else {
            self.sample_rate
        };

        let mut page_dur = Duration::from_nanos(
            (page_samples as u128 * 1_000_000_000u128 / rate as u128) as u64,
        );
        if page_dur.is_zero() {
            page_dur = FALLBACK_PACKET_DURATION * added as u32;
        }

        let mut base = page_dur / added as u32;
        if base.is_zero() {
            base = FALLBACK_PACKET_DURATION;
        }
        let mut remainder = page_dur.saturating_sub(base * (added as u32 - 1));
        if remainder.is_zero() {
            remainder = base;
        }

        let start = self.queue.len() - added;
        for i in 0..added {
            let pkt = &mut self.queue[start + i];
            pkt.granule = granule;
            pkt.duration = if i == added - 1 { remainder } else { base };
        }
    }

    /// Parses one page and appends the audio packets it completes.
    ///
    /// Returns the page granule and how many packets were added, or `None`
    /// when the stream ended cleanly on a page boundary.
    fn read_page_into_queue(&mut self) -> io::Result<Option<(u64, usize)>> {
        let header = {
            match fill_buf(&mut self.reader, &mut self.header)? {
                Fill::CleanEof => return Ok(None),
                Fill::Complete => self.header,
            }
        };

        if &header[0..4] != b"OggS" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid ogg capture pattern: {:?}", &header[0..4]),
            ));
        }

        let granule = u64::from_le_bytes(header[6..14].try_into().expect("8 bytes"));
        let seg_count = header[26] as usize;

        self.reader.read_exact(&mut self.seg_table[..seg_count])?;

        let total: usize = self.seg_table[..seg_count]
            .iter()
            .map(|&s| s as usize)
            .sum();
        self.page_buf.resize(total, 0);
        self.reader.read_exact(&mut self.page_buf)?;

        let before = self.queue.len();
        let mut offset = 0usize;

        for i in 0..seg_count {
            let size = self.seg_table[i] as usize;
            if size > 0 {
                if self.discarding_header {
                    offset += size;
                } else {
                    self.carry
                        .extend_from_slice(&self.page_buf[offset..offset + size]);
                    offset += size;

                    if self.carry.len() >= 8 {
                        let prefix = &self.carry[..8];
                        if prefix == OPUS_HEAD_SIG {
                            self.parse_opus_head();
                            self.carry.clear();
                            self.discarding_header = true;
                        } else if prefix == OPUS_TAGS_SIG {
                            self.carry.clear();
                            self.discarding_header = true;
                        }
                    }
                }
            }

            // A segment shorter than 255 terminates the current packet.
            if self.seg_table[i] < 255 {
                if self.discarding_header {
                    self.discarding_header = false;
                } else if !self.carry.is_empty() {
                    let data = Bytes::from(std::mem::take(&mut self.carry));
                    self.queue.push_back(OpusPacket {
                        data,
                        duration: Duration::ZERO,
                        granule: 0,
                    });
                }
            }
        }

        Ok(Some((granule, self.queue.len() - before)))
    }

    /// Pulls sample rate and pre-skip out of an accumulating OpusHead packet.
    /// Called as soon as the signature is visible; the fields may not have
    /// arrived yet, in which case the defaults stand.
    fn parse_opus_head(&mut self) {
        if self.carry.len() >= 12 {
            self.pre_skip = u16::from_le_bytes([self.carry[10], self.carry[11]]) as u64;
        }
        if self.carry.len() >= 16 {
            let rate = u32::from_le_bytes(self.carry[12..16].try_into().expect("4 bytes"));
            if rate != 0 {
                self.sample_rate = rate;
            }
        }
    }
}

/// Fills `buf` completely, distinguishing a clean EOF before the first byte
/// from a truncated read partway through.
fn fill_buf<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(Fill::CleanEof);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated ogg page",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Fill::Complete)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::audio::ogg_fixtures::{build_page, laces_for, opus_head, opus_tags};
    use std::io::Cursor;

    fn reader_over(pages: Vec<Vec<u8>>) -> OggOpusPacketReader<Cursor<Vec<u8>>> {
        // ---
        let bytes: Vec<u8> = pages.into_iter().flatten().collect();
        OggOpusPacketReader::new(Cursor::new(bytes))
    }

    fn collect_all(reader: &mut OggOpusPacketReader<Cursor<Vec<u8>>>) -> Vec<OpusPacket> {
        // ---
        let mut out = Vec::new();
        while let Some(pkt) = reader.next_packet().expect("stream should parse") {
            out.push(pkt);
        }
        out
    }

    #[test]
    fn filters_header_packets_and_emits_audio() {
        // ---
        let head = opus_head(48_000, 312);
        let tags = opus_tags("test", &[]);
        let audio = vec![0xAA; 120];

        let pages = vec![
            build_page(0, 0x02, &laces_for(head.len(), true), &head),
            build_page(0, 0x00, &laces_for(tags.len(), true), &tags),
            build_page(960, 0x00, &laces_for(audio.len(), true), &audio),
        ];

        let mut reader = reader_over(pages);
        let packets = collect_all(&mut reader);

        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].data[..], &audio[..]);
        assert_eq!(packets[0].granule, 960);
        assert_eq!(reader.sample_rate(), 48_000);
        assert_eq!(reader.pre_skip(), 312);
    }

    #[test]
    fn opus_head_declares_the_sample_rate() {
        // ---
        let head = opus_head(24_000, 0);
        let audio = vec![1u8; 40];

        let pages = vec![
            build_page(0, 0x02, &laces_for(head.len(), true), &head),
            build_page(480, 0x00, &laces_for(audio.len(), true), &audio),
        ];

        let mut reader = reader_over(pages);
        let packets = collect_all(&mut reader);

        assert_eq!(reader.sample_rate(), 24_000);
        // 480 samples at 24 kHz is 20 ms.
        assert_eq!(packets[0].duration, Duration::from_millis(20));
    }

    #[test]
    fn page_duration_is_split_with_remainder_on_last_packet() {
        // ---
        let head = opus_head(48_000, 0);
        let (a, b, c) = (vec![1u8; 50], vec![2u8; 50], vec![3u8; 50]);

        let mut laces = Vec::new();
        let mut payload = Vec::new();
        for pkt in [&a, &b, &c] {
            laces.extend(laces_for(pkt.len(), true));
            payload.extend_from_slice(pkt);
        }

        // 1000 samples over 3 packets does not divide evenly.
        let pages = vec![
            build_page(0, 0x02, &laces_for(head.len(), true), &head),
            build_page(1000, 0x00, &laces, &payload),
        ];

        let mut reader = reader_over(pages);
        let packets = collect_all(&mut reader);
        assert_eq!(packets.len(), 3);

        let page_dur = Duration::from_nanos(1000 * 1_000_000_000 / 48_000);
        let sum: Duration = packets.iter().map(|p| p.duration).sum();
        assert_eq!(sum, page_dur);
        assert_eq!(packets[0].duration, packets[1].duration);
        assert!(packets[2].duration >= packets[1].duration);
    }

    #[test]
    fn packet_spanning_pages_is_reassembled() {
        // ---
        let head = opus_head(48_000, 0);
        let big: Vec<u8> = (0..400).map(|i| (i % 251) as u8).collect();

        // First 255 bytes on page one (unterminated), the rest on page two.
        let pages = vec![
            build_page(0, 0x02, &laces_for(head.len(), true), &head),
            build_page(0, 0x00, &laces_for(255, false), &big[..255]),
            build_page(960, 0x01, &laces_for(big.len() - 255, true), &big[255..]),
        ];

        let mut reader = reader_over(pages);
        let packets = collect_all(&mut reader);

        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].data[..], &big[..]);
    }

    #[test]
    fn header_packet_spanning_pages_is_still_discarded() {
        // ---
        // An OpusTags packet padded past one page must not leak out as audio.
        let head = opus_head(48_000, 0);
        let mut tags = opus_tags("padded", &[]);
        tags.resize(300, 0);

        let audio = vec![7u8; 60];
        let pages = vec![
            build_page(0, 0x02, &laces_for(head.len(), true), &head),
            build_page(0, 0x00, &laces_for(255, false), &tags[..255]),
            build_page(0, 0x01, &laces_for(tags.len() - 255, true), &tags[255..]),
            build_page(960, 0x00, &laces_for(audio.len(), true), &audio),
        ];

        let mut reader = reader_over(pages);
        let packets = collect_all(&mut reader);

        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].data[..], &audio[..]);
    }

    #[test]
    fn pages_without_completed_packets_are_skipped() {
        // ---
        // A page whose only content is the start of a continued packet
        // finishes nothing; the reader must move on without emitting.
        let head = opus_head(48_000, 0);
        let big = vec![9u8; 510];

        let pages = vec![
            build_page(0, 0x02, &laces_for(head.len(), true), &head),
            build_page(0, 0x00, &laces_for(255, false), &big[..255]),
            build_page(0, 0x01, &laces_for(255, false), &big[255..]),
            build_page(960, 0x01, &laces_for(0, true), &[]),
        ];

        let mut reader = reader_over(pages);
        let packets = collect_all(&mut reader);

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data.len(), big.len());
        assert_eq!(packets[0].granule, 960);
    }

    #[test]
    fn zero_length_segments_terminate_packets() {
        // ---
        // A packet of exactly 255 bytes needs a trailing zero lace.
        let head = opus_head(48_000, 0);
        let exact = vec![3u8; 255];

        let pages = vec![
            build_page(0, 0x02, &laces_for(head.len(), true), &head),
            build_page(960, 0x00, &laces_for(exact.len(), true), &exact),
        ];

        let mut reader = reader_over(pages);
        let packets = collect_all(&mut reader);

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data.len(), 255);
    }

    #[test]
    fn invalid_capture_pattern_is_an_error() {
        // ---
        let mut junk = build_page(0, 0x00, &laces_for(4, true), &[1, 2, 3, 4]);
        junk[0] = b'X';

        let mut reader = OggOpusPacketReader::new(Cursor::new(junk));
        let err = reader.next_packet().expect_err("should reject bad page");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_page_is_an_unexpected_eof() {
        // ---
        let mut page = build_page(960, 0x00, &laces_for(100, true), &vec![9u8; 100]);
        page.truncate(page.len() - 40);

        let mut reader = OggOpusPacketReader::new(Cursor::new(page));
        let err = reader.next_packet().expect_err("should detect truncation");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn clean_eof_yields_none() {
        // ---
        let mut reader = OggOpusPacketReader::new(Cursor::new(Vec::new()));
        assert!(reader.next_packet().expect("empty stream is fine").is_none());
    }

    #[test]
    fn seek_state_controls_first_page_duration() {
        // ---
        let audio = vec![4u8; 80];
        let pages = vec![build_page(2880, 0x00, &laces_for(audio.len(), true), &audio)];

        let mut reader = reader_over(pages);
        reader.set_seek_state(1920, 312);

        let pkt = reader.next_packet().unwrap().unwrap();
        // 2880 - 1920 = 960 samples = 20 ms at 48 kHz.
        assert_eq!(pkt.duration, Duration::from_millis(20));
        assert_eq!(reader.pre_skip(), 312);
    }
}
