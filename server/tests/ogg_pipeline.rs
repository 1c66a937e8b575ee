//! End-to-end checks of the Ogg parsing pipeline: packet extraction,
//! duration accounting, seek, and header capture working together the way
//! the playlist driver uses them.

mod common;

use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{build_page, laces_for, opus_head, opus_tags, synthetic_track};
use opuscast_server::audio::{
    read_header_pages, seek_offset, ByteSink, OggOpusPacketReader, OpusHeaderCollector, Tee,
};

/// Sum of emitted packet durations equals the granule-based total.
#[test]
fn packet_durations_sum_to_stream_duration() {
    // ---
    let (bytes, _) = synthetic_track(312, 25, 3, 57);
    let mut reader = OggOpusPacketReader::new(Cursor::new(bytes));

    let mut total = Duration::ZERO;
    let mut packets = 0usize;
    while let Some(pkt) = reader.next_packet().expect("parse") {
        total += pkt.duration;
        packets += 1;
    }

    assert_eq!(packets, 25 * 3);
    // 25 pages * 3 packets * 960 samples at 48 kHz.
    let expected = Duration::from_nanos(25 * 3 * 960 * 1_000_000_000 / 48_000);
    assert_eq!(total, expected);
}

/// The concatenated audio payloads survive parsing byte-exactly, with the
/// header packets filtered out.
#[test]
fn audio_payload_concatenation_is_byte_exact() {
    // ---
    let (bytes, expected_audio) = synthetic_track(0, 10, 4, 33);
    let mut reader = OggOpusPacketReader::new(Cursor::new(bytes));

    let mut concat = Vec::new();
    while let Some(pkt) = reader.next_packet().expect("parse") {
        concat.extend_from_slice(&pkt.data);
    }

    assert_eq!(concat, expected_audio);
}

/// Seek + cached headers + tee compose into a stream a downstream parser
/// accepts, starting at the requested offset.
#[test]
fn seek_with_replayed_headers_feeds_the_tee_a_valid_stream() {
    // ---
    struct CollectingSink {
        collector: Mutex<OpusHeaderCollector>,
        header: Mutex<Option<Vec<u8>>>,
    }

    impl ByteSink for CollectingSink {
        fn write_chunk(&self, chunk: &[u8]) -> std::io::Result<usize> {
            if let Some(h) = self.collector.lock().unwrap().feed(chunk) {
                *self.header.lock().unwrap() = Some(h);
            }
            Ok(chunk.len())
        }
    }

    let (bytes, _) = synthetic_track(120, 50, 2, 64);

    // Prepare the seek exactly the way the playlist driver does.
    let mut file = Cursor::new(bytes.clone());
    let (header_pages, pre_skip) = read_header_pages(&mut file).expect("headers");
    assert_eq!(pre_skip, 120);

    let state = seek_offset(&mut file, Duration::from_millis(500)).expect("seek");
    assert!(state.prev_granule > 0);

    let sink = Arc::new(CollectingSink {
        collector: Mutex::new(OpusHeaderCollector::new()),
        header: Mutex::new(None),
    });

    let tee = Tee::new();
    tee.attach("probe", sink.clone());

    let source = Cursor::new(header_pages).chain(file);
    let mut reader = OggOpusPacketReader::new(tee.reader(source));
    reader.set_seek_state(state.prev_granule, state.pre_skip);

    // First packet lands at or past the seek target.
    let target_granule = 500 * 48 + 120;
    let first = reader.next_packet().expect("parse").expect("audio");
    assert!(first.granule >= target_granule);

    // Drain the rest so the tee sees the whole stream.
    while reader.next_packet().expect("parse").is_some() {}

    // The tee'd observer assembled the replayed header pages, which is
    // exactly what an encoder restart would be primed with.
    let header = sink.header.lock().unwrap().clone().expect("header cached");
    assert!(header.windows(8).any(|w| w == b"OpusHead"));
    assert!(header.windows(8).any(|w| w == b"OpusTags"));
}

/// A packet reader chained over two tracks (two logical bitstreams) keeps
/// producing audio, and a header observer resets on the second BOS.
#[test]
fn chained_tracks_reset_the_header_observer() {
    // ---
    let (first_track, first_audio) = synthetic_track(0, 3, 2, 40);
    let (second_track, second_audio) = synthetic_track(0, 2, 2, 48);

    let mut stream = first_track;
    stream.extend_from_slice(&second_track);

    let mut reader = OggOpusPacketReader::new(Cursor::new(stream.clone()));
    let mut concat = Vec::new();
    while let Some(pkt) = reader.next_packet().expect("parse") {
        concat.extend_from_slice(&pkt.data);
    }

    let mut expected = first_audio;
    expected.extend_from_slice(&second_audio);
    assert_eq!(concat, expected);

    // The collector follows along and ends up caching the second track's
    // headers after its BOS page.
    let mut collector = OpusHeaderCollector::new();
    let mut captured = Vec::new();
    for chunk in stream.chunks(113) {
        if let Some(header) = collector.feed(chunk) {
            captured.push(header);
        }
    }
    assert_eq!(captured.len(), 2);
}

/// Header packets split across pages never leak into the audio stream.
#[test]
fn multi_page_header_packets_are_filtered() {
    // ---
    let head = opus_head(48_000, 0);
    let mut tags = opus_tags("padded-to-span-pages", &[]);
    tags.resize(600, 0);

    let audio = vec![0xABu8; 80];
    let mut bytes = Vec::new();
    bytes.extend(build_page(0, 0x02, &laces_for(head.len(), true), &head));
    bytes.extend(build_page(0, 0x00, &laces_for(510, false), &tags[..510]));
    bytes.extend(build_page(
        0,
        0x01,
        &laces_for(tags.len() - 510, true),
        &tags[510..],
    ));
    bytes.extend(build_page(960, 0x00, &laces_for(audio.len(), true), &audio));

    let mut reader = OggOpusPacketReader::new(Cursor::new(bytes));
    let mut packets = Vec::new();
    while let Some(pkt) = reader.next_packet().expect("parse") {
        packets.push(pkt);
    }

    assert_eq!(packets.len(), 1);
    assert_eq!(&packets[0].data[..], &audio[..]);
}
