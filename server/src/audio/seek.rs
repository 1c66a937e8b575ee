//! Forward seek over an Ogg Opus stream.
//!
//! Seeking never decodes audio: the scan learns pre-skip from the header
//! packets, then skips whole pages by granule position with byte-offset
//! seeks until the first page at or past the target. Callers that feed a
//! tee replay the cached header pages (see [`read_header_pages`]) ahead of
//! the post-seek file content so downstream encoders still see a
//! well-formed stream.

use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;

use super::packet_reader::{DEFAULT_SAMPLE_RATE, OPUS_HEAD_SIG, OPUS_TAGS_SIG};

/// Granule bookkeeping to prime a packet reader after a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekState {
    /// Granule of the last audio page skipped over.
    pub prev_granule: u64,
    /// Pre-skip declared by OpusHead, in 48 kHz samples.
    pub pre_skip: u64,
}

/// Positions `source` at the first page whose granule covers `resume`, and
/// returns the state needed to keep duration math correct afterwards.
pub fn seek_offset<R: Read + Seek>(source: &mut R, resume: Duration) -> io::Result<SeekState> {
    let (offset, prev_granule, pre_skip) = find_offset(source, resume)?;
    source.seek(SeekFrom::Start(offset))?;

    Ok(SeekState {
        prev_granule,
        pre_skip,
    })
}

/// Scans from the start of the stream for the byte offset of the first page
/// with `granule >= resume_samples + pre_skip`.
///
/// Header pages are parsed (not skipped) until both OpusHead and OpusTags
/// have terminated, because pre-skip is needed before the target granule can
/// be computed. After that, pages before the target are skipped with a
/// relative seek and never reconstructed.
fn find_offset<R: Read + Seek>(source: &mut R, resume: Duration) -> io::Result<(u64, u64, u64)> {
    source.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; 27];
    let mut seg_table = [0u8; 255];
    let mut page_buf: Vec<u8> = Vec::new();
    let mut carry: Vec<u8> = Vec::new();

    let mut seen_head = false;
    let mut seen_tags = false;
    let mut discarding = false;
    let mut pre_skip = 0u64;
    let mut last_audio_granule = 0u64;

    let target_pcm =
        (resume.as_nanos() * DEFAULT_SAMPLE_RATE as u128 / 1_000_000_000u128) as u64;

    loop {
        let page_start = source.stream_position()?;

        source.read_exact(&mut header)?;
        if &header[0..4] != b"OggS" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid ogg capture pattern at {page_start}"),
            ));
        }

        let granule = u64::from_le_bytes(header[6..14].try_into().expect("8 bytes"));
        let seg_count = header[26] as usize;
        source.read_exact(&mut seg_table[..seg_count])?;

        let total: usize = seg_table[..seg_count].iter().map(|&s| s as usize).sum();

        if !seen_head || !seen_tags {
            page_buf.resize(total, 0);
            source.read_exact(&mut page_buf)?;

            // Reconstruct packets with the lacing table only to parse
            // OpusHead for pre-skip and to find the OpusTags boundary.
            let mut offset = 0usize;
            for i in 0..seg_count {
                let size = seg_table[i] as usize;
                if size > 0 && !discarding {
                    carry.extend_from_slice(&page_buf[offset..offset + size]);
                }
                offset += size;

                if seg_table[i] < 255 {
                    if discarding {
                        discarding = false;
                    } else if carry.len() >= 8 {
                        if !seen_head && &carry[..8] == OPUS_HEAD_SIG {
                            if carry.len() >= 12 {
                                pre_skip = u16::from_le_bytes([carry[10], carry[11]]) as u64;
                            }
                            seen_head = true;
                        } else if !seen_tags && &carry[..8] == OPUS_TAGS_SIG {
                            seen_tags = true;
                        }
                    }
                    carry.clear();
                }
            }

            continue;
        }

        let target_granule = target_pcm + pre_skip;

        if granule < target_granule {
            // Before the target: skip the payload without reconstruction.
            source.seek(SeekFrom::Current(total as i64))?;
            last_audio_granule = granule;
            continue;
        }

        return Ok((page_start, last_audio_granule, pre_skip));
    }
}

/// Reads the raw header pages (through the end of OpusTags) from the start
/// of the stream, returning their bytes plus the declared pre-skip.
///
/// The returned bytes are whole pages, so prepending them to post-seek file
/// content yields a stream any Ogg demuxer accepts.
pub fn read_header_pages<R: Read + Seek>(source: &mut R) -> io::Result<(Vec<u8>, u16)> {
    source.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; 27];
    let mut seg_table = [0u8; 255];
    let mut out: Vec<u8> = Vec::new();
    let mut carry: Vec<u8> = Vec::new();

    let mut got_head = false;
    let mut got_tags = false;
    let mut pre_skip = 0u16;

    loop {
        source.read_exact(&mut header)?;
        if &header[0..4] != b"OggS" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid ogg capture pattern: {:?}", &header[0..4]),
            ));
        }

        let seg_count = header[26] as usize;
        source.read_exact(&mut seg_table[..seg_count])?;

        let total: usize = seg_table[..seg_count].iter().map(|&s| s as usize).sum();
        let mut payload = vec![0u8; total];
        source.read_exact(&mut payload)?;

        // Keep the raw page bytes regardless of what the packets turn out
        // to be; headers always come first in a well-formed stream.
        out.extend_from_slice(&header);
        out.extend_from_slice(&seg_table[..seg_count]);
        out.extend_from_slice(&payload);

        let mut offset = 0usize;
        for i in 0..seg_count {
            let size = seg_table[i] as usize;
            if size > 0 {
                carry.extend_from_slice(&payload[offset..offset + size]);
                offset += size;
            }

            if seg_table[i] < 255 {
                if carry.len() >= 8 {
                    if !got_head && &carry[..8] == OPUS_HEAD_SIG {
                        got_head = true;
                        if carry.len() >= 12 {
                            pre_skip = u16::from_le_bytes([carry[10], carry[11]]);
                        }
                    } else if !got_tags && &carry[..8] == OPUS_TAGS_SIG {
                        got_tags = true;
                    }
                }
                carry.clear();

                if got_head && got_tags {
                    return Ok((out, pre_skip));
                }
            }
        }
    }
}
