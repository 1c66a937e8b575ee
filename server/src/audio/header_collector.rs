//! Header page capture for encoder restarts.
//!
//! Watches the raw Ogg Opus byte stream and caches the OpusHead + OpusTags
//! pages of the current logical bitstream, so a freshly spawned encoder can
//! be primed with them before any audio bytes. Only the initial headers
//! matter; everything after is passed over cheaply.

use super::packet_reader::{OPUS_HEAD_SIG, OPUS_TAGS_SIG};

const PAGE_HEADER_LEN: usize = 27;
const BOS_FLAG: u8 = 0x02;

#[derive(Default)]
pub struct OpusHeaderCollector {
    // ---
    // Raw bytes of the cached header pages.
    cache: Vec<u8>,

    // Partial input that does not yet form a full page.
    scratch: Vec<u8>,

    // Packet continuation across pages.
    carry: Vec<u8>,

    seen_head: bool,
    seen_tags: bool,
    header_done: bool,
}

impl OpusHeaderCollector {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk of the stream. Returns a copy of the full header
    /// bytes the moment both OpusHead and OpusTags have terminated for the
    /// current logical bitstream; a BOS page resets the cache for the next
    /// one.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        if chunk.is_empty() {
            return None;
        }
        self.scratch.extend_from_slice(chunk);

        loop {
            if self.scratch.len() < PAGE_HEADER_LEN {
                return None;
            }

            // Align on a page boundary, discarding garbage between pages.
            if !self.scratch.starts_with(b"OggS") {
                match find_capture(&self.scratch[1..]) {
                    Some(idx) => {
                        self.scratch.drain(..idx + 1);
                    }
                    None => self.scratch.clear(),
                }
                continue;
            }

            let seg_count = self.scratch[26] as usize;
            if self.scratch.len() < PAGE_HEADER_LEN + seg_count {
                return None;
            }

            let payload_len: usize = self.scratch[PAGE_HEADER_LEN..PAGE_HEADER_LEN + seg_count]
                .iter()
                .map(|&s| s as usize)
                .sum();
            let page_len = PAGE_HEADER_LEN + seg_count + payload_len;
            if self.scratch.len() < page_len {
                return None;
            }

            let page: Vec<u8> = self.scratch.drain(..page_len).collect();

            if page[5] & BOS_FLAG != 0 {
                // A new logical bitstream begins; forget the old headers.
                self.cache.clear();
                self.carry.clear();
                self.seen_head = false;
                self.seen_tags = false;
                self.header_done = false;
            }

            if self.header_done {
                continue;
            }

            self.cache.extend_from_slice(&page);

            if let Some(header) = self.scan_page(&page, seg_count) {
                return Some(header);
            }
        }
    }

    /// Walks one page's packets; returns the cached header on completion.
    fn scan_page(&mut self, page: &[u8], seg_count: usize) -> Option<Vec<u8>> {
        let seg_table = &page[PAGE_HEADER_LEN..PAGE_HEADER_LEN + seg_count];
        let payload = &page[PAGE_HEADER_LEN + seg_count..];

        let mut offset = 0usize;
        for &lace in seg_table {
            let size = lace as usize;
            if size > 0 {
                self.carry.extend_from_slice(&payload[offset..offset + size]);
                offset += size;
            }

            if lace < 255 {
                if self.carry.len() >= 8 {
                    if !self.seen_head && &self.carry[..8] == OPUS_HEAD_SIG {
                        self.seen_head = true;
                    } else if !self.seen_tags && &self.carry[..8] == OPUS_TAGS_SIG {
                        self.seen_tags = true;
                    }
                }
                self.carry.clear();

                if self.seen_head && self.seen_tags {
                    self.header_done = true;
                    return Some(self.cache.clone());
                }
            }
        }

        None
    }
}

fn find_capture(haystack: &[u8]) -> Option<usize> {
    haystack.windows(4).position(|w| w == b"OggS")
}
