//! Shared fixtures: synthetic Ogg Opus streams for end-to-end parsing
//! tests, built page by page with controlled granules and lacing.

/// Lacing values for one packet of `len` bytes. An unterminated packet
/// (continuing on the next page) must be a multiple of 255.
pub fn laces_for(len: usize, terminated: bool) -> Vec<u8> {
    let mut laces = vec![255u8; len / 255];
    if terminated {
        laces.push((len % 255) as u8);
    } else {
        assert!(len % 255 == 0, "unterminated packet must be 255-aligned");
    }
    laces
}

/// Assembles a raw Ogg page (CRC left zero; the server never checks it).
pub fn build_page(granule: u64, header_type: u8, laces: &[u8], payload: &[u8]) -> Vec<u8> {
    let total: usize = laces.iter().map(|&l| l as usize).sum();
    assert_eq!(total, payload.len(), "laces must cover the payload");
    assert!(laces.len() <= 255);

    let mut page = Vec::with_capacity(27 + laces.len() + payload.len());
    page.extend_from_slice(b"OggS");
    page.push(0);
    page.push(header_type);
    page.extend_from_slice(&granule.to_le_bytes());
    page.extend_from_slice(&0x6F70_7573u32.to_le_bytes());
    page.extend_from_slice(&0u32.to_le_bytes());
    page.extend_from_slice(&0u32.to_le_bytes());
    page.push(laces.len() as u8);
    page.extend_from_slice(laces);
    page.extend_from_slice(payload);
    page
}

/// Minimal RFC 7845 OpusHead packet (stereo, mapping family 0).
pub fn opus_head(sample_rate: u32, pre_skip: u16) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(19);
    pkt.extend_from_slice(b"OpusHead");
    pkt.push(1);
    pkt.push(2);
    pkt.extend_from_slice(&pre_skip.to_le_bytes());
    pkt.extend_from_slice(&sample_rate.to_le_bytes());
    pkt.extend_from_slice(&0i16.to_le_bytes());
    pkt.push(0);
    pkt
}

/// OpusTags packet with `KEY=value` comment strings.
pub fn opus_tags(vendor: &str, comments: &[&str]) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(b"OpusTags");
    pkt.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    pkt.extend_from_slice(vendor.as_bytes());
    pkt.extend_from_slice(&(comments.len() as u32).to_le_bytes());
    for comment in comments {
        pkt.extend_from_slice(&(comment.len() as u32).to_le_bytes());
        pkt.extend_from_slice(comment.as_bytes());
    }
    pkt
}

/// A complete synthetic track: headers plus `pages` audio pages, each
/// holding `packets_per_page` packets of `packet_len` bytes and advancing
/// the granule by 960 samples per packet. Returns the raw bytes and the
/// concatenation of all audio payloads for byte-equality checks.
pub fn synthetic_track(
    pre_skip: u16,
    pages: usize,
    packets_per_page: usize,
    packet_len: usize,
) -> (Vec<u8>, Vec<u8>) {
    let head = opus_head(48_000, pre_skip);
    let tags = opus_tags("fixture", &["TITLE=synthetic"]);

    let mut bytes = Vec::new();
    bytes.extend(build_page(0, 0x02, &laces_for(head.len(), true), &head));
    bytes.extend(build_page(0, 0x00, &laces_for(tags.len(), true), &tags));

    let mut audio_concat = Vec::new();
    let mut granule = 0u64;
    let mut fill = 1u8;

    for _ in 0..pages {
        let mut laces = Vec::new();
        let mut payload = Vec::new();
        for _ in 0..packets_per_page {
            let pkt = vec![fill; packet_len];
            fill = fill.wrapping_add(1).max(1);
            laces.extend(laces_for(pkt.len(), true));
            audio_concat.extend_from_slice(&pkt);
            payload.extend_from_slice(&pkt);
            granule += 960;
        }
        bytes.extend(build_page(granule, 0x00, &laces, &payload));
    }

    (bytes, audio_concat)
}
