//! Media catalog.
//!
//! Enumerates the `.opus` files of the media directory and extracts
//! best-effort title/artist metadata from their OpusTags. The catalog is
//! loaded once at startup and treated as immutable for the process
//! lifetime.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

/// One playable track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMeta {
    pub path: PathBuf,
    /// Tag title, or the file name without extension when untagged.
    pub title: String,
    /// Split, trimmed, deduplicated artist names. Never null, possibly empty.
    pub artists: Vec<String>,
}

// Conservative separator set; commas are intentionally absent because
// artist names may contain them.
const ARTIST_SEPARATORS: &[&str] = &[" feat. ", " ft. ", " featuring ", ";", " & ", "/", " x "];

/// Loads every `.opus` file directly under `media_dir`, sorted by file
/// name. Subdirectories and other extensions are ignored. Fails when the
/// directory is unreadable or holds no tracks.
pub fn load_catalog(media_dir: &Path) -> Result<Vec<TrackMeta>> {
    let entries = std::fs::read_dir(media_dir)
        .with_context(|| format!("read media dir {}", media_dir.display()))?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("scan {}", media_dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        if path.extension().map(|e| e == "opus").unwrap_or(false) {
            paths.push(path);
        }
    }
    paths.sort();

    if paths.is_empty() {
        bail!("no .opus tracks found in {}", media_dir.display());
    }

    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let (title, artists) = read_opus_tags_best_effort(&path);

        let title = title.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        out.push(TrackMeta {
            path,
            title,
            artists,
        });
    }

    Ok(out)
}

/// Best-effort OpusTags parse. Returns `(None, [])` when the file is
/// missing, unreadable, or untagged.
fn read_opus_tags_best_effort(path: &Path) -> (Option<String>, Vec<String>) {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            debug!("skipping tags for {}: {e}", path.display());
            return (None, Vec::new());
        }
    };

    let mut reader = RawOggPacketReader::new(file);
    let mut title = None;
    let mut artist_values: Vec<String> = Vec::new();

    loop {
        let pkt = match reader.next_packet() {
            Ok(Some(pkt)) => pkt,
            Ok(None) | Err(_) => break,
        };
        if pkt.len() < 8 {
            break;
        }

        if &pkt[..8] == b"OpusTags" {
            for (key, value) in parse_opus_tags(&pkt) {
                match key.as_str() {
                    "title" => {
                        if title.is_none() && !value.is_empty() {
                            title = Some(value);
                        }
                    }
                    "artist" => {
                        if !value.is_empty() {
                            artist_values.push(value);
                        }
                    }
                    _ => {}
                }
            }
            break;
        }
    }

    // Normalize + de-dupe artists, keeping first-seen order.
    let mut seen = HashSet::new();
    let mut artists = Vec::new();
    for value in artist_values {
        for artist in split_artists(&value) {
            if seen.insert(artist.clone()) {
                artists.push(artist);
            }
        }
    }

    (title, artists)
}

/// Decodes the comment list of a raw OpusTags packet into lowercase-keyed
/// `(key, value)` pairs. Malformed tails are simply cut off.
fn parse_opus_tags(pkt: &[u8]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut pos = 8usize;

    let Some(vendor_len) = read_u32(pkt, pos) else {
        return out;
    };
    pos += 4 + vendor_len as usize;

    let Some(count) = read_u32(pkt, pos) else {
        return out;
    };
    pos += 4;

    for _ in 0..count {
        let Some(len) = read_u32(pkt, pos) else {
            return out;
        };
        pos += 4;
        let end = pos + len as usize;
        if end > pkt.len() {
            return out;
        }

        if let Ok(comment) = std::str::from_utf8(&pkt[pos..end]) {
            if let Some((key, value)) = comment.split_once('=') {
                out.push((
                    key.trim().to_ascii_lowercase(),
                    value.trim().to_string(),
                ));
            }
        }
        pos = end;
    }

    out
}

fn read_u32(buf: &[u8], pos: usize) -> Option<u32> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes(b.try_into().expect("4 bytes")))
}

/// Splits a raw ARTIST value into individual names.
pub(crate) fn split_artists(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut parts = vec![trimmed.to_string()];
    for sep in ARTIST_SEPARATORS {
        let mut next = Vec::new();
        for cur in parts {
            for piece in cur.split(sep) {
                let piece = piece.trim();
                if !piece.is_empty() {
                    next.push(piece.to_string());
                }
            }
        }
        parts = next;
    }
    parts
}

/// Raw Ogg packet reassembly with no filtering or timing; just enough to
/// find the OpusTags packet near the start of a file.
struct RawOggPacketReader<R> {
    reader: BufReader<R>,
    carry: Vec<u8>,
    queue: std::collections::VecDeque<Vec<u8>>,
    header: [u8; 27],
    seg_table: [u8; 255],
    page_buf: Vec<u8>,
}

impl<R: Read> RawOggPacketReader<R> {
    // ---
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(256 * 1024, inner),
            carry: Vec::new(),
            queue: std::collections::VecDeque::new(),
            header: [0u8; 27],
            seg_table: [0u8; 255],
            page_buf: Vec::with_capacity(255 * 255),
        }
    }

    fn next_packet(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(pkt) = self.queue.pop_front() {
                return Ok(Some(pkt));
            }
            if !self.read_page()? {
                return Ok(None);
            }
        }
    }

    fn read_page(&mut self) -> io::Result<bool> {
        match self.reader.read(&mut self.header[..1])? {
            0 => return Ok(false),
            _ => self.reader.read_exact(&mut self.header[1..])?,
        }

        if &self.header[0..4] != b"OggS" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid ogg capture pattern",
            ));
        }

        let seg_count = self.header[26] as usize;
        self.reader.read_exact(&mut self.seg_table[..seg_count])?;

        let total: usize = self.seg_table[..seg_count]
            .iter()
            .map(|&s| s as usize)
            .sum();
        self.page_buf.resize(total, 0);
        self.reader.read_exact(&mut self.page_buf)?;

        let mut offset = 0usize;
        for i in 0..seg_count {
            let size = self.seg_table[i] as usize;
            if size > 0 {
                self.carry
                    .extend_from_slice(&self.page_buf[offset..offset + size]);
                offset += size;
            }

            if self.seg_table[i] < 255 && !self.carry.is_empty() {
                self.queue.push_back(std::mem::take(&mut self.carry));
            }
        }

        Ok(true)
    }
}
