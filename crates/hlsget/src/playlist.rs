//! Line-oriented M3U8 parser and the data model it produces.
//!
//! The parser resolves everything at parse time: URIs become absolute against
//! the playlist's own URL, byte-range offsets are chained, and each segment
//! carries its own [`Encryption`] value, so no key-tag state survives past
//! parsing. Unrecognized `#EXT-` tags and comments are skipped.

use url::Url;

use crate::error::DownloadError;

/// A sub-resource byte range with a resolved absolute offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub length: u64,
    pub offset: u64,
}

/// Encryption context attached to a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encryption {
    None,
    Aes128 {
        key_uri: Url,
        /// Explicit IV from the key tag. Absent means the IV is derived from
        /// the segment's absolute index.
        iv: Option<[u8; 16]>,
    },
}

#[derive(Debug, Clone)]
pub struct Variant {
    pub uri: Url,
    /// Peak bandwidth in bits per second. Required by the tag grammar.
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub codecs: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MasterPlaylist {
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone)]
pub struct Segment {
    /// 0-based position within the playlist; the output ordering key.
    pub index: usize,
    /// `media_sequence + index`; feeds IV derivation when no IV is given.
    pub absolute_index: u64,
    pub uri: Url,
    pub duration: f64,
    pub byte_range: Option<ByteRange>,
    pub encryption: Encryption,
}

#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub version: Option<u32>,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub end_list: bool,
    pub segments: Vec<Segment>,
}

#[derive(Debug)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

/// Key-tag state carried between segments while parsing.
#[derive(Debug, Clone)]
enum KeyContext {
    None,
    Aes128 { key_uri: Url, iv: Option<[u8; 16]> },
    /// A method we do not implement. Only an error once a segment actually
    /// falls under it.
    Unsupported(String),
}

struct PendingStreamInf {
    bandwidth: u64,
    resolution: Option<(u32, u32)>,
    codecs: Option<String>,
}

/// Obvious non-media resources that show up as junk lines in real-world
/// playlists. Matched against the raw URI line.
const NON_MEDIA_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".ico", ".css", ".js", ".html", ".txt",
];

pub fn parse(text: &str, base: &Url) -> Result<Playlist, DownloadError> {
    let mut saw_header = false;
    let mut variants: Vec<Variant> = Vec::new();
    let mut segments: Vec<Segment> = Vec::new();

    let mut version: Option<u32> = None;
    let mut target_duration: u64 = 0;
    let mut media_sequence: u64 = 0;
    let mut end_list = false;

    let mut pending_stream_inf: Option<PendingStreamInf> = None;
    let mut pending_duration: Option<f64> = None;
    let mut pending_range: Option<(u64, Option<u64>)> = None;
    let mut key_context = KeyContext::None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if !saw_header {
            if line == "#EXTM3U" {
                saw_header = true;
                continue;
            }
            return Err(DownloadError::parse(
                "first non-empty line is not #EXTM3U",
            ));
        }

        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending_stream_inf = Some(parse_stream_inf(rest)?);
        } else if let Some(rest) = line.strip_prefix("#EXTINF:") {
            pending_duration = Some(parse_extinf(rest)?);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            pending_range = Some(parse_byterange(rest)?);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            key_context = parse_key(rest, base)?;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            // Only meaningful before the first segment.
            if segments.is_empty() {
                media_sequence = rest.trim().parse().map_err(|_| {
                    DownloadError::parse(format!("invalid media sequence `{rest}`"))
                })?;
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = rest.trim().parse().map_err(|_| {
                DownloadError::parse(format!("invalid target duration `{rest}`"))
            })?;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-VERSION:") {
            version = rest.trim().parse().ok();
        } else if line == "#EXT-X-ENDLIST" {
            end_list = true;
        } else if line.starts_with('#') {
            // Comment or unrecognized tag.
            continue;
        } else if let Some(inf) = pending_stream_inf.take() {
            let uri = resolve(base, line)?;
            variants.push(Variant {
                uri,
                bandwidth: inf.bandwidth,
                resolution: inf.resolution,
                codecs: inf.codecs,
            });
        } else if let Some(duration) = pending_duration.take() {
            if is_non_media_uri(line) {
                pending_range = None;
                continue;
            }
            let uri = resolve(base, line)?;
            let encryption = match &key_context {
                KeyContext::None => Encryption::None,
                KeyContext::Aes128 { key_uri, iv } => Encryption::Aes128 {
                    key_uri: key_uri.clone(),
                    iv: *iv,
                },
                KeyContext::Unsupported(method) => {
                    return Err(DownloadError::UnsupportedEncryption {
                        method: method.clone(),
                    });
                }
            };
            let byte_range = pending_range
                .take()
                .map(|(length, offset)| resolve_byterange(length, offset, &uri, segments.last()));
            let index = segments.len();
            segments.push(Segment {
                index,
                absolute_index: media_sequence + index as u64,
                uri,
                duration,
                byte_range,
                encryption,
            });
        }
        // A URI line with no preceding EXTINF or STREAM-INF is ignored.
    }

    if !saw_header {
        return Err(DownloadError::parse("empty playlist"));
    }

    // STREAM-INF wins when a playlist carries both kinds of entries.
    if !variants.is_empty() {
        Ok(Playlist::Master(MasterPlaylist { variants }))
    } else {
        Ok(Playlist::Media(MediaPlaylist {
            version,
            target_duration,
            media_sequence,
            end_list,
            segments,
        }))
    }
}

/// Render a media playlist in the canonical subset this parser understands:
/// absolute URIs, explicit byte-range offsets, and a key tag emitted at every
/// encryption-context change. `parse(write(p))` reproduces `p`.
pub fn write_media_playlist(playlist: &MediaPlaylist) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    if let Some(version) = playlist.version {
        out.push_str(&format!("#EXT-X-VERSION:{version}\n"));
    }
    out.push_str(&format!(
        "#EXT-X-TARGETDURATION:{}\n",
        playlist.target_duration
    ));
    out.push_str(&format!(
        "#EXT-X-MEDIA-SEQUENCE:{}\n",
        playlist.media_sequence
    ));

    let mut context = Encryption::None;
    for segment in &playlist.segments {
        if segment.encryption != context {
            match &segment.encryption {
                Encryption::None => out.push_str("#EXT-X-KEY:METHOD=NONE\n"),
                Encryption::Aes128 { key_uri, iv } => {
                    out.push_str(&format!("#EXT-X-KEY:METHOD=AES-128,URI=\"{key_uri}\""));
                    if let Some(iv) = iv {
                        out.push_str(&format!(",IV=0x{}", hex::encode(iv)));
                    }
                    out.push('\n');
                }
            }
            context = segment.encryption.clone();
        }
        if let Some(range) = &segment.byte_range {
            out.push_str(&format!(
                "#EXT-X-BYTERANGE:{}@{}\n",
                range.length, range.offset
            ));
        }
        out.push_str(&format!("#EXTINF:{:.3},\n", segment.duration));
        out.push_str(segment.uri.as_str());
        out.push('\n');
    }

    if playlist.end_list {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

fn resolve(base: &Url, uri: &str) -> Result<Url, DownloadError> {
    base.join(uri)
        .map_err(|e| DownloadError::parse(format!("cannot resolve URI `{uri}`: {e}")))
}

fn resolve_byterange(
    length: u64,
    offset: Option<u64>,
    uri: &Url,
    previous: Option<&Segment>,
) -> ByteRange {
    let offset = offset.unwrap_or_else(|| {
        // Continuation: pick up right after the previous range on the same
        // resource; otherwise start at the beginning.
        match previous {
            Some(prev) if prev.uri == *uri => prev
                .byte_range
                .as_ref()
                .map(|r| r.offset + r.length)
                .unwrap_or(0),
            _ => 0,
        }
    });
    ByteRange { length, offset }
}

fn parse_extinf(rest: &str) -> Result<f64, DownloadError> {
    let duration_part = rest.split(',').next().unwrap_or(rest).trim();
    duration_part
        .parse()
        .map_err(|_| DownloadError::parse(format!("invalid segment duration `{rest}`")))
}

fn parse_byterange(rest: &str) -> Result<(u64, Option<u64>), DownloadError> {
    let rest = rest.trim();
    let (length_str, offset_str) = match rest.split_once('@') {
        Some((l, o)) => (l, Some(o)),
        None => (rest, None),
    };
    let length: u64 = length_str
        .trim()
        .parse()
        .map_err(|_| DownloadError::parse(format!("invalid byte range `{rest}`")))?;
    if length == 0 {
        return Err(DownloadError::parse("byte range length must be non-zero"));
    }
    let offset = match offset_str {
        Some(o) => Some(
            o.trim()
                .parse()
                .map_err(|_| DownloadError::parse(format!("invalid byte range offset `{rest}`")))?,
        ),
        None => None,
    };
    Ok((length, offset))
}

fn parse_stream_inf(rest: &str) -> Result<PendingStreamInf, DownloadError> {
    let mut bandwidth: Option<u64> = None;
    let mut resolution: Option<(u32, u32)> = None;
    let mut codecs: Option<String> = None;

    for (key, value) in split_attributes(rest) {
        if key.eq_ignore_ascii_case("BANDWIDTH") {
            bandwidth = Some(value.parse().map_err(|_| {
                DownloadError::parse(format!("invalid BANDWIDTH `{value}`"))
            })?);
        } else if key.eq_ignore_ascii_case("RESOLUTION") {
            resolution = parse_resolution(value);
        } else if key.eq_ignore_ascii_case("CODECS") {
            codecs = Some(value.to_string());
        }
    }

    let bandwidth =
        bandwidth.ok_or_else(|| DownloadError::parse("stream-inf is missing BANDWIDTH"))?;
    Ok(PendingStreamInf {
        bandwidth,
        resolution,
        codecs,
    })
}

fn parse_key(rest: &str, base: &Url) -> Result<KeyContext, DownloadError> {
    let mut method: Option<String> = None;
    let mut uri: Option<String> = None;
    let mut iv: Option<[u8; 16]> = None;

    for (key, value) in split_attributes(rest) {
        if key.eq_ignore_ascii_case("METHOD") {
            method = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("URI") {
            uri = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("IV") {
            let hex_str = value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
                .unwrap_or(value);
            let mut bytes = [0u8; 16];
            hex::decode_to_slice(hex_str, &mut bytes)
                .map_err(|e| DownloadError::parse(format!("invalid IV `{value}`: {e}")))?;
            iv = Some(bytes);
        }
    }

    let method = method.ok_or_else(|| DownloadError::parse("key tag is missing METHOD"))?;
    match method.as_str() {
        "NONE" => Ok(KeyContext::None),
        "AES-128" => {
            let uri = uri.ok_or_else(|| DownloadError::parse("AES-128 key tag is missing URI"))?;
            Ok(KeyContext::Aes128 {
                key_uri: resolve(base, &uri)?,
                iv,
            })
        }
        _ => Ok(KeyContext::Unsupported(method)),
    }
}

/// Split an attribute list on commas, keeping quoted values intact, and strip
/// the quotes from each value.
fn split_attributes(rest: &str) -> Vec<(&str, &str)> {
    let mut parts: Vec<&str> = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(rest[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < rest.len() {
        parts.push(rest[start..].trim());
    }

    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            let mut value = value.trim();
            if let Some(stripped) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
                value = stripped;
            }
            Some((key.trim(), value))
        })
        .collect()
}

fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn is_non_media_uri(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    let looks_like_media = [".ts", ".m4s", ".mp4", ".aac"]
        .iter()
        .any(|ext| lower.ends_with(ext) || lower.contains(&format!("{ext}?")));
    if looks_like_media {
        return false;
    }
    NON_MEDIA_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}
