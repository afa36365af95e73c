//! Turns the free-text title reported by the extraction engine into a safe
//! filename and a best-effort artist/song guess.
//!
//! Nothing in here touches the filesystem; the retrieval job runner combines
//! these helpers with the file it actually found on disk.

use serde::Serialize;

/// Characters that are not allowed in a filename on at least one of the
/// platforms we care about.
pub const RESERVED_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Artist reported when the title neither splits on a hyphen nor has enough
/// words to guess from.
pub const UNKNOWN_ARTIST: &str = "Unknown";

/// Display hint derived from a raw title. Treat both fields as a guess, not as
/// authoritative tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedMetadata {
    pub artist: String,
    pub song: String,
}

/// Removes every reserved character, keeping everything else (whitespace and
/// unicode included) in order.
pub fn sanitize(title: &str) -> String {
    title.chars().filter(|c| !RESERVED_CHARS.contains(c)).collect()
}

/// Guesses `(artist, song)` from a title such as `"Artist - Song"`.
///
/// A single `-` splits the title in two, even when one side ends up empty.
/// Any other shape falls back to a word
/// count: with more than two words the first one is taken as the artist.
/// Otherwise the artist is [`UNKNOWN_ARTIST`] and the song is the untouched
/// title.
pub fn extract_metadata(title: &str) -> ParsedMetadata {
    let parts: Vec<&str> = title.split('-').collect();
    if let [artist, song] = parts.as_slice() {
        return ParsedMetadata {
            artist: artist.trim().to_owned(),
            song: song.trim().to_owned(),
        };
    }

    let words = words(title);
    if let [first, rest @ ..] = words.as_slice()
        && rest.len() >= 2
    {
        return ParsedMetadata {
            artist: (*first).to_owned(),
            song: rest.join(" "),
        };
    }

    ParsedMetadata {
        artist: UNKNOWN_ARTIST.to_owned(),
        song: title.to_owned(),
    }
}

/// Final display filename for an artifact: the sanitized title plus the
/// extension of the produced file.
pub fn name_artifact(raw_title: &str, extension: &str) -> String {
    format!("{}.{}", sanitize(raw_title), extension)
}

/// Splits on whitespace and strips punctuation hugging each token, so `"-"`,
/// `"|"` or `"(Live)"` do not count as words on their own.
fn words(title: &str) -> Vec<&str> {
    title
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|token| !token.is_empty())
        .collect()
}
