//! Apple Music link parsing.
//!
//! Accepts album, playlist, song, and music-video URLs on the `music` and
//! `beta.music` hosts. An album link carrying the in-album track selector
//! (`?i=<song>`) is normalized to the bare album URL before matching.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

static ALBUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://(?:beta\.music|music)\.apple\.com/)(?P<storefront>\w{2})(?:/album)(?:/.+)?/(?P<id>\d+)(?:$|\?)",
    )
    .expect("album regex")
});
static MV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://(?:beta\.music|music)\.apple\.com/)(?P<storefront>\w{2})(?:/music-video)(?:/.+)?/(?P<id>\d+)(?:$|\?)",
    )
    .expect("music-video regex")
});
static SONG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://(?:beta\.music|music)\.apple\.com/)(?P<storefront>\w{2})(?:/song)(?:/.+)?/(?P<id>\d+)(?:$|\?)",
    )
    .expect("song regex")
});
static PLAYLIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://(?:beta\.music|music)\.apple\.com/)(?P<storefront>\w{2})(?:/playlist)(?:/.+)?/(?P<id>pl\.[\w-]+)(?:$|\?)",
    )
    .expect("playlist regex")
});

/// Kind of resource a link points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    Album,
    Playlist,
    Song,
    MusicVideo,
}

impl LinkKind {
    /// Resource path segment in the upstream catalog API.
    #[must_use]
    pub const fn api_resource(&self) -> &'static str {
        match self {
            Self::Album => "albums",
            Self::Playlist => "playlists",
            Self::Song => "songs",
            Self::MusicVideo => "music-videos",
        }
    }
}

/// Parsed identity of a submitted link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    #[serde(rename = "type")]
    pub kind: LinkKind,
    /// Two-letter region code, lowercase.
    pub storefront: String,
    pub id: String,
}

/// Strip the in-album track selector from an album link.
///
/// `https://music.apple.com/us/album/x/1?i=2` → `https://music.apple.com/us/album/x/1`.
/// Non-album links pass through unchanged.
#[must_use]
pub fn strip_track_param(link: &str) -> &str {
    if link.contains("/album/") {
        if let Some(pos) = link.find("?i=") {
            return &link[..pos];
        }
    }
    link
}

/// Parse a link into its type, storefront, and id.
///
/// Returns `None` for unrecognized URLs and for storefronts outside the
/// allowed set.
#[must_use]
pub fn parse_link(link: &str, allowed_storefronts: &HashSet<String>) -> Option<LinkInfo> {
    let link = strip_track_param(link);

    let patterns: [(LinkKind, &Regex); 4] = [
        (LinkKind::Album, &ALBUM_RE),
        (LinkKind::MusicVideo, &MV_RE),
        (LinkKind::Song, &SONG_RE),
        (LinkKind::Playlist, &PLAYLIST_RE),
    ];

    for (kind, regex) in patterns {
        if let Some(caps) = regex.captures(link) {
            let storefront = caps["storefront"].to_lowercase();
            if !allowed_storefronts.contains(&storefront) {
                tracing::warn!(
                    link,
                    storefront,
                    "link storefront is not in the allowed set"
                );
                return None;
            }
            return Some(LinkInfo {
                kind,
                storefront,
                id: caps["id"].to_string(),
            });
        }
    }

    tracing::warn!(link, "link did not match any known pattern");
    None
}
