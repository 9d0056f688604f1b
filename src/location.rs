//! Classification of the host location and playlist identity lookup.

use url::Url;

/// Query parameter carrying the host's logical playlist id.
pub const PLAYLIST_QUERY_PARAM: &str = "list";

/// Kind of view the host is currently showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Dedicated playlist page.
    PlaylistPage,
    /// Single item playing with a companion playlist panel.
    WatchWithPlaylist,
    /// Single item without a playlist.
    Watch,
    Other,
}

/// Parsed host location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    href: String,
    kind: ViewKind,
    playlist_id: Option<String>,
}

impl Location {
    /// Parses an absolute URL. Unparsable input is kept as an `Other` view
    /// so the engine simply stays inactive.
    pub fn parse(href: &str) -> Self {
        let Ok(url) = Url::parse(href) else {
            log::debug!("Unparsable location {:?}; treating as non-playlist view", href);
            return Self {
                href: href.to_string(),
                kind: ViewKind::Other,
                playlist_id: None,
            };
        };

        let playlist_id = url
            .query_pairs()
            .find(|(key, _)| key == PLAYLIST_QUERY_PARAM)
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let path = url.path().trim_end_matches('/');
        let kind = match (path, playlist_id.is_some()) {
            ("/playlist", true) => ViewKind::PlaylistPage,
            ("/watch", true) => ViewKind::WatchWithPlaylist,
            ("/watch", false) => ViewKind::Watch,
            _ => ViewKind::Other,
        };

        Self {
            href: href.to_string(),
            kind,
            playlist_id,
        }
    }

    pub fn href(&self) -> &str {
        &self.href
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    /// Playlist identity, absent when the view has no `list` parameter.
    pub fn playlist_id(&self) -> Option<&str> {
        self.playlist_id.as_deref()
    }

    pub fn is_watch_view(&self) -> bool {
        matches!(self.kind, ViewKind::Watch | ViewKind::WatchWithPlaylist)
    }
}

impl Default for Location {
    fn default() -> Self {
        Self {
            href: String::new(),
            kind: ViewKind::Other,
            playlist_id: None,
        }
    }
}
