//! Discovery of the playlist region inside the host tree.
//!
//! The host markup is undocumented and drifts between revisions, so items
//! are located through a ranked cascade of selectors: the first strategy
//! that yields at least one match wins, and results are never merged across
//! strategies.

use log::{debug, trace};

use crate::{
    location::{Location, ViewKind},
    selector::{parse_cascade, query_all, query_first, Selector},
    tree::HostTree,
};

/// Item strategies, broadest container match first.
pub const DEFAULT_ITEM_CASCADE: [&str; 13] = [
    "ytd-playlist-video-renderer",
    ".ytd-playlist-video-renderer",
    "#playlist-items ytd-playlist-video-renderer",
    ".playlist-items ytd-playlist-video-renderer",
    "ytd-playlist-panel-renderer#playlist ytd-playlist-video-renderer",
    "ytd-playlist-panel-renderer ytd-playlist-video-renderer",
    "#playlist.ytd-playlist-panel-renderer ytd-playlist-video-renderer",
    "ytd-playlist-panel-renderer #container ytd-playlist-video-renderer",
    "ytd-playlist-panel-renderer ytd-playlist-video-list-renderer ytd-playlist-video-renderer",
    ".ytd-watch-flexy ytd-playlist-panel-renderer ytd-playlist-video-renderer",
    "[id=\"playlist\"][class*=\"ytd-playlist-panel-renderer\"] ytd-playlist-video-renderer",
    ".ytd-playlist-panel-renderer ytd-playlist-video-renderer",
    "#secondary .ytd-playlist-video-renderer",
];

/// Side panel that accompanies a single playing item.
pub const DEFAULT_PANEL_CASCADE: [&str; 3] = [
    "ytd-playlist-panel-renderer#playlist",
    "ytd-playlist-panel-renderer",
    ".ytd-playlist-panel-renderer",
];

/// Region whose presence alone marks a dedicated playlist view.
pub const PLAYLIST_REGION_SELECTOR: &str = "#playlist-items";

/// Result of a successful cascade run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedItems<N> {
    /// Shared parent of every returned item.
    pub container: N,
    /// Items in current document order.
    pub items: Vec<N>,
    /// Index of the winning strategy in the cascade.
    pub strategy: usize,
}

/// Locates playlist items and decides whether a view should host the engine.
#[derive(Debug, Clone)]
pub struct ItemDiscovery {
    item_cascade: Vec<Selector>,
    panel_cascade: Vec<Selector>,
    playlist_region: Vec<Selector>,
}

impl Default for ItemDiscovery {
    fn default() -> Self {
        Self {
            item_cascade: parse_cascade(&DEFAULT_ITEM_CASCADE),
            panel_cascade: parse_cascade(&DEFAULT_PANEL_CASCADE),
            playlist_region: parse_cascade(&[PLAYLIST_REGION_SELECTOR]),
        }
    }
}

impl ItemDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the item cascade, keeping the default panel detection.
    pub fn with_item_cascade(mut self, cascade: Vec<Selector>) -> Self {
        self.item_cascade = cascade;
        self
    }

    pub fn item_cascade(&self) -> &[Selector] {
        &self.item_cascade
    }

    /// Evaluated fresh on every call; the host tree may have changed since.
    pub fn is_eligible<T: HostTree>(&self, tree: &T, location: &Location) -> bool {
        let is_playlist_page = location.kind() == ViewKind::PlaylistPage
            || first_match(tree, None, &self.playlist_region).is_some();
        let is_watch_with_playlist = location.kind() == ViewKind::WatchWithPlaylist;
        let has_panel = is_watch_with_playlist && self.has_playlist_panel(tree);
        trace!(
            "Eligibility for {}: playlist_page={} watch_with_playlist={} panel={}",
            location.href(),
            is_playlist_page,
            is_watch_with_playlist,
            has_panel
        );
        is_playlist_page || has_panel
    }

    pub fn has_playlist_panel<T: HostTree>(&self, tree: &T) -> bool {
        first_match(tree, None, &self.panel_cascade).is_some()
    }

    /// `true` when `node` is, or contains, a playlist panel.
    pub fn contains_playlist_panel<T: HostTree>(&self, tree: &T, node: T::Node) -> bool {
        self.panel_cascade
            .iter()
            .any(|selector| selector.matches(tree, node))
            || first_match(tree, Some(node), &self.panel_cascade).is_some()
    }

    /// Items of the winning strategy; empty when nothing matched yet.
    pub fn locate<T: HostTree>(&self, tree: &T) -> Vec<T::Node> {
        self.locate_with_container(tree)
            .map(|located| located.items)
            .unwrap_or_default()
    }

    /// Runs the cascade. Only matches that are children of the first match's
    /// parent are kept, so a commit never moves items across containers.
    pub fn locate_with_container<T: HostTree>(&self, tree: &T) -> Option<LocatedItems<T::Node>> {
        for (strategy, selector) in self.item_cascade.iter().enumerate() {
            let matches = query_all(tree, None, selector);
            let Some(first) = matches.first().copied() else {
                continue;
            };
            let Some(container) = tree.parent(first) else {
                continue;
            };
            let items: Vec<T::Node> = matches
                .into_iter()
                .filter(|item| tree.parent(*item) == Some(container))
                .collect();
            debug!(
                "Found {} playlist items with selector: {}",
                items.len(),
                selector
            );
            return Some(LocatedItems {
                container,
                items,
                strategy,
            });
        }
        debug!("No playlist items found by any of {} strategies", self.item_cascade.len());
        None
    }
}

fn first_match<T: HostTree>(tree: &T, scope: Option<T::Node>, cascade: &[Selector]) -> Option<T::Node> {
    cascade
        .iter()
        .find_map(|selector| query_first(tree, scope, selector))
}

#[cfg(test)]
mod tests {
    use super::ItemDiscovery;
    use crate::{
        document::{DocumentTree, ElementSpec},
        location::Location,
        selector::Selector,
        tree::HostTree,
    };

    fn item(title: &str) -> ElementSpec {
        ElementSpec::new("ytd-playlist-video-renderer")
            .child(ElementSpec::new("a").id("video-title").text(title))
    }

    fn watch_page(with_panel: bool) -> DocumentTree {
        let mut secondary = ElementSpec::new("div").id("secondary");
        if with_panel {
            secondary = secondary.child(
                ElementSpec::new("ytd-playlist-panel-renderer")
                    .id("playlist")
                    .child(ElementSpec::new("div").id("items").children([item("A"), item("B")])),
            );
        }
        DocumentTree::new(&ElementSpec::new("body").child(secondary))
    }

    #[test]
    fn test_playlist_page_is_eligible_without_panel() {
        let tree = DocumentTree::new(&ElementSpec::new("body"));
        let discovery = ItemDiscovery::new();
        assert!(discovery.is_eligible(&tree, &Location::parse("https://www.youtube.com/playlist?list=PL")));
    }

    #[test]
    fn test_playlist_region_marks_any_view_eligible() {
        let tree = DocumentTree::new(
            &ElementSpec::new("body").child(ElementSpec::new("div").id("playlist-items")),
        );
        let discovery = ItemDiscovery::new();
        assert!(discovery.is_eligible(&tree, &Location::parse("https://www.youtube.com/feed")));
    }

    #[test]
    fn test_watch_view_requires_panel() {
        let discovery = ItemDiscovery::new();
        let location = Location::parse("https://www.youtube.com/watch?v=x&list=PL");
        assert!(!discovery.is_eligible(&watch_page(false), &location));
        assert!(discovery.is_eligible(&watch_page(true), &location));

        let no_list = Location::parse("https://www.youtube.com/watch?v=x");
        assert!(!discovery.is_eligible(&watch_page(true), &no_list));
    }

    #[test]
    fn test_first_non_empty_strategy_wins() {
        let tree = watch_page(true);
        let discovery = ItemDiscovery::new().with_item_cascade(vec![
            Selector::parse("ytd-playlist-panel-video-renderer").expect("valid"),
            Selector::parse("#items ytd-playlist-video-renderer").expect("valid"),
            Selector::parse("ytd-playlist-video-renderer").expect("valid"),
        ]);

        let located = discovery.locate_with_container(&tree).expect("items located");

        assert_eq!(located.strategy, 1);
        assert_eq!(located.items.len(), 2);
        assert_eq!(tree.attribute(located.container, "id").as_deref(), Some("items"));
    }

    #[test]
    fn test_locate_keeps_only_first_container_children() {
        let tree = DocumentTree::new(&ElementSpec::new("body").children([
            ElementSpec::new("div").id("first").children([item("A"), item("B")]),
            ElementSpec::new("div").id("second").child(item("C")),
        ]));
        let located = ItemDiscovery::new()
            .locate_with_container(&tree)
            .expect("items located");
        assert_eq!(located.strategy, 0);
        assert_eq!(located.items.len(), 2);
    }

    #[test]
    fn test_locate_empty_tree_returns_nothing() {
        let tree = watch_page(false);
        assert!(ItemDiscovery::new().locate(&tree).is_empty());
    }

    #[test]
    fn test_contains_playlist_panel_checks_node_and_descendants() {
        let tree = watch_page(true);
        let discovery = ItemDiscovery::new();
        let secondary = tree.children(tree.root())[0];
        let panel = tree.children(secondary)[0];
        assert!(discovery.contains_playlist_panel(&tree, secondary));
        assert!(discovery.contains_playlist_panel(&tree, panel));
        let items = tree.children(panel)[0];
        assert!(!discovery.contains_playlist_panel(&tree, items));
    }
}
