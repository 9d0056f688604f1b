//! Reordering transforms and their commit to the live tree.

use std::{cmp::Ordering, collections::HashSet, str::FromStr};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::{
    error::EngineError,
    extract::{self, ExtractedFields},
    tree::HostTree,
};

/// Reordering applied to a playlist. `None` is the pristine host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
pub enum TransformKind {
    #[serde(rename = "reverse")]
    Reverse,
    #[serde(rename = "shuffle")]
    Shuffle,
    #[serde(rename = "alphabetical")]
    SortTitle,
    #[serde(rename = "duration")]
    SortDuration,
    #[serde(rename = "upload-date")]
    SortRecency,
    #[serde(rename = "none")]
    None,
}

impl TransformKind {
    /// Transforms a user can invoke, in menu order.
    pub const INVOKABLE: [TransformKind; 5] = [
        Self::Reverse,
        Self::Shuffle,
        Self::SortTitle,
        Self::SortDuration,
        Self::SortRecency,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Reverse => "Reverse Order",
            Self::Shuffle => "Shuffle",
            Self::SortTitle => "Sort A-Z",
            Self::SortDuration => "Sort by Duration",
            Self::SortRecency => "Sort by Upload Date",
            Self::None => "Original Order",
        }
    }

    /// Storage tag, as written into persisted records.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Reverse => "reverse",
            Self::Shuffle => "shuffle",
            Self::SortTitle => "alphabetical",
            Self::SortDuration => "duration",
            Self::SortRecency => "upload-date",
            Self::None => "none",
        }
    }

    /// Confirmation shown after a user-invoked transform.
    pub fn success_message(self) -> &'static str {
        match self {
            Self::Reverse => "Playlist reversed! 🔄",
            Self::Shuffle => "Playlist shuffled! 🔀",
            Self::SortTitle => "Playlist sorted alphabetically! 🔤",
            Self::SortDuration => "Playlist sorted by duration! ⏱️",
            Self::SortRecency => "Playlist sorted by upload date! 📅",
            Self::None => "Playlist restored to original order! 🔄",
        }
    }

    fn needs_fields(self) -> bool {
        matches!(
            self,
            Self::SortTitle | Self::SortDuration | Self::SortRecency
        )
    }
}

impl FromStr for TransformKind {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        [Self::None]
            .into_iter()
            .chain(Self::INVOKABLE)
            .find(|kind| kind.tag().eq_ignore_ascii_case(value))
            .ok_or_else(|| EngineError::UnknownTransform(value.to_string()))
    }
}

/// Pure reordering over item handles. Only the shuffle RNG is stateful.
pub struct OrderController {
    rng: StdRng,
}

impl Default for OrderController {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderController {
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        if let Err(err) = getrandom::fill(&mut seed) {
            warn!("Secure random seed unavailable ({}); falling back to clock seed", err);
            let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            return Self::with_seed(nanos as u64);
        }
        Self {
            rng: StdRng::from_seed(seed),
        }
    }

    /// Reproducible shuffles.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reads the fields a sort needs from the live tree, then applies `kind`.
    pub fn arrange<T: HostTree>(
        &mut self,
        tree: &T,
        items: &[T::Node],
        kind: TransformKind,
        now: DateTime<Utc>,
    ) -> Vec<T::Node> {
        if !kind.needs_fields() {
            return self.apply_unkeyed(items, kind);
        }
        let entries: Vec<(T::Node, ExtractedFields)> = items
            .iter()
            .map(|item| (*item, extract::extract_fields(tree, *item, now)))
            .collect();
        self.apply(&entries, kind)
    }

    /// Applies `kind` to items paired with their extracted fields. Sorts are
    /// stable; only `Shuffle` is non-deterministic.
    pub fn apply<N: Copy>(&mut self, entries: &[(N, ExtractedFields)], kind: TransformKind) -> Vec<N> {
        match kind {
            TransformKind::SortTitle => {
                let mut keyed: Vec<(String, N)> = entries
                    .iter()
                    .map(|(node, fields)| (title_sort_key(&fields.title), *node))
                    .collect();
                keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
                keyed.into_iter().map(|(_, node)| node).collect()
            }
            TransformKind::SortDuration => {
                let mut sorted = entries.to_vec();
                sorted.sort_by_key(|(_, fields)| fields.duration_seconds);
                sorted.into_iter().map(|(node, _)| node).collect()
            }
            TransformKind::SortRecency => {
                let mut sorted = entries.to_vec();
                sorted.sort_by(|(_, a), (_, b)| newest_first(a, b));
                sorted.into_iter().map(|(node, _)| node).collect()
            }
            _ => {
                let nodes: Vec<N> = entries.iter().map(|(node, _)| *node).collect();
                self.apply_unkeyed(&nodes, kind)
            }
        }
    }

    fn apply_unkeyed<N: Copy>(&mut self, items: &[N], kind: TransformKind) -> Vec<N> {
        let mut arranged = items.to_vec();
        match kind {
            TransformKind::Reverse => arranged.reverse(),
            TransformKind::Shuffle => self.shuffle(&mut arranged),
            _ => {}
        }
        arranged
    }

    /// Fisher-Yates.
    fn shuffle<N>(&mut self, items: &mut [N]) {
        for i in (1..items.len()).rev() {
            let j = self.rng.random_range(0..=i);
            items.swap(i, j);
        }
    }
}

fn newest_first(a: &ExtractedFields, b: &ExtractedFields) -> Ordering {
    b.recency.cmp(&a.recency)
}

/// Case- and accent-insensitive collation key.
pub fn title_sort_key(title: &str) -> String {
    title
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Replaces the item block under `container` with `new_order` in one batch.
///
/// Items in `current` are detached and `new_order` is inserted before the
/// first non-item sibling that followed the last current item. Other
/// siblings are never moved.
pub fn commit<T: HostTree>(
    tree: &mut T,
    container: T::Node,
    current: &[T::Node],
    new_order: &[T::Node],
) {
    let moving: HashSet<T::Node> = current.iter().chain(new_order).copied().collect();
    let siblings = tree.children(container);
    let anchor = siblings
        .iter()
        .rposition(|child| current.contains(child))
        .and_then(|last| {
            siblings[last + 1..]
                .iter()
                .find(|child| !moving.contains(child))
                .copied()
        });

    for item in current {
        tree.detach(*item);
    }
    tree.insert_children(container, anchor, new_order);
    debug!(
        "Committed {} items ({} replaced) under {:?}",
        new_order.len(),
        current.len(),
        container
    );
}

/// Detached copies of the pristine item order, captured once per activation.
#[derive(Debug, Clone)]
pub struct Snapshot<N> {
    clones: Vec<N>,
    titles: Vec<String>,
}

impl<N: Copy> Snapshot<N> {
    pub fn capture<T: HostTree<Node = N>>(tree: &mut T, items: &[N]) -> Self {
        let titles = items.iter().map(|item| extract::title(tree, *item)).collect();
        let clones = items.iter().map(|item| tree.clone_subtree(*item)).collect();
        Self { clones, titles }
    }

    pub fn len(&self) -> usize {
        self.clones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clones.is_empty()
    }

    /// Titles as they read at capture time.
    pub fn titles(&self) -> &[String] {
        &self.titles
    }

    /// Fresh copies of the recorded items, so the snapshot stays reusable.
    pub fn materialize<T: HostTree<Node = N>>(&self, tree: &mut T) -> Vec<N> {
        self.clones
            .iter()
            .map(|clone| tree.clone_subtree(*clone))
            .collect()
    }

    /// Replaces `current` under `container` with the recorded order and
    /// returns the inserted copies.
    pub fn restore<T: HostTree<Node = N>>(&self, tree: &mut T, container: N, current: &[N]) -> Vec<N> {
        let restored = self.materialize(tree);
        commit(tree, container, current, &restored);
        restored
    }
}
