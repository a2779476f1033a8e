//! Topic routing
//!
//! Topic parsing plus the [`TopicIndex`]: a trie keyed by topic-level
//! tokens mapping each subscribed filter to its [`Feed`]. A side cache
//! (filter string -> feed) serves repeat `init_feed` calls without touching
//! the trie lock; the trie itself sits behind a single read-write lock -
//! matching runs under the read lock, init/remove under the write lock.

mod parse;
mod trie;

pub use parse::{
    parse_topic_filter, parse_topic_name, validate_topic_name, FilterTokens, MatchKind,
    NameTokens, TopicToken,
};
pub use trie::TopicTrie;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::feed::Feed;

/// Feeds matched for one concrete topic; inline for typical fanouts
pub type MatchedFeeds = SmallVec<[Arc<Feed>; 8]>;

/// Concurrent map from topic filters to feeds.
///
/// Feeds are owned here; sessions reach them through `Arc` clones handed
/// out by [`TopicIndex::init_feed`] and hold them weakly via their
/// subscriptions. Removing a feed is rare and leaves empty trie nodes in
/// place.
pub struct TopicIndex {
    trie: RwLock<TopicTrie<Arc<Feed>>>,
    /// Lock-free fast path for already-initialized filters
    feeds: DashMap<Arc<str>, Arc<Feed>, ahash::RandomState>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
            feeds: DashMap::default(),
        }
    }

    /// Ensure the feed for `filter` exists and return it.
    ///
    /// The boolean reports whether the feed was already present; across
    /// concurrent callers for the same filter exactly one observes `false`
    /// and all receive the same feed.
    pub fn init_feed(&self, filter: &str, tokens: &[TopicToken]) -> (Arc<Feed>, bool) {
        if let Some(feed) = self.feeds.get(filter) {
            return (feed.clone(), true);
        }

        let mut trie = self.trie.write();
        let slot = trie.entry(tokens);
        if let Some(feed) = slot.as_ref() {
            // another writer won the race between cache miss and lock
            let feed = feed.clone();
            self.feeds
                .entry(Arc::from(filter))
                .or_insert_with(|| feed.clone());
            return (feed, true);
        }

        let feed = Arc::new(Feed::new(filter));
        *slot = Some(feed.clone());
        self.feeds.insert(Arc::from(filter), feed.clone());
        (feed, false)
    }

    /// Remove and return the feed for `filter`, if present.
    ///
    /// Keeping sparsely used feeds in place is usually the better trade;
    /// empty intermediate nodes are left behind either way.
    pub fn remove_feed(&self, filter: &str, tokens: &[TopicToken]) -> Option<Arc<Feed>> {
        let mut trie = self.trie.write();
        self.feeds.remove(filter);
        trie.take(tokens)
    }

    /// Collect the feed of every stored filter matching the concrete topic
    /// `name_tokens` (wildcard-free, from [`parse_topic_name`]).
    pub fn match_feeds(&self, name_tokens: &[&str]) -> MatchedFeeds {
        let trie = self.trie.read();
        let mut feeds = MatchedFeeds::new();
        trie.matches(name_tokens, |feed| feeds.push(feed.clone()));
        feeds
    }
}

impl Default for TopicIndex {
    fn default() -> Self {
        Self::new()
    }
}
