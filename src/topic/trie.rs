//! Topic trie
//!
//! A prefix tree keyed by topic-level tokens. Wildcard levels are stored as
//! the literal `+` and `#` children, so a filter occupies exactly one path
//! and matching a concrete topic is O(depth), independent of how many
//! filters are stored.

use ahash::AHashMap;
use compact_str::CompactString;

use super::parse::TopicToken;

#[derive(Debug)]
struct TrieNode<V> {
    /// Children indexed by level string (including the literals `+` and `#`)
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Value stored at this node
    value: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            children: AHashMap::new(),
            value: None,
        }
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic trie mapping filter paths to values
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Walk the token path, creating nodes on demand, and return the value
    /// slot at the terminal node.
    pub fn entry(&mut self, tokens: &[TopicToken]) -> &mut Option<V> {
        let mut node = &mut self.root;
        for token in tokens {
            node = node
                .children
                .entry(token.value.clone())
                .or_default();
        }
        &mut node.value
    }

    /// Take the value at the token path, if the path and value exist.
    /// Intermediate nodes are left in place.
    pub fn take(&mut self, tokens: &[TopicToken]) -> Option<V> {
        let mut node = &mut self.root;
        for token in tokens {
            node = node.children.get_mut(token.value.as_str())?;
        }
        node.value.take()
    }

    /// Invoke `on_match` for the value of every stored filter that matches
    /// the concrete topic `tokens` (which must be wildcard-free).
    ///
    /// At each node the literal child and the `+` child are both descended;
    /// a `#` child matches the current level and everything below it, and -
    /// per the MQTT spec - also the parent level, which is why a matching
    /// terminal child's `#` grandchild is emitted as well.
    pub fn matches<F>(&self, tokens: &[&str], mut on_match: F)
    where
        F: FnMut(&V),
    {
        if !tokens.is_empty() {
            Self::matches_recursive(&self.root, tokens, &mut on_match);
        }
    }

    fn matches_recursive<F>(node: &TrieNode<V>, tokens: &[&str], on_match: &mut F)
    where
        F: FnMut(&V),
    {
        for key in [tokens[0], "+"] {
            if let Some(child) = node.children.get(key) {
                if tokens.len() == 1 {
                    if let Some(v) = &child.value {
                        on_match(v);
                    }
                    // "a/b/#" also matches "a/b"
                    if let Some(hash_child) = child.children.get("#") {
                        if let Some(v) = &hash_child.value {
                            on_match(v);
                        }
                    }
                } else {
                    Self::matches_recursive(child, &tokens[1..], on_match);
                }
            }
        }

        if let Some(hash_child) = node.children.get("#") {
            if let Some(v) = &hash_child.value {
                on_match(v);
            }
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
