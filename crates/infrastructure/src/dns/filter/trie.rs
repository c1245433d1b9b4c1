use compact_str::CompactString;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use std::collections::HashMap;

pub const NO_RULE: u32 = u32::MAX;

/// A node in the reversed-label suffix trie.
struct TrieNode {
    children: HashMap<CompactString, TrieNode, FxBuildHasher>,
    /// Rule matching this node's domain and everything below it
    /// (`||ads.com^` syntax).
    apex_rule: u32,
    /// Rule matching strictly below this node (`*.ads.com` syntax).
    wildcard_rule: u32,
}

impl TrieNode {
    fn new() -> Self {
        Self {
            children: HashMap::with_hasher(FxBuildHasher),
            apex_rule: NO_RULE,
            wildcard_rule: NO_RULE,
        }
    }
}

impl Default for TrieNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Suffix trie for domain-pattern matching.
///
/// Patterns are stored as reversed label paths: `||ads.com^` traverses
/// ["com", "ads"] and sets `apex_rule` at the "ads" node, so both `ads.com`
/// and `sub.ads.com` match. `*.ads.com` sets `wildcard_rule` instead, which
/// requires at least one extra label: `sub.ads.com` matches, `ads.com` does
/// not.
///
/// Built once during compilation and replaced via ArcSwap; lookups hold no
/// lock. At most one rule id is returned: the deepest (most specific) match.
#[derive(Default)]
pub struct SuffixTrie {
    root: TrieNode,
}

impl SuffixTrie {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    fn node_for(&mut self, domain: &str) -> &mut TrieNode {
        let mut node = &mut self.root;
        for label in domain.split('.').rev() {
            node = node.children.entry(CompactString::new(label)).or_default();
        }
        node
    }

    /// Insert a `||domain^`-style pattern: the domain itself plus subdomains.
    pub fn insert_apex(&mut self, domain: &str, rule: u32) {
        let node = self.node_for(domain);
        if node.apex_rule == NO_RULE {
            node.apex_rule = rule;
        }
    }

    /// Insert a `*.domain`-style pattern: subdomains only.
    pub fn insert_wildcard(&mut self, domain: &str, rule: u32) {
        let node = self.node_for(domain);
        if node.wildcard_rule == NO_RULE {
            node.wildcard_rule = rule;
        }
    }

    /// Look up `domain` and return the deepest matching rule id.
    #[inline]
    pub fn lookup(&self, domain: &str) -> Option<u32> {
        let labels: SmallVec<[&str; 8]> = domain.split('.').rev().collect();
        let n = labels.len();
        let mut node = &self.root;
        let mut best = NO_RULE;

        for (i, label) in labels.iter().enumerate() {
            match node.children.get(*label) {
                Some(child) => {
                    if child.apex_rule != NO_RULE {
                        best = child.apex_rule;
                    }
                    // Wildcard requires at least one label beyond this node.
                    if child.wildcard_rule != NO_RULE && i + 1 < n {
                        best = child.wildcard_rule;
                    }
                    node = child;
                }
                None => break,
            }
        }

        (best != NO_RULE).then_some(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apex_matches_self_and_below() {
        let mut trie = SuffixTrie::new();
        trie.insert_apex("ads.com", 7);
        assert_eq!(trie.lookup("ads.com"), Some(7));
        assert_eq!(trie.lookup("tracker.ads.com"), Some(7));
        assert_eq!(trie.lookup("badads.com"), None);
        assert_eq!(trie.lookup("com"), None);
    }

    #[test]
    fn wildcard_requires_subdomain() {
        let mut trie = SuffixTrie::new();
        trie.insert_wildcard("ads.com", 3);
        assert_eq!(trie.lookup("ads.com"), None);
        assert_eq!(trie.lookup("x.ads.com"), Some(3));
        assert_eq!(trie.lookup("deep.x.ads.com"), Some(3));
    }

    #[test]
    fn deepest_match_wins() {
        let mut trie = SuffixTrie::new();
        trie.insert_apex("example.org", 1);
        trie.insert_apex("cdn.example.org", 2);
        assert_eq!(trie.lookup("a.cdn.example.org"), Some(2));
        assert_eq!(trie.lookup("b.example.org"), Some(1));
    }
}
