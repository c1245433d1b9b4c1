use super::trie::SuffixTrie;
use compact_str::CompactString;
use rustc_hash::FxBuildHasher;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A compiled rule: the original text plus the list it came from.
#[derive(Debug, Clone)]
pub struct RuleMeta {
    pub text: Arc<str>,
    pub list_id: i64,
}

/// A rule-engine hit.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub text: Arc<str>,
    pub list_id: i64,
    pub is_exception: bool,
}

/// Compiled adblock-syntax rule storage.
///
/// Supported syntax, the subset the configuration format promises:
///   `||example.org^`   block the domain and its subdomains
///   `example.org`      block the exact domain
///   `*.example.org`    block subdomains only
///   `@@||example.org^` exception (stops all other rules)
///   `0.0.0.0 host`     hosts-style line, blocks the exact host
///   `! comment` / `# comment`
///
/// Rules carrying `$` modifiers or `/regex/` bodies are outside the promised
/// subset and are skipped with a debug note.
///
/// Built at configure time and swapped atomically; `find` returns at most
/// one rule.
#[derive(Default)]
pub struct RuleIndex {
    rules: Vec<RuleMeta>,
    block_exact: HashMap<CompactString, u32, FxBuildHasher>,
    block_trie: SuffixTrie,
    allow_exact: HashMap<CompactString, u32, FxBuildHasher>,
    allow_trie: SuffixTrie,
}

enum Parsed<'a> {
    Apex(&'a str),
    Exact(&'a str),
    Wildcard(&'a str),
    Skip,
}

fn parse_body(body: &str) -> Parsed<'_> {
    if body.is_empty() {
        return Parsed::Skip;
    }
    if body.starts_with('/') && body.ends_with('/') {
        return Parsed::Skip;
    }
    if body.contains('$') {
        return Parsed::Skip;
    }
    if let Some(rest) = body.strip_prefix("||") {
        let domain = rest.strip_suffix('^').unwrap_or(rest);
        return if domain.is_empty() || domain.contains('/') {
            Parsed::Skip
        } else {
            Parsed::Apex(domain)
        };
    }
    if let Some(domain) = body.strip_prefix("*.") {
        return Parsed::Wildcard(domain);
    }
    // Hosts-style line: "0.0.0.0 ads.example.com".
    let mut fields = body.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some(first), Some(host)) if first.parse::<std::net::IpAddr>().is_ok() => {
            Parsed::Exact(host)
        }
        (Some(only), None) if !only.contains('/') && !only.contains('^') => Parsed::Exact(only),
        _ => Parsed::Skip,
    }
}

impl RuleIndex {
    /// Compile rule lines from every configured list. Line order within a
    /// list is irrelevant; exceptions always win.
    pub fn compile<'a>(lists: impl IntoIterator<Item = (i64, &'a [String])>) -> Self {
        let mut index = RuleIndex::default();
        let mut skipped = 0usize;

        for (list_id, lines) in lists {
            for line in lines {
                let line = line.trim();
                if line.is_empty() || line.starts_with('!') || line.starts_with('#') {
                    continue;
                }

                let (is_exception, body) = match line.strip_prefix("@@") {
                    Some(rest) => (true, rest),
                    None => (false, line),
                };

                let parsed = parse_body(body);
                if matches!(&parsed, Parsed::Skip) {
                    skipped += 1;
                    debug!(rule = line, "Skipping unsupported rule syntax");
                    continue;
                }

                let rule_id = index.rules.len() as u32;
                index.rules.push(RuleMeta {
                    text: Arc::from(line),
                    list_id,
                });

                let (exact, trie) = if is_exception {
                    (&mut index.allow_exact, &mut index.allow_trie)
                } else {
                    (&mut index.block_exact, &mut index.block_trie)
                };

                match parsed {
                    Parsed::Apex(domain) => trie.insert_apex(&domain.to_lowercase(), rule_id),
                    Parsed::Wildcard(domain) => {
                        trie.insert_wildcard(&domain.to_lowercase(), rule_id)
                    }
                    Parsed::Exact(host) => {
                        exact
                            .entry(CompactString::new(host.to_lowercase()))
                            .or_insert(rule_id);
                    }
                    Parsed::Skip => unreachable!(),
                }
            }
        }

        if skipped > 0 {
            debug!(skipped, "Rules outside the supported subset were ignored");
        }
        index
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn meta(&self, id: u32, is_exception: bool) -> RuleMatch {
        let meta = &self.rules[id as usize];
        RuleMatch {
            text: Arc::clone(&meta.text),
            list_id: meta.list_id,
            is_exception,
        }
    }

    /// Match `host` (already lower-cased, no trailing dot) against the
    /// index. Exception rules shadow block rules.
    pub fn find(&self, host: &str) -> Option<RuleMatch> {
        if let Some(&id) = self.allow_exact.get(host) {
            return Some(self.meta(id, true));
        }
        if let Some(id) = self.allow_trie.lookup(host) {
            return Some(self.meta(id, true));
        }
        if let Some(&id) = self.block_exact.get(host) {
            return Some(self.meta(id, false));
        }
        if let Some(id) = self.block_trie.lookup(host) {
            return Some(self.meta(id, false));
        }
        None
    }
}
