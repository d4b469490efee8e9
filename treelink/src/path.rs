//! Wildcard patterns and per-subscriber path matchers.
//!
//! Node paths are '/'-separated (`"a/b/c"`). A [`PathPattern`] matches a path
//! segment by segment, so `"a/*"` matches `"a/b"` but not `"a/b/c"`.

use std::fmt;

use crate::filter::QueryFilter;
use crate::message::Message;

/// Shell-style glob: `*`, `?`, `[abc]`, `[a-z]`, `[!x]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WildcardPattern {
    source: String,
    tokens: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    Literal(char),
    AnyOne,
    AnyRun,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

impl WildcardPattern {
    #[must_use]
    pub fn new(source: &str) -> Self {
        let mut tokens = Vec::new();
        let mut chars = source.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    // Collapse runs; "**" behaves like "*".
                    if tokens.last() != Some(&Token::AnyRun) {
                        tokens.push(Token::AnyRun);
                    }
                }
                '?' => tokens.push(Token::AnyOne),
                '\\' => tokens.push(Token::Literal(chars.next().unwrap_or('\\'))),
                '[' => {
                    let mut body = Vec::new();
                    let mut closed = false;
                    for d in chars.by_ref() {
                        if d == ']' && !body.is_empty() {
                            closed = true;
                            break;
                        }
                        body.push(d);
                    }
                    if closed {
                        tokens.push(parse_class(&body));
                    } else {
                        // Unterminated class: treat literally.
                        tokens.push(Token::Literal('['));
                        tokens.extend(body.into_iter().map(Token::Literal));
                    }
                }
                other => tokens.push(Token::Literal(other)),
            }
        }
        Self {
            source: source.to_owned(),
            tokens,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True if the pattern contains no wildcard tokens.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        let text: Vec<char> = text.chars().collect();
        match_tokens(&self.tokens, &text)
    }
}

fn parse_class(body: &[char]) -> Token {
    let (negated, body) = match body.first() {
        Some('!' | '^') => (true, &body[1..]),
        _ => (false, body),
    };
    let mut ranges = Vec::new();
    let mut i = 0;
    while i < body.len() {
        if i + 2 < body.len() && body[i + 1] == '-' {
            ranges.push((body[i], body[i + 2]));
            i += 3;
        } else {
            ranges.push((body[i], body[i]));
            i += 1;
        }
    }
    Token::Class { negated, ranges }
}

fn match_tokens(tokens: &[Token], text: &[char]) -> bool {
    // Iterative glob with single backtrack point for the last '*'.
    let (mut ti, mut si) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while si < text.len() {
        match tokens.get(ti) {
            Some(Token::AnyRun) => {
                star = Some((ti, si));
                ti += 1;
            }
            Some(tok) if single_matches(tok, text[si]) => {
                ti += 1;
                si += 1;
            }
            _ => match star {
                Some((st, ss)) => {
                    ti = st + 1;
                    si = ss + 1;
                    star = Some((st, ss + 1));
                }
                None => return false,
            },
        }
    }
    tokens[ti..].iter().all(|t| *t == Token::AnyRun)
}

fn single_matches(tok: &Token, c: char) -> bool {
    match tok {
        Token::Literal(l) => *l == c,
        Token::AnyOne => true,
        Token::AnyRun => false,
        Token::Class { negated, ranges } => {
            let hit = ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
            hit != *negated
        }
    }
}

impl fmt::Display for WildcardPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// A '/'-separated sequence of wildcard segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathPattern {
    source: String,
    segments: Vec<WildcardPattern>,
}

impl PathPattern {
    #[must_use]
    pub fn new(path: &str) -> Self {
        let trimmed = path.trim_start_matches('/');
        Self {
            source: trimmed.to_owned(),
            segments: split_path(trimmed).map(WildcardPattern::new).collect(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let mut parts = split_path(path.trim_start_matches('/'));
        for seg in &self.segments {
            match parts.next() {
                Some(part) if seg.matches(part) => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// One subscription held by a matcher.
#[derive(Debug, Clone)]
struct MatcherEntry {
    pattern: PathPattern,
    filter: Option<QueryFilter>,
}

/// The union of one subscriber's subscriptions.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    entries: Vec<MatcherEntry>,
}

impl PathMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the entry for `path`.
    pub fn add(&mut self, path: &str, filter: Option<QueryFilter>) {
        let pattern = PathPattern::new(path);
        if let Some(entry) = self.entries.iter_mut().find(|e| e.pattern == pattern) {
            entry.filter = filter;
        } else {
            self.entries.push(MatcherEntry { pattern, filter });
        }
    }

    /// Removes the entry for `path`; returns whether one existed.
    pub fn remove(&mut self, path: &str) -> bool {
        let pattern = PathPattern::new(path);
        let before = self.entries.len();
        self.entries.retain(|e| e.pattern != pattern);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        let pattern = PathPattern::new(path);
        self.entries.iter().any(|e| e.pattern == pattern)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.pattern.as_str())
    }

    /// True if any entry matches `path` and, when a payload is given, that
    /// entry's filter (if any) accepts it. Filters are not consulted for
    /// removals, where there is no payload to test.
    #[must_use]
    pub fn matches(&self, path: &str, payload: Option<&Message>) -> bool {
        self.entries.iter().any(|e| {
            e.pattern.matches(path)
                && match (payload, &e.filter) {
                    (Some(msg), Some(filter)) => filter.matches(msg),
                    _ => true,
                }
        })
    }
}
