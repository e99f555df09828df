//! Lexeme-based text matching used by the in-memory store for the `search*`
//! operators and full-text ranking.

use crate::errors::{RepoError, RepoResult};

use super::types::{Language, SearchMode};

const EN_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

fn stem_en(word: &str) -> String {
    if word.len() > 4
        && let Some(base) = word.strip_suffix("ies")
    {
        return format!("{base}y");
    }
    for suffix in ["ing", "edly", "ed", "ly"] {
        if let Some(base) = word.strip_suffix(suffix)
            && base.len() >= 3
        {
            return base.to_string();
        }
    }
    if let Some(base) = word.strip_suffix("es")
        && ["s", "x", "z", "ch", "sh"].iter().any(|s| base.ends_with(s))
    {
        return base.to_string();
    }
    match word.strip_suffix('s') {
        Some(base) if base.len() >= 3 && !base.ends_with('s') => base.to_string(),
        _ => word.to_string(),
    }
}

/// Lowercases and stems a single word without stop-word removal.
#[must_use]
pub fn normalize_word(word: &str, lang: Language) -> String {
    let lower = word.to_lowercase();
    match lang {
        Language::English => stem_en(&lower),
        _ => lower,
    }
}

fn is_stop_word(word: &str, lang: Language) -> bool {
    lang == Language::English && EN_STOP_WORDS.contains(&word)
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty())
}

/// Splits text into normalised lexemes, dropping stop words.
#[must_use]
pub fn analyze(text: &str, lang: Language) -> Vec<String> {
    words(text)
        .map(str::to_lowercase)
        .filter(|w| !is_stop_word(w, lang))
        .map(|w| normalize_word(&w, lang))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextQuery {
    Term { lexeme: String, prefix: bool },
    Phrase(Vec<String>),
    And(Vec<TextQuery>),
    Or(Vec<TextQuery>),
    Not(Box<TextQuery>),
}

impl TextQuery {
    /// Whether the query matches a document's lexemes. An empty conjunction matches nothing.
    #[must_use]
    pub fn matches(&self, doc: &[String]) -> bool {
        match self {
            Self::Term { lexeme, prefix } => {
                doc.iter().any(|d| if *prefix { d.starts_with(lexeme.as_str()) } else { d == lexeme })
            }
            Self::Phrase(seq) => !seq.is_empty() && doc.windows(seq.len()).any(|w| w == seq.as_slice()),
            Self::And(parts) => !parts.is_empty() && parts.iter().all(|p| p.matches(doc)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(doc)),
            Self::Not(inner) => !inner.matches(doc),
        }
    }

    fn hits(&self, doc: &[String]) -> usize {
        match self {
            Self::Term { lexeme, prefix } => doc
                .iter()
                .filter(|d| if *prefix { d.starts_with(lexeme.as_str()) } else { *d == lexeme })
                .count(),
            Self::Phrase(seq) if !seq.is_empty() => {
                doc.windows(seq.len()).filter(|w| *w == seq.as_slice()).count() * seq.len()
            }
            Self::Phrase(_) | Self::Not(_) => 0,
            Self::And(parts) | Self::Or(parts) => parts.iter().map(|p| p.hits(doc)).sum(),
        }
    }

    /// Relevance of a matching document: positive hits dampened by document length.
    #[must_use]
    pub fn rank(&self, doc: &[String]) -> Option<f64> {
        if !self.matches(doc) {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let (hits, len) = (self.hits(doc) as f64, doc.len().max(1) as f64);
        Some(hits / (1.0 + len.ln()))
    }
}

fn conjunction(lexemes: Vec<String>) -> TextQuery {
    TextQuery::And(lexemes.into_iter().map(|lexeme| TextQuery::Term { lexeme, prefix: false }).collect())
}

/// Builds a query from user input in the given mode.
///
/// # Errors
/// Returns `Validation` when raw boolean syntax is malformed.
pub fn parse_query(q: &str, mode: SearchMode, lang: Language) -> RepoResult<TextQuery> {
    match mode {
        SearchMode::Plain => Ok(conjunction(analyze(q, lang))),
        SearchMode::Phrase => Ok(TextQuery::Phrase(analyze(q, lang))),
        SearchMode::Websearch => Ok(parse_websearch(q, lang)),
        SearchMode::Raw => RawParser::new(q, lang).parse(),
    }
}

fn parse_websearch(q: &str, lang: Language) -> TextQuery {
    let mut items: Vec<TextQuery> = Vec::new();
    let mut pending_or = false;
    let mut rest = q.trim();
    while !rest.is_empty() {
        let (item, tail) = if let Some(after) = rest.strip_prefix('"') {
            let end = after.find('"').unwrap_or(after.len());
            let phrase = analyze(&after[..end], lang);
            let tail = after.get(end + 1..).unwrap_or("");
            ((!phrase.is_empty()).then_some(TextQuery::Phrase(phrase)), tail)
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let word = &rest[..end];
            let tail = &rest[end..];
            if word.eq_ignore_ascii_case("or") && !items.is_empty() {
                pending_or = true;
                rest = tail.trim_start();
                continue;
            }
            let (negated, word) = match word.strip_prefix('-') {
                Some(w) => (true, w),
                None => (false, word),
            };
            let lexemes = analyze(word, lang);
            let item = match lexemes.len() {
                0 => None,
                1 => Some(TextQuery::Term { lexeme: lexemes.into_iter().next().unwrap_or_default(), prefix: false }),
                _ => Some(TextQuery::Phrase(lexemes)),
            };
            (item.map(|i| if negated { TextQuery::Not(Box::new(i)) } else { i }), tail)
        };
        if let Some(item) = item {
            if pending_or && let Some(prev) = items.pop() {
                let merged = match prev {
                    TextQuery::Or(mut alts) => {
                        alts.push(item);
                        TextQuery::Or(alts)
                    }
                    other => TextQuery::Or(vec![other, item]),
                };
                items.push(merged);
            } else {
                items.push(item);
            }
            pending_or = false;
        }
        rest = tail.trim_start();
    }
    TextQuery::And(items)
}

struct RawParser {
    tokens: Vec<String>,
    pos: usize,
    lang: Language,
}

impl RawParser {
    fn new(q: &str, lang: Language) -> Self {
        let mut tokens = Vec::new();
        let mut cur = String::new();
        for c in q.chars() {
            if matches!(c, '&' | '|' | '!' | '(' | ')') || c.is_whitespace() {
                if !cur.is_empty() {
                    tokens.push(std::mem::take(&mut cur));
                }
                if !c.is_whitespace() {
                    tokens.push(c.to_string());
                }
            } else {
                cur.push(c);
            }
        }
        if !cur.is_empty() {
            tokens.push(cur);
        }
        Self { tokens, pos: 0, lang }
    }

    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn parse(mut self) -> RepoResult<TextQuery> {
        let q = self.expr()?;
        match self.peek() {
            None => Ok(q),
            Some(t) => Err(RepoError::Validation(format!("unexpected token {t:?} in search query"))),
        }
    }

    fn expr(&mut self) -> RepoResult<TextQuery> {
        let mut alts = vec![self.conj()?];
        while self.peek() == Some("|") {
            self.pos += 1;
            alts.push(self.conj()?);
        }
        Ok(if alts.len() == 1 { alts.remove(0) } else { TextQuery::Or(alts) })
    }

    fn conj(&mut self) -> RepoResult<TextQuery> {
        let mut parts = vec![self.unary()?];
        while self.peek() == Some("&") {
            self.pos += 1;
            parts.push(self.unary()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { TextQuery::And(parts) })
    }

    fn unary(&mut self) -> RepoResult<TextQuery> {
        let tok = self
            .peek()
            .map(str::to_string)
            .ok_or_else(|| RepoError::Validation("search query ended unexpectedly".into()))?;
        self.pos += 1;
        match tok.as_str() {
            "!" => Ok(TextQuery::Not(Box::new(self.unary()?))),
            "(" => {
                let inner = self.expr()?;
                if self.peek() != Some(")") {
                    return Err(RepoError::Validation("unbalanced parentheses in search query".into()));
                }
                self.pos += 1;
                Ok(inner)
            }
            "&" | "|" | ")" => Err(RepoError::Validation(format!("unexpected {tok:?} in search query"))),
            word => {
                let (word, prefix) = match word.strip_suffix(":*") {
                    Some(w) => (w, true),
                    None => (word, false),
                };
                Ok(TextQuery::Term { lexeme: normalize_word(word, self.lang), prefix })
            }
        }
    }
}

/// Whether `text` matches `query` in the given mode. Malformed queries match nothing.
#[must_use]
pub fn text_matches(text: &str, query: &str, mode: SearchMode, lang: Language) -> bool {
    parse_query(query, mode, lang).is_ok_and(|q| q.matches(&analyze(text, lang)))
}
