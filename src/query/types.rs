use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// Guards against pathological inputs
pub const MAX_PATH_DEPTH: usize = 32;
pub const MAX_IN_SET: usize = 10_000;
pub const MAX_SORT_FIELDS: usize = 8;
pub const MAX_TERMS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Comparison {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "eq" | "exact" => Self::Eq,
            "ne" | "neq" => Self::Ne,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            _ => return None,
        })
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
        }
    }

    #[must_use]
    pub fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    #[must_use]
    pub fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Self::Eq => ord == Equal,
            Self::Ne => ord != Equal,
            Self::Lt => ord == Less,
            Self::Lte => ord != Greater,
            Self::Gt => ord == Greater,
            Self::Gte => ord != Less,
        }
    }
}

/// Component extracted from a timestamp before comparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalPart {
    Date,
    Year,
    Month,
    Day,
    Week,
    Quarter,
}

impl TemporalPart {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "date" => Self::Date,
            "year" => Self::Year,
            "month" => Self::Month,
            "day" => Self::Day,
            "week" => Self::Week,
            "quarter" => Self::Quarter,
            _ => return None,
        })
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Date => "date",
            Self::Year => "year",
            Self::Month => "month",
            Self::Day => "day",
            Self::Week => "week",
            Self::Quarter => "quarter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Every query term must appear.
    #[default]
    Plain,
    /// Query terms must appear consecutively.
    Phrase,
    /// Quoted phrases, `-exclusions` and `OR`.
    Websearch,
    /// Boolean query syntax: `&`, `|`, `!`, parentheses and `:*` prefixes.
    Raw,
}

impl SearchMode {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Phrase => "phrase",
            Self::Websearch => "websearch",
            Self::Raw => "raw",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "plain" | "simple" => Self::Plain,
            "phrase" => Self::Phrase,
            "websearch" => Self::Websearch,
            "raw" => Self::Raw,
            _ => return None,
        })
    }
}

/// Text search configuration; selects stemming and stop words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Simple,
    #[default]
    English,
    Spanish,
    French,
    German,
    Portuguese,
    Italian,
    Dutch,
    Russian,
}

impl Language {
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "simple" => Self::Simple,
            "en" | "english" => Self::English,
            "es" | "spanish" => Self::Spanish,
            "fr" | "french" => Self::French,
            "de" | "german" => Self::German,
            "pt" | "portuguese" => Self::Portuguese,
            "it" | "italian" => Self::Italian,
            "nl" | "dutch" => Self::Dutch,
            "ru" | "russian" => Self::Russian,
            _ => return None,
        })
    }

    /// Name of the matching PostgreSQL text search configuration.
    #[must_use]
    pub fn pg_config(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::English => "english",
            Self::Spanish => "spanish",
            Self::French => "french",
            Self::German => "german",
            Self::Portuguese => "portuguese",
            Self::Italian => "italian",
            Self::Dutch => "dutch",
            Self::Russian => "russian",
        }
    }
}

/// Filter operator, the suffix after the last `__` of a filter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Cmp(Comparison),
    In,
    NotIn,
    Between,
    NotBetween,
    Like,
    Ilike,
    StartsWith,
    EndsWith,
    Contains,
    Regex,
    IsNull,
    IsNotNull,
    Temporal(TemporalPart, Comparison),
    JsonContains,
    JsonHasKey,
    JsonExtract,
    Search(SearchMode, Language),
}

impl Operator {
    /// Parses a single operator suffix. Temporal parts parse as equality.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(c) = Comparison::parse(s) {
            return Some(Self::Cmp(c));
        }
        if let Some(p) = TemporalPart::parse(s) {
            return Some(Self::Temporal(p, Comparison::Eq));
        }
        Some(match s {
            "in" => Self::In,
            "not_in" | "nin" => Self::NotIn,
            "between" | "range" => Self::Between,
            "not_between" => Self::NotBetween,
            "like" => Self::Like,
            "ilike" => Self::Ilike,
            "startswith" => Self::StartsWith,
            "endswith" => Self::EndsWith,
            "contains" => Self::Contains,
            "regex" => Self::Regex,
            "isnull" => Self::IsNull,
            "isnotnull" => Self::IsNotNull,
            "json_contains" => Self::JsonContains,
            "json_has_key" => Self::JsonHasKey,
            "json_extract" => Self::JsonExtract,
            "search" => Self::Search(SearchMode::Plain, Language::English),
            "search_phrase" => Self::Search(SearchMode::Phrase, Language::English),
            "search_websearch" => Self::Search(SearchMode::Websearch, Language::English),
            "search_raw" => Self::Search(SearchMode::Raw, Language::English),
            other => {
                // search_<lang> or search_<mode>_<lang>
                let rest = other.strip_prefix("search_")?;
                for mode in [SearchMode::Phrase, SearchMode::Websearch, SearchMode::Raw] {
                    if let Some(code) = rest.strip_prefix(mode.name()).and_then(|r| r.strip_prefix('_')) {
                        return Language::from_code(code).map(|lang| Self::Search(mode, lang));
                    }
                }
                Self::Search(SearchMode::Plain, Language::from_code(rest)?)
            }
        })
    }

    /// Whether a suffix names an operator, so it is not mistaken for a path segment.
    #[must_use]
    pub fn is_operator_name(s: &str) -> bool {
        Self::parse(s).is_some()
    }

    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Cmp(c) => c.name().to_string(),
            Self::In => "in".into(),
            Self::NotIn => "not_in".into(),
            Self::Between => "between".into(),
            Self::NotBetween => "not_between".into(),
            Self::Like => "like".into(),
            Self::Ilike => "ilike".into(),
            Self::StartsWith => "startswith".into(),
            Self::EndsWith => "endswith".into(),
            Self::Contains => "contains".into(),
            Self::Regex => "regex".into(),
            Self::IsNull => "isnull".into(),
            Self::IsNotNull => "isnotnull".into(),
            Self::Temporal(p, Comparison::Eq) => p.name().to_string(),
            Self::Temporal(p, c) => format!("{}__{}", p.name(), c.name()),
            Self::JsonContains => "json_contains".into(),
            Self::JsonHasKey => "json_has_key".into(),
            Self::JsonExtract => "json_extract".into(),
            Self::Search(mode, lang) => {
                let base = match mode {
                    SearchMode::Plain => "search".to_string(),
                    m => format!("search_{}", m.name()),
                };
                if *lang == Language::English { base } else { format!("{base}_{}", lang.pg_config()) }
            }
        }
    }
}

/// Dotted path as written by the caller: `author.name`, `meta__owner__id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    pub segments: Vec<String>,
}

impl FieldPath {
    #[must_use]
    pub fn new(path: &str) -> Self {
        let segments = path
            .split('.')
            .flat_map(|s| s.split("__"))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { segments }
    }

    #[must_use]
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    #[must_use]
    pub fn head(&self) -> &str {
        self.segments.first().map_or("", String::as_str)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// One parsed filter condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterTerm {
    pub field: FieldPath,
    pub operator: Operator,
    pub value: Value,
}

impl FilterTerm {
    #[must_use]
    pub fn new(field: &str, operator: Operator, value: impl Into<Value>) -> Self {
        Self { field: FieldPath::new(field), operator, value: value.into() }
    }

    #[must_use]
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Cmp(Comparison::Eq), value)
    }
}

/// Conjunction of filter terms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterExpression {
    pub terms: Vec<FilterTerm>,
}

impl FilterExpression {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.terms.push(FilterTerm::eq(field, value));
        self
    }

    #[must_use]
    pub fn with_op(mut self, field: &str, operator: Operator, value: impl Into<Value>) -> Self {
        self.terms.push(FilterTerm::new(field, operator, value));
        self
    }

    #[must_use]
    pub fn with_term(mut self, term: FilterTerm) -> Self {
        self.terms.push(term);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// `and_filters` AND (any of `or_filters`) AND NOT each of `not_filters`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexFilter {
    #[serde(default)]
    pub and_filters: FilterExpression,
    #[serde(default)]
    pub or_filters: Vec<FilterExpression>,
    #[serde(default)]
    pub not_filters: FilterExpression,
}

/// Filters accepted by read and bulk operations.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterInput {
    Simple(FilterExpression),
    Complex(ComplexFilter),
}

impl Default for FilterInput {
    fn default() -> Self {
        Self::Simple(FilterExpression::default())
    }
}

impl From<FilterExpression> for FilterInput {
    fn from(f: FilterExpression) -> Self {
        Self::Simple(f)
    }
}

impl From<ComplexFilter> for FilterInput {
    fn from(f: ComplexFilter) -> Self {
        Self::Complex(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub order: Order,
}

impl SortSpec {
    #[must_use]
    pub fn asc(field: &str) -> Self {
        Self { field: field.to_string(), order: Order::Asc }
    }

    #[must_use]
    pub fn desc(field: &str) -> Self {
        Self { field: field.to_string(), order: Order::Desc }
    }

    /// `-name` sorts descending, `name` ascending.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix('-') {
            Some(f) => Self::desc(f),
            None => Self::asc(s.trim_start_matches('+')),
        }
    }
}

/// Direction of a cursor page relative to its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Next,
    Prev,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_names_parse() {
        assert_eq!(Operator::parse("gte"), Some(Operator::Cmp(Comparison::Gte)));
        assert_eq!(Operator::parse("year"), Some(Operator::Temporal(TemporalPart::Year, Comparison::Eq)));
        assert_eq!(
            Operator::parse("search_es"),
            Some(Operator::Search(SearchMode::Plain, Language::Spanish))
        );
        assert_eq!(Operator::parse("search_xx"), None);
        assert_eq!(Operator::parse("name"), None);
        assert_eq!(Operator::Temporal(TemporalPart::Year, Comparison::Gte).name(), "year__gte");
    }

    #[test]
    fn search_names_keep_the_language() {
        let phrase_fr = Operator::Search(SearchMode::Phrase, Language::French);
        let phrase_en = Operator::Search(SearchMode::Phrase, Language::English);
        assert_eq!(phrase_fr.name(), "search_phrase_french");
        assert_ne!(phrase_fr.name(), phrase_en.name());
        assert_eq!(Operator::parse("search_raw_de"), Some(Operator::Search(SearchMode::Raw, Language::German)));
        assert_eq!(Operator::parse("search_phrase_xx"), None);
        for mode in [SearchMode::Plain, SearchMode::Phrase, SearchMode::Websearch, SearchMode::Raw] {
            for lang in [Language::English, Language::Simple, Language::Russian] {
                let op = Operator::Search(mode, lang);
                assert_eq!(Operator::parse(&op.name()), Some(op));
            }
        }
    }

    #[test]
    fn field_paths_accept_both_separators() {
        assert_eq!(FieldPath::new("author.name").segments, vec!["author", "name"]);
        assert_eq!(FieldPath::new("author__name").segments, vec!["author", "name"]);
        assert_eq!(FieldPath::new("meta.a__b").to_string(), "meta.a.b");
    }

    #[test]
    fn sort_spec_prefix() {
        assert_eq!(SortSpec::parse("-created_at"), SortSpec::desc("created_at"));
        assert_eq!(SortSpec::parse("name"), SortSpec::asc("name"));
    }
}
