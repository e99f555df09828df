// Filter language, compilation to predicates, plans and their renderings
mod compile;
pub mod cursor;
pub mod eval;
pub mod fulltext;
mod parse;
mod plan;
mod predicate;
pub mod sql;
mod types;

pub use compile::{CompiledFilter, FilterCompiler, canonical_json};
pub use cursor::{CursorPage, CursorToken};
pub use eval::{Row, compare_values, eval_predicate};
pub use parse::{parse_filter_json, parse_filter_map, parse_filter_value, parse_key, parse_term};
pub use plan::{
    AggregateOp, AggregationRow, AggregationSpec, Fingerprint, Pagination, PlanKind, QueryPlan,
    SearchSpec,
};
pub use predicate::{CompiledTerm, JoinSpec, Predicate, ResolvedPath};
pub use sql::{SqlParam, SqlQuery, SqlRenderer};
pub use types::{
    Comparison, ComplexFilter, Direction, FieldPath, FilterExpression, FilterInput, FilterTerm,
    Language, MAX_IN_SET, MAX_PATH_DEPTH, MAX_SORT_FIELDS, Operator, Order, SearchMode, SortSpec,
    TemporalPart,
};
