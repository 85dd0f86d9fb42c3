//! Predicate evaluation.
//!
//! A [`Predicate`] is compiled once into a [`CompiledFilter`] (regexes built,
//! addresses normalised) and then evaluated against any number of records.
//! A compiled filter is immutable and `Sync`, so one instance can be shared
//! by every thread filtering a device list.
//!
//! Invalid name patterns never fail evaluation: the leaf evaluates to `false`
//! and the [`PatternError`] is kept in the filter's diagnostics.

use regex::{Regex, RegexBuilder};
use thiserror::Error;
use uuid::Uuid;

use crate::decoder::vendor::ContactHash;
use crate::filter::predicate::Predicate;
use crate::logging::structured::LogContext;
use crate::storage::models::DeviceRecord;

/// Upper bound on compiled regex size for user-supplied patterns.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// A name pattern that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid pattern {pattern:?}: {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

/// Inputs that are not part of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalContext {
    pub now_ms: i64,
}

impl EvalContext {
    pub fn at(now_ms: i64) -> Self {
        Self { now_ms }
    }

    pub fn now() -> Self {
        Self {
            now_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug)]
enum Node {
    All(Vec<Node>),
    Any(Vec<Node>),
    Not(Box<Node>),
    Manufacturer(u16),
    Tag(String),
    Favorite(bool),
    /// `None` when the pattern was invalid.
    Name(Option<Regex>),
    Address(String),
    MinRssi(i16),
    LastSeenWithin(i64),
    FirstSeenBetween(Option<i64>, Option<i64>),
    MinDetectCount(u64),
    ServiceUuid(Uuid),
    Contact(ContactHash),
    IsFollowing,
    IsPaired,
    IsConnectable,
}

/// A predicate ready for repeated evaluation.
#[derive(Debug)]
pub struct CompiledFilter {
    root: Node,
    diagnostics: Vec<PatternError>,
}

impl CompiledFilter {
    pub fn compile(predicate: &Predicate) -> Self {
        let mut diagnostics = Vec::new();
        let root = compile_node(predicate, &mut diagnostics);
        Self { root, diagnostics }
    }

    /// Compile and log every invalid pattern under `ctx`.
    pub fn compile_logged(predicate: &Predicate, ctx: &LogContext) -> Self {
        let filter = Self::compile(predicate);
        for err in &filter.diagnostics {
            crate::log_warn!(
                ctx,
                "FILTER_PATTERN_INVALID",
                pattern = err.pattern.as_str(),
                reason = err.reason.as_str()
            );
        }
        filter
    }

    pub fn diagnostics(&self) -> &[PatternError] {
        &self.diagnostics
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn evaluate(&self, record: &DeviceRecord, ctx: &EvalContext) -> bool {
        eval_node(&self.root, record, ctx)
    }
}

/// Evaluate a predicate once. Pattern failures are reported, not raised.
pub fn evaluate(predicate: &Predicate, record: &DeviceRecord, ctx: &EvalContext) -> bool {
    let filter = CompiledFilter::compile(predicate);
    for err in filter.diagnostics() {
        log::warn!(
            "[device={}] FILTER_PATTERN_INVALID pattern={:?} reason={}",
            record.address,
            err.pattern,
            err.reason
        );
    }
    filter.evaluate(record, ctx)
}

fn compile_node(predicate: &Predicate, diagnostics: &mut Vec<PatternError>) -> Node {
    match predicate {
        Predicate::All { filters } => {
            Node::All(filters.iter().map(|f| compile_node(f, diagnostics)).collect())
        }
        Predicate::Any { filters } => {
            Node::Any(filters.iter().map(|f| compile_node(f, diagnostics)).collect())
        }
        Predicate::Not { filter } => Node::Not(Box::new(compile_node(filter, diagnostics))),
        Predicate::Manufacturer { id } => Node::Manufacturer(*id),
        Predicate::ByTag { tag } => Node::Tag(tag.clone()),
        Predicate::IsFavorite { favorite } => Node::Favorite(*favorite),
        Predicate::Name {
            pattern,
            ignore_case,
        } => {
            let compiled = RegexBuilder::new(pattern)
                .case_insensitive(*ignore_case)
                .size_limit(PATTERN_SIZE_LIMIT)
                .build();
            match compiled {
                Ok(regex) => Node::Name(Some(regex)),
                Err(e) => {
                    diagnostics.push(PatternError {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    });
                    Node::Name(None)
                }
            }
        }
        Predicate::Address { address } => Node::Address(address.to_ascii_lowercase()),
        Predicate::MinRssi { min_rssi } => Node::MinRssi(*min_rssi),
        Predicate::LastSeenWithin { within_ms } => Node::LastSeenWithin(*within_ms),
        Predicate::FirstSeenBetween { from_ms, to_ms } => Node::FirstSeenBetween(*from_ms, *to_ms),
        Predicate::MinDetectCount { count } => Node::MinDetectCount(*count),
        Predicate::ServiceUuid { uuid } => Node::ServiceUuid(*uuid),
        Predicate::AirdropContact { hash } => Node::Contact(*hash),
        Predicate::IsFollowing => Node::IsFollowing,
        Predicate::IsPaired => Node::IsPaired,
        Predicate::IsConnectable => Node::IsConnectable,
    }
}

fn eval_node(node: &Node, record: &DeviceRecord, ctx: &EvalContext) -> bool {
    match node {
        Node::All(children) => children.iter().all(|c| eval_node(c, record, ctx)),
        Node::Any(children) => children.iter().any(|c| eval_node(c, record, ctx)),
        Node::Not(child) => !eval_node(child, record, ctx),
        Node::Manufacturer(id) => record.manufacturer_id() == Some(*id),
        Node::Tag(tag) => record.tags.contains(tag),
        Node::Favorite(favorite) => record.favorite == *favorite,
        Node::Name(regex) => regex
            .as_ref()
            .map_or(false, |re| candidate_names(record).any(|name| re.is_match(name))),
        Node::Address(address) => record.address.eq_ignore_ascii_case(address),
        Node::MinRssi(min) => record.rssi.map_or(false, |rssi| rssi >= *min),
        Node::LastSeenWithin(within) => ctx.now_ms - record.last_seen_ms <= *within,
        Node::FirstSeenBetween(from, to) => {
            from.map_or(true, |from| record.first_seen_ms >= from)
                && to.map_or(true, |to| record.first_seen_ms <= to)
        }
        Node::MinDetectCount(count) => record.detect_count >= *count,
        Node::ServiceUuid(uuid) => record.service_uuids.contains(uuid),
        Node::Contact(hash) => record.contact_hashes().any(|h| h == *hash),
        Node::IsFollowing => record.last_following_detection_ms.is_some(),
        Node::IsPaired => record.is_paired,
        Node::IsConnectable => record.is_connectable,
    }
}

fn candidate_names(record: &DeviceRecord) -> impl Iterator<Item = &str> {
    [
        record.custom_name.as_deref(),
        record
            .metadata
            .as_ref()
            .and_then(|m| m.device_name.as_deref()),
        record.name.as_deref(),
    ]
    .into_iter()
    .flatten()
}

/// Free-text device search.
///
/// Case-insensitive substring over names, manufacturer and address, or a
/// full regex match of the query against the address or resolved name. A
/// query that is not a valid regex only does substring matching.
#[derive(Debug)]
pub struct SearchQuery {
    needle: String,
    regex: Option<Regex>,
}

impl SearchQuery {
    /// `None` for a blank query, which matches everything.
    pub fn parse(query: &str) -> Option<Self> {
        if query.trim().is_empty() {
            return None;
        }
        let regex = RegexBuilder::new(&format!("^(?:{})$", query))
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .ok();
        Some(Self {
            needle: query.to_lowercase(),
            regex,
        })
    }

    pub fn matches(&self, record: &DeviceRecord) -> bool {
        let contains = |s: Option<&str>| s.map_or(false, |s| s.to_lowercase().contains(&self.needle));

        let metadata = record.metadata.as_ref();
        contains(record.resolved_name())
            || contains(metadata.and_then(|m| m.device_name.as_deref()))
            || contains(metadata.and_then(|m| m.manufacturer_name.as_deref()))
            || contains(metadata.and_then(|m| m.model_number.as_deref()))
            || contains(record.custom_name.as_deref())
            || contains(record.manufacturer.as_ref().and_then(|m| m.name.as_deref()))
            || contains(Some(record.address.as_str()))
            || self.regex.as_ref().map_or(false, |re| {
                re.is_match(&record.address)
                    || record.resolved_name().map_or(false, |n| re.is_match(n))
            })
    }
}

/// One-shot form of [`SearchQuery::matches`].
pub fn matches_query(record: &DeviceRecord, query: &str) -> bool {
    SearchQuery::parse(query).map_or(true, |q| q.matches(record))
}

/// Filter a device list by an optional filter and an optional search query.
///
/// The list is split into `chunk_size` chunks which are evaluated on scoped
/// worker threads. Output order matches input order.
pub fn filter_devices(
    records: &[DeviceRecord],
    filter: Option<&CompiledFilter>,
    query: Option<&str>,
    ctx: &EvalContext,
    chunk_size: usize,
) -> Vec<DeviceRecord> {
    let query = query.and_then(SearchQuery::parse);
    if filter.is_none() && query.is_none() {
        return records.to_vec();
    }

    let keep = |record: &DeviceRecord| {
        filter.map_or(true, |f| f.evaluate(record, ctx))
            && query.as_ref().map_or(true, |q| q.matches(record))
    };

    let chunk_size = chunk_size.max(1);
    if records.len() <= chunk_size {
        return records.iter().filter(|r| keep(*r)).cloned().collect();
    }

    let chunks: Vec<&[DeviceRecord]> = records.chunks(chunk_size).collect();
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(chunks.len());

    let mut slots: Vec<Vec<DeviceRecord>> = vec![Vec::new(); chunks.len()];
    std::thread::scope(|scope| {
        let keep = &keep;
        let chunks = &chunks;
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                scope.spawn(move || {
                    (worker..chunks.len())
                        .step_by(workers)
                        .map(|idx| {
                            let kept: Vec<DeviceRecord> =
                                chunks[idx].iter().filter(|r| keep(*r)).cloned().collect();
                            (idx, kept)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok(results) => {
                    for (idx, kept) in results {
                        slots[idx] = kept;
                    }
                }
                Err(_) => log::error!("FILTER_WORKER_PANICKED"),
            }
        }
    });

    slots.into_iter().flatten().collect()
}
