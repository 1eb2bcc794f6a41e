pub mod catalog;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use logamizer_core::{AccessEvent, EvidenceSample, Finding, Severity};

use crate::aggregate::hour_bucket;
use crate::finding_fingerprint;

pub use catalog::RuleThresholds;

/// Maximum evidence samples carried by one finding.
pub const DEFAULT_EVIDENCE_LIMIT: usize = 20;

// ---------------------------------------------------------------------------
// Rule definitions
// ---------------------------------------------------------------------------

/// How a rule matches events and accumulates state. Tagged variants instead
/// of trait objects: every rule is one of these three machines.
pub enum RuleKind {
    /// Threshold of matching events per subject inside a time window keyed
    /// on event timestamps.
    SlidingWindow(WindowSpec),
    /// Plain per-subject match counter with a minimum before reporting.
    Counter(CounterSpec),
    /// Per-event pattern match; every matching subject is reported.
    PatternMatch(PatternSpec),
}

pub struct WindowSpec {
    pub window: Duration,
    pub threshold: u64,
    pub trigger: WindowTrigger,
}

pub enum WindowTrigger {
    /// 404 responses (scanner probing).
    NotFound,
    /// 4xx on authentication endpoints (brute force).
    AuthFailure { paths: Vec<String> },
    /// 5xx toward a single client (abuse or a broken scraper).
    ServerError,
}

pub struct CounterSpec {
    pub min_count: u64,
    pub trigger: CounterTrigger,
}

pub enum CounterTrigger {
    EmptyUserAgent,
    SuspiciousMethod,
}

pub struct PatternSpec {
    pub matcher: PatternMatcher,
}

pub enum PatternMatcher {
    AdminPath,
    InjectionSignature,
    SuspiciousUserAgent,
    SensitiveFileExposure,
    PathTraversal,
}

/// A built-in rule: identity, presentation, and its matching machine.
pub struct RuleDef {
    pub id: &'static str,
    pub title: &'static str,
    pub severity: Severity,
    pub suggested_action: &'static str,
    pub kind: RuleKind,
}

/// Result of matching one event: the canonical subject plus optional
/// per-pattern severity.
pub(crate) struct RuleMatch {
    pub(crate) subject: String,
    pub(crate) display: String,
    pub(crate) severity: Option<Severity>,
}

// ---------------------------------------------------------------------------
// Per-subject state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SubjectAcc {
    count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    evidence: Vec<EvidenceSample>,
    display: String,
    severity: Severity,
    /// Window rules only report subjects whose window reached the threshold.
    triggered: bool,
}

impl SubjectAcc {
    fn new(event: &AccessEvent, display: String, severity: Severity) -> Self {
        Self {
            count: 0,
            first_seen: event.timestamp,
            last_seen: event.timestamp,
            evidence: Vec::new(),
            display,
            severity,
            triggered: false,
        }
    }

    fn record(&mut self, event: &AccessEvent, evidence_limit: usize) {
        self.count += 1;
        if event.timestamp < self.first_seen {
            self.first_seen = event.timestamp;
        }
        if event.timestamp > self.last_seen {
            self.last_seen = event.timestamp;
        }
        if self.evidence.len() < evidence_limit {
            self.evidence.push(EvidenceSample {
                line: event.line_number,
                raw: event.raw_line.clone(),
            });
        }
    }
}

struct WindowState {
    ring: VecDeque<DateTime<Utc>>,
    acc: SubjectAcc,
}

enum RuleState {
    SlidingWindow(HashMap<String, WindowState>),
    Counter(HashMap<String, SubjectAcc>),
    PatternMatch(HashMap<String, SubjectAcc>),
}

struct Rule {
    def: RuleDef,
    state: RuleState,
}

impl Rule {
    fn new(def: RuleDef) -> Self {
        let state = match def.kind {
            RuleKind::SlidingWindow(_) => RuleState::SlidingWindow(HashMap::new()),
            RuleKind::Counter(_) => RuleState::Counter(HashMap::new()),
            RuleKind::PatternMatch(_) => RuleState::PatternMatch(HashMap::new()),
        };
        Self { def, state }
    }

    fn step(&mut self, event: &AccessEvent, evidence_limit: usize) {
        match (&self.def.kind, &mut self.state) {
            (RuleKind::SlidingWindow(spec), RuleState::SlidingWindow(states)) => {
                if !catalog::window_matches(&spec.trigger, event) {
                    return;
                }
                let state = states.entry(event.ip.clone()).or_insert_with(|| WindowState {
                    ring: VecDeque::new(),
                    acc: SubjectAcc::new(event, event.ip.clone(), self.def.severity),
                });
                state.acc.record(event, evidence_limit);

                // Ring keyed on event time, not wall clock; evict entries
                // that fell out of the window before counting.
                state.ring.push_back(event.timestamp);
                let cutoff = event.timestamp - spec.window;
                while state.ring.front().is_some_and(|ts| *ts < cutoff) {
                    state.ring.pop_front();
                }
                if state.ring.len() as u64 >= spec.threshold {
                    state.acc.triggered = true;
                }
            }
            (RuleKind::Counter(spec), RuleState::Counter(states)) => {
                let Some(m) = catalog::counter_matches(&spec.trigger, event) else {
                    return;
                };
                let severity = m.severity.unwrap_or(self.def.severity);
                let acc = states
                    .entry(m.subject)
                    .or_insert_with(|| SubjectAcc::new(event, m.display, severity));
                acc.record(event, evidence_limit);
                if acc.count >= spec.min_count {
                    acc.triggered = true;
                }
            }
            (RuleKind::PatternMatch(spec), RuleState::PatternMatch(states)) => {
                let Some(m) = catalog::pattern_matches(&spec.matcher, event) else {
                    return;
                };
                let severity = m.severity.unwrap_or(self.def.severity);
                let acc = states
                    .entry(m.subject)
                    .or_insert_with(|| SubjectAcc::new(event, m.display, severity));
                acc.record(event, evidence_limit);
                acc.triggered = true;
            }
            // States are built from the kinds above; the pairs cannot diverge.
            _ => unreachable!("rule state does not match rule kind"),
        }
    }

    fn finish(self, site_id: &str) -> Vec<Finding> {
        let def = self.def;
        let subjects: Vec<(String, SubjectAcc)> = match self.state {
            RuleState::SlidingWindow(states) => states
                .into_iter()
                .map(|(subject, state)| (subject, state.acc))
                .collect(),
            RuleState::Counter(states) | RuleState::PatternMatch(states) => {
                states.into_iter().collect()
            }
        };

        let mut findings: Vec<Finding> = subjects
            .into_iter()
            .filter(|(_, acc)| acc.triggered)
            .map(|(subject, acc)| {
                let window_key = hour_bucket(acc.first_seen).to_rfc3339();
                Finding {
                    site_id: site_id.to_string(),
                    finding_type: def.id.to_string(),
                    severity: acc.severity,
                    title: def.title.to_string(),
                    description: catalog::describe(def.id, &acc.display, acc.count),
                    subject: subject.clone(),
                    fingerprint: finding_fingerprint(def.id, site_id, &subject, &window_key),
                    evidence: acc.evidence,
                    suggested_action: Some(def.suggested_action.replace("{subject}", &acc.display)),
                    match_count: acc.count,
                    first_seen: acc.first_seen,
                    last_seen: acc.last_seen,
                }
            })
            .collect();

        findings.sort_by(|a, b| a.subject.cmp(&b.subject));
        findings
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Single-pass, order-preserving security scanner. Rules are seeded at run
/// start, stepped once per event in registration order, and emit their
/// findings at end of stream. No state is shared between rules.
pub struct RuleEngine {
    site_id: String,
    evidence_limit: usize,
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(site_id: impl Into<String>, thresholds: &RuleThresholds) -> Self {
        Self {
            site_id: site_id.into(),
            evidence_limit: thresholds.evidence_limit,
            rules: catalog::built_in(thresholds).into_iter().map(Rule::new).collect(),
        }
    }

    pub fn step(&mut self, event: &AccessEvent) {
        for rule in &mut self.rules {
            rule.step(event, self.evidence_limit);
        }
    }

    pub fn finish(self) -> Vec<Finding> {
        let site_id = self.site_id;
        self.rules
            .into_iter()
            .flat_map(|rule| rule.finish(&site_id))
            .collect()
    }
}
