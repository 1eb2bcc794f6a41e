//! The built-in rule set and its matchers.

use std::sync::LazyLock;

use chrono::Duration;
use logamizer_core::{AccessEvent, Severity, StatusClass};
use percent_encoding::percent_decode_str;
use regex::Regex;

use super::{
    CounterSpec, CounterTrigger, PatternMatcher, PatternSpec, RuleDef, RuleKind, RuleMatch,
    WindowSpec, WindowTrigger, DEFAULT_EVIDENCE_LIMIT,
};

/// Engine thresholds; mirrors the `[rules]` configuration table.
#[derive(Debug, Clone)]
pub struct RuleThresholds {
    pub scanner_threshold: u64,
    pub scanner_window_minutes: u64,
    pub brute_force_threshold: u64,
    pub brute_force_window_minutes: u64,
    pub server_error_threshold: u64,
    pub server_error_window_minutes: u64,
    pub empty_ua_min_count: u64,
    pub extra_auth_paths: Vec<String>,
    pub evidence_limit: usize,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            scanner_threshold: 20,
            scanner_window_minutes: 10,
            brute_force_threshold: 10,
            brute_force_window_minutes: 5,
            server_error_threshold: 10,
            server_error_window_minutes: 5,
            empty_ua_min_count: 5,
            extra_auth_paths: Vec::new(),
            evidence_limit: DEFAULT_EVIDENCE_LIMIT,
        }
    }
}

const AUTH_PATHS: &[&str] = &[
    "/login",
    "/signin",
    "/sign-in",
    "/auth",
    "/wp-login",
    "/account/login",
    "/user/login",
    "/api/login",
    "/api/auth",
    "/xmlrpc.php",
];

/// Admin/console paths probed by scanners: (label, pattern, severity).
static ADMIN_PATTERNS: LazyLock<Vec<(&'static str, Regex, Severity)>> = LazyLock::new(|| {
    vec![
        ("env_file", Regex::new(r"(?i)/\.env(\.|$|\?)").unwrap(), Severity::Critical),
        ("git_dir", Regex::new(r"(?i)/\.git(/|$)").unwrap(), Severity::Critical),
        ("wordpress_admin", Regex::new(r"(?i)/wp-(admin|login)").unwrap(), Severity::Medium),
        ("phpmyadmin", Regex::new(r"(?i)/(phpmyadmin|pma)(/|$)").unwrap(), Severity::Medium),
        ("cgi_bin", Regex::new(r"(?i)/cgi-bin/").unwrap(), Severity::Medium),
        ("joomla_admin", Regex::new(r"(?i)/administrator(/|$)").unwrap(), Severity::Medium),
    ]
});

/// Injection signature families, tried in order; first match claims the event.
static SIGNATURE_FAMILIES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        (
            "sqli",
            Regex::new(
                r"(?i)(union\s+(all\s+)?select|select\s+.+\s+from\s|sleep\s*\(|benchmark\s*\(|'\s*or\s*'?1'?\s*=\s*'?1|;\s*drop\s+table)",
            )
            .unwrap(),
        ),
        (
            "xss",
            Regex::new(r"(?i)(<script|%3cscript|onerror\s*=|onload\s*=|javascript:|alert\s*\()").unwrap(),
        ),
    ]
});

static SENSITIVE_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\.env|\.git|\.sql($|\?)|\.bak($|\?)|\.pem($|\?)|backup|dump|id_rsa|wp-config\.php|\.htpasswd)",
    )
    .unwrap()
});

/// Known-bad user agents, matched as lowercase substrings.
const BAD_USER_AGENTS: &[&str] = &[
    "sqlmap", "nikto", "masscan", "nmap", "dirbuster", "gobuster", "wpscan", "hydra", "zgrab",
    "acunetix", "nessus", "havij",
];

/// Built-in rules in their fixed registration order.
pub(crate) fn built_in(t: &RuleThresholds) -> Vec<RuleDef> {
    let mut auth_paths: Vec<String> = AUTH_PATHS.iter().map(|p| p.to_string()).collect();
    auth_paths.extend(t.extra_auth_paths.iter().map(|p| p.to_lowercase()));

    vec![
        RuleDef {
            id: "scanner.probing",
            title: "Scanner probing detected",
            severity: Severity::High,
            suggested_action: "Block IP {subject} at the firewall and review WAF rate limits.",
            kind: RuleKind::SlidingWindow(WindowSpec {
                window: Duration::minutes(t.scanner_window_minutes as i64),
                threshold: t.scanner_threshold,
                trigger: WindowTrigger::NotFound,
            }),
        },
        RuleDef {
            id: "auth.brute_force",
            title: "Possible brute-force against authentication",
            severity: Severity::High,
            suggested_action: "Rate-limit or block IP {subject} and enforce lockouts on the login endpoint.",
            kind: RuleKind::SlidingWindow(WindowSpec {
                window: Duration::minutes(t.brute_force_window_minutes as i64),
                threshold: t.brute_force_threshold,
                trigger: WindowTrigger::AuthFailure { paths: auth_paths },
            }),
        },
        RuleDef {
            id: "abuse.server_errors",
            title: "High rate of 5xx responses to a single client",
            severity: Severity::High,
            suggested_action: "Investigate server errors and rate-limit IP {subject} if abusive.",
            kind: RuleKind::SlidingWindow(WindowSpec {
                window: Duration::minutes(t.server_error_window_minutes as i64),
                threshold: t.server_error_threshold,
                trigger: WindowTrigger::ServerError,
            }),
        },
        RuleDef {
            id: "probe.admin_path",
            title: "Admin path probe detected",
            severity: Severity::Medium,
            suggested_action: "Block {subject} if the path is unused, or restrict it to trusted networks.",
            kind: RuleKind::PatternMatch(PatternSpec {
                matcher: PatternMatcher::AdminPath,
            }),
        },
        RuleDef {
            id: "signature.injection",
            title: "Injection signature in query string",
            severity: Severity::High,
            suggested_action: "Block {subject} and verify input validation on the targeted endpoints.",
            kind: RuleKind::PatternMatch(PatternSpec {
                matcher: PatternMatcher::InjectionSignature,
            }),
        },
        RuleDef {
            id: "ua.suspicious",
            title: "Known attack tool user agent",
            severity: Severity::Medium,
            suggested_action: "Block clients presenting the {subject} user agent.",
            kind: RuleKind::PatternMatch(PatternSpec {
                matcher: PatternMatcher::SuspiciousUserAgent,
            }),
        },
        RuleDef {
            id: "exposure.sensitive_file",
            title: "Sensitive file served successfully",
            severity: Severity::Critical,
            suggested_action: "Remove {subject} from the web root and rotate any exposed secrets.",
            kind: RuleKind::PatternMatch(PatternSpec {
                matcher: PatternMatcher::SensitiveFileExposure,
            }),
        },
        RuleDef {
            id: "traversal.path",
            title: "Directory traversal attempt",
            severity: Severity::High,
            suggested_action: "Block IP {subject} and review path normalization in the application.",
            kind: RuleKind::PatternMatch(PatternSpec {
                matcher: PatternMatcher::PathTraversal,
            }),
        },
        RuleDef {
            id: "ua.missing",
            title: "Requests without a user agent",
            severity: Severity::Low,
            suggested_action: "Consider blocking automated clients from IP {subject}.",
            kind: RuleKind::Counter(CounterSpec {
                min_count: t.empty_ua_min_count,
                trigger: CounterTrigger::EmptyUserAgent,
            }),
        },
        RuleDef {
            id: "method.suspicious",
            title: "Suspicious HTTP method",
            severity: Severity::Medium,
            suggested_action: "Disable TRACE/CONNECT on the server and block IP {subject} if needed.",
            kind: RuleKind::Counter(CounterSpec {
                min_count: 1,
                trigger: CounterTrigger::SuspiciousMethod,
            }),
        },
    ]
}

// ---------------------------------------------------------------------------
// Matchers
// ---------------------------------------------------------------------------

pub(crate) fn window_matches(trigger: &WindowTrigger, event: &AccessEvent) -> bool {
    match trigger {
        WindowTrigger::NotFound => event.status == 404,
        WindowTrigger::AuthFailure { paths } => {
            event.status_class() == StatusClass::ClientError && {
                let path = event.path.to_lowercase();
                paths.iter().any(|p| path.contains(p.as_str()))
            }
        }
        WindowTrigger::ServerError => event.status_class() == StatusClass::ServerError,
    }
}

pub(crate) fn counter_matches(trigger: &CounterTrigger, event: &AccessEvent) -> Option<RuleMatch> {
    match trigger {
        CounterTrigger::EmptyUserAgent => match &event.user_agent {
            None => Some(RuleMatch {
                subject: event.ip.clone(),
                display: event.ip.clone(),
                severity: None,
            }),
            Some(_) => None,
        },
        CounterTrigger::SuspiciousMethod => {
            if event.method == "TRACE" || event.method == "CONNECT" {
                Some(RuleMatch {
                    subject: event.ip.clone(),
                    display: event.ip.clone(),
                    severity: None,
                })
            } else {
                None
            }
        }
    }
}

pub(crate) fn pattern_matches(matcher: &PatternMatcher, event: &AccessEvent) -> Option<RuleMatch> {
    match matcher {
        PatternMatcher::AdminPath => {
            let (label, _, severity) = ADMIN_PATTERNS
                .iter()
                .find(|(_, re, _)| re.is_match(&event.path))?;
            Some(RuleMatch {
                subject: format!("{}|{}", event.ip, label),
                display: format!("{} ({})", event.ip, label),
                severity: Some(*severity),
            })
        }
        PatternMatcher::InjectionSignature => {
            let query = decoded_query(&event.path)?;
            let (family, _) = SIGNATURE_FAMILIES.iter().find(|(_, re)| re.is_match(&query))?;
            Some(RuleMatch {
                subject: format!("{}|{}", event.ip, family),
                display: format!("{} ({})", event.ip, family),
                severity: None,
            })
        }
        PatternMatcher::SuspiciousUserAgent => {
            let ua = event.user_agent.as_deref()?;
            let lower = ua.to_lowercase();
            BAD_USER_AGENTS
                .iter()
                .any(|bad| lower.contains(bad))
                .then(|| RuleMatch {
                    subject: ua.to_string(),
                    display: ua.to_string(),
                    severity: None,
                })
        }
        PatternMatcher::SensitiveFileExposure => {
            if event.status_class() != StatusClass::Success {
                return None;
            }
            let path_only = event.path.split('?').next().unwrap_or(&event.path);
            SENSITIVE_FILE_RE.is_match(path_only).then(|| RuleMatch {
                subject: path_only.to_string(),
                display: path_only.to_string(),
                severity: None,
            })
        }
        PatternMatcher::PathTraversal => {
            let decoded = percent_decode_str(&event.path).decode_utf8_lossy();
            has_traversal(&decoded).then(|| RuleMatch {
                subject: format!("{}|{}", event.ip, decoded),
                display: format!("{} ({})", event.ip, decoded),
                severity: None,
            })
        }
    }
}

/// Query string with percent- and plus-decoding applied; None when the path
/// carries no query.
fn decoded_query(path: &str) -> Option<String> {
    let (_, query) = path.split_once('?')?;
    let decoded = percent_decode_str(query).decode_utf8_lossy();
    Some(decoded.replace('+', " "))
}

fn has_traversal(path: &str) -> bool {
    path.contains("../") || path.contains("..\\") || path.ends_with("/..")
}

pub(crate) fn describe(rule_id: &str, display: &str, count: u64) -> String {
    match rule_id {
        "scanner.probing" => format!(
            "{count} requests producing 404 responses from IP {display} within a short window"
        ),
        "auth.brute_force" => format!(
            "{count} failed requests to authentication endpoints from IP {display}"
        ),
        "abuse.server_errors" => format!("{count} 5xx responses served to IP {display}"),
        "probe.admin_path" => format!("{count} probe requests to administrative paths from {display}"),
        "signature.injection" => format!("{count} requests with injection signatures from {display}"),
        "ua.suspicious" => format!("{count} requests using the known attack tool user agent {display}"),
        "exposure.sensitive_file" => format!(
            "Sensitive path {display} answered with a success status {count} time(s)"
        ),
        "traversal.path" => format!("{count} request(s) with traversal sequences from {display}"),
        "ua.missing" => format!("{count} requests without a user-agent header from IP {display}"),
        "method.suspicious" => format!("{count} TRACE/CONNECT requests from IP {display}"),
        _ => format!("{count} matching events for {display}"),
    }
}
