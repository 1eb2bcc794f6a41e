use std::collections::HashSet;

use logamizer_core::AccessEvent;

/// Drops events from a site's hidden IPs before they reach aggregation and
/// rules. Applied at pipeline time so the uploaded raw data stays intact and
/// can be re-materialized after the hidden set changes.
#[derive(Debug, Clone, Default)]
pub struct HiddenIpFilter {
    ips: HashSet<String>,
}

impl HiddenIpFilter {
    pub fn new(hidden_ips: &[String]) -> Self {
        Self {
            ips: hidden_ips.iter().map(|ip| ip.trim().to_string()).collect(),
        }
    }

    pub fn is_hidden(&self, ip: &str) -> bool {
        self.ips.contains(ip)
    }

    pub fn allows(&self, event: &AccessEvent) -> bool {
        !self.is_hidden(&event.ip)
    }
}
