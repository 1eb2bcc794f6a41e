pub mod access;
pub mod error_log;

use logamizer_core::ParseQuality;

pub use access::AccessLogParser;
pub use error_log::ErrorLogParser;

/// A single line that failed to parse. Counted, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    pub message: String,
}

impl LineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of a stream parse: the events plus the quality report.
#[derive(Debug, Clone)]
pub struct ParseOutput<E> {
    pub events: Vec<E>,
    pub quality: ParseQuality,
}

/// Line-level parser contract shared by the access and error recognizers.
///
/// `parse_line` returns `Ok(None)` for lines that are skipped (empty or
/// comments) and `Err` for lines no recognizer claims. `parse_stream` folds a
/// line sequence into events plus quality counters; drivers that need to
/// interleave stages call `parse_line` themselves and keep the same counters
/// through [`track_line`].
pub trait LineParser {
    type Event;

    fn parse_line(&self, line: &str, line_number: u64) -> Result<Option<Self::Event>, LineError>;

    fn parse_stream(&self, lines: impl Iterator<Item = (u64, String)>) -> ParseOutput<Self::Event> {
        let mut events = Vec::new();
        let mut quality = ParseQuality::default();
        for (line_number, line) in lines {
            if let Some(event) = track_line(self, &mut quality, &line, line_number) {
                events.push(event);
            }
        }
        ParseOutput { events, quality }
    }
}

/// Parse one line, updating the quality counters. Returns the event when the
/// line parsed.
pub fn track_line<P: LineParser + ?Sized>(
    parser: &P,
    quality: &mut ParseQuality,
    line: &str,
    line_number: u64,
) -> Option<P::Event> {
    quality.total_lines += 1;
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        quality.empty_lines += 1;
        return None;
    }
    match parser.parse_line(trimmed, line_number) {
        Ok(Some(event)) => {
            quality.parsed_lines += 1;
            Some(event)
        }
        Ok(None) => {
            quality.empty_lines += 1;
            None
        }
        Err(e) => {
            quality.record_failure(line_number, trimmed, e.message);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logamizer_core::LogFormat;

    #[test]
    fn stream_counts_empty_comment_failed() {
        let parser = AccessLogParser::new(LogFormat::Auto);
        let lines = vec![
            (1, "".to_string()),
            (2, "# comment".to_string()),
            (3, "definitely not a log line".to_string()),
            (
                4,
                r#"203.0.113.42 - - [23/Jan/2026:17:36:10 +0000] "GET / HTTP/1.1" 200 532 "-" "curl/8.0""#
                    .to_string(),
            ),
        ];
        let out = parser.parse_stream(lines.into_iter());
        assert_eq!(out.quality.total_lines, 4);
        assert_eq!(out.quality.empty_lines, 2);
        assert_eq!(out.quality.failed_lines, 1);
        assert_eq!(out.quality.parsed_lines, 1);
        assert_eq!(out.events.len(), 1);
        assert!((out.quality.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(out.quality.sample_errors.len(), 1);
        assert_eq!(out.quality.sample_errors[0].line, 3);
    }
}
