use std::io::{BufRead, BufReader, Cursor, Read};

use flate2::read::GzDecoder;
use logamizer_core::LogamizerError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Lazy line reader over raw or gzip-compressed log bytes.
///
/// Yields `(line_number, text)` pairs starting at line 1, decoding UTF-8
/// lossily. Iteration never fails on content; a broken compression stream
/// ends iteration early and is reported by [`LineReader::take_failure`].
pub struct LineReader {
    inner: BufReader<Box<dyn Read + Send>>,
    next_line: u64,
    failure: Option<String>,
    done: bool,
}

impl std::fmt::Debug for LineReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineReader")
            .field("next_line", &self.next_line)
            .field("failure", &self.failure)
            .field("done", &self.done)
            .finish()
    }
}

impl LineReader {
    /// Build a reader for the given blob. Compression is detected from the
    /// filename suffix or the gzip magic bytes.
    pub fn new(filename: &str, bytes: Vec<u8>) -> Result<Self, LogamizerError> {
        let gzipped = filename.ends_with(".gz") || bytes.starts_with(&GZIP_MAGIC);
        if gzipped && !bytes.starts_with(&GZIP_MAGIC) {
            return Err(LogamizerError::Decode(format!(
                "{filename}: expected gzip data, found no gzip header"
            )));
        }

        let inner: Box<dyn Read + Send> = if gzipped {
            Box::new(GzDecoder::new(Cursor::new(bytes)))
        } else {
            Box::new(Cursor::new(bytes))
        };

        Ok(Self {
            inner: BufReader::new(inner),
            next_line: 1,
            failure: None,
            done: false,
        })
    }

    /// Stream failure recorded during iteration (e.g. a truncated gzip
    /// member), if any. The driver turns this into a decode error.
    pub fn take_failure(&mut self) -> Option<LogamizerError> {
        self.failure.take().map(LogamizerError::Decode)
    }
}

impl Iterator for LineReader {
    type Item = (u64, String);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = Vec::new();
        match self.inner.read_until(b'\n', &mut buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                    buf.pop();
                }
                let line = self.next_line;
                self.next_line += 1;
                Some((line, String::from_utf8_lossy(&buf).into_owned()))
            }
            Err(e) => {
                self.failure = Some(format!("stream failed at line {}: {e}", self.next_line));
                self.done = true;
                None
            }
        }
    }
}
