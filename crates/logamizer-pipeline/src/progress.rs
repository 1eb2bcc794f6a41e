use logamizer_store::ProgressSink;
use tokio::sync::watch;

/// One progress observation for a job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub percent: u8,
    pub message: String,
}

/// Progress sink over a watch channel: the latest update wins and sending
/// never blocks, so the hot event path cannot stall on a slow consumer.
pub struct WatchProgress {
    tx: watch::Sender<ProgressUpdate>,
}

impl WatchProgress {
    pub fn new() -> (Self, watch::Receiver<ProgressUpdate>) {
        let (tx, rx) = watch::channel(ProgressUpdate::default());
        (Self { tx }, rx)
    }
}

impl ProgressSink for WatchProgress {
    fn report(&self, job_id: &str, percent: u8, message: &str) {
        // Receiver may be gone; dropping the update is fine.
        let _ = self.tx.send(ProgressUpdate {
            job_id: job_id.to_string(),
            percent: percent.min(100),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_update_wins() {
        let (sink, rx) = WatchProgress::new();
        sink.report("job-1", 10, "parsing");
        sink.report("job-1", 55, "aggregating");
        let seen = rx.borrow().clone();
        assert_eq!(seen.percent, 55);
        assert_eq!(seen.message, "aggregating");
    }

    #[test]
    fn send_without_receiver_does_not_panic() {
        let (sink, rx) = WatchProgress::new();
        drop(rx);
        sink.report("job-1", 100, "done");
    }

    #[test]
    fn percent_is_clamped() {
        let (sink, rx) = WatchProgress::new();
        sink.report("job-1", 150, "overflow");
        assert_eq!(rx.borrow().percent, 100);
    }
}
