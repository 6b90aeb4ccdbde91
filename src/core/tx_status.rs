use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use eyre::Result;

use crate::ports::tx_status_sink::{TxStatus, TxStatusSink};

/// Buffer bound; the oldest statuses are dropped beyond it.
pub const MAX_BUFFERED_STATUSES: usize = 10_000;

/// In-memory buffer of transaction outcomes, flushed to a [`TxStatusSink`] on a timer.
#[derive(Debug, Default)]
pub struct TxStatusRecorder {
    buffer: Mutex<VecDeque<TxStatus>>,
}

impl TxStatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TxStatus>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, status: TxStatus) {
        let mut buffer = self.lock();
        if buffer.len() >= MAX_BUFFERED_STATUSES {
            buffer.pop_front();
        }
        buffer.push_back(status);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Hand everything buffered to `sink`. On failure the batch is put back
    /// in front of anything recorded meanwhile.
    pub async fn flush(&self, sink: &dyn TxStatusSink) -> Result<usize> {
        let batch: Vec<TxStatus> = self.lock().drain(..).collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        if let Err(e) = sink.persist(batch.clone()).await {
            let mut buffer = self.lock();
            for status in batch.into_iter().rev() {
                if buffer.len() >= MAX_BUFFERED_STATUSES {
                    break;
                }
                buffer.push_front(status);
            }
            return Err(e);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;

    #[derive(Default)]
    struct CountingSink {
        persisted: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TxStatusSink for CountingSink {
        async fn persist(&self, batch: Vec<TxStatus>) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                eyre::bail!("storage offline");
            }
            self.persisted.fetch_add(batch.len(), Ordering::Relaxed);
            Ok(())
        }
    }

    fn status(hash: &str) -> TxStatus {
        TxStatus {
            tx_hash: Some(hash.to_string()),
            accepted: true,
            reason: None,
            source_ip: "127.0.0.1".to_string(),
            node_url: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn flush_drains_buffer() {
        let recorder = TxStatusRecorder::new();
        let sink = CountingSink::default();
        recorder.record(status("0x1"));
        recorder.record(status("0x2"));

        assert_eq!(recorder.flush(&sink).await.unwrap(), 2);
        assert_eq!(recorder.pending(), 0);
        assert_eq!(sink.persisted.load(Ordering::Relaxed), 2);
        assert_eq!(recorder.flush(&sink).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_statuses() {
        let recorder = TxStatusRecorder::new();
        let sink = CountingSink::default();
        sink.fail.store(true, Ordering::Relaxed);
        recorder.record(status("0x1"));

        assert!(recorder.flush(&sink).await.is_err());
        assert_eq!(recorder.pending(), 1);

        sink.fail.store(false, Ordering::Relaxed);
        assert_eq!(recorder.flush(&sink).await.unwrap(), 1);
    }
}
