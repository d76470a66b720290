use std::sync::Mutex;
use std::time::Instant;

use monolog_storage::{StoredBatch, TopicStore};
use tokio::sync::mpsc;

/// A fetch that found no data and was parked instead of answered.  The
/// completion sender is the owning connection's ordered-writer channel; the
/// response slot `response_seq` stays reserved there, so later responses on
/// the same connection wait behind this one and the client still sees
/// responses in request order.
#[derive(Debug)]
pub struct PendingFetch {
    pub connection_id: u64,
    pub response_seq: u64,
    pub correlation_id: i32,
    pub api_version: i16,
    pub topic: String,
    pub partition: i32,
    pub fetch_offset: i64,
    pub max_bytes: i32,
    pub deadline: Instant,
    pub completion: mpsc::Sender<(u64, Vec<u8>)>,
}

/// Outcome of one scheduler pass over a parked fetch.
#[derive(Debug)]
pub struct CompletedFetch {
    pub fetch: PendingFetch,
    pub batches: Vec<StoredBatch>,
}

/// FIFO queue of parked fetches behind a mutex.  A tick walks the queue in
/// stable order; entries leave when their deadline passes, when data shows up
/// at their offset, or when their connection goes away.
#[derive(Debug, Default)]
pub struct PendingQueue {
    inner: Mutex<Vec<PendingFetch>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, fetch: PendingFetch) {
        self.inner.lock().expect("pending lock").push(fetch);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry belonging to a closed connection.
    pub fn remove_connection(&self, connection_id: u64) {
        self.inner
            .lock()
            .expect("pending lock")
            .retain(|fetch| fetch.connection_id != connection_id);
    }

    /// One scheduler pass.  Expired entries complete empty; entries whose
    /// offset now has data complete with it; the rest stay parked.  Entries
    /// whose completion channel is gone are dropped outright.
    pub fn take_actionable(
        &self,
        topics: &TopicStore,
        max_batches: usize,
        now: Instant,
    ) -> Vec<CompletedFetch> {
        let mut queue = self.inner.lock().expect("pending lock");
        let mut completed = Vec::new();
        let mut still_pending = Vec::with_capacity(queue.len());
        for fetch in queue.drain(..) {
            if fetch.completion.is_closed() {
                continue;
            }
            if now > fetch.deadline {
                completed.push(CompletedFetch {
                    fetch,
                    batches: Vec::new(),
                });
                continue;
            }
            match topics.read_from(&fetch.topic, fetch.fetch_offset, max_batches) {
                Ok(batches) if !batches.is_empty() => {
                    completed.push(CompletedFetch { fetch, batches });
                }
                Ok(_) => still_pending.push(fetch),
                // Topic vanished (or a storage error): complete empty rather
                // than leaving the client's response slot hanging.
                Err(_) => completed.push(CompletedFetch {
                    fetch,
                    batches: Vec::new(),
                }),
            }
        }
        *queue = still_pending;
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monolog_storage::Db;
    use std::time::Duration;

    fn topic_store() -> TopicStore {
        TopicStore::open(Db::open_in_memory().expect("open db")).expect("open store")
    }

    fn parked(
        connection_id: u64,
        topic: &str,
        offset: i64,
        deadline: Instant,
    ) -> (PendingFetch, mpsc::Receiver<(u64, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel(4);
        (
            PendingFetch {
                connection_id,
                response_seq: 0,
                correlation_id: 1,
                api_version: 4,
                topic: topic.to_string(),
                partition: 0,
                fetch_offset: offset,
                max_bytes: 1 << 20,
                deadline,
                completion: tx,
            },
            rx,
        )
    }

    #[test]
    fn entry_stays_parked_until_data_arrives() {
        let topics = topic_store();
        topics.create_topic("t", 0).expect("create");
        let queue = PendingQueue::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        let (fetch, _rx) = parked(1, "t", 0, deadline);
        queue.park(fetch);

        assert!(queue
            .take_actionable(&topics, 100, Instant::now())
            .is_empty());
        assert_eq!(queue.len(), 1);

        topics.append_batch("t", b"payload", 0, 1, 1).expect("append");
        let completed = queue.take_actionable(&topics, 100, Instant::now());
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].batches.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn expired_entry_completes_empty() {
        let topics = topic_store();
        topics.create_topic("t", 0).expect("create");
        let queue = PendingQueue::new();
        let (fetch, _rx) = parked(1, "t", 0, Instant::now() - Duration::from_millis(1));
        queue.park(fetch);

        let completed = queue.take_actionable(&topics, 100, Instant::now());
        assert_eq!(completed.len(), 1);
        assert!(completed[0].batches.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn connection_removal_clears_its_entries() {
        let topics = topic_store();
        topics.create_topic("t", 0).expect("create");
        let queue = PendingQueue::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        let (fetch_a, _rx_a) = parked(1, "t", 0, deadline);
        let (fetch_b, _rx_b) = parked(2, "t", 0, deadline);
        queue.park(fetch_a);
        queue.park(fetch_b);

        queue.remove_connection(1);
        assert_eq!(queue.len(), 1);

        // A dropped receiver is cleaned up on the next pass.
        drop(_rx_b);
        assert!(queue
            .take_actionable(&topics, 100, Instant::now())
            .is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn vanished_topic_completes_empty() {
        let topics = topic_store();
        topics.create_topic("t", 0).expect("create");
        let queue = PendingQueue::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        let (fetch, _rx) = parked(1, "t", 0, deadline);
        queue.park(fetch);
        topics.delete_topic("t").expect("delete");

        let completed = queue.take_actionable(&topics, 100, Instant::now());
        assert_eq!(completed.len(), 1);
        assert!(completed[0].batches.is_empty());
    }
}
