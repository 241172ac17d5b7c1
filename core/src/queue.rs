use crate::infer::ClassifyInferResponse;
use crate::ProxyError;
use classify_proxy_backend::Batch;
use std::cmp::{min, Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tracing::{instrument, Span};

/// Queue entry
#[derive(Debug)]
pub struct Entry {
    /// Payload
    pub sequence: String,
    /// Entry metadata
    pub metadata: Metadata,
}

impl Entry {
    pub fn new(
        id: u64,
        sequence: String,
        response_tx: oneshot::Sender<Result<ClassifyInferResponse, ProxyError>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let input_length = sequence.chars().count();
        Self {
            sequence,
            metadata: Metadata {
                id,
                response_tx,
                queue_time: Instant::now(),
                input_length,
                _permit: permit,
            },
        }
    }
}

/// Entry metadata
#[derive(Debug)]
pub struct Metadata {
    /// Process-unique id, only used for diagnostics
    pub(crate) id: u64,
    /// Result slot: written once by the batching task, read by the admitting caller
    pub(crate) response_tx: oneshot::Sender<Result<ClassifyInferResponse, ProxyError>>,
    /// Instant when this entry was queued
    pub(crate) queue_time: Instant,
    /// Number of characters in the sequence
    pub(crate) input_length: usize,
    /// Admission permit, released once the entry is resolved
    pub(crate) _permit: OwnedSemaphorePermit,
}

/// Longest input first, then arrival order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Priority {
    length: usize,
    arrival: Reverse<u64>,
}

#[derive(Debug)]
struct QueuedEntry {
    priority: Priority,
    entry: Entry,
}

// Only the priority takes part in the ordering, never the payload
impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

/// Request Queue
#[derive(Debug, Clone)]
pub struct Queue {
    /// Channel to communicate with the background queue task
    queue_sender: mpsc::UnboundedSender<QueueCommand>,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    pub fn new() -> Self {
        // Create channels
        let (queue_sender, queue_receiver) = mpsc::unbounded_channel();

        // Launch background queue task
        std::thread::spawn(move || queue_blocking_task(queue_receiver));

        Self { queue_sender }
    }

    /// Append an entry to the queue
    #[instrument(skip_all, fields(id = entry.metadata.id))]
    pub fn append(&self, entry: Entry) {
        // Send append command to the background task managing the state
        // The task only stops once every `Queue` handle is dropped
        self.queue_sender
            .send(QueueCommand::Append(Box::new(entry), Span::current()))
            .expect("Queue background task dropped the receiver. This is a bug.");
    }

    /// Remove and return up to `max_size` entries with the highest priority
    #[instrument(skip(self))]
    pub async fn next_batch(&self, max_size: usize) -> Option<NextBatch> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.queue_sender
            .send(QueueCommand::NextBatch {
                max_size,
                response_sender,
                span: Span::current(),
            })
            .expect("Queue background task dropped the receiver. This is a bug.");
        // Await on response channel
        response_receiver.await.expect(
            "Queue background task dropped the sender without sending a new batch. This is a bug.",
        )
    }

    /// Number of pending entries. May be stale as soon as it returns.
    pub async fn size(&self) -> usize {
        let (response_sender, response_receiver) = oneshot::channel();

        self.queue_sender
            .send(QueueCommand::Size(response_sender))
            .expect("Queue background task dropped the receiver. This is a bug.");
        response_receiver
            .await
            .expect("Queue background task dropped the sender. This is a bug.")
    }
}

// Background task responsible of the queue state
fn queue_blocking_task(mut queue_receiver: mpsc::UnboundedReceiver<QueueCommand>) {
    let mut entries: BinaryHeap<QueuedEntry> = BinaryHeap::new();
    let mut arrival: u64 = 0;

    while let Some(cmd) = queue_receiver.blocking_recv() {
        match cmd {
            QueueCommand::Append(entry, span) => {
                let _span = span.entered();
                let priority = Priority {
                    length: entry.metadata.input_length,
                    arrival: Reverse(arrival),
                };
                arrival += 1;
                entries.push(QueuedEntry {
                    priority,
                    entry: *entry,
                });
                let gauge = metrics::gauge!("cp_queue_size");
                gauge.increment(1.0);
            }
            QueueCommand::NextBatch {
                max_size,
                response_sender,
                span,
            } => {
                let _span = span.entered();

                let capacity = min(max_size, entries.len());
                let mut sequences = Vec::with_capacity(capacity);
                let mut metadata = Vec::with_capacity(capacity);

                while metadata.len() < max_size {
                    let Some(queued) = entries.pop() else {
                        break;
                    };
                    sequences.push(queued.entry.sequence);
                    metadata.push(queued.entry.metadata);
                }

                let batch_size = metadata.len();
                let next_batch = if metadata.is_empty() {
                    None
                } else {
                    tracing::debug!("Popped {batch_size} entries, {} left", entries.len());
                    Some((metadata, Batch { sequences }))
                };

                let _ = response_sender.send(next_batch);

                if batch_size > 0 {
                    let histogram = metrics::histogram!("cp_batch_next_size");
                    histogram.record(batch_size as f64);
                }
                let gauge = metrics::gauge!("cp_queue_size");
                gauge.set(entries.len() as f64)
            }
            QueueCommand::Size(response_sender) => {
                let _ = response_sender.send(entries.len());
            }
        }
    }
}

pub type NextBatch = (Vec<Metadata>, Batch);

#[derive(Debug)]
enum QueueCommand {
    Append(Box<Entry>, Span),
    NextBatch {
        max_size: usize,
        response_sender: oneshot::Sender<Option<NextBatch>>,
        span: Span,
    },
    Size(oneshot::Sender<usize>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn entry(id: u64, sequence: &str) -> Entry {
        let (response_tx, _) = oneshot::channel();
        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        Entry::new(id, sequence.to_string(), response_tx, permit)
    }

    #[tokio::test]
    async fn longest_sequences_are_popped_first() {
        let queue = Queue::new();
        queue.append(entry(0, &"a".repeat(5)));
        queue.append(entry(1, &"b".repeat(10)));
        queue.append(entry(2, &"c".repeat(3)));

        let (metadata, batch) = queue.next_batch(2).await.unwrap();
        assert_eq!(batch.sequences, vec!["b".repeat(10), "a".repeat(5)]);
        assert_eq!(
            metadata.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![1, 0]
        );

        let (_, batch) = queue.next_batch(2).await.unwrap();
        assert_eq!(batch.sequences, vec!["c".repeat(3)]);

        assert!(queue.next_batch(2).await.is_none());
    }

    #[tokio::test]
    async fn equal_lengths_are_first_in_first_out() {
        let queue = Queue::new();
        queue.append(entry(0, "aa"));
        queue.append(entry(1, "bb"));
        queue.append(entry(2, "dddd"));
        queue.append(entry(3, "cc"));

        let (metadata, batch) = queue.next_batch(10).await.unwrap();
        assert_eq!(batch.sequences, vec!["dddd", "aa", "bb", "cc"]);
        assert_eq!(
            metadata.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![2, 0, 1, 3]
        );
    }

    #[tokio::test]
    async fn length_counts_characters() {
        let queue = Queue::new();
        // 3 chars, 6 bytes
        queue.append(entry(0, "éàü"));
        // 4 chars, 4 bytes
        queue.append(entry(1, "abcd"));

        let (_, batch) = queue.next_batch(1).await.unwrap();
        assert_eq!(batch.sequences, vec!["abcd"]);
    }

    #[tokio::test]
    async fn every_pop_returns_the_current_top() {
        let queue = Queue::new();
        for i in 0..100u64 {
            let length = ((i * 37) % 101) as usize + 1;
            queue.append(entry(i, &"x".repeat(length)));
        }
        assert_eq!(queue.size().await, 100);

        let mut popped = Vec::new();
        while let Some((_, batch)) = queue.next_batch(7).await {
            assert!(batch.len() == 7 || queue.size().await == 0);
            popped.extend(batch.sequences.into_iter().map(|s| s.len()));
        }

        assert_eq!(popped.len(), 100);
        assert!(popped.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn size_reflects_pending_entries() {
        let queue = Queue::new();
        assert_eq!(queue.size().await, 0);

        queue.append(entry(0, "a"));
        queue.append(entry(1, "bb"));
        queue.append(entry(2, "ccc"));
        assert_eq!(queue.size().await, 3);

        queue.next_batch(2).await.unwrap();
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_push_and_pop_lose_nothing() {
        let queue = Queue::new();
        let producers = 4u64;
        let per_producer = 250u64;

        let mut handles = Vec::new();
        for p in 0..producers {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..per_producer {
                    let id = p * per_producer + i;
                    let length = (id % 13) as usize + 1;
                    queue.append(entry(id, &format!("{id}:{}", "x".repeat(length))));
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                while ids.len() < (producers * per_producer) as usize {
                    match queue.next_batch(7).await {
                        Some((metadata, batch)) => {
                            assert!(batch.len() <= 7);
                            assert_eq!(metadata.len(), batch.len());
                            ids.extend(metadata.into_iter().map(|m| m.id));
                        }
                        None => tokio::task::yield_now().await,
                    }
                }
                ids
            })
        };

        for handle in handles {
            handle.await.unwrap();
        }
        let ids = tokio::time::timeout(Duration::from_secs(10), consumer)
            .await
            .unwrap()
            .unwrap();

        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(ids.len(), (producers * per_producer) as usize);
        assert_eq!(unique.len(), ids.len());
        assert!(queue.next_batch(7).await.is_none());
    }
}
