//! Bounded blocking FIFO shared by the feeder and the workers.
//!
//! A bounded mpsc channel provides the capacity and the blocking `put`; the
//! receiver sits behind an async mutex so any number of workers can `take`.

use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("work queue capacity must be greater than zero")]
    ZeroCapacity,
    #[error("work queue closed")]
    Closed,
}

pub struct WorkQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok(Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
        })
    }

    /// Enqueue, waiting while the queue is full.
    pub async fn put(&self, item: T) -> Result<(), QueueError> {
        self.tx.send(item).await.map_err(|_| QueueError::Closed)
    }

    /// Dequeue, waiting while the queue is empty.
    pub async fn take(&self) -> Result<T, QueueError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(QueueError::Closed)
    }

    /// Items waiting to be taken.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bound fixed at construction; `put` waits once `len` reaches it.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn zero_capacity_rejected() {
        assert!(matches!(
            WorkQueue::<u32>::new(0),
            Err(QueueError::ZeroCapacity)
        ));
    }

    #[tokio::test]
    async fn fifo_order() {
        let queue = WorkQueue::new(4).unwrap();
        for i in 0..4 {
            queue.put(i).await.unwrap();
        }
        assert_eq!(queue.len(), 4);
        for i in 0..4 {
            assert_eq!(queue.take().await.unwrap(), i);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn put_blocks_when_full_until_take() {
        let queue = Arc::new(WorkQueue::new(2).unwrap());
        queue.put(1).await.unwrap();
        queue.put(2).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.put(3).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished(), "put should block on a full queue");
        assert_eq!(queue.len(), queue.capacity());

        assert_eq!(queue.take().await.unwrap(), 1);

        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("put should unblock after take")
            .unwrap()
            .unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.take().await.unwrap(), 2);
        assert_eq!(queue.take().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn take_blocks_when_empty() {
        let queue = Arc::new(WorkQueue::<u32>::new(1).unwrap());

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished(), "take should block on an empty queue");

        queue.put(7).await.unwrap();
        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("take should unblock after put")
            .unwrap()
            .unwrap();
        assert_eq!(item, 7);
    }

    #[tokio::test]
    async fn many_consumers_share_queue() {
        let queue = Arc::new(WorkQueue::new(8).unwrap());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    for _ in 0..5 {
                        got.push(queue.take().await.unwrap());
                    }
                    got
                })
            })
            .collect();

        for i in 0..20 {
            queue.put(i).await.unwrap();
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..20).collect::<Vec<_>>());
    }
}
