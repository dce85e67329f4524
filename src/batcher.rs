use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Object-safe processor invoked with a drained batch, in queue order.
pub trait BatchProcessor<T>: Send + Sync {
    fn process(&self, batch: Vec<T>) -> BoxFuture;
}

impl<T, F, Fut> BatchProcessor<T> for F
where
    F: Fn(Vec<T>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn process(&self, batch: Vec<T>) -> BoxFuture {
        Box::pin((self)(batch))
    }
}

struct Inner<T> {
    queue: VecDeque<T>,
    dispatching: bool,
    timer: Option<JoinHandle<()>>,
}

/// Time- or size-triggered inbox that delivers batches to a processor.
///
/// `queue()` never blocks. A batch dispatches when either `capacity` items
/// have accumulated or `delay` has elapsed since the first item of the
/// current batch arrived, whichever comes first. At most one batch is ever
/// in flight; items queued while a batch is processing accumulate for the
/// next one.
pub struct Batcher<T> {
    inner: Arc<Mutex<Inner<T>>>,
    processor: Arc<dyn BatchProcessor<T>>,
    capacity: usize,
    delay: Duration,
}

impl<T> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Batcher {
            inner: self.inner.clone(),
            processor: self.processor.clone(),
            capacity: self.capacity,
            delay: self.delay,
        }
    }
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new(capacity: usize, delay: Duration, processor: Arc<dyn BatchProcessor<T>>) -> Self {
        Batcher {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                dispatching: false,
                timer: None,
            })),
            processor,
            capacity: capacity.max(1),
            delay,
        }
    }

    /// Non-blocking enqueue. Schedules or triggers a dispatch as needed.
    pub async fn queue(&self, item: T) {
        let mut guard = self.inner.lock().await;
        let was_empty = guard.queue.is_empty();
        guard.queue.push_back(item);

        if guard.queue.len() >= self.capacity {
            if let Some(t) = guard.timer.take() {
                t.abort();
            }
            drop(guard);
            self.try_dispatch().await;
            return;
        }

        if was_empty && guard.timer.is_none() {
            let this = self.clone();
            let delay = self.delay;
            guard.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.try_dispatch().await;
            }));
        }
    }

    /// Forces an immediate dispatch of whatever is currently queued.
    pub async fn flush(&self) {
        {
            let mut guard = self.inner.lock().await;
            if let Some(t) = guard.timer.take() {
                t.abort();
            }
        }
        self.try_dispatch().await;
    }

    /// Discards pending items without dispatching them.
    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(t) = guard.timer.take() {
            t.abort();
        }
        guard.queue.clear();
    }

    /// Number of items currently buffered, not counting an in-flight batch.
    pub async fn count(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    async fn try_dispatch(&self) {
        let batch = {
            let mut guard = self.inner.lock().await;
            if guard.dispatching || guard.queue.is_empty() {
                return;
            }
            guard.dispatching = true;
            guard.timer.take();
            guard.queue.drain(..).collect::<Vec<_>>()
        };

        self.processor.process(batch).await;

        let mut guard = self.inner.lock().await;
        guard.dispatching = false;
        let pending = !guard.queue.is_empty();
        drop(guard);
        if pending {
            Box::pin(self.try_dispatch()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn dispatches_on_capacity() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let processor = move |batch: Vec<i32>| {
            let tx = tx.clone();
            async move {
                tx.send(batch).unwrap();
            }
        };
        let batcher = Batcher::new(3, Duration::from_secs(60), Arc::new(processor));
        batcher.queue(1).await;
        batcher.queue(2).await;
        batcher.queue(3).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn dispatches_on_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let processor = move |batch: Vec<i32>| {
            let tx = tx.clone();
            async move {
                tx.send(batch).unwrap();
            }
        };
        let batcher = Batcher::new(100, Duration::from_millis(20), Arc::new(processor));
        batcher.queue(1).await;
        batcher.queue(2).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![1, 2]);
    }

    #[tokio::test]
    async fn flush_forces_immediate_dispatch() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let processor = move |batch: Vec<i32>| {
            let count = count2.clone();
            async move {
                count.fetch_add(batch.len(), Ordering::SeqCst);
            }
        };
        let batcher = Batcher::new(100, Duration::from_secs(60), Arc::new(processor));
        batcher.queue(1).await;
        batcher.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_discards_without_dispatch() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let processor = move |batch: Vec<i32>| {
            let count = count2.clone();
            async move {
                count.fetch_add(batch.len(), Ordering::SeqCst);
            }
        };
        let batcher = Batcher::new(100, Duration::from_millis(10), Arc::new(processor));
        batcher.queue(1).await;
        batcher.clear().await;
        assert_eq!(batcher.count().await, 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn preserves_queue_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let processor = move |batch: Vec<i32>| {
            let tx = tx.clone();
            async move {
                tx.send(batch).unwrap();
            }
        };
        let batcher = Batcher::new(5, Duration::from_secs(60), Arc::new(processor));
        for i in 0..5 {
            batcher.queue(i).await;
        }
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![0, 1, 2, 3, 4]);
    }
}
