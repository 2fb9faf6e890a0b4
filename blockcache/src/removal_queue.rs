use std::time::Duration;

/// Work items accepted by the removal workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalItem {
    /// A backend object id whose deletion should be scheduled.
    Object(i64),
    /// Asks a multi-delete worker to flush its current batch now, without
    /// waiting for the batch to fill up.
    Flush,
    /// Asks the worker loop to exit after draining what it already has.
    Quit,
}

/// Bounded FIFO of pending removals, shared between producers (block
/// dereference) and the removal worker thread(s).
pub struct RemovalQueue {
    tx: flume::Sender<RemovalItem>,
    rx: flume::Receiver<RemovalItem>,
}

impl RemovalQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        RemovalQueue { tx, rx }
    }

    pub fn push(&self, item: RemovalItem, timeout: Option<Duration>) -> Result<(), RemovalItem> {
        match timeout {
            None => self.tx.send(item).map_err(|e| e.into_inner()),
            Some(d) => self.tx.send_timeout(item, d).map_err(|e| e.into_inner()),
        }
    }

    pub fn pop(&self) -> Option<RemovalItem> {
        self.rx.recv().ok()
    }

    /// Non-blocking pop, used by the multi-delete worker while it is
    /// still filling up a batch.
    pub fn try_pop(&self) -> Option<RemovalItem> {
        self.rx.try_recv().ok()
    }

    pub fn sender(&self) -> flume::Sender<RemovalItem> {
        self.tx.clone()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let q = RemovalQueue::new(4);
        q.push(RemovalItem::Object(1), None).unwrap();
        q.push(RemovalItem::Object(2), None).unwrap();
        assert_eq!(q.pop(), Some(RemovalItem::Object(1)));
        assert_eq!(q.pop(), Some(RemovalItem::Object(2)));
    }

    #[test]
    fn full_queue_rejects_with_timeout() {
        let q = RemovalQueue::new(1);
        q.push(RemovalItem::Object(1), None).unwrap();
        let err = q.push(RemovalItem::Object(2), Some(Duration::from_millis(10)));
        assert_eq!(err, Err(RemovalItem::Object(2)));
    }
}
