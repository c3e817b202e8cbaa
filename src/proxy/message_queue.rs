use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::proxy::error::QueueError;
use crate::proxy::protocol::RelayMessage;

type Waiter = oneshot::Sender<Result<RelayMessage, QueueError>>;

struct QueueState {
    buffer: VecDeque<RelayMessage>,
    waiters: VecDeque<(u64, Waiter)>,
    next_waiter_id: u64,
    closed: bool,
}

/// Per-request mailbox fed by the channel registry and drained by one request handler.
pub struct MessageQueue {
    request_id: String,
    state: Mutex<QueueState>,
}

impl MessageQueue {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                closed: false,
            }),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // The critical sections never panic; recover the data if one somehow did.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hands the message to the oldest live waiter, or buffers it.
    pub fn enqueue(&self, message: RelayMessage) {
        let mut state = self.lock();
        if state.closed {
            return;
        }

        let mut message = message;
        while let Some((_, waiter)) = state.waiters.pop_front() {
            match waiter.send(Ok(message)) {
                Ok(()) => return,
                // Receiver dropped (request cancelled); try the next waiter.
                Err(Ok(returned)) => message = returned,
                Err(Err(_)) => return,
            }
        }
        state.buffer.push_back(message);
    }

    /// Next message in FIFO order, waiting at most `timeout`.
    pub async fn dequeue(&self, timeout: Duration) -> Result<RelayMessage, QueueError> {
        let (id, mut rx) = {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if let Some(message) = state.buffer.pop_front() {
                return Ok(message);
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back((id, tx));
            (id, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => {
                let mut state = self.lock();
                let before = state.waiters.len();
                state.waiters.retain(|(waiter_id, _)| *waiter_id != id);
                if state.waiters.len() < before {
                    return Err(QueueError::Timeout);
                }
                drop(state);
                // enqueue or close claimed the waiter right as the timer fired
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(QueueError::Timeout),
                }
            }
        }
    }

    /// Rejects all waiters and discards buffered messages. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.buffer.clear();
        for (_, waiter) in state.waiters.drain(..) {
            let _ = waiter.send(Err(QueueError::Closed));
        }
        tracing::debug!(request_id = %self.request_id, "message queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_waiters(&self) -> usize {
        self.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunk(data: &str) -> RelayMessage {
        RelayMessage::Chunk(data.to_string())
    }

    #[tokio::test]
    async fn test_buffered_messages_are_fifo() {
        let queue = MessageQueue::new("r1");
        queue.enqueue(chunk("a"));
        queue.enqueue(chunk("b"));
        assert_eq!(queue.len(), 2);

        let timeout = Duration::from_millis(50);
        assert_eq!(queue.dequeue(timeout).await, Ok(chunk("a")));
        assert_eq!(queue.dequeue(timeout).await, Ok(chunk("b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_receives_message_directly() {
        let queue = Arc::new(MessageQueue::new("r1"));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        while queue.pending_waiters() == 0 {
            tokio::task::yield_now().await;
        }
        queue.enqueue(chunk("direct"));

        assert_eq!(consumer.await.unwrap(), Ok(chunk("direct")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_dangling_waiter() {
        let queue = MessageQueue::new("r1");
        let result = queue.dequeue(Duration::from_millis(20)).await;
        assert_eq!(result, Err(QueueError::Timeout));
        assert_eq!(queue.pending_waiters(), 0);

        // The next message is buffered rather than sent to the expired waiter.
        queue.enqueue(chunk("late"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue(Duration::from_millis(20)).await, Ok(chunk("late")));
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_future_dequeues() {
        let queue = Arc::new(MessageQueue::new("r1"));
        queue.enqueue(chunk("discarded"));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                // drain the buffered message, then wait
                let _ = queue.dequeue(Duration::from_secs(5)).await;
                queue.dequeue(Duration::from_secs(5)).await
            })
        };
        while queue.pending_waiters() == 0 {
            tokio::task::yield_now().await;
        }

        queue.close();
        queue.close();
        assert_eq!(waiter.await.unwrap(), Err(QueueError::Closed));

        queue.enqueue(chunk("ignored"));
        assert!(queue.is_empty());
        assert!(queue.is_closed());
        assert_eq!(
            queue.dequeue(Duration::from_millis(10)).await,
            Err(QueueError::Closed)
        );
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_skipped() {
        let queue = Arc::new(MessageQueue::new("r1"));
        let abandoned = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        while queue.pending_waiters() == 0 {
            tokio::task::yield_now().await;
        }
        abandoned.abort();
        let _ = abandoned.await;

        queue.enqueue(chunk("kept"));
        assert_eq!(queue.dequeue(Duration::from_millis(20)).await, Ok(chunk("kept")));
    }

    #[tokio::test]
    async fn test_each_message_goes_to_exactly_one_waiter() {
        let queue = Arc::new(MessageQueue::new("r1"));
        let mut consumers = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                queue.dequeue(Duration::from_secs(5)).await
            }));
        }
        while queue.pending_waiters() < 3 {
            tokio::task::yield_now().await;
        }
        for data in ["x", "y", "z"] {
            queue.enqueue(chunk(data));
        }

        let mut received = Vec::new();
        for consumer in consumers {
            match consumer.await.unwrap() {
                Ok(RelayMessage::Chunk(data)) => received.push(data),
                other => panic!("unexpected result: {:?}", other),
            }
        }
        received.sort();
        assert_eq!(received, vec!["x", "y", "z"]);
        assert!(queue.is_empty());
    }
}
