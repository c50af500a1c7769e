//! Fan-out of incoming messages.
//!
//! Every subscriber owns a bounded queue. [`MessageBus::publish`] only pushes
//! into those queues and wakes their consumers; it never waits on a consumer
//! and never fails because of one. A full queue sheds according to its
//! [`OverflowPolicy`], so a slow consumer loses messages instead of stalling
//! the receive loop or its neighbours.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::update::IncomingMessage;

/// What a full subscriber queue does with a new message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered message to make room.
    #[default]
    DropOldest,
    /// Discard the new message.
    DropNewest,
}

/// Identifies one subscription on its bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ─── Queue ────────────────────────────────────────────────────────────────────

struct Queue {
    items:    VecDeque<IncomingMessage>,
    capacity: usize,
    policy:   OverflowPolicy,
    dropped:  u64,
    closed:   bool,
}

struct Slot {
    queue:  Mutex<Queue>,
    notify: Notify,
}

impl Slot {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity.min(64)),
                capacity: capacity.max(1),
                policy,
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Returns `false` if the message was shed.
    fn push(&self, id: SubscriberId, msg: IncomingMessage) -> bool {
        let mut q = self.queue.lock();
        if q.closed {
            return false;
        }
        let mut kept = true;
        if q.items.len() >= q.capacity {
            q.dropped += 1;
            match q.policy {
                OverflowPolicy::DropOldest => {
                    if let Some(old) = q.items.pop_front() {
                        tracing::warn!(
                            "[tdhead] Subscriber {id} full, dropped oldest message {} (chat {})",
                            old.id, old.chat_id
                        );
                    }
                }
                OverflowPolicy::DropNewest => {
                    tracing::warn!(
                        "[tdhead] Subscriber {id} full, dropped new message {} (chat {})",
                        msg.id, msg.chat_id
                    );
                    kept = false;
                }
            }
        }
        if kept {
            q.items.push_back(msg);
        }
        drop(q);
        self.notify.notify_one();
        kept
    }

    fn close(&self) {
        self.queue.lock().closed = true;
        self.notify.notify_one();
    }
}

// ─── MessageBus ───────────────────────────────────────────────────────────────

struct BusInner {
    subscribers: Mutex<HashMap<SubscriberId, Arc<Slot>>>,
    history:     Mutex<VecDeque<IncomingMessage>>,
    next_id:     AtomicU64,
    closed:      AtomicBool,
    capacity:    usize,
    policy:      OverflowPolicy,
    history_len: usize,
}

/// Broadcasts [`IncomingMessage`]s to any number of [`Subscription`]s.
/// Cheap to clone.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// `capacity` and `policy` are the defaults for [`subscribe`](Self::subscribe);
    /// the last `history_len` messages are kept for late subscribers.
    pub fn new(capacity: usize, policy: OverflowPolicy, history_len: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                history:     Mutex::new(VecDeque::with_capacity(history_len)),
                next_id:     AtomicU64::new(1),
                closed:      AtomicBool::new(false),
                capacity,
                policy,
                history_len,
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with(self.inner.capacity, self.inner.policy)
    }

    pub fn subscribe_with(&self, capacity: usize, policy: OverflowPolicy) -> Subscription {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(Slot::new(capacity, policy));
        {
            let mut subscribers = self.inner.subscribers.lock();
            // Checked under the lock so `close` cannot miss this slot.
            if self.inner.closed.load(Ordering::SeqCst) {
                slot.close();
            } else {
                subscribers.insert(id, slot.clone());
            }
        }
        tracing::debug!("[tdhead] Subscriber {id} registered");
        Subscription { id, slot, bus: Arc::downgrade(&self.inner) }
    }

    /// Subscribe with the queue pre-filled with up to `n` recent messages.
    pub fn subscribe_with_replay(&self, n: usize) -> Subscription {
        let sub = self.subscribe();
        {
            let mut q = sub.slot.queue.lock();
            let n = n.min(q.capacity);
            let replay = self.recent(n);
            // Anything published since subscribing is newer than the replay.
            for msg in replay.into_iter().rev() {
                if !q.items.iter().any(|m| m.id == msg.id && m.chat_id == msg.chat_id) {
                    q.items.push_front(msg);
                }
            }
            while q.items.len() > q.capacity {
                q.items.pop_front();
            }
        }
        sub
    }

    /// Remove a subscriber. Messages already queued can still be received.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let slot = self.inner.subscribers.lock().remove(&id);
        match slot {
            Some(slot) => {
                slot.close();
                tracing::debug!("[tdhead] Subscriber {id} removed");
                true
            }
            None => false,
        }
    }

    /// Enqueue `msg` for every live subscriber.
    pub fn publish(&self, msg: IncomingMessage) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.inner.history_len > 0 {
            let mut history = self.inner.history.lock();
            if history.len() >= self.inner.history_len {
                history.pop_front();
            }
            history.push_back(msg.clone());
        }
        let slots: Vec<(SubscriberId, Arc<Slot>)> = self.inner.subscribers.lock()
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();
        for (id, slot) in slots {
            slot.push(id, msg.clone());
        }
    }

    /// The last `n` published messages, oldest first.
    pub fn recent(&self, n: usize) -> Vec<IncomingMessage> {
        let history = self.inner.history.lock();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting messages and end every subscription once drained.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<Arc<Slot>> = self.inner.subscribers.lock()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            slot.close();
        }
        tracing::debug!("[tdhead] Message bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscribers", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ─── Subscription ─────────────────────────────────────────────────────────────

/// One subscriber's end of the bus. Dropping it unsubscribes.
pub struct Subscription {
    id:   SubscriberId,
    slot: Arc<Slot>,
    bus:  Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId { self.id }

    /// The next message, in publish order. `None` once unsubscribed or the
    /// bus is closed, and the queue is drained.
    pub async fn recv(&mut self) -> Option<IncomingMessage> {
        loop {
            {
                let mut q = self.slot.queue.lock();
                if let Some(msg) = q.items.pop_front() {
                    return Some(msg);
                }
                if q.closed {
                    return None;
                }
            }
            self.slot.notify.notified().await;
        }
    }

    /// The next message if one is queued.
    pub fn try_recv(&mut self) -> Option<IncomingMessage> {
        self.slot.queue.lock().items.pop_front()
    }

    /// How many messages this subscriber has lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.slot.queue.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.slot.queue.lock().closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.subscribers.lock().remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::MessageSender;
    use serde_json::Value;

    fn msg(id: i64) -> IncomingMessage {
        IncomingMessage {
            id,
            chat_id:   1,
            sender:    MessageSender::User { user_id: 2 },
            text:      format!("m{id}"),
            timestamp: 0,
            outgoing:  false,
            raw:       Arc::new(Value::Null),
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<i64> {
        std::iter::from_fn(|| sub.try_recv()).map(|m| m.id).collect()
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_message_in_order() {
        let bus = MessageBus::new(8, OverflowPolicy::DropOldest, 0);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(msg(1));
        bus.publish(msg(2));
        assert_eq!(a.recv().await.unwrap().id, 1);
        assert_eq!(a.recv().await.unwrap().id, 2);
        assert_eq!(drain(&mut b), vec![1, 2]);
    }

    #[test]
    fn unsubscribing_one_leaves_the_other_alone() {
        let bus = MessageBus::new(8, OverflowPolicy::DropOldest, 0);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(msg(1));
        assert!(bus.unsubscribe(a.id()));
        assert!(!bus.unsubscribe(a.id()));
        bus.publish(msg(2));
        assert_eq!(drain(&mut a), vec![1]);
        assert!(a.is_closed());
        assert_eq!(drain(&mut b), vec![1, 2]);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn full_queue_drops_oldest_and_keeps_order() {
        let bus = MessageBus::new(3, OverflowPolicy::DropOldest, 0);
        let mut sub = bus.subscribe();
        for id in 1..=5 {
            bus.publish(msg(id));
        }
        assert_eq!(sub.dropped(), 2);
        assert_eq!(drain(&mut sub), vec![3, 4, 5]);
        bus.publish(msg(6));
        assert_eq!(drain(&mut sub), vec![6]);
    }

    #[test]
    fn drop_newest_keeps_the_backlog() {
        let bus = MessageBus::new(8, OverflowPolicy::DropOldest, 0);
        let mut sub = bus.subscribe_with(2, OverflowPolicy::DropNewest);
        for id in 1..=4 {
            bus.publish(msg(id));
        }
        assert_eq!(sub.dropped(), 2);
        assert_eq!(drain(&mut sub), vec![1, 2]);
    }

    #[test]
    fn replay_prefills_recent_history() {
        let bus = MessageBus::new(8, OverflowPolicy::DropOldest, 3);
        for id in 1..=5 {
            bus.publish(msg(id));
        }
        assert_eq!(bus.recent(10).iter().map(|m| m.id).collect::<Vec<_>>(), vec![3, 4, 5]);
        let mut sub = bus.subscribe_with_replay(2);
        bus.publish(msg(6));
        assert_eq!(drain(&mut sub), vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn close_ends_subscriptions_after_drain() {
        let bus = MessageBus::new(8, OverflowPolicy::DropOldest, 0);
        let mut sub = bus.subscribe();
        bus.publish(msg(1));
        bus.close();
        bus.publish(msg(2));
        assert_eq!(sub.recv().await.unwrap().id, 1);
        assert!(sub.recv().await.is_none());
        assert!(bus.subscribe().is_closed());
    }

    #[tokio::test]
    async fn recv_wakes_on_publish_from_another_task() {
        let bus = MessageBus::new(8, OverflowPolicy::DropOldest, 0);
        let mut sub = bus.subscribe();
        let publisher = bus.clone();
        let task = tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish(msg(9));
        });
        assert_eq!(sub.recv().await.unwrap().id, 9);
        task.await.unwrap();
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = MessageBus::new(8, OverflowPolicy::DropOldest, 0);
        let sub = bus.subscribe();
        assert_eq!(bus.len(), 1);
        drop(sub);
        assert!(bus.is_empty());
    }
}
