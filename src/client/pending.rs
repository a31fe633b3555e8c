use bytes::Bytes;
use tokio::sync::oneshot;

/// How an outstanding call ended.
#[derive(Debug)]
pub enum CallEvent {
    /// The connection to the broker went away.
    BrokerDisconnected,
    /// The module the call was sent to went away.
    ModuleDisconnected,
    /// Exception frame payload: code, message, detail.
    Exception(Bytes),
    /// Reply frame payload.
    Reply(Bytes),
}

struct PendingCall {
    destination: i32,
    tx: oneshot::Sender<CallEvent>,
}

/// Outstanding calls, indexed by message id.
///
/// A message id is the index of the first free slot, so ids are small and
/// are reused once a call completes. Each slot owns the sending half of a
/// oneshot channel; completing a call consumes it, so a waiter is released
/// exactly once. Dropping the sender (see [`PendingCalls::fail_all`]) wakes
/// the waiter with a closed channel, which reads as a broker disconnect.
#[derive(Default)]
pub(crate) struct PendingCalls {
    // ---
    slots: Vec<Option<PendingCall>>,
}

impl PendingCalls {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a message id for a call to `destination`.
    pub fn register(&mut self, destination: i32) -> (i32, oneshot::Receiver<CallEvent>) {
        // ---
        let (tx, rx) = oneshot::channel();
        let call = Some(PendingCall { destination, tx });
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = call;
                index
            }
            None => {
                self.slots.push(call);
                self.slots.len() - 1
            }
        };
        (index as i32, rx)
    }

    /// Deliver `event` to the call with `message_id`.
    ///
    /// Returns false when no such call is outstanding.
    pub fn complete(&mut self, message_id: i32, event: CallEvent) -> bool {
        // ---
        let Some(call) = usize::try_from(message_id)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .and_then(Option::take)
        else {
            return false;
        };
        // Receiver may already be gone if the caller gave up.
        let _ = call.tx.send(event);
        true
    }

    /// Forget a call without waking it.
    pub fn remove(&mut self, message_id: i32) -> bool {
        // ---
        usize::try_from(message_id)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .and_then(Option::take)
            .is_some()
    }

    /// Fail every call sent to `destination`. Returns how many were released.
    pub fn fail_module(&mut self, destination: i32) -> usize {
        // ---
        let mut released = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|c| c.destination == destination) {
                if let Some(call) = slot.take() {
                    let _ = call.tx.send(CallEvent::ModuleDisconnected);
                    released += 1;
                }
            }
        }
        released
    }

    /// Release every waiter by closing its channel.
    pub fn fail_all(&mut self) -> usize {
        // ---
        let released = self.len();
        self.slots.clear();
        released
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_register_and_complete() {
        // ---
        let mut pending = PendingCalls::new();
        let (id, rx) = pending.register(3);
        assert_eq!(id, 0);
        assert_eq!(pending.len(), 1);

        let payload = Bytes::from_static(b"reply");
        assert!(pending.complete(id, CallEvent::Reply(payload.clone())));
        assert_eq!(pending.len(), 0);

        match rx.blocking_recv().unwrap() {
            CallEvent::Reply(bytes) => assert_eq!(bytes, payload),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_ids_reuse_first_free_slot() {
        // ---
        let mut pending = PendingCalls::new();
        let (a, _ra) = pending.register(1);
        let (b, _rb) = pending.register(1);
        let (c, _rc) = pending.register(1);
        assert_eq!((a, b, c), (0, 1, 2));

        assert!(pending.remove(b));
        let (d, _rd) = pending.register(1);
        assert_eq!(d, 1);
    }

    #[test]
    fn test_complete_twice_releases_once() {
        // ---
        let mut pending = PendingCalls::new();
        let (id, _rx) = pending.register(1);
        assert!(pending.complete(id, CallEvent::Reply(Bytes::new())));
        assert!(!pending.complete(id, CallEvent::Reply(Bytes::new())));
        assert!(!pending.complete(-1, CallEvent::Reply(Bytes::new())));
        assert!(!pending.complete(99, CallEvent::Reply(Bytes::new())));
    }

    #[test]
    fn test_fail_module_only_hits_that_destination() {
        // ---
        let mut pending = PendingCalls::new();
        let (_, rx3) = pending.register(3);
        let (_, rx4) = pending.register(4);

        assert_eq!(pending.fail_module(3), 1);
        assert!(matches!(rx3.blocking_recv().unwrap(), CallEvent::ModuleDisconnected));
        assert_eq!(pending.len(), 1);
        drop(rx4);
    }

    #[test]
    fn test_fail_all_closes_channels() {
        // ---
        let mut pending = PendingCalls::new();
        let (_, rx1) = pending.register(1);
        let (_, rx2) = pending.register(2);

        assert_eq!(pending.fail_all(), 2);
        assert!(rx1.blocking_recv().is_err());
        assert!(rx2.blocking_recv().is_err());
        assert_eq!(pending.len(), 0);
    }
}
