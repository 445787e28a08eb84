use std::collections::VecDeque;
use std::time::Instant;

/// Deferred work produced as a side effect of socket readiness. Events run
/// after I/O dispatch, before slots are reused, one at a time.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CoreEvent {
    /// An outgoing connect completed.
    TcpConnected(usize),
    /// An outgoing connect of a relay-punched connection completed.
    TcpRelaySessionConnected(usize),
    /// An incoming connection was accepted into the slot.
    TcpClientConnected(usize),
    /// The socket is gone; the slot transitions to free.
    TcpDisconnected(usize),
    /// The wire handshake completed and the session is running.
    NewCoreConnection(usize),
    /// Cooperative close request.
    CloseConnection(usize),
}

/// One-shot timed work.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimedEvent {
    /// Close duplicate sessions of the slot's (luid, ruid, rhid) triple.
    CloseParallel(usize),
}

/// FIFO of deferred events plus the one-shot timer list.
pub struct EventQueue {
    events: VecDeque<CoreEvent>,
    timers: Vec<(Instant, TimedEvent)>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue {
            events: VecDeque::new(),
            timers: Vec::new(),
        }
    }

    #[inline]
    pub fn push(&mut self, event: CoreEvent) {
        self.events.push_back(event);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<CoreEvent> {
        self.events.pop_front()
    }

    /// Schedules a one-shot timed event.
    #[inline]
    pub fn schedule(&mut self, deadline: Instant, event: TimedEvent) {
        self.timers.push((deadline, event));
    }

    /// Removes and returns every timed event whose deadline has passed.
    pub fn due(&mut self, now: Instant) -> Vec<TimedEvent> {
        let mut fired = Vec::new();
        let mut index = 0;

        while index < self.timers.len() {
            if self.timers[index].0 <= now {
                fired.push(self.timers.swap_remove(index).1);
            } else {
                index += 1;
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let mut queue = EventQueue::new();
        queue.push(CoreEvent::TcpConnected(1));
        queue.push(CoreEvent::NewCoreConnection(1));

        assert_eq!(queue.pop(), Some(CoreEvent::TcpConnected(1)));
        assert_eq!(queue.pop(), Some(CoreEvent::NewCoreConnection(1)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_timers_fire_once_when_due() {
        let mut queue = EventQueue::new();
        let now = Instant::now();

        queue.schedule(now + Duration::from_secs(1), TimedEvent::CloseParallel(3));

        assert!(queue.due(now).is_empty());
        assert_eq!(
            queue.due(now + Duration::from_secs(1)),
            vec![TimedEvent::CloseParallel(3)]
        );
        assert!(queue.due(now + Duration::from_secs(2)).is_empty());
    }
}
