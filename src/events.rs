// Typed event sources
//
// Subscribers run in subscription order with mutable access to a shared
// context. Any subscriber can stop propagation by returning Flow::Stop.

/// Whether an event keeps propagating to later subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<C, E> = Box<dyn FnMut(&mut C, &E) -> Flow>;

/// Ordered subscribers for events of type `E` delivered with context `C`.
pub struct EventSource<C, E> {
    subscribers: Vec<(SubscriptionId, Handler<C, E>)>,
    next_id: u64,
}

impl<C, E> EventSource<C, E> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&mut C, &E) -> Flow + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(handler)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    /// Deliver `event` to each subscriber in order, stopping at the first
    /// `Flow::Stop`, which is then returned.
    pub fn emit(&mut self, context: &mut C, event: &E) -> Flow {
        for (_, handler) in &mut self.subscribers {
            if handler(context, event) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<C, E> Default for EventSource<C, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_run_in_insertion_order() {
        let mut source: EventSource<Vec<&'static str>, u32> = EventSource::new();
        source.subscribe(|log, _| {
            log.push("first");
            Flow::Continue
        });
        source.subscribe(|log, _| {
            log.push("second");
            Flow::Continue
        });

        let mut log = Vec::new();
        assert_eq!(source.emit(&mut log, &1), Flow::Continue);
        assert_eq!(log, vec!["first", "second"]);
    }

    #[test]
    fn stop_short_circuits_later_subscribers() {
        let mut source: EventSource<u32, u32> = EventSource::new();
        source.subscribe(|count, _| {
            *count += 1;
            Flow::Continue
        });
        source.subscribe(|count, event| {
            *count += 1;
            if *event == 0 {
                Flow::Stop
            } else {
                Flow::Continue
            }
        });
        source.subscribe(|count, _| {
            *count += 100;
            Flow::Continue
        });

        let mut count = 0;
        assert_eq!(source.emit(&mut count, &0), Flow::Stop);
        assert_eq!(count, 2);

        count = 0;
        assert_eq!(source.emit(&mut count, &1), Flow::Continue);
        assert_eq!(count, 102);
    }

    #[test]
    fn unsubscribe_removes_only_that_subscriber() {
        let mut source: EventSource<Vec<u32>, u32> = EventSource::new();
        let a = source.subscribe(|seen, e| {
            seen.push(*e);
            Flow::Continue
        });
        let _b = source.subscribe(|seen, e| {
            seen.push(*e * 10);
            Flow::Continue
        });

        assert!(source.unsubscribe(a));
        assert!(!source.unsubscribe(a));
        assert_eq!(source.len(), 1);

        let mut seen = Vec::new();
        source.emit(&mut seen, &3);
        assert_eq!(seen, vec![30]);
    }

    #[test]
    fn ids_are_not_reused() {
        let mut source: EventSource<(), ()> = EventSource::new();
        let a = source.subscribe(|_, _| Flow::Continue);
        source.unsubscribe(a);
        let b = source.subscribe(|_, _| Flow::Continue);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_source_continues() {
        let mut source: EventSource<(), ()> = EventSource::default();
        assert!(source.is_empty());
        assert_eq!(source.emit(&mut (), &()), Flow::Continue);
    }
}
