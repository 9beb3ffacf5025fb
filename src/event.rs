//! A tiny per-session event bus.
//!
//! The original implementation keeps a single process-wide `clear_cache`
//! event that every dimension subscribes to. Per §9's "Context propagation"
//! redesign note, Menger scopes the bus to a [`Context`](crate::Context)
//! instead of a global: subscribers are registered against one session and
//! dropped with it.

/// Names of events the bus carries. Only one is needed today, but the type
/// keeps the door open without requiring stringly-typed event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Fired after any structural mutation of a dimension (create, rename,
    /// reparent, delete, merge, prune).
    ClearCache,
}

type Callback = Box<dyn FnMut() + 'static>;

/// A registry of callbacks keyed by [`Event`].
#[derive(Default)]
pub struct Bus {
    clear_cache: Vec<Callback>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback to run whenever `event` is triggered.
    pub fn subscribe(&mut self, event: Event, callback: impl FnMut() + 'static) {
        match event {
            Event::ClearCache => self.clear_cache.push(Box::new(callback)),
        }
    }

    /// Run every callback registered for `event`.
    pub fn trigger(&mut self, event: Event) {
        match event {
            Event::ClearCache => {
                for cb in &mut self.clear_cache {
                    cb();
                }
            }
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("clear_cache_subscribers", &self.clear_cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn trigger_runs_all_subscribers() {
        let mut bus = Bus::new();
        let hits = Rc::new(Cell::new(0));

        let h1 = hits.clone();
        bus.subscribe(Event::ClearCache, move || h1.set(h1.get() + 1));
        let h2 = hits.clone();
        bus.subscribe(Event::ClearCache, move || h2.set(h2.get() + 1));

        bus.trigger(Event::ClearCache);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn trigger_with_no_subscribers_is_a_no_op() {
        let mut bus = Bus::new();
        bus.trigger(Event::ClearCache);
    }
}
