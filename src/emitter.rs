//! Listener registry shared by ports, stdio streams and worker handles.
//!
//! Besides plain `on`/`off`/`emit`, the registry exposes an explicit
//! interest hook: subscribers to [`Emitter::on_interest_change`] hear about
//! the first listener being added for a name and the last one going away.
//! Keep-alive tracking is built on that hook and nothing else.

use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

pub trait Event {
    type Name: Copy + Eq + Hash + Debug + 'static;

    fn name(&self) -> Self::Name;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Rc<dyn Fn(&E)>;
type InterestHook = Rc<dyn Fn(bool)>;

struct Entry<E: Event> {
    id: ListenerId,
    name: E::Name,
    once: bool,
    listener: Listener<E>,
}

pub struct Emitter<E: Event> {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<Entry<E>>>,
    hooks: RefCell<Vec<(E::Name, InterestHook)>>,
}

impl<E: Event> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Emitter<E> {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            listeners: RefCell::new(Vec::new()),
            hooks: RefCell::new(Vec::new()),
        }
    }

    pub fn on(&self, name: E::Name, listener: impl Fn(&E) + 'static) -> ListenerId {
        self.add(name, false, Rc::new(listener))
    }

    /// Listener removed right before its first call.
    pub fn once(&self, name: E::Name, listener: impl Fn(&E) + 'static) -> ListenerId {
        self.add(name, true, Rc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.listeners.borrow_mut();
            listeners
                .iter()
                .position(|e| e.id == id)
                .map(|pos| listeners.remove(pos).name)
        };
        match removed {
            Some(name) => {
                if self.listener_count(name) == 0 {
                    self.notify(name, false);
                }
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, name: E::Name) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|e| e.name == name)
            .count()
    }

    /// Calls every listener registered for the event's name. Returns whether there were any.
    pub fn emit(&self, event: &E) -> bool {
        let name = event.name();
        let (targets, dropped_once) = {
            let mut listeners = self.listeners.borrow_mut();
            let targets: Vec<Listener<E>> = listeners
                .iter()
                .filter(|e| e.name == name)
                .map(|e| e.listener.clone())
                .collect();
            let before = listeners.len();
            listeners.retain(|e| !(e.once && e.name == name));
            (targets, before != listeners.len())
        };
        if dropped_once && self.listener_count(name) == 0 {
            self.notify(name, false);
        }
        for listener in &targets {
            listener(event);
        }
        !targets.is_empty()
    }

    pub fn remove_listeners(&self, name: E::Name) {
        let removed = {
            let mut listeners = self.listeners.borrow_mut();
            let before = listeners.len();
            listeners.retain(|e| e.name != name);
            before != listeners.len()
        };
        if removed {
            self.notify(name, false);
        }
    }

    /// Drops every listener, reporting lost interest for each name that had some.
    pub fn remove_all(&self) {
        let names: Vec<E::Name> = {
            let mut listeners = self.listeners.borrow_mut();
            let mut names = Vec::new();
            for entry in listeners.drain(..) {
                if !names.contains(&entry.name) {
                    names.push(entry.name);
                }
            }
            names
        };
        for name in names {
            self.notify(name, false);
        }
    }

    /// `hook(true)` fires when `name` goes from zero listeners to one,
    /// `hook(false)` when it goes back to zero.
    pub fn on_interest_change(&self, name: E::Name, hook: impl Fn(bool) + 'static) {
        self.hooks.borrow_mut().push((name, Rc::new(hook)));
    }

    fn add(&self, name: E::Name, once: bool, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let first = self.listener_count(name) == 0;
        self.listeners.borrow_mut().push(Entry {
            id,
            name,
            once,
            listener,
        });
        if first {
            self.notify(name, true);
        }
        id
    }

    fn notify(&self, name: E::Name, interested: bool) {
        let hooks: Vec<InterestHook> = self
            .hooks
            .borrow()
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, h)| h.clone())
            .collect();
        for hook in hooks {
            hook(interested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Pong,
    }

    struct Ev(Kind, u32);

    impl Event for Ev {
        type Name = Kind;
        fn name(&self) -> Kind {
            self.0
        }
    }

    #[test]
    fn test_emit_reaches_matching_listeners_only() {
        let em: Emitter<Ev> = Emitter::new();
        let got = Rc::new(RefCell::new(Vec::new()));
        let g = got.clone();
        em.on(Kind::Ping, move |e| g.borrow_mut().push(e.1));
        assert!(em.emit(&Ev(Kind::Ping, 1)));
        assert!(!em.emit(&Ev(Kind::Pong, 2)));
        assert_eq!(*got.borrow(), vec![1]);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let em: Emitter<Ev> = Emitter::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        em.once(Kind::Ping, move |_| h.set(h.get() + 1));
        em.emit(&Ev(Kind::Ping, 0));
        em.emit(&Ev(Kind::Ping, 0));
        assert_eq!(hits.get(), 1);
        assert_eq!(em.listener_count(Kind::Ping), 0);
    }

    #[test]
    fn test_interest_hook_fires_on_edges_only() {
        let em: Emitter<Ev> = Emitter::new();
        let edges = Rc::new(RefCell::new(Vec::new()));
        let e = edges.clone();
        em.on_interest_change(Kind::Ping, move |on| e.borrow_mut().push(on));

        let a = em.on(Kind::Ping, |_| {});
        let b = em.on(Kind::Ping, |_| {});
        let c = em.on(Kind::Ping, |_| {});
        em.on(Kind::Pong, |_| {});
        assert_eq!(*edges.borrow(), vec![true]);

        assert!(em.off(b));
        assert!(em.off(a));
        assert_eq!(*edges.borrow(), vec![true]);
        assert!(em.off(c));
        assert!(!em.off(c));
        assert_eq!(*edges.borrow(), vec![true, false]);
    }

    #[test]
    fn test_remove_all_reports_lost_interest() {
        let em: Emitter<Ev> = Emitter::new();
        let lost = Rc::new(Cell::new(0));
        let l = lost.clone();
        em.on_interest_change(Kind::Pong, move |on| {
            if !on {
                l.set(l.get() + 1)
            }
        });
        em.on(Kind::Pong, |_| {});
        em.on(Kind::Pong, |_| {});
        em.remove_all();
        assert_eq!(lost.get(), 1);
        assert_eq!(em.listener_count(Kind::Pong), 0);
    }
}
