//! Name-keyed fan-out of events to handlers.
//!
//! Handlers for one name run in registration order. The table lock is
//! released before any handler runs, so handlers may register, remove, or
//! tear down the connection from inside a callback.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures_util::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::{
    event::{Event, EventName},
    message::Message,
};

/// A registered callback.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Token identifying one registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Handler table keyed by [`EventName`].
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<EventName, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("EventDispatcher")
            .field("names", &handlers.len())
            .field("handlers", &handlers.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// Registering the same closure twice yields two independent entries.
    pub fn on<F>(&self, name: impl Into<EventName>, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(name.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one registration. Returns false if it was not present.
    pub fn off(&self, name: &EventName, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(entry, _)| *entry != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(name);
        }
        removed
    }

    /// Register `handler` and return a guard that removes it on drop.
    pub fn subscribe<F>(self: &Arc<Self>, name: impl Into<EventName>, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let name = name.into();
        let id = self.on(name.clone(), handler);
        Subscription {
            dispatcher: Some(Arc::downgrade(self)),
            name,
            id,
        }
    }

    /// Forward every event under `names` into an async stream.
    pub fn listen<I, N>(self: &Arc<Self>, names: I) -> EventStream
    where
        I: IntoIterator<Item = N>,
        N: Into<EventName>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = names
            .into_iter()
            .map(|name| {
                let tx = tx.clone();
                self.subscribe(name, move |event| {
                    let _ = tx.send(event.clone());
                })
            })
            .collect();
        EventStream { rx, subscriptions }
    }

    /// Number of handlers registered under `name`.
    pub fn handler_count(&self, name: &EventName) -> usize {
        self.handlers.read().get(name).map_or(0, Vec::len)
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Deliver `event` to every handler under its name.
    pub fn emit(&self, event: &Event) {
        self.emit_while(event, || true);
    }

    /// Deliver an inbound message: first as `message`, then under its tag
    /// with the body only.
    pub fn dispatch_message(&self, message: Message) {
        self.dispatch_message_while(message, || true);
    }

    /// Like [`Self::emit`], but checks `live` before each handler and stops
    /// at the first false.
    pub(crate) fn emit_while(&self, event: &Event, live: impl Fn() -> bool) -> bool {
        let name = event.name();
        let snapshot: Vec<Handler> = match self.handlers.read().get(&name) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => {
                trace!(event = %name, "No handlers");
                return live();
            }
        };

        for handler in snapshot {
            if !live() {
                return false;
            }
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(event = %name, "Event handler panicked");
            }
        }
        true
    }

    pub(crate) fn dispatch_message_while(&self, message: Message, live: impl Fn() -> bool) {
        let typed = Event::typed(&message);
        if self.emit_while(&Event::Message(message), &live) {
            self.emit_while(&typed, &live);
        }
    }
}

/// Registration guard; unregisters its handler when dropped.
#[must_use = "dropping a Subscription unregisters its handler"]
#[derive(Debug)]
pub struct Subscription {
    dispatcher: Option<Weak<EventDispatcher>>,
    name: EventName,
    id: HandlerId,
}

impl Subscription {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn name(&self) -> &EventName {
        &self.name
    }

    /// Keep the handler registered for the dispatcher's lifetime.
    pub fn detach(mut self) -> HandlerId {
        self.dispatcher = None;
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take().and_then(|weak| weak.upgrade()) {
            dispatcher.off(&self.name, self.id);
        }
    }
}

/// Async stream of events, fed by handlers that live as long as the stream.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
    subscriptions: Vec<Subscription>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving; already-delivered events remain readable.
    pub fn close(&mut self) {
        self.subscriptions.clear();
        self.rx.close();
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll_recv(cx)
    }
}
