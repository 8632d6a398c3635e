//! Forwarding a request's log events to the client that sent it.
//!
//! The daemon opens a `request` span carrying a numeric `client` field around
//! every request it runs. [`ClientLogLayer`] sees each event emitted inside
//! such a span, formats it as one line and hands it to the sender that
//! [`LogRouter::register`] associated with that client id. Events outside a
//! request span are left to the other layers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use super::codec::Frame;

/// Name of the span wrapping one request.
pub const REQUEST_SPAN: &str = "request";

/// Field of [`REQUEST_SPAN`] holding the client id.
pub const CLIENT_FIELD: &str = "client";

/// Maps client ids to the channel feeding that client's connection.
#[derive(Clone, Default)]
pub struct LogRouter {
    inner: Arc<RouterInner>,
}

#[derive(Default)]
struct RouterInner {
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, UnboundedSender<Frame>>>,
}

impl LogRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events tagged with the returned id to `sink` until the
    /// [`Registration`] is dropped.
    pub fn register(&self, sink: UnboundedSender<Frame>) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.clients.lock().insert(id, sink);
        Registration {
            id,
            router: self.clone(),
        }
    }

    /// Layer to install in the global subscriber.
    pub fn layer(&self) -> ClientLogLayer {
        ClientLogLayer {
            router: self.clone(),
        }
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    fn send(&self, id: u64, frame: Frame) {
        if let Some(sink) = self.inner.clients.lock().get(&id) {
            // The connection may already be gone; its log lines go with it.
            let _ = sink.send(frame);
        }
    }
}

/// Keeps a client registered with a [`LogRouter`].
pub struct Registration {
    id: u64,
    router: LogRouter,
}

impl Registration {
    /// Client id to record in the request span
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.router.inner.clients.lock().remove(&self.id);
    }
}

/// Subscriber layer that turns events into [`Frame::stderr`] lines.
pub struct ClientLogLayer {
    router: LogRouter,
}

struct ClientId(u64);

#[derive(Default)]
struct ClientIdVisitor(Option<u64>);

impl Visit for ClientIdVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == CLIENT_FIELD {
            self.0 = Some(value);
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == CLIENT_FIELD {
            self.0 = u64::try_from(value).ok();
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S> Layer<S> for ClientLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != REQUEST_SPAN {
            return;
        }
        let mut visitor = ClientIdVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(client), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(ClientId(client));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        let client = scope.into_iter().find_map(|span| {
            let extensions = span.extensions();
            let client = extensions.get::<ClientId>().map(|c| c.0);
            client
        });
        let Some(client) = client else {
            return;
        };

        let mut line = LineVisitor::default();
        event.record(&mut line);
        self.router.send(
            client,
            Frame::stderr(format!(
                "{} {}{}",
                event.metadata().level(),
                line.message,
                line.fields
            )),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::FrameKind;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;
    use tracing::{info, info_span, warn};
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_events_reach_only_their_client() {
        let router = LogRouter::new();
        let subscriber = tracing_subscriber::registry().with(router.layer());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = router.register(a_tx);
        let b = router.register(b_tx);

        tracing::subscriber::with_default(subscriber, || {
            info!("outside any request");
            let span = info_span!("request", client = a.id());
            let _entered = span.enter();
            let inner = info_span!("host", server = "box");
            let _inner = inner.enter();
            warn!(server = "box", "Remote revision differs");
        });

        let frame = a_rx.try_recv().unwrap();
        assert_eq!(frame.kind, FrameKind::Stderr);
        assert_eq!(frame.text, "WARN Remote revision differs server=box");
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
        drop(b);
    }

    #[test]
    fn test_dropping_registration_stops_forwarding() {
        let router = LogRouter::new();
        let subscriber = tracing_subscriber::registry().with(router.layer());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registration = router.register(tx);
        let id = registration.id();
        assert_eq!(router.client_count(), 1);

        drop(registration);
        assert_eq!(router.client_count(), 0);

        tracing::subscriber::with_default(subscriber, || {
            let span = info_span!("request", client = id);
            let _entered = span.enter();
            info!("nobody listening");
        });
        assert!(rx.try_recv().is_err());
    }
}
