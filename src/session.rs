//! Per-connected-client state machine (component E).
//!
//! A `Session` owns its [`Link`](crate::link::Link) and the list of
//! channels it currently holds a subscription to. It never reaches into
//! another session directly; reader-count notifications bound for other
//! writers are handed back to the caller as [`PendingEvent`]s, for the
//! reactor to route through the session table it alone has access to.

use std::os::fd::RawFd;

use log::{debug, warn};

use crate::link::Link;
use crate::registry::{PendingEvent, Registry, SubscribeOutcome};
use crate::wire::{self, DecodeError, Request, MAX_MESSAGE_SIZE};

/// Stable key for a session, assigned by the reactor (a `mio::Token`
/// value) and passed through to the registry instead of a borrowed
/// reference, per SPEC_FULL §9's "cyclic reference" design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub usize);

struct Subscription {
    channel_name: Vec<u8>,
    is_writer: bool,
}

/// What the reactor should do with this session's entry after a
/// read-readiness dispatch.
pub enum Dispatch {
    /// Session stays registered. Any events must still be delivered.
    Continue(Vec<PendingEvent>),
    /// Session must be torn down; `cleanup` has already run and these
    /// events (from the subscriptions it held) must still be delivered.
    Disconnect(Vec<PendingEvent>),
}

pub struct Session {
    id: SessionId,
    link: Link,
    pid: i32,
    event_mode: bool,
    subscriptions: Vec<Subscription>,
}

impl Session {
    pub fn new(id: SessionId, link: Link, pid: i32) -> Session {
        Session {
            id,
            link,
            pid,
            event_mode: false,
            subscriptions: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn raw_fd(&self) -> RawFd {
        self.link.raw_fd()
    }

    pub fn stream_mut(&mut self) -> &mut mio::net::UnixStream {
        self.link.stream_mut()
    }

    /// Handle one read-readiness notification: read exactly one framed
    /// message, dispatch it, and report what the reactor should do next.
    pub fn on_readable(&mut self, default_buffer_size: u64, registry: &mut Registry) -> Dispatch {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let bytes_read = match self.link.read(&mut buf) {
            Ok(0) => {
                debug!("pid {}: peer closed", self.pid);
                return Dispatch::Disconnect(self.cleanup(registry));
            }
            Ok(n) => n,
            Err(e) => {
                warn!("pid {}: read error: {e}", self.pid);
                return Dispatch::Disconnect(self.cleanup(registry));
            }
        };

        let request = match wire::decode_request(&buf[..bytes_read]) {
            Ok(r) => r,
            Err(e) => {
                warn!("pid {}: {}", self.pid, fatal_reason(e));
                return Dispatch::Disconnect(self.cleanup(registry));
            }
        };

        self.dispatch(request, default_buffer_size, registry)
    }

    fn dispatch(
        &mut self,
        request: Request,
        default_buffer_size: u64,
        registry: &mut Registry,
    ) -> Dispatch {
        match request {
            Request::EventMode => {
                self.event_mode = true;
                self.reply_approval();
                Dispatch::Continue(Vec::new())
            }
            Request::NoEventMode => {
                self.event_mode = false;
                self.reply_approval();
                Dispatch::Continue(Vec::new())
            }
            Request::WriterSubscribe {
                requested_size,
                channel_name,
            } => self.handle_subscribe(channel_name, true, requested_size, default_buffer_size, registry),
            Request::ReaderSubscribe {
                requested_size,
                channel_name,
            } => self.handle_subscribe(channel_name, false, requested_size, default_buffer_size, registry),
            Request::WriterUnsubscribe { channel_name } => {
                self.handle_unsubscribe(channel_name, true, registry)
            }
            Request::ReaderUnsubscribe { channel_name } => {
                self.handle_unsubscribe(channel_name, false, registry)
            }
        }
    }

    fn handle_subscribe(
        &mut self,
        channel_name: Vec<u8>,
        is_writer: bool,
        requested_size: u32,
        default_buffer_size: u64,
        registry: &mut Registry,
    ) -> Dispatch {
        if channel_name.is_empty() {
            self.reply_denial();
            return Dispatch::Continue(Vec::new());
        }

        let outcome = registry.subscribe(
            self.id,
            &channel_name,
            is_writer,
            requested_size,
            default_buffer_size,
        );

        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                warn!("pid {}: subscribe to {:?} failed: {e:#}", self.pid, String::from_utf8_lossy(&channel_name));
                if !self.reply_denial() {
                    return Dispatch::Disconnect(self.cleanup(registry));
                }
                return Dispatch::Continue(registry.take_pending_events());
            }
        };

        match outcome {
            SubscribeOutcome::WriterConflict => {
                self.reply_denial();
                Dispatch::Continue(registry.take_pending_events())
            }
            SubscribeOutcome::Approved(channel_id) => {
                self.subscriptions.push(Subscription {
                    channel_name: channel_name.clone(),
                    is_writer,
                });

                if !self.reply_approval() {
                    // Approval itself failed to send; nothing to roll
                    // back for the client (it never got a reply), but
                    // the session can no longer be trusted.
                    return Dispatch::Disconnect(self.cleanup(registry));
                }

                let fd = registry.channel_fd(channel_id);
                if self.link.send_fd(fd).is_err() {
                    warn!("pid {}: FD transfer failed after approval", self.pid);
                    return Dispatch::Disconnect(self.cleanup(registry));
                }

                Dispatch::Continue(registry.take_pending_events())
            }
        }
    }

    fn handle_unsubscribe(
        &mut self,
        channel_name: Vec<u8>,
        is_writer: bool,
        registry: &mut Registry,
    ) -> Dispatch {
        let pos = self
            .subscriptions
            .iter()
            .position(|s| s.channel_name == channel_name && s.is_writer == is_writer);

        let Some(pos) = pos else {
            self.reply_denial();
            return Dispatch::Continue(Vec::new());
        };

        match registry.unsubscribe(self.id, &channel_name, is_writer) {
            Ok(_destroyed) => {
                self.subscriptions.remove(pos);
                self.reply_approval();
                Dispatch::Continue(registry.take_pending_events())
            }
            Err(_) => {
                self.reply_denial();
                Dispatch::Continue(Vec::new())
            }
        }
    }

    /// Unsubscribe from every channel this session still holds, as part
    /// of disconnect (§4.E) or a terminal dispatch failure.
    fn cleanup(&mut self, registry: &mut Registry) -> Vec<PendingEvent> {
        for sub in self.subscriptions.drain(..) {
            // The registry state is what this session itself put there;
            // absence here would indicate a prior inconsistency, not a
            // legitimate client error, so it is logged and ignored.
            if let Err(e) = registry.unsubscribe(self.id, &sub.channel_name, sub.is_writer) {
                warn!(
                    "pid {}: cleanup unsubscribe from {:?} failed: {e:?}",
                    self.pid,
                    String::from_utf8_lossy(&sub.channel_name)
                );
            }
        }
        registry.take_pending_events()
    }

    /// Deliver a reader-count notification to this session if, and only
    /// if, it is currently an event-mode writer. Failures are swallowed
    /// (§7 category 6): an event is advisory and must never disconnect
    /// the writer it is meant for.
    pub fn deliver_event(&mut self, channel_name: &[u8], num_readers: u16) {
        if !self.event_mode {
            return;
        }
        match wire::encode_channel_subscription_event(num_readers, channel_name) {
            Some(msg) => {
                if let Err(e) = self.link.write(&msg) {
                    debug!("pid {}: event delivery swallowed: {e}", self.pid);
                }
            }
            None => warn!(
                "pid {}: channel name too long to encode subscription event",
                self.pid
            ),
        }
    }

    fn reply_approval(&mut self) -> bool {
        self.link.write(&wire::encode_approval()).is_ok()
    }

    fn reply_denial(&mut self) -> bool {
        self.link.write(&wire::encode_denial()).is_ok()
    }
}

fn fatal_reason(e: DecodeError) -> String {
    format!("protocol violation: {e}")
}
