//! Single-threaded readiness-based reactor (component F).
//!
//! Classic select/poll pattern via `mio`: one `Poll` instance owns the
//! listening link and every accepted session, addressed by `mio::Token`.
//! There is no suspension mid-handler: each readiness notification runs
//! its session's dispatch to completion before the next is drawn.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::auth::PermittedCredentials;
use crate::link::{Link, Listener};
use crate::registry::Registry;
use crate::session::{Dispatch, Session, SessionId};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub struct Reactor {
    poll: Poll,
    listener: Listener,
    sessions: Slab<Session>,
}

impl Reactor {
    pub fn new(mut listener: Listener) -> Result<Reactor> {
        let poll = Poll::new().context("creating mio Poll")?;
        poll.registry()
            .register(listener.inner_mut(), LISTENER_TOKEN, Interest::READABLE)
            .context("registering listening socket")?;
        Ok(Reactor {
            poll,
            listener,
            sessions: Slab::new(),
        })
    }

    /// Run until `shutdown` is set (§4.I.8) or a poll error occurs.
    pub fn run(
        &mut self,
        default_buffer_size: u64,
        permitted: &PermittedCredentials,
        registry: &mut Registry,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        let mut events = Events::with_capacity(128);
        while !shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("polling reactor"),
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_ready(permitted);
                } else {
                    self.dispatch_ready(event.token(), default_buffer_size, registry);
                }
            }
        }
        info!("shutdown signal received, stopping reactor");
        Ok(())
    }

    fn accept_ready(&mut self, permitted: &PermittedCredentials) {
        loop {
            match self.listener.accept() {
                Ok((stream, creds)) => {
                    if !permitted.admits(&creds) {
                        permitted.log_rejection(&creds);
                        continue;
                    }
                    self.register_session(stream, creds.pid());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn register_session(&mut self, mut stream: mio::net::UnixStream, pid: i32) {
        let entry = self.sessions.vacant_entry();
        let token = Token(entry.key());
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
        {
            warn!("pid {pid}: registering session failed: {e}");
            return;
        }
        let session = Session::new(SessionId(token.0), Link::new(stream), pid);
        entry.insert(session);
        info!("pid {pid}: connection admitted");
    }

    fn dispatch_ready(&mut self, token: Token, default_buffer_size: u64, registry: &mut Registry) {
        let Some(session) = self.sessions.get_mut(token.0) else {
            return;
        };

        let outcome = session.on_readable(default_buffer_size, registry);
        match outcome {
            Dispatch::Continue(events) => self.deliver_events(events),
            Dispatch::Disconnect(events) => {
                let mut session = self.sessions.remove(token.0);
                let _ = self
                    .poll
                    .registry()
                    .deregister(session.stream_mut());
                self.deliver_events(events);
            }
        }
    }

    fn deliver_events(&mut self, events: Vec<crate::registry::PendingEvent>) {
        for event in events {
            if let Some(session) = self.sessions.get_mut(event.writer.0) {
                session.deliver_event(&event.channel_name, event.num_readers);
            }
        }
    }
}
