//! Channel registry (component D).
//!
//! Channels are held in a `slab::Slab` arena and addressed by a stable
//! [`ChannelId`], replacing the raw-pointer aliasing of the original
//! design (SPEC_FULL §9). A `name -> ChannelId` index makes subscribe
//! and unsubscribe name lookups direct.

use std::collections::HashMap;
use std::os::fd::{OwnedFd, RawFd, AsRawFd};

use slab::Slab;

use crate::buffer;
use crate::session::SessionId;

/// Stable handle into the channel arena. Never reused while the channel
/// it names is alive; once a channel is destroyed its id is free for
/// slab reuse, matching slab's own key-reuse semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(usize);

struct Channel {
    name: Vec<u8>,
    fd: OwnedFd,
    actual_size: u64,
    writer: Option<SessionId>,
    readers: Vec<SessionId>,
}

impl Channel {
    fn is_empty(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// Outcome of a subscribe attempt that did not hit a capacity error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Approved(ChannelId),
    /// A writer subscribe on a channel that already has one.
    WriterConflict,
}

/// Why an unsubscribe request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeError {
    ChannelNotFound,
    /// Writer unsubscribe from a session that is not the channel's writer.
    NotTheWriter,
    /// Reader unsubscribe from a session with no matching reader entry.
    NotASubscribedReader,
}

/// An unsolicited reader-count notification the caller must deliver to
/// `writer` after committing the mutation that produced it.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub writer: SessionId,
    pub channel_name: Vec<u8>,
    pub num_readers: u16,
}

#[derive(Default)]
pub struct Registry {
    channels: Slab<Channel>,
    by_name: HashMap<Vec<u8>, ChannelId>,
    pending_events: Vec<PendingEvent>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn channel_fd(&self, id: ChannelId) -> RawFd {
        self.channels[id.0].fd.as_raw_fd()
    }

    /// §4.D `subscribe`.
    pub fn subscribe(
        &mut self,
        session: SessionId,
        name: &[u8],
        is_writer: bool,
        requested_size: u32,
        default_buffer_size: u64,
    ) -> anyhow::Result<SubscribeOutcome> {
        if let Some(&id) = self.by_name.get(name) {
            let channel = &mut self.channels[id.0];
            if is_writer {
                if channel.writer.is_some() {
                    return Ok(SubscribeOutcome::WriterConflict);
                }
                channel.writer = Some(session);
            } else {
                channel.readers.push(session);
                if channel.writer.is_some() {
                    let event = PendingEvent {
                        writer: channel.writer.unwrap(),
                        channel_name: channel.name.clone(),
                        num_readers: channel.readers.len() as u16,
                    };
                    self.pending_events.push(event);
                }
            }
            return Ok(SubscribeOutcome::Approved(id));
        }

        let size = if requested_size == 0 {
            default_buffer_size
        } else {
            requested_size as u64
        };
        let (fd, actual_size) = buffer::create(size)?;

        let channel = Channel {
            name: name.to_vec(),
            fd,
            actual_size,
            writer: is_writer.then_some(session),
            readers: if is_writer { Vec::new() } else { vec![session] },
        };
        let entry = self.channels.vacant_entry();
        let id = ChannelId(entry.key());
        entry.insert(channel);
        self.by_name.insert(name.to_vec(), id);
        Ok(SubscribeOutcome::Approved(id))
    }

    /// §4.D `unsubscribe`. Returns whether the channel was destroyed as
    /// a result, and drains any pending event produced by the mutation.
    pub fn unsubscribe(
        &mut self,
        session: SessionId,
        name: &[u8],
        is_writer: bool,
    ) -> Result<bool, UnsubscribeError> {
        let id = *self
            .by_name
            .get(name)
            .ok_or(UnsubscribeError::ChannelNotFound)?;
        let channel = &mut self.channels[id.0];

        if is_writer {
            if channel.writer != Some(session) {
                return Err(UnsubscribeError::NotTheWriter);
            }
            channel.writer = None;
        } else {
            let pos = channel
                .readers
                .iter()
                .position(|&s| s == session)
                .ok_or(UnsubscribeError::NotASubscribedReader)?;
            channel.readers.remove(pos);
            if let Some(writer) = channel.writer {
                self.pending_events.push(PendingEvent {
                    writer,
                    channel_name: channel.name.clone(),
                    num_readers: channel.readers.len() as u16,
                });
            }
        }

        let destroyed = channel.is_empty();
        if destroyed {
            self.by_name.remove(name);
            self.channels.remove(id.0);
        }
        Ok(destroyed)
    }

    /// Drain events produced by the most recent subscribe/unsubscribe call,
    /// in commit order.
    pub fn take_pending_events(&mut self) -> Vec<PendingEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[cfg(test)]
    pub fn reader_count(&self, name: &[u8]) -> Option<usize> {
        let id = *self.by_name.get(name)?;
        Some(self.channels[id.0].readers.len())
    }

    #[cfg(test)]
    pub fn actual_size(&self, name: &[u8]) -> Option<u64> {
        let id = *self.by_name.get(name)?;
        Some(self.channels[id.0].actual_size)
    }
}
