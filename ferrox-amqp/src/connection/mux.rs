//! Routes incoming frames by channel
//!
//! Open and Close concern the connection itself. Begin and End map and unmap
//! sessions on channels. Everything else goes to the session mapped on the
//! frame's incoming channel.

use ferrox_amqp_types::{
    definitions::{AmqpError, ConnectionError},
    performatives::{Begin, End},
    states::ConnectionState,
};
use tracing::{instrument, trace};

use crate::{
    control::SessionId,
    error::ScopedError,
    frames::amqp::{Frame, FrameBody},
    session::{Session, SessionConfig},
};

use super::{scoped_to_local, Connection, Error};

impl Connection {
    /// Handles one frame read from the transport once the connection is open
    #[instrument(name = "RECV", skip_all)]
    pub(crate) fn on_incoming(&mut self, frame: Frame) -> Result<(), Error> {
        let Frame { channel, body } = frame;
        trace!(channel, frame = ?body);

        match self.state {
            ConnectionState::Opened => {}
            // Only the peer's Close matters once ours is out
            ConnectionState::CloseSent | ConnectionState::Discarding => {
                return match body {
                    FrameBody::Close(close) => self.on_incoming_close(close),
                    _ => Ok(()),
                };
            }
            _ => {
                return Err(Self::local_error(
                    AmqpError::IllegalState,
                    "Frame received on a connection that is not open",
                ))
            }
        }

        match body {
            FrameBody::Open(_) => Err(Self::local_error(
                AmqpError::IllegalState,
                "Open received on an open connection",
            )),
            FrameBody::Begin(begin) => self.on_incoming_begin(channel, begin),
            FrameBody::End(end) => self.on_incoming_end(channel, end),
            FrameBody::Close(close) => self.on_incoming_close(close),
            // Idle timeout is tracked by the transport
            FrameBody::Empty => Ok(()),
            body => self.on_session_frame(channel, body),
        }
    }

    fn session_key_by_incoming_channel(&self, channel: u16) -> Result<usize, Error> {
        self.session_by_incoming_channel
            .get(&channel)
            .copied()
            .ok_or_else(|| {
                Self::local_error(AmqpError::NotFound, "No session mapped on the channel")
            })
    }

    pub(super) fn on_incoming_begin(&mut self, channel: u16, begin: Begin) -> Result<(), Error> {
        if channel > self.local_open.channel_max.0 {
            return Err(Self::local_error(
                ConnectionError::FramingError,
                "Begin on a channel above channel-max",
            ));
        }
        if self.session_by_incoming_channel.contains_key(&channel) {
            return Err(Self::local_error(
                AmqpError::NotAllowed,
                "Begin on a channel already in use",
            ));
        }

        match begin.remote_channel {
            // Answer to one of ours
            Some(outgoing_channel) => {
                let key = outgoing_channel as usize;
                let session = self.sessions.get_mut(key).ok_or_else(|| {
                    Self::local_error(AmqpError::NotFound, "Begin answers an unknown channel")
                })?;
                session
                    .on_incoming_begin(channel, begin)
                    .map_err(scoped_to_local)?;
                self.session_by_incoming_channel.insert(channel, key);
            }
            // The peer initiates
            None => {
                let key = self.sessions.vacant_key();
                if key > self.agreed_channel_max as usize {
                    return Err(Self::local_error(
                        AmqpError::ResourceLimitExceeded,
                        "No channel left for a remotely initiated session",
                    ));
                }
                self.session_serial += 1;
                let id = SessionId {
                    key,
                    serial: self.session_serial,
                };
                let mut session =
                    Session::new(id, key as u16, SessionConfig::default(), self.max_frame_size);
                session
                    .on_incoming_begin(channel, begin)
                    .map_err(scoped_to_local)?;
                session
                    .send_begin(&mut self.outbox)
                    .map_err(scoped_to_local)?;
                if let Some(relay) = session.take_relay() {
                    let _ = self.incoming_sessions.send(relay);
                }
                self.sessions.insert(session);
                self.session_by_incoming_channel.insert(channel, key);
            }
        }
        Ok(())
    }

    pub(super) fn on_incoming_end(&mut self, channel: u16, end: End) -> Result<(), Error> {
        let key = self.session_key_by_incoming_channel(channel)?;
        if let Some(session) = self.sessions.get_mut(key) {
            session
                .on_incoming_end(end, &mut self.outbox)
                .map_err(scoped_to_local)?;
        }
        self.drop_if_unmapped(key);
        Ok(())
    }

    /// Hands a link level frame to its session
    ///
    /// A session scoped violation ends that session only; link scoped ones
    /// have already been dealt with by the session.
    fn on_session_frame(&mut self, channel: u16, body: FrameBody) -> Result<(), Error> {
        let key = self.session_key_by_incoming_channel(channel)?;
        let Some(session) = self.sessions.get_mut(key) else {
            return Ok(());
        };
        match session.on_incoming(body, &mut self.outbox) {
            Ok(()) => {}
            Err(ScopedError::Session(error)) => session.fail(error, &mut self.outbox),
            Err(err) => return Err(scoped_to_local(err)),
        }
        self.drop_if_unmapped(key);
        Ok(())
    }
}
