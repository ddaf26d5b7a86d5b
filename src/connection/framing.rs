//! Framing and protocol negotiation run by the processor task.
//!
//! ```text
//! Unformatted ──format matched──► Unprepared ──prepare()──► Ready ──pop()*──► deliver
//! ```
//!
//! Each pass works on whatever the receive buffer holds; "need more data" at any
//! stage ends the pass without error and the next notification resumes it.

use super::{Connection, OnReceive};
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::utils::metrics::global_metrics;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FramingState {
    Unformatted,
    Unprepared,
    Ready,
}

/// Outcome of extracting and delivering packets.
pub(crate) enum Flow {
    /// Keep the connection; wait for the next notification.
    Continue,
    /// Tear the connection down.
    Abort(ProtocolError),
}

pub(crate) struct Framer {
    conn: Connection,
    on_receive: OnReceive,
    state: FramingState,
}

impl Framer {
    pub(crate) fn new(conn: Connection, on_receive: OnReceive) -> Self {
        Self {
            conn,
            on_receive,
            state: FramingState::Unformatted,
        }
    }

    /// Run one processing pass over the receive buffer.
    pub(crate) async fn process(&mut self) -> Result<()> {
        let conn = self.conn.clone();
        let recv = &conn.inner.recv;

        if self.state == FramingState::Unformatted {
            match conn.inner.registry.match_format(recv) {
                Ok(format) => {
                    conn.bind_format(format);
                    self.state = FramingState::Unprepared;
                }
                Err(ProtocolError::DataNotReady) => return Ok(()),
                Err(e) => {
                    warn!(
                        session = %conn.session_id(),
                        peer = %conn.source(),
                        "{}",
                        constants::ERR_NO_FORMAT_MATCH
                    );
                    return Err(e);
                }
            }
        }

        let Some(format) = conn.packet_format() else {
            return Err(ProtocolError::Custom(
                "packet format missing after negotiation".to_string(),
            ));
        };

        if self.state == FramingState::Unprepared {
            self.state = FramingState::Ready;
            if let Some(reply) = format.prepare(recv)? {
                conn.write_transport(&reply).await?;
            }
            if recv.is_empty() {
                return Ok(());
            }
        }

        loop {
            let packet = match format.pop(recv) {
                Ok(Some(packet)) => packet,
                Ok(None) | Err(ProtocolError::DataNotReady) => return Ok(()),
                Err(e) => {
                    warn!(session = %conn.session_id(), format = format.name(), error = %e, "Packet extraction failed");
                    return Err(e);
                }
            };
            global_metrics().packet_received();

            if conn.protocol().is_none() {
                conn.bind_protocol(packet.protocol());
            }

            if let Flow::Abort(e) = self.deliver(packet) {
                return Err(e);
            }
        }
    }

    /// Hand one packet's contents to the receive callback.
    fn deliver(&self, packet: Packet) -> Flow {
        if packet.is_raw() {
            global_metrics().message_decoded();
            return match (self.on_receive)(&self.conn, Message::raw(packet.payload)) {
                Ok(()) => Flow::Continue,
                Err(e) => Flow::Abort(e),
            };
        }

        let Some(codec) = self.conn.codec() else {
            warn!(session = %self.conn.session_id(), "{}", constants::ERR_CODEC_NOT_READY);
            return Flow::Abort(ProtocolError::CodecNotFound {
                protocol_type: packet.protocol_type,
                version: packet.version,
            });
        };

        let (mut next, mut rest) = match codec.decode(packet.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(session = %self.conn.session_id(), error = %e, "Payload decode failed");
                return Flow::Abort(e);
            }
        };

        while let Some(msg) = next.take() {
            global_metrics().message_decoded();
            if let Err(e) = (self.on_receive)(&self.conn, msg) {
                warn!(session = %self.conn.session_id(), error = %e, "Receive callback failed");
                return Flow::Abort(e);
            }
            if rest.is_empty() {
                break;
            }

            let before = rest.len();
            match codec.decode(rest) {
                // A decode that consumes nothing would spin forever.
                Ok((_, remaining)) if remaining.len() >= before => break,
                Ok((msg, remaining)) => {
                    next = msg;
                    rest = remaining;
                }
                Err(e) => {
                    debug!(session = %self.conn.session_id(), error = %e, "Stopped decoding packet remainder");
                    break;
                }
            }
        }

        Flow::Continue
    }
}
