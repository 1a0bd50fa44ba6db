//! Resend requests, with backoff after send errors.
//!
//! Requests are sent from the playback thread, so a failing or stalled control socket
//! must not hold it up: sends are bounded by a write timeout, and after a failure no
//! request is sent for a while.

use raop_proto::control::ResendRequest;
use raop_utils::time;

use crate::{
    connection::Shared,
    socket::{self, DatagramSocket},
};

/// What became of a resend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResendOutcome {
    Sent,
    /// The connection is not running.
    Inactive,
    /// A send failed no longer than the backoff window ago.
    Suppressed,
    /// The send failed (or was dropped to simulate a bad connection).
    Failed,
}

/// Asks the peer to retransmit `count` packets starting at sequence number `first`.
pub(crate) fn request_resend<S: DatagramSocket>(
    shared: &Shared<S>,
    first: u16,
    count: u16,
    now: u64,
) -> ResendOutcome {
    let id = shared.id;

    if !shared.is_running() {
        log::debug!("{id}: resend request for {count} packets from {first} while not running");
        return ResendOutcome::Inactive;
    }

    let backoff = time::duration_to_nanos(shared.config.resend_error_backoff);

    let since_error = shared
        .lock()
        .last_resend_error
        .map(|t| now.saturating_sub(t));

    if let Some(elapsed) = since_error.filter(|&e| e <= backoff) {
        log::debug!(
            "{id}: suppressing a resend request for {count} packets from {first}, \
            the control socket failed {} ms ago",
            elapsed / time::NANOS_PER_MILLI,
        );
        return ResendOutcome::Suppressed;
    }

    let request = ResendRequest { first, count }.encode();
    let sock = &shared.sockets.control;

    let result = if shared.dropper.should_drop() {
        log::trace!("{id}: dropping a resend request to simulate a bad connection");
        Err(std::io::ErrorKind::Other.into())
    } else {
        sock.set_write_timeout(Some(shared.config.resend_send_timeout))
            .and_then(|()| socket::send_packet(sock, &request, shared.peers.control))
    };

    match result {
        Ok(()) => {
            shared.lock().last_resend_error = None;
            log::trace!("{id}: requested resend of {count} packets from {first}");
            ResendOutcome::Sent
        }
        Err(e) => {
            shared.lock().last_resend_error = Some(now);
            log::debug!(
                "{id}: error sending a resend request for {count} packets from {first}: {e}, \
                backing off"
            );
            ResendOutcome::Failed
        }
    }
}
