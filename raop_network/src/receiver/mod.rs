//! The per-connection receive loops.
//!
//! Each socket of a connection is drained by its own thread, running
//! [`Receiver::start`]. Loops block on the socket with a read timeout, and each timeout is
//! a chance to notice that the connection is being torn down.

pub(crate) mod audio;
pub(crate) mod control;
pub(crate) mod timing;

use raop_proto::MAX_DATAGRAM_LEN;
use raop_utils::time;

use crate::{
    connection::Shared,
    socket::{DatagramSocket, io_err_is_timeout},
};

/// Encapsulates one channel's packet handling.
///
/// Implementors define how a datagram received on their socket updates the connection.
/// The provided [`start`](Receiver::start) method runs the blocking receive loop and
/// dispatches datagrams to [`on_datagram`](Receiver::on_datagram).
pub(crate) trait Receiver<S: DatagramSocket> {
    /// Name of the channel, for logs.
    const CHANNEL: &'static str;

    /// Called on every received datagram, with its arrival time on our clock.
    ///
    /// Bad input is logged and ignored, never propagated.
    fn on_datagram(&mut self, datagram: &[u8], arrival: u64);

    /// Runs the receive loop on `sock` until the connection's stop flag is raised.
    fn start(&mut self, shared: &Shared<S>, sock: &S) {
        let id = shared.id;

        if let Err(e) = sock.set_read_timeout(Some(shared.config.receive_poll_interval)) {
            log::warn!(
                "{id}: cannot set a read timeout on the {} socket, teardown may stall: {e}",
                Self::CHANNEL,
            );
        }

        let mut buf = [0; MAX_DATAGRAM_LEN];

        while !shared.should_stop() {
            let res = sock.recv_from(&mut buf);

            // don't return on errors...
            match res {
                Ok((n, _)) => self.on_datagram(&buf[..n], time::local_now()),
                Err(e) if io_err_is_timeout(e.kind()) => continue,
                Err(e) => {
                    log::debug!("{id}: error receiving on the {} socket: {e}", Self::CHANNEL);
                    // a broken socket fails instantly, don't spin on it
                    std::thread::sleep(shared.config.receive_poll_interval);
                }
            }
        }

        log::trace!("{id}: {} receiver stopped", Self::CHANNEL);
    }
}
