//! Live connections of a receiver, keyed by connection id.

use core::net::SocketAddr;
use std::{
    collections::hash_map::Entry,
    net::UdpSocket,
    sync::Arc,
};

use crate::{
    Connection, ConnectionId, PacketSink, PortAllocator, ReceiverConfig, SetupError,
    StreamParams, socket::DatagramSocket,
};

/// Hash map storing connections, keyed by id.
type ConnectionMap<S> = rustc_hash::FxHashMap<ConnectionId, Connection<S>>;

/// Owns every live connection, and the port allocator they bind through.
///
/// Removing a connection, or dropping the registry, tears connections down.
pub struct ConnectionRegistry<S: DatagramSocket = UdpSocket> {
    config: Arc<ReceiverConfig>,
    ports: PortAllocator,
    connections: ConnectionMap<S>,
}

impl ConnectionRegistry<UdpSocket> {
    /// Sets up and starts a connection.
    ///
    /// If a connection with the same id already exists, it is returned as is: a duplicate
    /// session setup must not disturb a running stream.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        id: ConnectionId,
        params: StreamParams,
        local: SocketAddr,
        peer_host: &str,
        peer_control_port: u16,
        peer_timing_port: u16,
        sink: Arc<dyn PacketSink>,
    ) -> Result<&mut Connection, SetupError> {
        match self.connections.entry(id) {
            Entry::Occupied(e) => {
                log::warn!("{id}: setup requested for an already active stream, ignored");
                Ok(e.into_mut())
            }
            Entry::Vacant(e) => {
                let mut connection = Connection::setup(
                    id,
                    Arc::clone(&self.config),
                    params,
                    local,
                    peer_host,
                    peer_control_port,
                    peer_timing_port,
                    &self.ports,
                    sink,
                )?;

                connection.start()?;

                Ok(e.insert(connection))
            }
        }
    }
}

impl<S: DatagramSocket> ConnectionRegistry<S> {
    pub fn new(config: ReceiverConfig) -> Result<Self, SetupError> {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            ports: PortAllocator::new(),
            connections: ConnectionMap::default(),
        })
    }

    #[inline(always)]
    pub fn config(&self) -> &Arc<ReceiverConfig> {
        &self.config
    }

    #[inline(always)]
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Adds a connection built elsewhere. A connection previously registered under the same
    /// id is returned, still running.
    pub fn insert(&mut self, connection: Connection<S>) -> Option<Connection<S>> {
        self.connections.insert(connection.id(), connection)
    }

    #[inline]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection<S>> {
        self.connections.get(&id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&id)
    }

    /// Tears down and forgets a connection. Returns whether it existed.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(mut connection) => {
                connection.teardown();
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.keys().copied()
    }

    /// Tears down every connection, in no particular order.
    pub fn clear(&mut self) {
        for (_, mut connection) in self.connections.drain() {
            connection.teardown();
        }
    }
}

impl<S: DatagramSocket> Drop for ConnectionRegistry<S> {
    fn drop(&mut self) {
        self.clear();
    }
}
