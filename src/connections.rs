//! Port-to-port connections of the live project.

use crate::port::PortId;

/// A directed connection from an output port to an input port.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PortConnection {
    pub src: PortId,
    pub dest: PortId,
    /// Gain applied to the source signal when summed into `dest`.
    pub multiplier: f32,
    pub enabled: bool,
    /// Internal channel wiring that the user cannot remove.
    pub locked: bool,
}

impl PortConnection {
    pub fn new(src: PortId, dest: PortId) -> Self {
        Self {
            src,
            dest,
            multiplier: 1.0,
            enabled: true,
            locked: false,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f32) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }
}

/// Holds every connection in the project. Mutated only from the
/// non-real-time thread; the graph resolves it into per-node source lists
/// during setup.
#[derive(Clone, Debug, Default)]
pub struct PortConnectionsManager {
    connections: Vec<PortConnection>,
}

impl PortConnectionsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the connection between `conn.src` and `conn.dest`.
    pub fn connect(&mut self, conn: PortConnection) {
        match self
            .connections
            .iter_mut()
            .find(|c| c.src == conn.src && c.dest == conn.dest)
        {
            Some(existing) => *existing = conn,
            None => self.connections.push(conn),
        }
    }

    /// Returns `true` if a connection was removed.
    pub fn disconnect(&mut self, src: PortId, dest: PortId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| !(c.src == src && c.dest == dest));
        before != self.connections.len()
    }

    pub fn are_connected(&self, src: PortId, dest: PortId) -> bool {
        self.find(src, dest).is_some()
    }

    pub fn find(&self, src: PortId, dest: PortId) -> Option<&PortConnection> {
        self.connections
            .iter()
            .find(|c| c.src == src && c.dest == dest)
    }

    /// Enabled connections feeding `dest`.
    pub fn sources(&self, dest: PortId) -> impl Iterator<Item = &PortConnection> {
        self.connections
            .iter()
            .filter(move |c| c.dest == dest && c.enabled)
    }

    /// Enabled connections leaving `src`.
    pub fn dests(&self, src: PortId) -> impl Iterator<Item = &PortConnection> {
        self.connections
            .iter()
            .filter(move |c| c.src == src && c.enabled)
    }

    /// Drop every connection touching `port`. Returns the number removed.
    pub fn remove_all_for(&mut self, port: PortId) -> usize {
        let before = self.connections.len();
        self.connections
            .retain(|c| c.src != port && c.dest != port);
        before - self.connections.len()
    }

    pub(crate) fn retain(&mut self, f: impl FnMut(&PortConnection) -> bool) {
        self.connections.retain(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortConnection> {
        self.connections.iter()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
