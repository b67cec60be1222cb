//! Walks the live project and produces nodes and edges.

use std::sync::Arc;

use hashbrown::HashMap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::error::GraphError;
use crate::graph::node::{NodeKey, NodeKind, PortNode};
use crate::plugin::Plugin;
use crate::port::{Port, PortFlags, PortFlow, PortId, PortSource};
use crate::processors::{Fader, TrackProcessor, TrackType};
use crate::project::Project;

pub(crate) struct GraphBuilder {
    pub(crate) kinds: Vec<NodeKind>,
    pub(crate) children: Vec<Vec<usize>>,
    index: HashMap<NodeKey, usize>,
    pub(crate) tempo_nodes: Vec<usize>,
    pub(crate) tempo: Option<Arc<TrackProcessor>>,
    pub(crate) external_out_ports: Vec<Arc<Port>>,
}

impl GraphBuilder {
    fn new() -> Self {
        Self {
            kinds: Vec::new(),
            children: Vec::new(),
            index: HashMap::new(),
            tempo_nodes: Vec::new(),
            tempo: None,
            external_out_ports: Vec::new(),
        }
    }

    /// Build the node set for `project`.
    ///
    /// With `connect_ports` unset only the edges inside processors are added,
    /// not the ones coming from port connections.
    pub(crate) fn build(
        project: &Project,
        drop_unnecessary_ports: bool,
        connect_ports: bool,
    ) -> Result<Self, GraphError> {
        let ports: Vec<Arc<Port>> = project
            .all_ports()
            .into_iter()
            .filter(|p| !p.is_deleting())
            .collect();
        let by_id: HashMap<PortId, &Arc<Port>> = ports.iter().map(|p| (p.id(), p)).collect();

        check_references(project, &by_id)?;

        let mut b = Self::new();
        let initial = b.add(NodeKind::InitialProcessor);

        for track in project.tracklist().iter() {
            b.add(NodeKind::Track(Arc::clone(track.processor())));

            if track.kind() == TrackType::Modulator {
                for pl in track.modulators() {
                    b.add_plugin(pl);
                }
                for mmp in track.macros() {
                    let cv_in_connected = project.connections().sources(mmp.cv_in().id()).next().is_some();
                    b.add(NodeKind::ModulatorMacroProcessor {
                        processor: Arc::clone(mmp),
                        cv_in_connected,
                    });
                }
            }

            if let Some(ch) = track.channel() {
                b.add(NodeKind::Fader(Arc::clone(ch.fader())));
                b.add(NodeKind::Prefader(Arc::clone(ch.prefader())));
                for pl in ch.plugins() {
                    b.add_plugin(pl);
                }
                for send in ch.sends() {
                    b.add(NodeKind::ChannelSend(Arc::clone(send)));
                }
            }
        }

        let mut dropped = 0usize;
        for port in &ports {
            if port.flow() == PortFlow::Output && port.is_exposed_to_backend() {
                b.external_out_ports.push(Arc::clone(port));
            }

            let srcs: Vec<PortSource> = project
                .connections()
                .sources(port.id())
                .filter_map(|conn| {
                    by_id.get(&conn.src).map(|src| PortSource {
                        port: Arc::clone(src),
                        multiplier: conn.multiplier,
                    })
                })
                .collect();

            if drop_unnecessary_ports
                && port.is_control()
                && port.flags().contains(PortFlags::AUTOMATABLE)
                && srcs.is_empty()
            {
                dropped += 1;
                continue;
            }

            b.add(NodeKind::Port(PortNode {
                port: Arc::clone(port),
                srcs,
            }));
        }
        debug!(nodes = b.kinds.len(), dropped, "added graph nodes");

        for track in project.tracklist().iter() {
            let track_node = b.find(&NodeKey::Track(track.id()));
            let Some(track_node) = track_node else {
                continue;
            };
            let processor = track.processor();

            if let Some(signal) = processor.signal() {
                for port in signal.inputs() {
                    if let Some(pn) = b.find_port(port) {
                        b.connect(pn, track_node);
                        b.connect(initial, pn);
                    }
                }
                for port in signal.outputs() {
                    if let Some(pn) = b.find_port(port) {
                        b.connect(track_node, pn);
                    }
                }
            }

            if let Some(tempo) = processor.tempo() {
                for port in tempo.ports() {
                    if let Some(pn) = b.find_port(port) {
                        b.connect(pn, track_node);
                        b.tempo_nodes.push(pn);
                    }
                }
                b.connect(track_node, initial);
                b.tempo = Some(Arc::clone(processor));
            }

            if track.kind() == TrackType::Modulator {
                b.connect(initial, track_node);
                for pl in track.modulators() {
                    b.connect_plugin(pl);
                    for port in pl.in_ports() {
                        if let Some(pn) = b.find_port(port) {
                            b.connect(track_node, pn);
                        }
                    }
                }
                for mmp in track.macros() {
                    let key = NodeKey::ModulatorMacroProcessor {
                        track: mmp.track(),
                        index: mmp.index(),
                    };
                    let Some(mn) = b.find(&key) else {
                        continue;
                    };
                    for port in [mmp.cv_in(), mmp.macro_port()] {
                        if let Some(pn) = b.find_port(port) {
                            b.connect(pn, mn);
                        }
                    }
                    if let Some(pn) = b.find_port(mmp.cv_out()) {
                        b.connect(mn, pn);
                    }
                }
            }

            if let Some(ch) = track.channel() {
                if let Some(fader_node) = b.find(&NodeKey::Fader(track.id())) {
                    b.connect_fader(fader_node, ch.fader());
                }
                if let Some(prefader_node) = b.find(&NodeKey::Prefader(track.id())) {
                    b.connect_fader(prefader_node, ch.prefader());
                }
                for pl in ch.plugins() {
                    b.connect_plugin(pl);
                }
                for send in ch.sends() {
                    let key = NodeKey::ChannelSend {
                        track: send.track(),
                        slot: send.slot(),
                    };
                    let Some(sn) = b.find(&key) else {
                        continue;
                    };
                    for port in [send.amount(), send.enabled()] {
                        if let Some(pn) = b.find_port(port) {
                            b.connect(pn, sn);
                        }
                    }
                    for port in send.signal().inputs() {
                        if let Some(pn) = b.find_port(port) {
                            b.connect(pn, sn);
                        }
                    }
                    for port in send.signal().outputs() {
                        if let Some(pn) = b.find_port(port) {
                            b.connect(sn, pn);
                        }
                    }
                }
            }
        }

        if connect_ports {
            let edges: Vec<(PortId, PortId)> = project
                .connections()
                .iter()
                .filter(|c| c.enabled)
                .map(|c| (c.src, c.dest))
                .collect();
            for (src, dest) in edges {
                b.connect_port_ids(src, dest);
            }
        }

        Ok(b)
    }

    fn add(&mut self, kind: NodeKind) -> usize {
        let key = kind.key();
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.kinds.len();
        self.kinds.push(kind);
        self.children.push(Vec::new());
        self.index.insert(key, idx);
        idx
    }

    fn add_plugin(&mut self, pl: &Arc<Plugin>) {
        if pl.in_ports().is_empty() && pl.out_ports().is_empty() {
            return;
        }
        self.add(NodeKind::Plugin(Arc::clone(pl)));
    }

    pub(crate) fn find(&self, key: &NodeKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn find_port(&self, port: &Port) -> Option<usize> {
        self.find(&NodeKey::Port(port.id()))
    }

    fn connect(&mut self, from: usize, to: usize) {
        let children = &mut self.children[from];
        if from != to && !children.contains(&to) {
            children.push(to);
        }
    }

    /// Add the edge for a port connection. Returns `false` if either port has
    /// no node.
    pub(crate) fn connect_port_ids(&mut self, src: PortId, dest: PortId) -> bool {
        match (self.find(&NodeKey::Port(src)), self.find(&NodeKey::Port(dest))) {
            (Some(a), Some(b)) => {
                self.connect(a, b);
                true
            }
            _ => false,
        }
    }

    fn connect_plugin(&mut self, pl: &Plugin) {
        let Some(pl_node) = self.find(&NodeKey::Plugin(pl.id())) else {
            return;
        };
        for port in pl.in_ports() {
            // dropped control ports have no node; the plugin reads them directly
            if let Some(pn) = self.find_port(port) {
                self.connect(pn, pl_node);
            }
        }
        for port in pl.out_ports() {
            if let Some(pn) = self.find_port(port) {
                self.connect(pl_node, pn);
            }
        }
    }

    fn connect_fader(&mut self, node: usize, fader: &Fader) {
        for port in fader.signal().inputs() {
            if let Some(pn) = self.find_port(port) {
                self.connect(pn, node);
            }
        }
        for port in fader.signal().outputs() {
            if let Some(pn) = self.find_port(port) {
                self.connect(node, pn);
            }
        }
        if let Some(controls) = fader.controls() {
            for port in [&controls.amp, &controls.balance, &controls.mute] {
                if let Some(pn) = self.find_port(port) {
                    self.connect(pn, node);
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Topological order of the nodes, or the key of a node on a cycle.
    pub(crate) fn topo_order(&self) -> Result<Vec<usize>, NodeKey> {
        let mut g: DiGraph<usize, ()> = DiGraph::with_capacity(self.kinds.len(), self.kinds.len() * 2);
        let idx: Vec<NodeIndex> = (0..self.kinds.len()).map(|i| g.add_node(i)).collect();
        for (from, children) in self.children.iter().enumerate() {
            for &to in children {
                g.add_edge(idx[from], idx[to], ());
            }
        }
        match toposort(&g, None) {
            Ok(order) => Ok(order.into_iter().map(|ni| g[ni]).collect()),
            Err(cycle) => Err(self.kinds[g[cycle.node_id()]].key()),
        }
    }
}

/// Reject connections and routings pointing at objects that no longer exist.
fn check_references(project: &Project, ports: &HashMap<PortId, &Arc<Port>>) -> Result<(), GraphError> {
    for conn in project.connections().iter() {
        for id in [conn.src, conn.dest] {
            if ports.contains_key(&id) {
                continue;
            }
            return Err(if project.is_port_id_allocated(id) {
                GraphError::StaleReference(format!(
                    "connection {} -> {} references removed {}",
                    conn.src, conn.dest, id
                ))
            } else {
                GraphError::UnknownPort(id)
            });
        }
    }

    for track in project.tracklist().iter() {
        let Some(output) = track.channel().and_then(|ch| ch.output()) else {
            continue;
        };
        if project.track(output).is_none() {
            return Err(GraphError::StaleReference(format!(
                "{} routes to removed {}",
                track.id(),
                output
            )));
        }
    }
    Ok(())
}
