//! The live object graph: tracks, their channels and plugins, and the port
//! connections between them.
//!
//! Every structural edit here must be followed by
//! [`Project::recalc_graph`]`(false)` before the audio thread sees it; latency
//! changes only need `recalc_graph(true)`.

use std::sync::Arc;

use hashbrown::HashSet;
use tracing::debug;

use crate::config::EngineConfig;
use crate::connections::{PortConnection, PortConnectionsManager};
use crate::engine::AudioEngine;
use crate::error::{Error, GraphError, Result};
use crate::graph::Graph;
use crate::plugin::{Plugin, PluginDescriptor, PluginId, PluginInstance};
use crate::port::{Port, PortId, PortIdAllocator, PortType};
use crate::processors::{ChannelSend, Track, TrackId, TrackType, CHANNEL_SEND_SLOTS, STRIP_SIZE};

/// Ordered list of the project's tracks.
#[derive(Default)]
pub struct Tracklist {
    tracks: Vec<Track>,
}

impl Tracklist {
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id() == id)
    }

    fn push(&mut self, track: Track) {
        self.tracks.push(track);
    }

    fn remove(&mut self, id: TrackId) -> Option<Track> {
        let pos = self.tracks.iter().position(|t| t.id() == id)?;
        Some(self.tracks.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// A session: owns the tracklist, the connections and the engine that
/// plays them.
pub struct Project {
    config: EngineConfig,
    tracklist: Tracklist,
    connections: PortConnectionsManager,
    port_ids: PortIdAllocator,
    next_track: u32,
    next_plugin: u32,
    tempo: TrackId,
    master: TrackId,
    engine: Arc<AudioEngine>,
}

impl Project {
    /// Create a project with a tempo track and a master track.
    ///
    /// The processing graph is not built until the first
    /// [`Project::recalc_graph`]`(false)`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let engine = Arc::new(AudioEngine::new(config.clone())?);
        let mut project = Self {
            config,
            tracklist: Tracklist::default(),
            connections: PortConnectionsManager::new(),
            port_ids: PortIdAllocator::default(),
            next_track: 0,
            next_plugin: 0,
            tempo: TrackId(0),
            master: TrackId(0),
            engine,
        };
        project.tempo = project.push_track(TrackType::Tempo, "Tempo");
        project.master = project.push_track(TrackType::Master, "Master");
        project.rewire_channel(project.master);
        Ok(project)
    }

    fn push_track(&mut self, kind: TrackType, name: &str) -> TrackId {
        let id = TrackId(self.next_track);
        self.next_track += 1;
        self.tracklist.push(Track::new(id, kind, name, &mut self.port_ids));
        id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<AudioEngine> {
        &self.engine
    }

    pub fn tracklist(&self) -> &Tracklist {
        &self.tracklist
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracklist.get(id)
    }

    pub fn tempo_track(&self) -> TrackId {
        self.tempo
    }

    pub fn master_track(&self) -> TrackId {
        self.master
    }

    pub fn connections(&self) -> &PortConnectionsManager {
        &self.connections
    }

    /// Direct access to the connections, bypassing validation.
    pub fn connections_mut(&mut self) -> &mut PortConnectionsManager {
        &mut self.connections
    }

    /// Every live port in the project.
    pub fn all_ports(&self) -> Vec<Arc<Port>> {
        self.tracklist
            .iter()
            .flat_map(|t| t.ports())
            .cloned()
            .collect()
    }

    pub fn find_port(&self, id: PortId) -> Option<Arc<Port>> {
        self.tracklist
            .iter()
            .flat_map(|t| t.ports())
            .find(|p| p.id() == id)
            .cloned()
    }

    /// Whether `id` ever belonged to a port of this project.
    pub fn is_port_id_allocated(&self, id: PortId) -> bool {
        self.port_ids.is_allocated(id)
    }

    /// Append a track. Audio tracks and buses are routed to the master.
    pub fn add_track(&mut self, kind: TrackType, name: &str) -> Result<TrackId> {
        let singleton = match kind {
            TrackType::Tempo | TrackType::Master => true,
            TrackType::Modulator => self.tracklist.iter().any(|t| t.kind() == TrackType::Modulator),
            _ => false,
        };
        if singleton {
            return Err(Error::SingletonTrack(kind));
        }

        let id = self.push_track(kind, name);
        if matches!(kind, TrackType::Audio | TrackType::AudioBus) {
            let master = self.master;
            if let Some(ch) = self.tracklist.get_mut(id).and_then(|t| t.channel.as_mut()) {
                ch.output = Some(master);
            }
        }
        self.rewire_channel(id);
        debug!(track = %id, ?kind, name, "track added");
        Ok(id)
    }

    /// Remove a track with everything it owns. Tracks routed to it fall back
    /// to their default output.
    pub fn remove_track(&mut self, id: TrackId) -> Result<()> {
        let kind = self.tracklist.get(id).ok_or(Error::UnknownTrack(id))?.kind();
        if matches!(kind, TrackType::Tempo | TrackType::Master) {
            return Err(Error::PermanentTrack(id));
        }
        let Some(track) = self.tracklist.remove(id) else {
            return Err(Error::UnknownTrack(id));
        };

        for port in track.ports() {
            self.connections.remove_all_for(port.id());
            port.mark_deleting();
        }
        for pl in track.modulators.iter() {
            pl.mark_deleting();
        }
        if let Some(ch) = &track.channel {
            for pl in ch.inserts.iter().flatten() {
                pl.mark_deleting();
            }
        }

        let master = self.master;
        let dependents: Vec<TrackId> = self
            .tracklist
            .iter()
            .filter(|t| t.channel().and_then(|ch| ch.output()) == Some(id))
            .map(Track::id)
            .collect();
        for dep in dependents {
            if let Some(t) = self.tracklist.get_mut(dep) {
                let fallback = (t.kind().signal_type() == Some(PortType::Audio)).then_some(master);
                if let Some(ch) = t.channel.as_mut() {
                    ch.output = fallback;
                }
            }
            self.rewire_channel(dep);
        }
        debug!(track = %id, "track removed");
        Ok(())
    }

    /// Put a plugin into an insert slot, replacing whatever is there.
    pub fn insert_plugin(
        &mut self,
        track: TrackId,
        slot: usize,
        descriptor: &PluginDescriptor,
        instance: Box<dyn PluginInstance>,
    ) -> Result<PluginId> {
        if slot >= STRIP_SIZE {
            return Err(Error::InvalidSlot { track, slot });
        }
        let id = PluginId(self.next_plugin);
        let t = self.tracklist.get_mut(track).ok_or(Error::UnknownTrack(track))?;
        let ch = t.channel.as_mut().ok_or(Error::NoChannel(track))?;
        let plugin = Arc::new(Plugin::new(id, descriptor, instance, &mut self.port_ids));
        let old = ch.inserts[slot].replace(plugin);
        self.next_plugin += 1;

        if let Some(old) = old {
            self.retire_plugin(&old);
        }
        self.rewire_channel(track);
        debug!(track = %track, slot, plugin = %id, "plugin inserted");
        Ok(id)
    }

    pub fn remove_plugin(&mut self, track: TrackId, slot: usize) -> Result<()> {
        let t = self.tracklist.get_mut(track).ok_or(Error::UnknownTrack(track))?;
        let ch = t.channel.as_mut().ok_or(Error::NoChannel(track))?;
        let plugin = ch
            .inserts
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(Error::InvalidSlot { track, slot })?;
        self.retire_plugin(&plugin);
        self.rewire_channel(track);
        Ok(())
    }

    /// Add a plugin to the modulator track.
    pub fn add_modulator(
        &mut self,
        track: TrackId,
        descriptor: &PluginDescriptor,
        instance: Box<dyn PluginInstance>,
    ) -> Result<PluginId> {
        let id = PluginId(self.next_plugin);
        let t = self.tracklist.get_mut(track).ok_or(Error::UnknownTrack(track))?;
        if t.kind() != TrackType::Modulator {
            return Err(Error::NotModulatorTrack(track));
        }
        t.modulators
            .push(Arc::new(Plugin::new(id, descriptor, instance, &mut self.port_ids)));
        self.next_plugin += 1;
        Ok(id)
    }

    fn retire_plugin(&mut self, plugin: &Plugin) {
        for port in plugin.ports() {
            self.connections.remove_all_for(port.id());
        }
        plugin.mark_deleting();
    }

    /// Send `track`'s signal into `target`'s input from a free send slot.
    ///
    /// Fails without changing anything if the send would close a loop.
    pub fn add_send(&mut self, track: TrackId, slot: usize, prefader: bool, target: TrackId) -> Result<()> {
        if slot >= CHANNEL_SEND_SLOTS {
            return Err(Error::InvalidSlot { track, slot });
        }
        let target_ins: Vec<Arc<Port>> = self
            .tracklist
            .get(target)
            .ok_or(Error::UnknownTrack(target))?
            .processor()
            .signal()
            .ok_or(Error::NoChannel(target))?
            .inputs()
            .into_iter()
            .cloned()
            .collect();

        let t = self.tracklist.get_mut(track).ok_or(Error::UnknownTrack(track))?;
        let ch = t.channel.as_mut().ok_or(Error::NoChannel(track))?;
        if ch.sends[slot].is_some() {
            return Err(Error::InvalidSlot { track, slot });
        }
        let send = Arc::new(ChannelSend::new(track, slot, ch.fader().kind(), prefader, &mut self.port_ids));
        ch.sends[slot] = Some(Arc::clone(&send));

        let outs = send.signal().outputs();
        let wiring = link(&outs, &target_ins.iter().collect::<Vec<_>>());
        let Some(&(src, dest)) = wiring.first() else {
            self.drop_send(track, slot);
            return Err(Error::InvalidConnection {
                src: outs[0].id(),
                dest: target_ins.first().map_or(outs[0].id(), |p| p.id()),
            });
        };
        for &(s, d) in &wiring {
            self.connections.connect(PortConnection::new(s, d).locked());
        }
        self.rewire_channel(track);

        if let Err(err) = self.ensure_acyclic(src, dest) {
            self.drop_send(track, slot);
            return Err(err);
        }
        Ok(())
    }

    pub fn remove_send(&mut self, track: TrackId, slot: usize) -> Result<()> {
        let occupied = self
            .tracklist
            .get(track)
            .ok_or(Error::UnknownTrack(track))?
            .channel()
            .ok_or(Error::NoChannel(track))?
            .send(slot)
            .is_some();
        if !occupied {
            return Err(Error::InvalidSlot { track, slot });
        }
        self.drop_send(track, slot);
        Ok(())
    }

    fn drop_send(&mut self, track: TrackId, slot: usize) {
        let send = self
            .tracklist
            .get_mut(track)
            .and_then(|t| t.channel.as_mut())
            .and_then(|ch| ch.sends.get_mut(slot).and_then(Option::take));
        if let Some(send) = send {
            for port in send.ports() {
                self.connections.remove_all_for(port.id());
                port.mark_deleting();
            }
        }
        self.rewire_channel(track);
    }

    /// Route the channel output of `track` to `output`'s input, or nowhere.
    ///
    /// Fails without changing anything if the routing would close a loop.
    pub fn set_track_output(&mut self, track: TrackId, output: Option<TrackId>) -> Result<()> {
        let t = self.tracklist.get(track).ok_or(Error::UnknownTrack(track))?;
        let ch = t.channel().ok_or(Error::NoChannel(track))?;
        let src = ch.fader().signal().outputs()[0].id();

        let dest = match output {
            Some(out) => {
                let target = self.tracklist.get(out).ok_or(Error::UnknownTrack(out))?;
                let input = target
                    .processor()
                    .signal()
                    .ok_or(Error::NoChannel(out))?
                    .inputs()[0]
                    .id();
                if target.kind().signal_type() != t.kind().signal_type() {
                    return Err(Error::InvalidConnection { src, dest: input });
                }
                Some(input)
            }
            None => None,
        };

        let prev = self.set_output_unchecked(track, output);
        self.rewire_channel(track);
        if let Some(dest) = dest {
            if let Err(err) = self.ensure_acyclic(src, dest) {
                self.set_output_unchecked(track, prev);
                self.rewire_channel(track);
                return Err(err);
            }
        }
        Ok(())
    }

    fn set_output_unchecked(&mut self, track: TrackId, output: Option<TrackId>) -> Option<TrackId> {
        self.tracklist
            .get_mut(track)
            .and_then(|t| t.channel.as_mut())
            .and_then(|ch| std::mem::replace(&mut ch.output, output))
    }

    /// Connect two ports after checking [`Graph::can_ports_be_connected`].
    pub fn connect_ports(&mut self, src: PortId, dest: PortId) -> Result<()> {
        self.connect_ports_with_multiplier(src, dest, 1.0)
    }

    pub fn connect_ports_with_multiplier(&mut self, src: PortId, dest: PortId, multiplier: f32) -> Result<()> {
        let src_port = self.find_port(src).ok_or(GraphError::UnknownPort(src))?;
        let dest_port = self.find_port(dest).ok_or(GraphError::UnknownPort(dest))?;
        if !Graph::can_ports_be_connected(self, &src_port, &dest_port) {
            return Err(Error::InvalidConnection { src, dest });
        }
        self.connections
            .connect(PortConnection::new(src, dest).with_multiplier(multiplier));
        Ok(())
    }

    /// Remove a user connection. Internal channel wiring cannot be removed.
    ///
    /// Returns `false` if the ports were not connected.
    pub fn disconnect_ports(&mut self, src: PortId, dest: PortId) -> Result<bool> {
        if self.connections.find(src, dest).is_some_and(|c| c.locked) {
            return Err(Error::InvalidConnection { src, dest });
        }
        Ok(self.connections.disconnect(src, dest))
    }

    fn ensure_acyclic(&self, src: PortId, dest: PortId) -> Result<()> {
        let (Some(s), Some(d)) = (self.find_port(src), self.find_port(dest)) else {
            return Err(GraphError::UnknownPort(src).into());
        };
        if Graph::can_ports_be_connected(self, &s, &d) {
            Ok(())
        } else {
            Err(Error::InvalidConnection { src, dest })
        }
    }

    /// Rebuild the locked wiring of a track's channel strip:
    /// processor out → inserts → prefader → fader → output track, with sends
    /// tapping the prefader or fader.
    fn rewire_channel(&mut self, id: TrackId) {
        let Some(track) = self.tracklist.get(id) else {
            return;
        };
        let Some(ch) = track.channel() else {
            return;
        };

        let processor_outs = track.processor().signal().map(|s| s.outputs()).unwrap_or_default();
        let prefader_outs = ch.prefader().signal().outputs();
        let fader_outs = ch.fader().signal().outputs();

        let mut owned: HashSet<PortId> = HashSet::new();
        owned.extend(processor_outs.iter().map(|p| p.id()));
        owned.extend(prefader_outs.iter().map(|p| p.id()));
        owned.extend(fader_outs.iter().map(|p| p.id()));

        let mut wiring = Vec::new();
        let mut prev = processor_outs;
        for pl in ch.plugins() {
            owned.extend(pl.out_ports().iter().map(|p| p.id()));
            wiring.extend(link(&prev, &pl.in_ports().iter().collect::<Vec<_>>()));
            prev = pl.out_ports().iter().collect();
        }
        wiring.extend(link(&prev, &ch.prefader().signal().inputs()));
        wiring.extend(link(&prefader_outs, &ch.fader().signal().inputs()));
        for send in ch.sends() {
            let tap = if send.is_prefader() { &prefader_outs } else { &fader_outs };
            wiring.extend(link(tap, &send.signal().inputs()));
        }
        if let Some(signal) = ch
            .output()
            .and_then(|out| self.tracklist.get(out))
            .and_then(|t| t.processor().signal())
        {
            wiring.extend(link(&fader_outs, &signal.inputs()));
        }

        self.connections
            .retain(|c| !(c.locked && owned.contains(&c.src)));
        for (src, dest) in wiring {
            self.connections.connect(PortConnection::new(src, dest).locked());
        }
    }

    /// Rebuild the processing graph (`soft = false`) or only refresh its
    /// latencies (`soft = true`).
    pub fn recalc_graph(&self, soft: bool) -> Result<()> {
        self.engine.router().recalc_graph(self, soft)
    }
}

/// Pair outputs with inputs of the same type, in order.
fn link(outs: &[&Arc<Port>], ins: &[&Arc<Port>]) -> Vec<(PortId, PortId)> {
    let mut pairs = Vec::new();
    for kind in [PortType::Audio, PortType::Event] {
        let outs = outs.iter().filter(|p| p.kind() == kind);
        let ins = ins.iter().filter(|p| p.kind() == kind);
        pairs.extend(outs.zip(ins).map(|(o, i)| (o.id(), i.id())));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PassThrough;

    fn project() -> Project {
        Project::new(EngineConfig::default().with_strict_validation(false)).unwrap()
    }

    #[test]
    fn new_project_has_tempo_and_master() {
        let p = project();
        assert_eq!(p.tracklist().len(), 2);
        assert_eq!(p.track(p.tempo_track()).unwrap().kind(), TrackType::Tempo);
        assert_eq!(p.track(p.master_track()).unwrap().kind(), TrackType::Master);
        // master prefader -> fader, L and R
        assert_eq!(p.connections().len(), 4);
    }

    #[test]
    fn singleton_tracks_are_refused() {
        let mut p = project();
        assert!(matches!(
            p.add_track(TrackType::Master, "Master 2"),
            Err(Error::SingletonTrack(TrackType::Master))
        ));
        p.add_track(TrackType::Modulator, "Modulators").unwrap();
        assert!(p.add_track(TrackType::Modulator, "Modulators 2").is_err());
    }

    #[test]
    fn audio_track_is_wired_to_master() {
        let mut p = project();
        let id = p.add_track(TrackType::Audio, "Audio 1").unwrap();
        let track = p.track(id).unwrap();
        let ch = track.channel().unwrap();
        assert_eq!(ch.output(), Some(p.master_track()));

        let fader_l = ch.fader().signal().outputs()[0].id();
        let master = p.track(p.master_track()).unwrap();
        let master_in_l = master.processor().signal().unwrap().inputs()[0].id();
        let conn = p.connections().find(fader_l, master_in_l).unwrap();
        assert!(conn.locked);
    }

    #[test]
    fn inserts_are_chained_before_prefader() {
        let mut p = project();
        let id = p.add_track(TrackType::Audio, "Audio 1").unwrap();
        p.insert_plugin(id, 0, &PassThrough::descriptor(), Box::new(PassThrough::new()))
            .unwrap();

        let track = p.track(id).unwrap();
        let ch = track.channel().unwrap();
        let pl = ch.insert(0).unwrap().clone();
        let proc_out = track.processor().signal().unwrap().outputs()[0].id();
        let prefader_in = ch.prefader().signal().inputs()[0].id();

        assert!(p.connections().are_connected(proc_out, pl.in_ports()[0].id()));
        assert!(p.connections().are_connected(pl.out_ports()[0].id(), prefader_in));
        assert!(!p.connections().are_connected(proc_out, prefader_in));

        p.remove_plugin(id, 0).unwrap();
        assert!(pl.is_deleting());
        assert!(p.connections().are_connected(proc_out, prefader_in));
    }

    #[test]
    fn locked_connections_cannot_be_disconnected() {
        let mut p = project();
        let id = p.add_track(TrackType::Audio, "Audio 1").unwrap();
        let ch = p.track(id).unwrap().channel().unwrap();
        let src = ch.prefader().signal().outputs()[0].id();
        let dest = ch.fader().signal().inputs()[0].id();
        assert!(matches!(
            p.disconnect_ports(src, dest),
            Err(Error::InvalidConnection { .. })
        ));
    }

    #[test]
    fn routing_loop_is_refused() {
        let mut p = project();
        let a = p.add_track(TrackType::AudioBus, "Bus A").unwrap();
        let b = p.add_track(TrackType::AudioBus, "Bus B").unwrap();
        p.set_track_output(a, Some(b)).unwrap();
        assert!(matches!(
            p.set_track_output(b, Some(a)),
            Err(Error::InvalidConnection { .. })
        ));
        assert_eq!(p.track(b).unwrap().channel().unwrap().output(), Some(p.master_track()));
    }

    #[test]
    fn removing_a_bus_reroutes_its_inputs() {
        let mut p = project();
        let a = p.add_track(TrackType::Audio, "Audio").unwrap();
        let bus = p.add_track(TrackType::AudioBus, "Bus").unwrap();
        p.set_track_output(a, Some(bus)).unwrap();
        p.add_send(a, 0, true, bus).unwrap();

        p.remove_track(bus).unwrap();
        assert!(p.track(bus).is_none());
        assert_eq!(p.track(a).unwrap().channel().unwrap().output(), Some(p.master_track()));
        assert!(p.connections().iter().all(|c| p.find_port(c.src).is_some() && p.find_port(c.dest).is_some()));
        assert!(matches!(p.remove_track(p.master_track()), Err(Error::PermanentTrack(_))));
    }
}
