use std::sync::atomic::Ordering;
use std::sync::Arc;

use hashbrown::HashSet;
use routegraph::connections::PortConnection;
use routegraph::plugin::PassThrough;
use routegraph::processors::{TrackId, TrackType};
use routegraph::{EngineConfig, Error, Graph, GraphError, NodeKey, PortId, Project};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn config() -> EngineConfig {
    init_logging();
    EngineConfig::default()
        .with_num_threads(2)
        .with_strict_validation(false)
}

fn fader_out(p: &Project, track: TrackId) -> PortId {
    p.track(track).unwrap().channel().unwrap().fader().signal().outputs()[0].id()
}

fn track_in(p: &Project, track: TrackId) -> PortId {
    p.track(track).unwrap().processor().signal().unwrap().inputs()[0].id()
}

#[test]
fn two_tracks_connected_by_one_port() {
    let mut p = Project::new(config()).unwrap();
    let a = p.add_track(TrackType::Audio, "A").unwrap();
    let b = p.add_track(TrackType::AudioBus, "B").unwrap();
    p.insert_plugin(b, 0, &PassThrough::descriptor(), Box::new(PassThrough::with_latency(32)))
        .unwrap();
    p.set_track_output(a, None).unwrap();

    let a_out = fader_out(&p, a);
    let b_in = track_in(&p, b);
    p.connect_ports(a_out, b_in).unwrap();
    p.recalc_graph(false).unwrap();

    let nodes = p.engine().router().graph_nodes().unwrap();
    assert_eq!(nodes.children(&NodeKey::Port(a_out)), vec![NodeKey::Port(b_in)]);

    let a_node = nodes.get(&NodeKey::Port(a_out)).unwrap();
    let b_node = nodes.get(&NodeKey::Port(b_in)).unwrap();
    assert_eq!(b_node.route_playback_latency(), 32);
    assert_eq!(
        a_node.route_playback_latency(),
        a_node.playback_latency() + b_node.route_playback_latency()
    );

    assert!(p.disconnect_ports(a_out, b_in).unwrap());
    p.recalc_graph(false).unwrap();

    let nodes = p.engine().router().graph_nodes().unwrap();
    let a_node = nodes.get(&NodeKey::Port(a_out)).unwrap();
    assert!(a_node.is_terminal());
    assert_eq!(a_node.route_playback_latency(), 0);
}

#[test]
fn adding_a_track_with_a_plugin_adds_its_nodes() {
    let mut p = Project::new(config()).unwrap();
    p.add_track(TrackType::Audio, "Audio 1").unwrap();
    p.recalc_graph(false).unwrap();
    let before = p.engine().router().graph_nodes().unwrap();

    let track = p.add_track(TrackType::Audio, "Audio 2").unwrap();
    let plugin = p
        .insert_plugin(track, 0, &PassThrough::descriptor(), Box::new(PassThrough::new()))
        .unwrap();
    p.recalc_graph(false).unwrap();
    let after = p.engine().router().graph_nodes().unwrap();

    // track, fader, prefader, plugin and 16 signal ports; the automatable
    // fader controls have no sources and get no node
    assert_eq!(after.len(), before.len() + 20);
    for key in [
        NodeKey::Track(track),
        NodeKey::Fader(track),
        NodeKey::Prefader(track),
        NodeKey::Plugin(plugin),
    ] {
        assert!(after.contains(&key), "missing {}", key);
    }

    let new_edges: HashSet<_> = after.edges().into_iter().collect();
    for edge in before.edges() {
        assert!(new_edges.contains(&edge), "lost edge {} -> {}", edge.0, edge.1);
    }
}

#[test]
fn setup_is_idempotent() {
    let mut p = Project::new(config()).unwrap();
    p.add_track(TrackType::Audio, "Audio 1").unwrap();
    p.add_track(TrackType::Midi, "Midi 1").unwrap();

    let mut graph = Graph::new(config());
    graph.setup(&p, true, true).unwrap();
    let first = graph.setup_nodes().unwrap().len();
    graph.setup(&p, true, true).unwrap();
    assert_eq!(graph.setup_nodes().unwrap().len(), first);
}

#[test]
fn setup_without_port_edges_keeps_processor_edges() {
    let mut p = Project::new(config()).unwrap();
    let track = p.add_track(TrackType::Audio, "Audio 1").unwrap();

    let mut graph = Graph::new(config());
    graph.setup(&p, true, false).unwrap();
    graph.rechain().unwrap();
    let nodes = graph.nodes().unwrap();

    let out = fader_out(&p, track);
    assert!(nodes.get(&NodeKey::Port(out)).unwrap().is_terminal());
    assert_eq!(nodes.children(&NodeKey::Fader(track)).len(), 2);
}

#[test]
fn route_latency_follows_the_critical_path() {
    let mut p = Project::new(config()).unwrap();
    let slow = p.add_track(TrackType::Audio, "Slow").unwrap();
    let fast = p.add_track(TrackType::Audio, "Fast").unwrap();
    p.insert_plugin(slow, 0, &PassThrough::descriptor(), Box::new(PassThrough::with_latency(100)))
        .unwrap();
    p.insert_plugin(slow, 1, &PassThrough::descriptor(), Box::new(PassThrough::with_latency(50)))
        .unwrap();
    p.insert_plugin(fast, 0, &PassThrough::descriptor(), Box::new(PassThrough::with_latency(10)))
        .unwrap();
    p.recalc_graph(false).unwrap();

    let nodes = p.engine().router().graph_nodes().unwrap();
    assert_eq!(nodes.get(&NodeKey::Track(slow)).unwrap().route_playback_latency(), 150);
    assert_eq!(nodes.get(&NodeKey::Track(fast)).unwrap().route_playback_latency(), 10);
    assert_eq!(nodes.max_route_playback_latency(), 150);
    assert_eq!(p.engine().router().get_max_route_playback_latency(), 150);
}

#[test]
fn soft_recalc_refreshes_latency_in_place() {
    let mut p = Project::new(config()).unwrap();
    let track = p.add_track(TrackType::Audio, "Audio 1").unwrap();
    let plugin = PassThrough::with_latency(16);
    let latency = plugin.latency_handle();
    let id = p
        .insert_plugin(track, 0, &PassThrough::descriptor(), Box::new(plugin))
        .unwrap();
    p.recalc_graph(false).unwrap();
    let before = p.engine().router().graph_nodes().unwrap();
    assert_eq!(before.get(&NodeKey::Plugin(id)).unwrap().playback_latency(), 16);

    latency.store(128, Ordering::SeqCst);
    p.recalc_graph(true).unwrap();
    let after = p.engine().router().graph_nodes().unwrap();

    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.get(&NodeKey::Plugin(id)).unwrap().playback_latency(), 128);
    assert_eq!(after.max_route_playback_latency(), 128);

    let snapshot: Vec<u32> = after.iter().map(|n| n.route_playback_latency()).collect();
    p.recalc_graph(true).unwrap();
    p.recalc_graph(true).unwrap();
    let again: Vec<u32> = after.iter().map(|n| n.route_playback_latency()).collect();
    assert_eq!(snapshot, again);
}

fn looped_buses(p: &mut Project) {
    let a = p.add_track(TrackType::AudioBus, "Bus A").unwrap();
    let b = p.add_track(TrackType::AudioBus, "Bus B").unwrap();
    let (a_out, b_in) = (fader_out(p, a), track_in(p, b));
    let (b_out, a_in) = (fader_out(p, b), track_in(p, a));
    p.connections_mut().connect(PortConnection::new(a_out, b_in));
    p.connections_mut().connect(PortConnection::new(b_out, a_in));
}

#[test]
fn cycle_is_rejected_and_previous_graph_kept() {
    let mut p = Project::new(config()).unwrap();
    p.recalc_graph(false).unwrap();
    let live = p.engine().router().graph_nodes().unwrap();

    looped_buses(&mut p);
    let err = p.recalc_graph(false).unwrap_err();
    assert!(matches!(err, Error::Graph(GraphError::Cycle(_))), "{}", err);

    let still_live = p.engine().router().graph_nodes().unwrap();
    assert!(Arc::ptr_eq(&live, &still_live));
    assert!(still_live.is_acyclic());
}

#[test]
fn cycle_is_rejected_by_rechain_without_validation() {
    let mut p = Project::new(config()).unwrap();
    looped_buses(&mut p);

    let mut graph = Graph::new(config());
    assert!(matches!(graph.setup(&p, true, true), Err(GraphError::Cycle(_))));

    graph.setup(&p, false, true).unwrap();
    assert!(matches!(graph.rechain(), Err(GraphError::Cycle(_))));
    assert!(graph.nodes().is_none());
    assert!(matches!(graph.rechain(), Err(GraphError::NotSetUp)));
}

#[test]
#[should_panic(expected = "invalid processing graph")]
fn strict_validation_panics_on_cycle() {
    let mut p = Project::new(config().with_strict_validation(true)).unwrap();
    looped_buses(&mut p);
    let _ = p.recalc_graph(false);
}

#[test]
fn stale_reference_is_rejected() {
    let mut p = Project::new(config()).unwrap();
    let doomed = p.add_track(TrackType::Audio, "Doomed").unwrap();
    let stale = fader_out(&p, doomed);
    p.remove_track(doomed).unwrap();
    p.recalc_graph(false).unwrap();

    let master_in = track_in(&p, p.master_track());
    p.connections_mut().connect(PortConnection::new(stale, master_in));
    let err = p.recalc_graph(false).unwrap_err();
    assert!(matches!(err, Error::Graph(GraphError::StaleReference(_))), "{}", err);
}

#[test]
fn connection_rules() {
    let mut p = Project::new(config()).unwrap();
    let audio = p.add_track(TrackType::Audio, "Audio").unwrap();
    let midi = p.add_track(TrackType::Midi, "Midi").unwrap();
    let bus = p.add_track(TrackType::AudioBus, "Bus").unwrap();

    let port = |p: &Project, id: PortId| p.find_port(id).unwrap();
    let audio_out = port(&p, fader_out(&p, audio));
    let audio_in = port(&p, track_in(&p, audio));
    let midi_in = port(&p, track_in(&p, midi));
    let bus_in = port(&p, track_in(&p, bus));

    assert!(Graph::can_ports_be_connected(&p, &audio_out, &bus_in));
    // wrong direction
    assert!(!Graph::can_ports_be_connected(&p, &bus_in, &audio_out));
    // audio into an event port
    assert!(!Graph::can_ports_be_connected(&p, &audio_out, &midi_in));
    // feedback into its own input
    assert!(!Graph::can_ports_be_connected(&p, &audio_out, &audio_in));

    assert!(matches!(
        p.connect_ports(audio_out.id(), midi_in.id()),
        Err(Error::InvalidConnection { .. })
    ));
}

#[test]
fn modulator_macros_follow_their_cv_input() {
    use routegraph::plugin::PluginDescriptor;

    let mut p = Project::new(config()).unwrap();
    let mods = p.add_track(TrackType::Modulator, "Modulators").unwrap();
    let lfo = p
        .add_modulator(mods, &PluginDescriptor::new("LFO").with_cv_outs(1), Box::new(PassThrough::new()))
        .unwrap();
    let track = p.track(mods).unwrap();
    let cv_out = track.modulators().next().unwrap().out_ports()[0].id();
    let macro_in = track.macros()[0].cv_in().id();
    p.connect_ports(cv_out, macro_in).unwrap();
    p.recalc_graph(false).unwrap();

    let nodes = p.engine().router().graph_nodes().unwrap();
    let macro_key = NodeKey::ModulatorMacroProcessor { track: mods, index: 0 };
    assert!(nodes.children(&NodeKey::Plugin(lfo)).contains(&NodeKey::Port(cv_out)));
    assert!(nodes.children(&NodeKey::Port(macro_in)).contains(&macro_key));
    assert!(nodes.children(&NodeKey::InitialProcessor).contains(&NodeKey::Track(mods)));
}

#[test]
fn dot_export_lists_nodes() {
    let mut p = Project::new(config()).unwrap();
    p.add_track(TrackType::Audio, "Audio 1").unwrap();
    p.recalc_graph(false).unwrap();
    let dot = p.engine().router().to_dot();
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("initial processor"));
    assert!(dot.contains("->"));
}
