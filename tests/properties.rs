use hashbrown::HashMap;
use proptest::prelude::*;
use proptest::sample::Index;
use routegraph::plugin::PassThrough;
use routegraph::processors::{TrackId, TrackType};
use routegraph::{EngineConfig, GraphNodes, NodeKey, Project};

#[derive(Debug, Clone)]
struct TrackSpec {
    kind: TrackType,
    latency: Option<u32>,
}

fn track_spec() -> impl Strategy<Value = TrackSpec> {
    (
        prop_oneof![
            3 => Just(TrackType::Audio),
            1 => Just(TrackType::Midi),
            2 => Just(TrackType::AudioBus),
        ],
        proptest::option::of(0u32..512),
    )
        .prop_map(|(kind, latency)| TrackSpec { kind, latency })
}

#[derive(Debug, Clone)]
enum Routing {
    Output(Index, Index),
    Send(Index, Index, bool),
}

fn routing() -> impl Strategy<Value = Routing> {
    prop_oneof![
        (any::<Index>(), any::<Index>()).prop_map(|(a, b)| Routing::Output(a, b)),
        (any::<Index>(), any::<Index>(), any::<bool>()).prop_map(|(a, b, pre)| Routing::Send(a, b, pre)),
    ]
}

fn build(tracks: &[TrackSpec], routings: &[Routing], num_threads: usize, trace: usize) -> Project {
    let config = EngineConfig::default()
        .with_num_threads(num_threads)
        .with_strict_validation(false)
        .with_execution_trace(trace);
    let mut p = Project::new(config).unwrap();

    let mut ids: Vec<TrackId> = Vec::new();
    for (i, spec) in tracks.iter().enumerate() {
        let id = p.add_track(spec.kind, &format!("Track {}", i)).unwrap();
        if let Some(latency) = spec.latency {
            p.insert_plugin(id, 0, &PassThrough::descriptor(), Box::new(PassThrough::with_latency(latency)))
                .unwrap();
        }
        ids.push(id);
    }

    // refused routings (loops, type mismatches) leave the project unchanged
    for r in routings {
        match r {
            Routing::Output(a, b) => {
                let _ = p.set_track_output(ids[a.index(ids.len())], Some(ids[b.index(ids.len())]));
            }
            Routing::Send(a, b, pre) => {
                let _ = p.add_send(ids[a.index(ids.len())], 0, *pre, ids[b.index(ids.len())]);
            }
        }
    }

    p.recalc_graph(false).unwrap();
    p
}

fn latencies(nodes: &GraphNodes) -> Vec<(NodeKey, u32, u32)> {
    nodes
        .iter()
        .map(|n| (n.key(), n.playback_latency(), n.route_playback_latency()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn built_graphs_are_acyclic_and_ordered(
        tracks in prop::collection::vec(track_spec(), 1..8),
        routings in prop::collection::vec(routing(), 0..8),
    ) {
        let p = build(&tracks, &routings, 0, 0);
        let nodes = p.engine().router().graph_nodes().unwrap();
        prop_assert!(nodes.is_acyclic());

        let pos: HashMap<usize, usize> = nodes.topo_order().iter().enumerate().map(|(i, &n)| (n, i)).collect();
        prop_assert_eq!(pos.len(), nodes.len());
        for node in nodes.iter() {
            prop_assert_eq!(node.is_terminal(), node.childnodes().is_empty());
            prop_assert_eq!(node.is_initial(), node.init_refcount() == 0);
            for &child in node.childnodes() {
                prop_assert!(pos[&node.id()] < pos[&child]);
            }
        }
    }

    #[test]
    fn route_latency_is_own_plus_worst_child(
        tracks in prop::collection::vec(track_spec(), 1..8),
        routings in prop::collection::vec(routing(), 0..8),
    ) {
        let p = build(&tracks, &routings, 0, 0);
        let nodes = p.engine().router().graph_nodes().unwrap();

        for node in nodes.iter() {
            let worst_child = node
                .childnodes()
                .iter()
                .filter_map(|&c| nodes.node(c))
                .map(|c| c.route_playback_latency())
                .max()
                .unwrap_or(0);
            prop_assert_eq!(node.route_playback_latency(), node.playback_latency() + worst_child);
        }

        let from_triggers = nodes.init_triggers().map(|n| n.route_playback_latency()).max().unwrap_or(0);
        prop_assert_eq!(nodes.max_route_playback_latency(), from_triggers);

        let worst_plugin = tracks.iter().filter_map(|t| t.latency).max().unwrap_or(0);
        prop_assert!(nodes.max_route_playback_latency() >= worst_plugin);
    }

    #[test]
    fn soft_recalc_is_idempotent(
        tracks in prop::collection::vec(track_spec(), 1..6),
        routings in prop::collection::vec(routing(), 0..6),
    ) {
        let p = build(&tracks, &routings, 0, 0);
        let nodes = p.engine().router().graph_nodes().unwrap();
        let first = latencies(&nodes);

        p.recalc_graph(true).unwrap();
        let second = latencies(&nodes);
        p.recalc_graph(true).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&second, &latencies(&nodes));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn parallel_execution_respects_edges(
        tracks in prop::collection::vec(track_spec(), 1..6),
        routings in prop::collection::vec(routing(), 0..6),
    ) {
        let p = build(&tracks, &routings, 3, 4096);
        let router = p.engine().router();
        let nodes = router.graph_nodes().unwrap();

        for _ in 0..4 {
            prop_assert!(p.engine().process(128).is_processed());
            let trace = router.take_execution_trace();
            prop_assert_eq!(trace.len(), nodes.len());
            let pos: HashMap<NodeKey, usize> = trace.iter().enumerate().map(|(i, k)| (*k, i)).collect();
            for (parent, child) in nodes.edges() {
                prop_assert!(pos[&parent] < pos[&child], "{} ran after {}", parent, child);
            }
        }
    }
}
