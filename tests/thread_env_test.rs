//! Kept in its own binary: the thread-count variable is process-wide.

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use routegraph::config::ENV_DSP_THREADS;
use routegraph::processors::TrackType;
use routegraph::{AudioEngine, CycleOutcome, EngineConfig, Error, Project};

fn process_on_audio_thread(engine: &Arc<AudioEngine>) -> Option<CycleOutcome> {
    let engine = Arc::clone(engine);
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(engine.process(64));
    });
    rx.recv_timeout(Duration::from_secs(5)).ok()
}

#[test]
fn failed_first_build_publishes_no_graph() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = EngineConfig::default()
        .with_num_threads(2)
        .with_strict_validation(false);
    let mut p = Project::new(config).unwrap();
    p.add_track(TrackType::Audio, "Audio 1").unwrap();

    std::env::set_var(ENV_DSP_THREADS, "lots");
    let err = p.recalc_graph(false).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)), "{}", err);
    assert!(p.engine().router().graph_nodes().is_none());
    assert!(!p.engine().router().is_running());
    assert_eq!(process_on_audio_thread(p.engine()), Some(CycleOutcome::NoGraph));

    std::env::set_var(ENV_DSP_THREADS, "1");
    p.recalc_graph(false).unwrap();
    std::env::remove_var(ENV_DSP_THREADS);
    assert!(p.engine().router().is_running());
    assert_eq!(process_on_audio_thread(p.engine()), Some(CycleOutcome::Processed));
}
