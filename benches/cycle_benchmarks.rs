use criterion::{black_box, criterion_group, criterion_main, Criterion};
use routegraph::plugin::PassThrough;
use routegraph::processors::TrackType;
use routegraph::time::EngineProcessTimeInfo;
use routegraph::{EngineConfig, Project};

fn project(tracks: usize, num_threads: usize) -> Project {
    let config = EngineConfig::default()
        .with_buffer_size(256)
        .with_num_threads(num_threads)
        .with_strict_validation(false);
    let mut project = Project::new(config).unwrap();
    for i in 0..tracks {
        let track = project.add_track(TrackType::Audio, &format!("Audio {}", i)).unwrap();
        project
            .insert_plugin(track, 0, &PassThrough::descriptor(), Box::new(PassThrough::with_latency(i as u32)))
            .unwrap();
    }
    project.recalc_graph(false).unwrap();
    project
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("Router.start_cycle() 16 tracks, 1 thread", |b| {
        let project = project(16, 0);
        let router = project.engine().router();
        b.iter(|| router.start_cycle(black_box(EngineProcessTimeInfo::new(0, 0, 256))))
    });

    c.bench_function("Router.start_cycle() 16 tracks, 4 threads", |b| {
        let project = project(16, 3);
        let router = project.engine().router();
        b.iter(|| router.start_cycle(black_box(EngineProcessTimeInfo::new(0, 0, 256))))
    });

    c.bench_function("AudioEngine.process() 16 tracks", |b| {
        let project = project(16, 3);
        let engine = project.engine();
        let mut out = vec![0.0f32; 512];
        b.iter(|| {
            engine.process(black_box(256));
            engine.read_output(&mut out, 2);
        })
    });

    c.bench_function("Project.recalc_graph(soft) 16 tracks", |b| {
        let project = project(16, 0);
        b.iter(|| project.recalc_graph(black_box(true)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
