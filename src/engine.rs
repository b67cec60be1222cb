//! The audio engine: transport, run flags and the per-callback driver around
//! the router.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::router::{CycleOutcome, Router};
use crate::time::EngineProcessTimeInfo;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PlayState {
    Paused,
    Rolling,
    RollRequested,
    PauseRequested,
}

impl PlayState {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => PlayState::Rolling,
            2 => PlayState::RollRequested,
            3 => PlayState::PauseRequested,
            _ => PlayState::Paused,
        }
    }
}

/// Play state shared between the UI and the audio callback.
///
/// Requests are resolved by the engine at the start of its next callback.
pub struct Transport {
    state: AtomicU8,
}

impl Transport {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PlayState::Paused as u8),
        }
    }

    pub fn request_roll(&self) {
        self.state.store(PlayState::RollRequested as u8, Ordering::SeqCst);
    }

    pub fn request_pause(&self) {
        self.state.store(PlayState::PauseRequested as u8, Ordering::SeqCst);
    }

    pub fn play_state(&self) -> PlayState {
        PlayState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set(&self, state: PlayState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_rolling(&self) -> bool {
        self.play_state() == PlayState::Rolling
    }
}

/// Flags and counters shared by the engine, the router and the UI.
pub struct EngineState {
    run: AtomicBool,
    cycle_running: AtomicBool,
    transport: Transport,
    remaining_latency_preroll: AtomicU32,
    playhead: AtomicU64,
}

impl EngineState {
    pub(crate) fn new() -> Self {
        Self {
            run: AtomicBool::new(true),
            cycle_running: AtomicBool::new(false),
            transport: Transport::new(),
            remaining_latency_preroll: AtomicU32::new(0),
            playhead: AtomicU64::new(0),
        }
    }

    /// Whether callbacks are allowed to process.
    pub fn run(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    pub fn set_run(&self, run: bool) {
        self.run.store(run, Ordering::SeqCst);
    }

    pub(crate) fn swap_run(&self, run: bool) -> bool {
        self.run.swap(run, Ordering::SeqCst)
    }

    /// Whether a callback is between [`EngineState::begin_cycle`] and the
    /// drop of its guard.
    pub fn is_cycle_running(&self) -> bool {
        self.cycle_running.load(Ordering::SeqCst)
    }

    /// Mark a callback as running, unless the engine is stopped.
    ///
    /// The flag is raised before `run` is checked, so a hard rebuild that
    /// clears `run` and then sees no running cycle cannot race a callback.
    pub fn begin_cycle(&self) -> Option<CycleGuard<'_>> {
        self.cycle_running.store(true, Ordering::SeqCst);
        if !self.run() {
            self.cycle_running.store(false, Ordering::SeqCst);
            return None;
        }
        Some(CycleGuard { state: self })
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Frames left before rolling nodes produce audio for the playhead.
    pub fn remaining_latency_preroll(&self) -> u32 {
        self.remaining_latency_preroll.load(Ordering::SeqCst)
    }

    /// Global frame position of the transport.
    pub fn playhead(&self) -> u64 {
        self.playhead.load(Ordering::SeqCst)
    }

    pub fn set_playhead(&self, frame: u64) {
        self.playhead.store(frame, Ordering::SeqCst);
    }
}

/// Clears `cycle_running` on drop.
pub struct CycleGuard<'a> {
    state: &'a EngineState,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.state.cycle_running.store(false, Ordering::SeqCst);
    }
}

pub struct AudioEngine {
    config: EngineConfig,
    state: Arc<EngineState>,
    router: Router,
    /// Whether the external outputs hold this callback's audio.
    output_valid: AtomicBool,
}

impl AudioEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(EngineState::new());
        info!(
            sample_rate = config.sample_rate,
            buffer_size = config.buffer_size,
            "audio engine created"
        );
        Ok(Self {
            router: Router::new(config.clone(), Arc::clone(&state)),
            config,
            state,
            output_valid: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn transport(&self) -> &Transport {
        self.state.transport()
    }

    /// Process one backend callback of `nframes` frames.
    ///
    /// While latency preroll remains, the callback is split so that each
    /// route starts rolling exactly when its latency is covered. The playhead
    /// only advances by the frames that rolled.
    pub fn process(&self, nframes: u32) -> CycleOutcome {
        self.output_valid.store(false, Ordering::SeqCst);
        let Some(_cycle) = self.state.begin_cycle() else {
            return CycleOutcome::Skipped;
        };
        if nframes > self.config.buffer_size {
            return CycleOutcome::Rejected;
        }
        self.resolve_transport_requests();

        let playhead = self.state.playhead();
        let mut offset = 0u32;
        let mut remaining = nframes;

        while remaining > 0 && self.state.remaining_latency_preroll() > 0 {
            let preroll = self.state.remaining_latency_preroll();
            let mut split = remaining.min(preroll);
            self.router.with_live_nodes(|nodes| {
                for node in nodes.into_iter().flat_map(|n| n.init_triggers()) {
                    let route_latency = node.route_playback_latency();
                    if preroll > route_latency && preroll <= route_latency + split {
                        // this route starts rolling inside the split
                        split = split.min(preroll - route_latency);
                    }
                }
            });

            let outcome = self
                .router
                .start_cycle(EngineProcessTimeInfo::new(playhead, offset, split));
            if !outcome.is_processed() {
                return outcome;
            }
            self.state
                .remaining_latency_preroll
                .fetch_sub(split, Ordering::SeqCst);
            remaining -= split;
            offset += split;
        }

        if remaining > 0 {
            let outcome = self
                .router
                .start_cycle(EngineProcessTimeInfo::new(playhead, offset, remaining));
            if !outcome.is_processed() {
                return outcome;
            }
            if self.state.transport.is_rolling() {
                self.state
                    .playhead
                    .fetch_add(u64::from(remaining), Ordering::SeqCst);
            }
        }

        self.output_valid.store(true, Ordering::SeqCst);
        CycleOutcome::Processed
    }

    fn resolve_transport_requests(&self) {
        match self.state.transport.play_state() {
            PlayState::RollRequested => {
                let preroll = self.router.get_max_route_playback_latency();
                self.state
                    .remaining_latency_preroll
                    .store(preroll, Ordering::SeqCst);
                self.state.transport.set(PlayState::Rolling);
            }
            PlayState::PauseRequested => {
                self.state
                    .remaining_latency_preroll
                    .store(0, Ordering::SeqCst);
                self.state.transport.set(PlayState::Paused);
            }
            PlayState::Paused | PlayState::Rolling => {}
        }
    }

    /// Interleave the exposed output ports of the last callback into `out`.
    ///
    /// Writes silence if the last callback did not process.
    pub fn read_output(&self, out: &mut [f32], channels: usize) {
        if channels == 0 || !self.output_valid.load(Ordering::SeqCst) {
            out.fill(0.0);
            return;
        }
        out.fill(0.0);
        self.router.with_live_nodes(|nodes| {
            let ports = nodes.map_or(&[][..], |n| n.external_out_ports());
            for (ch, port) in ports.iter().take(channels).enumerate() {
                port.read_audio(|buf| {
                    for (frame, sample) in out.chunks_exact_mut(channels).zip(buf) {
                        frame[ch] = *sample;
                    }
                });
            }
            // fewer ports than device channels: repeat the last port
            let Some(last) = ports.len().checked_sub(1) else {
                return;
            };
            if ports.len() >= channels {
                return;
            }
            for frame in out.chunks_exact_mut(channels) {
                let val = frame[last];
                for slot in frame.iter_mut().skip(ports.len()) {
                    *slot = val;
                }
            }
        });
    }
}
