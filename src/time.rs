//! Per-cycle timing values.

use core::ops::Range;

/// Timing of one processing cycle, supplied by the engine callback.
///
/// Immutable for the duration of a cycle. `g_start_frame_w_offset` is the
/// global frame the buffer region at `local_offset` corresponds to, so it is
/// never smaller than `g_start_frame`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineProcessTimeInfo {
    /// Global playhead frame at the start of the callback.
    pub g_start_frame: u64,
    /// `g_start_frame` plus the offset into the callback buffer.
    pub g_start_frame_w_offset: u64,
    /// Offset into the port buffers where this cycle starts.
    pub local_offset: u32,
    /// Number of frames to process.
    pub nframes: u32,
}

impl EngineProcessTimeInfo {
    pub fn new(g_start_frame: u64, local_offset: u32, nframes: u32) -> Self {
        Self {
            g_start_frame,
            g_start_frame_w_offset: g_start_frame + u64::from(local_offset),
            local_offset,
            nframes,
        }
    }

    /// Buffer region this cycle reads and writes.
    #[inline]
    pub fn range(&self) -> Range<usize> {
        let start = self.local_offset as usize;
        start..start + self.nframes as usize
    }

    /// Last buffer index (exclusive) touched by this cycle.
    #[inline]
    pub fn end_offset(&self) -> u32 {
        self.local_offset + self.nframes
    }
}

/// Everything a node needs to know about the cycle it runs in.
///
/// Published once per cycle by the router and copied by the workers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProcessContext {
    pub time: EngineProcessTimeInfo,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Whether the transport is rolling.
    pub rolling: bool,
    /// Frames of latency preroll left before the transport really rolls.
    pub remaining_preroll: u32,
}
