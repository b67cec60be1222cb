use std::sync::Arc;

use crate::port::{ControlRange, Port, PortFlags, PortFlow, PortIdAllocator, PortOwner, PortType};
use crate::processors::TrackId;
use crate::time::EngineProcessTimeInfo;

/// Macro knobs created on every modulator track.
pub const NUM_MODULATOR_MACROS: usize = 8;

/// Scales an incoming CV signal by a macro knob.
///
/// With nothing routed into `cv_in` the output is the knob value itself.
pub struct ModulatorMacroProcessor {
    track: TrackId,
    index: usize,
    cv_in: Arc<Port>,
    macro_: Arc<Port>,
    cv_out: Arc<Port>,
}

impl ModulatorMacroProcessor {
    pub(crate) fn new(track: TrackId, index: usize, ids: &mut PortIdAllocator) -> Self {
        let owner = PortOwner::ModulatorMacroProcessor { track, index };
        let name = format!("Macro {}", index + 1);
        Self {
            track,
            index,
            cv_in: Arc::new(Port::new(ids.next(), format!("{} CV in", name), PortType::Cv, PortFlow::Input, owner)),
            macro_: Arc::new(
                Port::new(ids.next(), name.clone(), PortType::Control, PortFlow::Input, owner)
                    .with_range(ControlRange::new(0.0, 1.0, 1.0))
                    .with_flags(PortFlags::AUTOMATABLE),
            ),
            cv_out: Arc::new(Port::new(ids.next(), format!("{} CV out", name), PortType::Cv, PortFlow::Output, owner)),
        }
    }

    pub fn track(&self) -> TrackId {
        self.track
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cv_in(&self) -> &Arc<Port> {
        &self.cv_in
    }

    pub fn macro_port(&self) -> &Arc<Port> {
        &self.macro_
    }

    pub fn cv_out(&self) -> &Arc<Port> {
        &self.cv_out
    }

    pub fn ports(&self) -> impl Iterator<Item = &Arc<Port>> {
        [&self.cv_in, &self.macro_, &self.cv_out].into_iter()
    }

    pub(crate) fn process(&self, time: &EngineProcessTimeInfo, cv_in_connected: bool) {
        let value = self.macro_.control_value();
        if cv_in_connected {
            self.cv_out.copy_from(&self.cv_in, time);
            self.cv_out.write_audio(|buf| {
                if let Some(region) = buf.get_mut(time.range()) {
                    region.iter_mut().for_each(|s| *s *= value);
                }
            });
        } else {
            self.cv_out.write_audio(|buf| {
                if let Some(region) = buf.get_mut(time.range()) {
                    region.fill(value);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconnected_macro_outputs_knob_value() {
        let mmp = ModulatorMacroProcessor::new(TrackId(3), 0, &mut PortIdAllocator::default());
        for port in mmp.ports() {
            port.allocate_bufs(4);
        }
        mmp.macro_port().set_control_value(0.75);
        let time = EngineProcessTimeInfo::new(0, 0, 4);
        mmp.process(&time, false);
        mmp.cv_out().read_audio(|buf| assert_eq!(buf, &[0.75; 4]));

        mmp.cv_in().write_audio(|buf| buf.fill(0.5));
        mmp.process(&time, true);
        mmp.cv_out().read_audio(|buf| assert_eq!(buf, &[0.375; 4]));
    }
}
