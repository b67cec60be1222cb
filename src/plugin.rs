//! Opaque plugin processors.
//!
//! Plugin hosting itself is out of scope: a plugin is anything implementing
//! [`PluginInstance`], wrapped in a [`Plugin`] that owns its ports.

use core::fmt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PluginError;
use crate::port::{ControlRange, Port, PortFlags, PortFlow, PortIdAllocator, PortOwner, PortType};
use crate::time::ProcessContext;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PluginId(pub(crate) u32);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin#{}", self.0)
    }
}

/// Ports handed to [`PluginInstance::process`], in descriptor order.
pub struct PluginPorts<'a> {
    pub inputs: &'a [Arc<Port>],
    pub outputs: &'a [Arc<Port>],
}

impl<'a> PluginPorts<'a> {
    pub fn audio_inputs(&self) -> impl Iterator<Item = &'a Arc<Port>> {
        self.inputs.iter().filter(|p| p.kind() == PortType::Audio)
    }

    pub fn audio_outputs(&self) -> impl Iterator<Item = &'a Arc<Port>> {
        self.outputs.iter().filter(|p| p.kind() == PortType::Audio)
    }

    pub fn controls(&self) -> impl Iterator<Item = &'a Arc<Port>> {
        self.inputs.iter().filter(|p| p.is_control())
    }
}

/// The DSP side of a plugin.
///
/// `process` runs on a graph worker thread. Output buffers are cleared for
/// the cycle's region before it is called. Return an error instead of
/// panicking; the cycle completes regardless and the error is reported to
/// the UI afterwards.
///
/// ```
/// use routegraph::plugin::{PluginInstance, PluginPorts};
/// use routegraph::{PluginError, ProcessContext};
///
/// struct Silence;
///
/// impl PluginInstance for Silence {
///     fn process(&mut self, _ctx: &ProcessContext, _ports: &PluginPorts<'_>) -> Result<(), PluginError> {
///         Ok(())
///     }
/// }
/// ```
pub trait PluginInstance: Send {
    fn process(&mut self, ctx: &ProcessContext, ports: &PluginPorts<'_>) -> Result<(), PluginError>;

    /// Processing delay in frames.
    fn latency(&self) -> u32 {
        0
    }
}

/// A control input declared by a plugin.
#[derive(Clone, Debug)]
pub struct ControlDescriptor {
    pub label: String,
    pub range: ControlRange,
    pub automatable: bool,
}

impl ControlDescriptor {
    pub fn new(label: impl Into<String>, range: ControlRange) -> Self {
        Self {
            label: label.into(),
            range,
            automatable: true,
        }
    }
}

/// Port layout of a plugin.
#[derive(Clone, Debug, Default)]
pub struct PluginDescriptor {
    pub name: String,
    pub audio_ins: usize,
    pub audio_outs: usize,
    pub midi_in: bool,
    pub controls: Vec<ControlDescriptor>,
    pub cv_outs: usize,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_audio(mut self, ins: usize, outs: usize) -> Self {
        self.audio_ins = ins;
        self.audio_outs = outs;
        self
    }

    pub fn with_midi_in(mut self) -> Self {
        self.midi_in = true;
        self
    }

    pub fn with_control(mut self, control: ControlDescriptor) -> Self {
        self.controls.push(control);
        self
    }

    pub fn with_cv_outs(mut self, outs: usize) -> Self {
        self.cv_outs = outs;
        self
    }
}

pub struct Plugin {
    id: PluginId,
    name: String,
    in_ports: Vec<Arc<Port>>,
    out_ports: Vec<Arc<Port>>,
    instance: Mutex<Box<dyn PluginInstance>>,
    latency: AtomicU32,
    deleting: AtomicBool,
}

impl Plugin {
    pub(crate) fn new(
        id: PluginId,
        descriptor: &PluginDescriptor,
        instance: Box<dyn PluginInstance>,
        ids: &mut PortIdAllocator,
    ) -> Self {
        let owner = PortOwner::Plugin(id);
        let mut in_ports = Vec::new();
        let mut out_ports = Vec::new();

        for i in 0..descriptor.audio_ins {
            in_ports.push(Arc::new(Port::new(
                ids.next(),
                format!("{} audio in {}", descriptor.name, i + 1),
                PortType::Audio,
                PortFlow::Input,
                owner,
            )));
        }
        if descriptor.midi_in {
            in_ports.push(Arc::new(Port::new(
                ids.next(),
                format!("{} midi in", descriptor.name),
                PortType::Event,
                PortFlow::Input,
                owner,
            )));
        }
        for control in &descriptor.controls {
            let flags = if control.automatable {
                PortFlags::AUTOMATABLE
            } else {
                PortFlags::NONE
            };
            in_ports.push(Arc::new(
                Port::new(ids.next(), control.label.clone(), PortType::Control, PortFlow::Input, owner)
                    .with_range(control.range)
                    .with_flags(flags),
            ));
        }
        for i in 0..descriptor.audio_outs {
            out_ports.push(Arc::new(Port::new(
                ids.next(),
                format!("{} audio out {}", descriptor.name, i + 1),
                PortType::Audio,
                PortFlow::Output,
                owner,
            )));
        }
        for i in 0..descriptor.cv_outs {
            out_ports.push(Arc::new(Port::new(
                ids.next(),
                format!("{} cv out {}", descriptor.name, i + 1),
                PortType::Cv,
                PortFlow::Output,
                owner,
            )));
        }

        let latency = instance.latency();
        Self {
            id,
            name: descriptor.name.clone(),
            in_ports,
            out_ports,
            instance: Mutex::new(instance),
            latency: AtomicU32::new(latency),
            deleting: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_ports(&self) -> &[Arc<Port>] {
        &self.in_ports
    }

    pub fn out_ports(&self) -> &[Arc<Port>] {
        &self.out_ports
    }

    pub fn audio_ins(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.in_ports.iter().filter(|p| p.kind() == PortType::Audio)
    }

    pub fn audio_outs(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.out_ports.iter().filter(|p| p.kind() == PortType::Audio)
    }

    pub fn ports(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.in_ports.iter().chain(self.out_ports.iter())
    }

    /// Cached latency, as of the last [`Plugin::update_latency`].
    pub fn latency(&self) -> u32 {
        self.latency.load(Ordering::SeqCst)
    }

    /// Re-read the instance's latency. Not real-time safe.
    pub fn update_latency(&self) -> u32 {
        let latency = self.instance.lock().latency();
        self.latency.store(latency, Ordering::SeqCst);
        latency
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_deleting(&self) {
        self.deleting.store(true, Ordering::SeqCst);
        for port in self.ports() {
            port.mark_deleting();
        }
    }

    /// Run the instance for one cycle.
    ///
    /// Never blocks: if the instance is locked by a non-real-time caller the
    /// cycle is skipped for this plugin and an error is returned. A panic in
    /// the instance is caught, its outputs are silenced and it comes back as
    /// an error too.
    pub(crate) fn process(&self, ctx: &ProcessContext) -> Result<(), PluginError> {
        let Some(mut instance) = self.instance.try_lock() else {
            return Err(PluginError::new(format!("{} is busy", self.name)));
        };
        for port in &self.out_ports {
            port.clear_buffer(&ctx.time);
        }
        let ports = PluginPorts {
            inputs: &self.in_ports,
            outputs: &self.out_ports,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| instance.process(ctx, &ports))) {
            Ok(result) => result,
            Err(payload) => {
                for port in &self.out_ports {
                    port.clear_buffer(&ctx.time);
                }
                Err(PluginError::new(format!(
                    "{} panicked: {}",
                    self.name,
                    panic_message(&*payload)
                )))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("latency", &self.latency())
            .finish()
    }
}

/// Copies each audio input to the matching output, with an adjustable
/// reported latency.
///
/// The latency handle can be changed from any thread; call
/// `Project::recalc_graph(true)` afterwards to propagate it.
#[derive(Clone, Default)]
pub struct PassThrough {
    latency: Arc<AtomicU32>,
}

impl PassThrough {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: u32) -> Self {
        Self {
            latency: Arc::new(AtomicU32::new(latency)),
        }
    }

    /// Shared handle to the reported latency.
    pub fn latency_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.latency)
    }

    /// Two audio ins, two audio outs, no controls.
    pub fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new("PassThrough").with_audio(2, 2)
    }
}

impl PluginInstance for PassThrough {
    fn process(&mut self, ctx: &ProcessContext, ports: &PluginPorts<'_>) -> Result<(), PluginError> {
        for (input, output) in ports.audio_inputs().zip(ports.audio_outputs()) {
            output.copy_from(input, &ctx.time);
        }
        Ok(())
    }

    fn latency(&self) -> u32 {
        self.latency.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::EngineProcessTimeInfo;

    #[test]
    fn passthrough_copies_and_reports_latency() {
        let mut ids = PortIdAllocator::default();
        let pt = PassThrough::with_latency(32);
        let handle = pt.latency_handle();
        let plugin = Plugin::new(PluginId(0), &PassThrough::descriptor(), Box::new(pt), &mut ids);
        assert_eq!(plugin.in_ports().len(), 2);
        assert_eq!(plugin.out_ports().len(), 2);
        assert_eq!(plugin.latency(), 32);

        for port in plugin.ports() {
            port.allocate_bufs(16);
        }
        plugin.in_ports()[0].write_audio(|buf| buf.fill(0.25));

        let ctx = ProcessContext {
            time: EngineProcessTimeInfo::new(0, 0, 16),
            sample_rate: 48000,
            ..Default::default()
        };
        plugin.process(&ctx).unwrap();
        plugin.out_ports()[0].read_audio(|buf| assert!(buf.iter().all(|&s| s == 0.25)));

        handle.store(64, Ordering::SeqCst);
        assert_eq!(plugin.latency(), 32);
        assert_eq!(plugin.update_latency(), 64);
        assert_eq!(plugin.latency(), 64);
    }

    struct Crashing;

    impl PluginInstance for Crashing {
        fn process(&mut self, _ctx: &ProcessContext, ports: &PluginPorts<'_>) -> Result<(), PluginError> {
            for out in ports.audio_outputs() {
                out.write_audio(|buf| buf.fill(1.0));
            }
            panic!("plugin crashed");
        }
    }

    #[test]
    fn panicking_instance_is_reported_as_error() {
        let mut ids = PortIdAllocator::default();
        let plugin = Plugin::new(PluginId(2), &PassThrough::descriptor(), Box::new(Crashing), &mut ids);
        for port in plugin.ports() {
            port.allocate_bufs(16);
        }
        let ctx = ProcessContext {
            time: EngineProcessTimeInfo::new(0, 0, 16),
            sample_rate: 48000,
            ..Default::default()
        };

        for _ in 0..2 {
            let err = plugin.process(&ctx).unwrap_err();
            assert!(err.0.contains("panicked: plugin crashed"), "{}", err);
            plugin.out_ports()[0].read_audio(|buf| assert!(buf.iter().all(|&s| s == 0.0)));
        }
    }

    #[test]
    fn controls_are_automatable_by_default() {
        let mut ids = PortIdAllocator::default();
        let desc = PluginDescriptor::new("gain")
            .with_audio(1, 1)
            .with_control(ControlDescriptor::new("gain", ControlRange::new(0.0, 2.0, 1.0)));
        let plugin = Plugin::new(PluginId(1), &desc, Box::new(PassThrough::new()), &mut ids);
        let control = plugin.in_ports().iter().find(|p| p.is_control()).unwrap();
        assert!(control.flags().contains(PortFlags::AUTOMATABLE));
        assert_eq!(control.control_value(), 1.0);
    }
}
