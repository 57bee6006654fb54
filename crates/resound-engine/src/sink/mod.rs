mod worker;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use resound_core::channels::ChannelMap;
use resound_core::memory::MemChunk;
use resound_core::sample::SampleSpec;
use resound_core::time::MicroSeconds;
use resound_core::volume::CVolume;

pub use self::worker::{
    GhostInfo, SinkMessage, SinkWorker, ThreadInput, WorkerCallbacks, MAX_MIX_STREAMS,
};
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventKind};
use crate::hook::HookResult;
use crate::msgq::MsgSender;
use crate::namereg::{NameRegFail, Namespace};
use crate::proplist::{Proplist, DEVICE_CLASS, DEVICE_DESCRIPTION};
use crate::rtpoll::RtPoll;
use crate::source::Source;
use crate::{Core, ModuleIndex, SinkId, SinkInputId, SourceId};

pub(crate) const DEFAULT_MIN_LATENCY: MicroSeconds = MicroSeconds::from_millis(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Init,
    Idle,
    Running,
    Suspended,
    Unlinked,
}

impl SinkState {
    /// Streams are being pulled or could be at any moment; the driver is in
    /// its active mode.
    pub fn is_opened(self) -> bool {
        matches!(self, SinkState::Idle | SinkState::Running)
    }

    /// The sink is wired into the server: anything but INIT and UNLINKED.
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            SinkState::Idle | SinkState::Running | SinkState::Suspended
        )
    }
}

/// Capability bits a driver declares at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkFlags {
    /// The driver owns the volume; the mixer won't apply software gain on
    /// its behalf.
    pub hw_volume_ctrl: bool,
    /// The reported volume curve is dB-linear.
    pub decibel_volume: bool,
}

/// Everything a driver fills in before asking the core for a sink.
#[derive(Debug)]
pub struct SinkBuilder {
    pub name: Option<String>,
    pub driver: Option<String>,
    pub module: Option<ModuleIndex>,
    pub proplist: Proplist,
    pub sample_spec: Option<SampleSpec>,
    pub channel_map: Option<ChannelMap>,
    pub volume: Option<CVolume>,
    pub muted: Option<bool>,
    pub namereg_fail: NameRegFail,
}

impl SinkBuilder {
    pub fn new(name: impl Into<String>) -> SinkBuilder {
        SinkBuilder {
            name: Some(name.into()),
            driver: None,
            module: None,
            proplist: Proplist::new(),
            sample_spec: None,
            channel_map: None,
            volume: None,
            muted: None,
            namereg_fail: NameRegFail::default(),
        }
    }
}

type StateCallback = Box<dyn FnMut(SinkId, SinkState) -> Result<()> + Send>;
type GetVolumeCallback = Box<dyn FnMut(SinkId, &mut CVolume) -> Result<()> + Send>;
type SetVolumeCallback = Box<dyn FnMut(SinkId, &CVolume) -> Result<()> + Send>;
type GetMuteCallback = Box<dyn FnMut(SinkId, &mut bool) -> Result<()> + Send>;
type SetMuteCallback = Box<dyn FnMut(SinkId, bool) -> Result<()> + Send>;
type GetLatencyCallback = Box<dyn FnMut(SinkId) -> MicroSeconds + Send>;

/// Control-side driver hooks; any subset may be present. The volume and
/// mute hooks are self-disabling: one failure and the sink falls back to
/// the software path for good.
#[derive(Default)]
pub struct SinkCallbacks {
    pub set_state: Option<StateCallback>,
    pub get_volume: Option<GetVolumeCallback>,
    pub set_volume: Option<SetVolumeCallback>,
    pub get_mute: Option<GetMuteCallback>,
    pub set_mute: Option<SetMuteCallback>,
    pub get_latency: Option<GetLatencyCallback>,
}

/// The control-thread view of a playback endpoint.
pub struct Sink {
    pub(crate) name: String,
    pub(crate) driver: Option<String>,
    pub(crate) module: Option<ModuleIndex>,
    pub(crate) proplist: Proplist,
    pub(crate) sample_spec: SampleSpec,
    pub(crate) channel_map: ChannelMap,
    pub(crate) flags: SinkFlags,
    pub(crate) state: SinkState,
    pub(crate) volume: CVolume,
    pub(crate) muted: bool,
    pub(crate) refresh_volume: bool,
    pub(crate) refresh_mute: bool,
    pub(crate) inputs: Vec<SinkInputId>,
    pub(crate) n_corked: usize,
    pub(crate) min_latency: MicroSeconds,
    pub(crate) max_latency: MicroSeconds,
    pub(crate) silence: MemChunk,
    pub(crate) monitor: SourceId,
    pub(crate) callbacks: SinkCallbacks,
    pub(crate) msgq: Option<MsgSender>,
    pub(crate) rtpoll: Option<Arc<RtPoll>>,
    pub(crate) worker: Option<SinkWorker>,
}

impl Sink {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn module(&self) -> Option<ModuleIndex> {
        self.module
    }

    pub fn proplist(&self) -> &Proplist {
        &self.proplist
    }

    pub fn sample_spec(&self) -> SampleSpec {
        self.sample_spec
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    pub fn flags(&self) -> SinkFlags {
        self.flags
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn volume(&self) -> &CVolume {
        &self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// The cached all-zeroes chunk this sink hands out when nothing is
    /// playing.
    pub fn silence(&self) -> &MemChunk {
        &self.silence
    }

    pub fn monitor(&self) -> SourceId {
        self.monitor
    }

    pub fn inputs(&self) -> &[SinkInputId] {
        &self.inputs
    }

    pub fn n_corked(&self) -> usize {
        self.n_corked
    }

    pub fn min_latency(&self) -> MicroSeconds {
        self.min_latency
    }

    pub fn max_latency(&self) -> MicroSeconds {
        self.max_latency
    }
}

fn validate_builder(builder: &SinkBuilder) -> Result<()> {
    let spec = builder.sample_spec.ok_or(Error::InvalidSampleSpec)?;
    if !spec.is_valid() {
        return Err(Error::InvalidSampleSpec);
    }
    if let Some(map) = &builder.channel_map {
        if map.len() != spec.channels as usize {
            return Err(Error::ChannelMismatch);
        }
    }
    if let Some(volume) = &builder.volume {
        if volume.len() != spec.channels as usize {
            return Err(Error::ChannelMismatch);
        }
    }
    Ok(())
}

impl Core {
    /// Builds and registers a sink along with its monitor source. The sink
    /// comes out in INIT; the driver still has to inject its queue and poll
    /// handles and call [`Core::put_sink`].
    pub fn create_sink(&mut self, mut builder: SinkBuilder, flags: SinkFlags) -> Result<SinkId> {
        let requested = builder.name.take().ok_or(Error::InvalidName)?;
        let name = self
            .names
            .register(Namespace::Sink, &requested, builder.namereg_fail)?;
        builder.name = Some(name.clone());

        if self.hooks.sink_new.fire(&mut builder) == HookResult::Cancel {
            self.names.unregister(Namespace::Sink, &name);
            return Err(Error::Vetoed);
        }

        if let Err(err) = validate_builder(&builder) {
            self.names.unregister(Namespace::Sink, &name);
            return Err(err);
        }

        if self.hooks.sink_fixate.fire(&mut builder) == HookResult::Cancel {
            self.names.unregister(Namespace::Sink, &name);
            return Err(Error::Vetoed);
        }

        // The fixate hook had its last chance to mutate the builder; from
        // here on the data is authoritative.
        let spec = match builder.sample_spec {
            Some(spec) if spec.is_valid() => spec,
            _ => {
                self.names.unregister(Namespace::Sink, &name);
                return Err(Error::InvalidSampleSpec);
            }
        };
        let channel_map = builder
            .channel_map
            .clone()
            .unwrap_or_else(|| ChannelMap::default_for(spec.channels));
        let volume = builder
            .volume
            .clone()
            .unwrap_or_else(|| CVolume::norm(spec.channels));
        let muted = builder.muted.unwrap_or(false);

        let monitor_name = match self.names.register(
            Namespace::Source,
            &format!("{name}.monitor"),
            NameRegFail::Fail,
        ) {
            Ok(monitor_name) => monitor_name,
            Err(err) => {
                self.names.unregister(Namespace::Sink, &name);
                return Err(err);
            }
        };

        let silence = self.silence_cache.get(&self.mempool, &spec);

        let mut monitor_proplist = Proplist::new();
        let description = builder.proplist.get(DEVICE_DESCRIPTION).unwrap_or(&name);
        monitor_proplist.set(DEVICE_DESCRIPTION, format!("Monitor of {description}"));
        monitor_proplist.set(DEVICE_CLASS, "monitor");

        let source = Source::new(
            monitor_name,
            builder.driver.clone(),
            monitor_proplist,
            spec,
            channel_map.clone(),
        );
        let monitor = self.sources.insert(source);

        let sink = Sink {
            name,
            driver: builder.driver.clone(),
            module: builder.module,
            proplist: builder.proplist.clone(),
            sample_spec: spec,
            channel_map,
            flags,
            state: SinkState::Init,
            volume: volume.clone(),
            muted,
            refresh_volume: false,
            refresh_mute: false,
            inputs: Vec::new(),
            n_corked: 0,
            min_latency: DEFAULT_MIN_LATENCY,
            max_latency: DEFAULT_MIN_LATENCY,
            silence: silence.clone(),
            monitor,
            callbacks: SinkCallbacks::default(),
            msgq: None,
            rtpoll: None,
            worker: None,
        };
        let id = self.sinks.insert(sink);
        self.sources[monitor].monitor_of = Some(id);

        let worker = SinkWorker::new(
            id,
            monitor,
            spec,
            volume,
            muted,
            silence,
            self.mempool.clone(),
        );
        self.sinks[id].worker = Some(worker);

        tracing::info!(
            "Created sink {:?} \"{}\" with sample spec {} and channel map {}",
            id,
            self.sinks[id].name,
            spec,
            self.sinks[id].channel_map,
        );

        Ok(id)
    }

    pub fn sink(&self, id: SinkId) -> Result<&Sink> {
        self.sinks.get(id).ok_or(Error::InvalidId)
    }

    pub fn set_sink_callbacks(&mut self, id: SinkId, callbacks: SinkCallbacks) -> Result<()> {
        let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
        sink.callbacks = callbacks;
        Ok(())
    }

    /// Hands the sink (and its monitor) the driver's message queue.
    pub fn set_sink_msgq(&mut self, id: SinkId, msgq: MsgSender) -> Result<()> {
        let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
        sink.msgq = Some(msgq.clone());
        let monitor = sink.monitor;
        self.sources[monitor].msgq = Some(msgq);
        Ok(())
    }

    pub fn set_sink_rtpoll(&mut self, id: SinkId, rtpoll: Arc<RtPoll>) -> Result<()> {
        let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
        sink.rtpoll = Some(rtpoll.clone());
        let monitor = sink.monitor;
        self.sources[monitor].rtpoll = Some(rtpoll);
        Ok(())
    }

    /// Declares the device's latency bounds. Only legal before `put`, and
    /// only reaches the IO half while the worker hasn't been taken yet.
    pub fn set_sink_latency_range(
        &mut self,
        id: SinkId,
        min: MicroSeconds,
        max: MicroSeconds,
    ) -> Result<()> {
        let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
        assert_eq!(sink.state, SinkState::Init);
        assert!(min.is_zero() || max.is_zero() || min <= max);
        sink.min_latency = min;
        sink.max_latency = max;
        if let Some(worker) = sink.worker.as_mut() {
            worker.set_latency_range(min, max);
        }
        Ok(())
    }

    /// Detaches the IO half built at construction; the driver moves it onto
    /// its IO thread.
    pub fn take_sink_worker(&mut self, id: SinkId) -> Result<SinkWorker> {
        let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
        sink.worker.take().ok_or(Error::InvalidState)
    }

    /// Publishes a fully wired sink: INIT → IDLE, monitor put, NEW event.
    pub fn put_sink(&mut self, id: SinkId) -> Result<()> {
        {
            let sink = self.sinks.get(id).ok_or(Error::InvalidId)?;
            assert_eq!(sink.state, SinkState::Init, "put is only legal from INIT");
            assert!(sink.msgq.is_some());
            assert!(sink.rtpoll.is_some());
            assert!(
                sink.min_latency.is_zero()
                    || sink.max_latency.is_zero()
                    || sink.min_latency <= sink.max_latency
            );
        }

        {
            let sink = &mut self.sinks[id];
            if !sink.flags.hw_volume_ctrl {
                sink.flags.decibel_volume = true;
            }
        }

        self.sink_set_state(id, SinkState::Idle)?;

        let monitor = self.sinks[id].monitor;
        self.put_source(monitor)?;

        self.events.notify(CoreEvent::Sink {
            kind: EventKind::New,
            id,
        });
        let mut arg = id;
        self.hooks.sink_put.fire(&mut arg);
        Ok(())
    }

    /// Takes the sink out of service. Idempotent: it also undoes the
    /// registrations done at construction, so it runs even on sinks that
    /// were never put.
    pub fn unlink_sink(&mut self, id: SinkId) -> Result<()> {
        let (linked, name, monitor) = {
            let sink = self.sinks.get(id).ok_or(Error::InvalidId)?;
            (sink.state.is_linked(), sink.name.clone(), sink.monitor)
        };

        if linked {
            let mut arg = id;
            self.hooks.sink_unlink.fire(&mut arg);
        }

        if self.sinks[id].state != SinkState::Unlinked {
            self.names.unregister(Namespace::Sink, &name);
        }

        let mut previous: Option<SinkInputId> = None;
        while let Some(&input_id) = self.sinks[id].inputs.first() {
            // A kill that doesn't remove its input would spin here forever.
            assert!(previous != Some(input_id), "kill left the input attached");
            self.kill_sink_input(input_id)?;
            previous = Some(input_id);
        }

        if linked {
            let _ = self.sink_set_state(id, SinkState::Unlinked);
        }
        self.sinks[id].state = SinkState::Unlinked;
        self.sinks[id].callbacks = SinkCallbacks::default();

        self.unlink_source(monitor)?;

        if linked {
            self.events.notify(CoreEvent::Sink {
                kind: EventKind::Remove,
                id,
            });
            let mut arg = id;
            self.hooks.sink_unlink_post.fire(&mut arg);
        }

        Ok(())
    }

    /// Frees an unlinked sink (unlinking first if the caller didn't) and
    /// its monitor source.
    pub fn remove_sink(&mut self, id: SinkId) -> Result<()> {
        let state = self.sinks.get(id).ok_or(Error::InvalidId)?.state;
        if state != SinkState::Unlinked {
            self.unlink_sink(id)?;
        }

        let sink = match self.sinks.remove(id) {
            Some(sink) => sink,
            None => return Err(Error::InvalidId),
        };
        assert!(sink.inputs.is_empty(), "sink freed with inputs attached");

        tracing::info!("Freeing sink {:?} \"{}\"", id, sink.name);

        self.sources.remove(sink.monitor);
        Ok(())
    }

    pub(crate) fn sink_set_state(&mut self, id: SinkId, state: SinkState) -> Result<()> {
        let suspend_change = {
            let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
            if sink.state == state {
                return Ok(());
            }
            let suspend_change = (sink.state == SinkState::Suspended && state.is_opened())
                || (sink.state.is_opened() && state == SinkState::Suspended);

            if let Some(set_state) = sink.callbacks.set_state.as_mut() {
                set_state(id, state)?;
            }
            suspend_change
        };

        let (tx, rx) = oneshot::channel();
        self.sink_send_sync(id, rx, SinkMessage::SetState { state, reply: tx })?;

        self.sinks[id].state = state;

        if suspend_change {
            // We're suspending or resuming, tell everyone about it.
            let inputs = self.sinks[id].inputs.clone();
            for input_id in inputs {
                if let Some(input) = self.sink_inputs.get_mut(input_id) {
                    if let Some(on_suspend) = input.on_suspend.as_mut() {
                        on_suspend(state == SinkState::Suspended);
                    }
                }
            }
        }

        if state != SinkState::Unlinked {
            // Entering UNLINKED is announced by unlink itself.
            let mut arg = id;
            self.hooks.sink_state_changed.fire(&mut arg);
        }

        Ok(())
    }

    /// Moves between IDLE and RUNNING according to demand; SUSPENDED is
    /// left alone.
    pub fn update_sink_status(&mut self, id: SinkId) -> Result<()> {
        let sink = self.sinks.get(id).ok_or(Error::InvalidId)?;
        assert!(sink.state.is_linked());

        if sink.state == SinkState::Suspended {
            return Ok(());
        }

        let state = if self.sink_used_by(id)? > 0 {
            SinkState::Running
        } else {
            SinkState::Idle
        };
        self.sink_set_state(id, state)
    }

    pub fn suspend_sink(&mut self, id: SinkId, suspend: bool) -> Result<()> {
        let sink = self.sinks.get(id).ok_or(Error::InvalidId)?;
        assert!(sink.state.is_linked());

        if suspend {
            self.sink_set_state(id, SinkState::Suspended)
        } else {
            let state = if self.sink_used_by(id)? > 0 {
                SinkState::Running
            } else {
                SinkState::Idle
            };
            self.sink_set_state(id, state)
        }
    }

    pub fn set_sink_volume(&mut self, id: SinkId, volume: &CVolume) -> Result<()> {
        let changed = {
            let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
            assert!(sink.state.is_linked());
            if volume.len() != sink.sample_spec.channels as usize {
                return Err(Error::ChannelMismatch);
            }

            let changed = sink.volume != *volume;
            sink.volume = volume.clone();

            if let Some(set_volume) = sink.callbacks.set_volume.as_mut() {
                if set_volume(id, volume).is_err() {
                    sink.callbacks.set_volume = None;
                }
            }
            changed
        };

        if self.sinks[id].callbacks.set_volume.is_none() {
            self.sink_post(
                id,
                SinkMessage::SetVolume {
                    volume: volume.clone(),
                },
            )?;
        }

        if changed {
            self.events.notify(CoreEvent::Sink {
                kind: EventKind::Change,
                id,
            });
        }
        Ok(())
    }

    pub fn get_sink_volume(&mut self, id: SinkId) -> Result<CVolume> {
        let (old, refresh) = {
            let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
            assert!(sink.state.is_linked());

            let old = sink.volume.clone();
            if let Some(get_volume) = sink.callbacks.get_volume.as_mut() {
                let mut refreshed = sink.volume.clone();
                if get_volume(id, &mut refreshed).is_err() {
                    sink.callbacks.get_volume = None;
                } else {
                    sink.volume = refreshed;
                }
            }
            let refresh = sink.callbacks.get_volume.is_none() && sink.refresh_volume;
            (old, refresh)
        };

        if refresh {
            let (tx, rx) = oneshot::channel();
            if let Ok(volume) = self.sink_send_sync(id, rx, SinkMessage::GetVolume { reply: tx }) {
                self.sinks[id].volume = volume;
            }
        }

        if old != self.sinks[id].volume {
            self.events.notify(CoreEvent::Sink {
                kind: EventKind::Change,
                id,
            });
        }

        Ok(self.sinks[id].volume.clone())
    }

    pub fn set_sink_mute(&mut self, id: SinkId, muted: bool) -> Result<()> {
        let changed = {
            let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
            assert!(sink.state.is_linked());

            let changed = sink.muted != muted;
            sink.muted = muted;

            if let Some(set_mute) = sink.callbacks.set_mute.as_mut() {
                if set_mute(id, muted).is_err() {
                    sink.callbacks.set_mute = None;
                }
            }
            changed
        };

        if self.sinks[id].callbacks.set_mute.is_none() {
            self.sink_post(id, SinkMessage::SetMute { muted })?;
        }

        if changed {
            self.events.notify(CoreEvent::Sink {
                kind: EventKind::Change,
                id,
            });
        }
        Ok(())
    }

    pub fn get_sink_mute(&mut self, id: SinkId) -> Result<bool> {
        let (old, refresh) = {
            let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
            assert!(sink.state.is_linked());

            let old = sink.muted;
            if let Some(get_mute) = sink.callbacks.get_mute.as_mut() {
                let mut refreshed = sink.muted;
                if get_mute(id, &mut refreshed).is_err() {
                    sink.callbacks.get_mute = None;
                } else {
                    sink.muted = refreshed;
                }
            }
            let refresh = sink.callbacks.get_mute.is_none() && sink.refresh_mute;
            (old, refresh)
        };

        if refresh {
            let (tx, rx) = oneshot::channel();
            if let Ok(muted) = self.sink_send_sync(id, rx, SinkMessage::GetMute { reply: tx }) {
                self.sinks[id].muted = muted;
            }
        }

        if old != self.sinks[id].muted {
            self.events.notify(CoreEvent::Sink {
                kind: EventKind::Change,
                id,
            });
        }

        Ok(self.sinks[id].muted)
    }

    pub fn set_sink_refresh_volume(&mut self, id: SinkId, refresh: bool) -> Result<()> {
        let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
        sink.refresh_volume = refresh;
        Ok(())
    }

    pub fn set_sink_refresh_mute(&mut self, id: SinkId, refresh: bool) -> Result<()> {
        let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;
        sink.refresh_mute = refresh;
        Ok(())
    }

    /// Updates the device description, keeping the monitor's in step.
    pub fn set_sink_description(&mut self, id: SinkId, description: Option<&str>) -> Result<()> {
        let (monitor, monitor_description, linked) = {
            let sink = self.sinks.get_mut(id).ok_or(Error::InvalidId)?;

            if description.is_none() && !sink.proplist.contains(DEVICE_DESCRIPTION) {
                return Ok(());
            }
            if let (Some(old), Some(new)) = (sink.proplist.get(DEVICE_DESCRIPTION), description) {
                if old == new {
                    return Ok(());
                }
            }

            match description {
                Some(description) => sink.proplist.set(DEVICE_DESCRIPTION, description),
                None => {
                    sink.proplist.unset(DEVICE_DESCRIPTION);
                }
            }

            let monitor_description =
                format!("Monitor of {}", description.unwrap_or(&sink.name));
            (sink.monitor, monitor_description, sink.state.is_linked())
        };

        self.set_source_description(monitor, Some(&monitor_description))?;

        if linked {
            self.events.notify(CoreEvent::Sink {
                kind: EventKind::Change,
                id,
            });
            let mut arg = id;
            self.hooks.sink_proplist_changed.fire(&mut arg);
        }

        Ok(())
    }

    /// Everything attached to this sink, monitor taps included.
    pub fn sink_linked_by(&self, id: SinkId) -> Result<usize> {
        let sink = self.sinks.get(id).ok_or(Error::InvalidId)?;
        assert!(sink.state.is_linked());

        // Note the asymmetry to sink_used_by: monitor clients count here.
        Ok(sink.inputs.len() + self.source_linked_by(sink.monitor)?)
    }

    /// Demand for actual playback: non-corked inputs only.
    pub fn sink_used_by(&self, id: SinkId) -> Result<usize> {
        let sink = self.sinks.get(id).ok_or(Error::InvalidId)?;
        assert!(sink.state.is_linked());
        assert!(sink.inputs.len() >= sink.n_corked);

        // Streams connected to the monitor source don't matter here.
        Ok(sink.inputs.len() - sink.n_corked)
    }

    /// Latency in the time domain of the sound card; 0 when it can't be
    /// determined.
    pub fn get_sink_latency(&mut self, id: SinkId) -> Result<MicroSeconds> {
        {
            let sink = self.sinks.get(id).ok_or(Error::InvalidId)?;
            assert!(sink.state.is_linked());
            if !sink.state.is_opened() {
                return Ok(MicroSeconds::ZERO);
            }
        }

        if let Some(get_latency) = self.sinks[id].callbacks.get_latency.as_mut() {
            return Ok(get_latency(id));
        }

        let (tx, rx) = oneshot::channel();
        match self.sink_send_sync(id, rx, SinkMessage::GetLatency { reply: tx }) {
            Ok(usec) => Ok(usec.unwrap_or(MicroSeconds::ZERO)),
            Err(_) => Ok(MicroSeconds::ZERO),
        }
    }

    /// The latency the attached streams are asking for, clamped to the
    /// sink's bounds; `None` when nobody asked.
    pub fn get_sink_requested_latency(&mut self, id: SinkId) -> Result<Option<MicroSeconds>> {
        {
            let sink = self.sinks.get(id).ok_or(Error::InvalidId)?;
            assert!(sink.state.is_linked());
            if !sink.state.is_opened() {
                return Ok(None);
            }
        }

        let (tx, rx) = oneshot::channel();
        match self.sink_send_sync(id, rx, SinkMessage::GetRequestedLatency { reply: tx }) {
            Ok(usec) => Ok(usec),
            Err(_) => Ok(None),
        }
    }

    /// Bulk-detaches all streams and the monitor so the driver can swap its
    /// queue or poll handles.
    pub fn detach_sink(&mut self, id: SinkId) -> Result<()> {
        assert!(self.sinks.get(id).ok_or(Error::InvalidId)?.state.is_linked());
        let (tx, rx) = oneshot::channel();
        self.sink_send_sync(id, rx, SinkMessage::Detach { reply: tx })
    }

    pub fn attach_sink(&mut self, id: SinkId) -> Result<()> {
        assert!(self.sinks.get(id).ok_or(Error::InvalidId)?.state.is_linked());
        let (tx, rx) = oneshot::channel();
        self.sink_send_sync(id, rx, SinkMessage::Attach { reply: tx })
    }

    pub(crate) fn sink_post(&self, id: SinkId, msg: SinkMessage) -> Result<()> {
        let sink = self.sinks.get(id).ok_or(Error::InvalidId)?;
        let msgq = sink.msgq.as_ref().ok_or(Error::Disconnected)?;
        msgq.post(msg)?;
        if let Some(rtpoll) = &sink.rtpoll {
            rtpoll.wake();
        }
        Ok(())
    }

    pub(crate) fn sink_send_sync<T>(
        &self,
        id: SinkId,
        rx: oneshot::Receiver<T>,
        msg: SinkMessage,
    ) -> Result<T> {
        self.sink_post(id, msg)?;
        rx.recv().map_err(|_| Error::Disconnected)
    }
}
