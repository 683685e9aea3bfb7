//! Timed event emission.
//!
//! The performer hands over small batches of already-shaped events; the
//! player paces them against a wall-clock start stamp and pushes them into
//! an [`OutputSink`]. Pacing uses absolute targets so per-event sleep
//! jitter never accumulates.

use crate::model::score::ScoreEvent;
use crate::util;
use anyhow::{Context, bail};
use log::{debug, info};
use midly::num::{u4, u7, u15, u24, u28};
use midly::{Format, Header, MetaMessage, MidiMessage, PitchBend, Smf, Timing, TrackEvent, TrackEventKind};
use spin_sleep::{SpinSleeper, SpinStrategy};
use std::path::Path;
use std::time::{Duration, Instant};

const MAX_SLEEP_CHUNK_S: f64 = 0.050;
const EXPORT_PPQ: u16 = 480;

/// Where performed events go. Implementations own the transport
/// (MIDI port, log, test buffer).
pub trait OutputSink: Send {
    fn send(&mut self, event: &ScoreEvent) -> anyhow::Result<()>;

    /// Silence everything the sink may still be sounding.
    fn reset(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sink that logs events instead of sending them anywhere.
pub struct LogSink {
    name: String,
    verbose: bool,
}

impl LogSink {
    pub fn new(name: &str, verbose: bool) -> Self {
        Self {
            name: name.to_string(),
            verbose,
        }
    }
}

impl OutputSink for LogSink {
    fn send(&mut self, event: &ScoreEvent) -> anyhow::Result<()> {
        if !self.verbose {
            debug!("{}: {event:?}", self.name);
            return Ok(());
        }
        match event {
            ScoreEvent::NoteOn { pitch, velocity, .. } => {
                info!("{}: on  {:>4} vel {:>3}", self.name, util::note_name(*pitch), velocity);
            }
            ScoreEvent::NoteOff { pitch, .. } => {
                info!("{}: off {:>4}", self.name, util::note_name(*pitch));
            }
            other => debug!("{}: {other:?}", self.name),
        }
        Ok(())
    }
}

pub struct Player<S: OutputSink> {
    sink: S,
    sleeper: SpinSleeper,
    start: Option<Instant>,
    /// Scheduled seconds since the start stamp.
    elapsed: f64,
    recorded: Option<Vec<ScoreEvent>>,
}

impl<S: OutputSink> Player<S> {
    pub fn new(sink: S, record: bool) -> Self {
        Self {
            sink,
            sleeper: SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread),
            start: None,
            elapsed: 0.0,
            recorded: if record { Some(Vec::new()) } else { None },
        }
    }

    /// Stamp the wall-clock origin. Call right before the first batch and
    /// again whenever playback resumes after a stop.
    pub fn init_playback(&mut self) {
        self.start = Some(Instant::now());
        self.elapsed = 0.0;
    }

    /// Pace a batch of delta-timed events and emit them in order.
    pub fn play(&mut self, events: &[ScoreEvent]) -> anyhow::Result<()> {
        let Some(start) = self.start else {
            bail!("Playback was never initialized..!");
        };

        for event in events {
            self.elapsed += event.time();
            let target = start + Duration::from_secs_f64(self.elapsed.max(0.0));

            loop {
                let now = Instant::now();
                if now >= target {
                    break;
                }
                let remaining = (target - now).as_secs_f64();
                self.sleeper
                    .sleep(Duration::from_secs_f64(remaining.min(MAX_SLEEP_CHUNK_S)));
            }

            self.sink.send(event)?;
            if let Some(recorded) = self.recorded.as_mut() {
                recorded.push(event.with_time(self.elapsed));
            }
        }

        Ok(())
    }

    /// Emit a batch immediately, without pacing. Used for resets and for
    /// closing notes on shutdown.
    pub fn flush(&mut self, events: &[ScoreEvent]) -> anyhow::Result<()> {
        for event in events {
            self.sink.send(event)?;
            if let Some(recorded) = self.recorded.as_mut() {
                recorded.push(event.with_time(self.elapsed));
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) -> anyhow::Result<()> {
        self.sink.reset()
    }

    /// Save the recorded performance as a single-track MIDI file.
    pub fn save(&self, path: &Path, tempo: u32, channel: u8) -> anyhow::Result<()> {
        let Some(recorded) = self.recorded.as_ref() else {
            bail!("Recording was not enabled..!");
        };

        let bytes = render_midi(recorded, tempo, channel)?;
        std::fs::write(path, &bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved {} events to {}..!", recorded.len(), path.display());

        Ok(())
    }

    #[cfg(test)]
    fn recorded(&self) -> &[ScoreEvent] {
        self.recorded.as_deref().unwrap_or(&[])
    }
}

/// Serialize absolutely-timed events into standard MIDI bytes.
fn render_midi(events: &[ScoreEvent], tempo: u32, channel: u8) -> anyhow::Result<Vec<u8>> {
    let channel = u4::new(channel.min(15));
    let seconds_per_tick = tempo as f64 / 1_000_000.0 / EXPORT_PPQ as f64;

    let mut track: Vec<TrackEvent> = vec![TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(tempo))),
    }];

    let mut last_tick: u64 = 0;
    for event in events {
        let tick = (event.time().max(0.0) / seconds_per_tick).round() as u64;
        let delta = u28::new(tick.saturating_sub(last_tick) as u32);

        let kind = match event {
            ScoreEvent::NoteOn { pitch, velocity, .. } => TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOn {
                    key: u7::new(*pitch & 0x7f),
                    vel: u7::new(*velocity & 0x7f),
                },
            },
            ScoreEvent::NoteOff { pitch, .. } => TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOff {
                    key: u7::new(*pitch & 0x7f),
                    vel: u7::new(0),
                },
            },
            ScoreEvent::ControlChange { controller, value, .. } => TrackEventKind::Midi {
                channel,
                message: MidiMessage::Controller {
                    controller: u7::new(*controller & 0x7f),
                    value: u7::new(*value & 0x7f),
                },
            },
            ScoreEvent::PitchBend { bend, .. } => TrackEventKind::Midi {
                channel,
                message: MidiMessage::PitchBend {
                    bend: PitchBend::from_int(*bend),
                },
            },
            ScoreEvent::Tempo { tempo, .. } => {
                TrackEventKind::Meta(MetaMessage::Tempo(u24::new(*tempo)))
            }
            // internal markers don't belong in the file
            ScoreEvent::SongPosition { .. } | ScoreEvent::Repetition { .. } => continue,
        };

        track.push(TrackEvent { delta, kind });
        last_tick = tick;
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(u15::new(EXPORT_PPQ)),
    ));
    smf.tracks.push(track);

    let mut bytes = Vec::new();
    smf.write_std(&mut bytes)
        .context("Failed to serialize the recording..!")?;
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MemorySink {
        sent: Arc<Mutex<Vec<ScoreEvent>>>,
    }

    impl OutputSink for MemorySink {
        fn send(&mut self, event: &ScoreEvent) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(*event);
            Ok(())
        }
    }

    fn phrase() -> Vec<ScoreEvent> {
        vec![
            ScoreEvent::NoteOn { pitch: 62, velocity: 90, time: 0.0 },
            ScoreEvent::NoteOff { pitch: 62, time: 0.01 },
            ScoreEvent::NoteOn { pitch: 64, velocity: 80, time: 0.01 },
            ScoreEvent::NoteOff { pitch: 64, time: 0.01 },
        ]
    }

    #[test]
    fn events_arrive_in_order() {
        env_logger::try_init().unwrap_or(());

        let sink = MemorySink::default();
        let sent = Arc::clone(&sink.sent);
        let mut player = Player::new(sink, false);

        player.init_playback();
        player.play(&phrase()).unwrap();

        assert_eq!(*sent.lock().unwrap(), phrase());
    }

    #[test]
    fn playback_must_be_initialized() {
        let mut player = Player::new(MemorySink::default(), false);
        assert!(player.play(&phrase()).is_err());
    }

    #[test]
    fn recording_accumulates_absolute_times() {
        env_logger::try_init().unwrap_or(());

        let mut player = Player::new(MemorySink::default(), true);
        player.init_playback();
        player.play(&phrase()).unwrap();

        let times: Vec<f64> = player.recorded().iter().map(|e| e.time()).collect();
        assert_eq!(times, vec![0.0, 0.01, 0.02, 0.03]);
    }

    #[test]
    fn recording_round_trips_through_midi() {
        env_logger::try_init().unwrap_or(());

        let mut player = Player::new(MemorySink::default(), true);
        player.init_playback();
        player
            .play(&[
                ScoreEvent::NoteOn { pitch: 60, velocity: 100, time: 0.0 },
                ScoreEvent::PitchBend { bend: 4096, time: 0.0 },
                ScoreEvent::NoteOff { pitch: 60, time: 0.01 },
                ScoreEvent::SongPosition { index: 1, time: 0.0 },
            ])
            .unwrap();

        let bytes = render_midi(player.recorded(), 500_000, 0).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.tracks.len(), 1);

        let midi_events: Vec<_> = smf.tracks[0]
            .iter()
            .filter(|e| matches!(e.kind, TrackEventKind::Midi { .. }))
            .collect();
        // the song position marker is dropped
        assert_eq!(midi_events.len(), 3);
    }

    #[test]
    fn negative_deltas_do_not_panic() {
        let sink = MemorySink::default();
        let sent = Arc::clone(&sink.sent);
        let mut player = Player::new(sink, false);

        player.init_playback();
        player
            .play(&[
                ScoreEvent::NoteOn { pitch: 60, velocity: 100, time: -0.5 },
                ScoreEvent::NoteOff { pitch: 60, time: 0.01 },
            ])
            .unwrap();

        assert_eq!(sent.lock().unwrap().len(), 2);
    }
}
