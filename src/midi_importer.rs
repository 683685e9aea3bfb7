use crate::model::score::{KeySignature, ScoreEvent, TimeSignature, Tune};
use crate::util::TRIGGER_DELTA;
use anyhow::{Result, anyhow};
use log::{debug, warn};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const DEFAULT_MPQN: u32 = 500_000;

struct NoteInterval {
    pub pitch: u8,
    pub start_tick: u64,
    pub end_tick: u64,
    pub velocity: u8,
}

#[derive(Debug, Clone)]
struct TempoSegment {
    pub mpqn: u32,
    pub start_tick: u64,
    pub seconds_at_start: f64,
}

/// Import a Standard MIDI File as a [`Tune`], flattened to delta-seconds
/// events, repeated `repeats` times with repetition markers.
pub fn import_midi_file<P: AsRef<Path>>(path: P, repeats: usize) -> Result<Tune> {
    let bytes = fs::read(path.as_ref()).map_err(|e| {
        anyhow!(
            "Failed to read MIDI file {}: {}",
            path.as_ref().display(),
            e
        )
    })?;

    midi_bytes_to_tune(&bytes, repeats)
}

fn midi_bytes_to_tune(bytes: &[u8], repeats: usize) -> Result<Tune> {
    let smf = Smf::parse(bytes).map_err(|e| anyhow!("Failed to parse MIDI: {:?}", e))?;

    let ticks_per_quarter = match smf.header.timing {
        Timing::Metrical(t) => t.as_int() as u64,
        Timing::Timecode(_fps, _subframe) => {
            return Err(anyhow!(
                "SMPTE timecode midi timing is not currently supported..!"
            ));
        }
    };

    debug!("Ticks per quarter note: {}", ticks_per_quarter);
    debug!(
        "MIDI format: {:?}, tracks: {}",
        smf.header.format,
        smf.tracks.len()
    );

    let mut tempo_changes: Vec<(u64, u32)> = Vec::new();
    tempo_changes.push((0u64, DEFAULT_MPQN)); // default ~120bpm until a tempo meta appears

    let mut key_signature: Option<KeySignature> = None;
    let mut time_signature: Option<TimeSignature> = None;

    let mut intervals: Vec<NoteInterval> = Vec::new();
    let mut open_notes: HashMap<u8, Vec<(u64, u8)>> = HashMap::new();

    for (track_idx, track) in smf.tracks.iter().enumerate() {
        let mut abs_tick: u64 = 0;
        for event in track.iter() {
            abs_tick = abs_tick.saturating_add(event.delta.as_int() as u64);

            match &event.kind {
                TrackEventKind::Meta(meta) => match meta {
                    MetaMessage::Tempo(micro) => {
                        let mpqn: u32 = micro.as_int();
                        tempo_changes.push((abs_tick, mpqn));
                        debug!(
                            "Tempo change at tick {} -> {} us/qn (track {})",
                            abs_tick, mpqn, track_idx
                        );
                    }
                    MetaMessage::KeySignature(fifths, minor) => {
                        if key_signature.is_none() {
                            key_signature = Some(KeySignature::from_fifths(*fifths, *minor));
                            debug!("Key signature: {} fifths, minor: {}", fifths, minor);
                        }
                    }
                    MetaMessage::TimeSignature(numerator, denominator_pow2, _, _) => {
                        if time_signature.is_none() {
                            time_signature =
                                Some(TimeSignature::new(*numerator, 1 << denominator_pow2));
                            debug!("Time signature: {}/{}", numerator, 1 << denominator_pow2);
                        }
                    }
                    _ => {}
                },
                TrackEventKind::Midi {
                    channel: _,
                    message,
                } => match message {
                    MidiMessage::NoteOn { key, vel } => {
                        let velocity: u8 = vel.as_int();
                        if velocity == 0 {
                            close_note(&mut open_notes, &mut intervals, key.as_int(), abs_tick);
                        } else {
                            open_notes
                                .entry(key.as_int())
                                .or_default()
                                .push((abs_tick, velocity));
                        }
                    }
                    MidiMessage::NoteOff { key, vel: _ } => {
                        close_note(&mut open_notes, &mut intervals, key.as_int(), abs_tick);
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }

    let last_tick_estimate = intervals
        .iter()
        .map(|interval| interval.end_tick)
        .max()
        .unwrap_or(0);

    for (pitch, stack) in open_notes.into_iter() {
        for (start_tick, start_vel) in stack {
            let end_tick = if last_tick_estimate > start_tick {
                last_tick_estimate
            } else {
                start_tick + ticks_per_quarter
            };

            intervals.push(NoteInterval {
                pitch,
                start_tick,
                end_tick,
                velocity: start_vel,
            });

            warn!(
                "Unclosed NoteOn for {} at tick: {} auto-closing at: {}..!",
                pitch, start_tick, end_tick
            );
        }
    }

    if intervals.is_empty() {
        return Err(anyhow!("MIDI file contains no notes"));
    }

    let mut last_tick: u64 = 0;
    let mut seconds_accum: f64 = 0.0;
    let mut last_mpqn: u32 = DEFAULT_MPQN;
    let mut tempo_segments: Vec<TempoSegment> = Vec::new();

    tempo_changes.sort_unstable_by_key(|(tick, _)| *tick);

    for (tick, mpqn) in tempo_changes.into_iter() {
        if tick < last_tick {
            continue;
        }

        if tick > last_tick {
            let delta_ticks = (tick - last_tick) as f64;
            seconds_accum += delta_ticks * (last_mpqn as f64) / (ticks_per_quarter as f64) / 1e6;
        }

        tempo_segments.push(TempoSegment {
            start_tick: tick,
            mpqn,
            seconds_at_start: seconds_accum,
        });

        last_tick = tick;
        last_mpqn = mpqn;
    }

    let ticks_to_seconds = |tick: u64| -> f64 {
        let segment = match tempo_segments.iter().rfind(|seg| seg.start_tick <= tick) {
            Some(s) => s,
            None => &tempo_segments[0],
        };

        let delta_ticks = (tick - segment.start_tick) as f64;
        segment.seconds_at_start
            + delta_ticks * (segment.mpqn as f64) / (ticks_per_quarter as f64) / 1e6
    };

    // first explicit tempo meta; the segment at index 0 is the default
    let tempo = tempo_segments
        .get(1)
        .map(|seg| seg.mpqn)
        .unwrap_or(DEFAULT_MPQN);

    // flatten intervals to an ordered on/off point list in seconds
    struct Point {
        time: f64,
        is_start: bool,
        pitch: u8,
        velocity: u8,
    }

    let mut points: Vec<Point> = Vec::new();
    for interval in &intervals {
        points.push(Point {
            time: ticks_to_seconds(interval.start_tick),
            is_start: true,
            pitch: interval.pitch,
            velocity: interval.velocity,
        });
        points.push(Point {
            time: ticks_to_seconds(interval.end_tick),
            is_start: false,
            pitch: interval.pitch,
            velocity: 0,
        });
    }

    // offs sort before ons at the same instant so a pitch is released
    // before it is struck again
    points.sort_by(|a, b| {
        a.time
            .total_cmp(&b.time)
            .then_with(|| (a.is_start as u8).cmp(&(b.is_start as u8)))
    });

    let mut events: Vec<ScoreEvent> = Vec::new();
    let mut cursor = points.first().map_or(0.0, |p| p.time);
    let span_start = cursor;
    for point in &points {
        let delta = point.time - cursor;
        cursor = point.time;
        if point.is_start {
            events.push(ScoreEvent::NoteOn {
                pitch: point.pitch,
                velocity: point.velocity,
                time: delta,
            });
        } else {
            events.push(ScoreEvent::NoteOff {
                pitch: point.pitch,
                time: delta,
            });
        }
    }

    let key = key_signature.unwrap_or_default();
    let meter = time_signature.unwrap_or_default();
    let span = cursor - span_start;
    let offset = estimate_pickup(span, tempo, meter);

    debug!(
        "Imported {} events, key {}, meter {}/{}, tempo {} us/qn, pickup {:.3}s",
        events.len(),
        key.name(),
        meter.numerator,
        meter.denominator,
        tempo,
        offset
    );

    Ok(Tune::from_parts(events, key, meter, tempo, offset, repeats))
}

/// Estimate the pickup-bar length as the melody span's remainder modulo the
/// bar. Remainders within the beat-trigger tolerance of a bar boundary count
/// as no pickup.
fn estimate_pickup(span: f64, tempo: u32, meter: TimeSignature) -> f64 {
    let quarter = tempo as f64 / 1e6;
    let bar = meter.quarters_per_bar() * quarter;
    let beat = bar / meter.beat_count() as f64;

    let remainder = span.rem_euclid(bar);
    if remainder / beat <= TRIGGER_DELTA || (bar - remainder) / beat <= TRIGGER_DELTA {
        0.0
    } else {
        remainder
    }
}

fn close_note(
    open_notes: &mut HashMap<u8, Vec<(u64, u8)>>,
    intervals: &mut Vec<NoteInterval>,
    pitch: u8,
    abs_tick: u64,
) {
    if let Some(stack) = open_notes.get_mut(&pitch)
        && let Some((start_tick, start_vel)) = stack.pop()
    {
        intervals.push(NoteInterval {
            pitch,
            start_tick,
            end_tick: abs_tick,
            velocity: start_vel,
        });
    } else {
        debug!("Orphaned NoteOff for {} at tick {}..!", pitch, abs_tick);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use midly::num::{u4, u7, u15, u24, u28};
    use midly::{Format, Header, TrackEvent};

    /// Build an in-memory format-0 file: one 4/4 bar of quarter notes at
    /// 120 bpm, with key and meter metas.
    fn synthetic_midi() -> Vec<u8> {
        let ppq = 480u16;
        let header = Header::new(Format::SingleTrack, Timing::Metrical(u15::new(ppq)));
        let mut track: Vec<TrackEvent> = Vec::new();

        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(500_000))),
        });
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::TimeSignature(4, 2, 24, 8)),
        });
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::KeySignature(2, false)),
        });

        for pitch in [62u8, 64, 66, 67].iter() {
            track.push(TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel: u4::new(0),
                    message: MidiMessage::NoteOn {
                        key: u7::new(*pitch),
                        vel: u7::new(90),
                    },
                },
            });
            track.push(TrackEvent {
                delta: u28::new(480),
                kind: TrackEventKind::Midi {
                    channel: u4::new(0),
                    message: MidiMessage::NoteOff {
                        key: u7::new(*pitch),
                        vel: u7::new(0),
                    },
                },
            });
        }
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });

        let mut smf = Smf::new(header);
        smf.tracks.push(track);
        let mut bytes = Vec::new();
        smf.write(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn imports_key_meter_and_tempo() {
        env_logger::try_init().unwrap_or(());

        let tune = midi_bytes_to_tune(&synthetic_midi(), 1).unwrap();
        assert_eq!(tune.key().name(), "D");
        assert_eq!(tune.time_signature(), TimeSignature::new(4, 4));
        assert_eq!(tune.tempo(), 500_000);
        assert_eq!(tune.note_on_count(), 4);
    }

    #[test]
    fn full_bar_has_no_pickup() {
        let tune = midi_bytes_to_tune(&synthetic_midi(), 1).unwrap();
        assert_eq!(tune.offset(), 0.0);
    }

    #[test]
    fn note_durations_follow_the_tempo_map() {
        let tune = midi_bytes_to_tune(&synthetic_midi(), 1).unwrap();
        for note in tune.notes() {
            assert!((note.duration - 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn pickup_estimation() {
        let meter = TimeSignature::new(4, 4);
        // two bars and a half-beat pickup at 120 bpm
        let offset = estimate_pickup(4.5, 500_000, meter);
        assert!((offset - 0.5).abs() < 1e-9);
        // exact bar multiples have none
        assert_eq!(estimate_pickup(4.0, 500_000, meter), 0.0);
        // a hair under a bar boundary still counts as none
        assert_eq!(estimate_pickup(3.99, 500_000, meter), 0.0);
    }

    #[test]
    fn empty_file_is_rejected() {
        let header = Header::new(Format::SingleTrack, Timing::Metrical(u15::new(480)));
        let mut smf = Smf::new(header);
        smf.tracks.push(vec![TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        }]);
        let mut bytes = Vec::new();
        smf.write(&mut bytes).unwrap();
        assert!(midi_bytes_to_tune(&bytes, 1).is_err());
    }
}
