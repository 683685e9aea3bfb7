use crate::util::TRIGGER_DELTA;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single symbolic event, carrying the time elapsed since the previous
/// event in seconds (delta-time encoding).
///
/// Events are immutable values: performing an event builds a new one.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum ScoreEvent {
    NoteOn { pitch: u8, velocity: u8, time: f64 },
    NoteOff { pitch: u8, time: f64 },
    ControlChange { controller: u8, value: u8, time: f64 },
    PitchBend { bend: i16, time: f64 },
    Tempo { tempo: u32, time: f64 },
    SongPosition { index: u16, time: f64 },
    Repetition { index: u32, time: f64 },
}

impl ScoreEvent {
    pub fn time(&self) -> f64 {
        match *self {
            ScoreEvent::NoteOn { time, .. }
            | ScoreEvent::NoteOff { time, .. }
            | ScoreEvent::ControlChange { time, .. }
            | ScoreEvent::PitchBend { time, .. }
            | ScoreEvent::Tempo { time, .. }
            | ScoreEvent::SongPosition { time, .. }
            | ScoreEvent::Repetition { time, .. } => time,
        }
    }

    /// A copy of this event with a new time delta.
    pub fn with_time(self, new_time: f64) -> Self {
        let mut ev = self;
        match &mut ev {
            ScoreEvent::NoteOn { time, .. }
            | ScoreEvent::NoteOff { time, .. }
            | ScoreEvent::ControlChange { time, .. }
            | ScoreEvent::PitchBend { time, .. }
            | ScoreEvent::Tempo { time, .. }
            | ScoreEvent::SongPosition { time, .. }
            | ScoreEvent::Repetition { time, .. } => *time = new_time,
        }
        ev
    }

    pub fn is_note_on(&self) -> bool {
        matches!(self, ScoreEvent::NoteOn { velocity, .. } if *velocity > 0)
    }

    pub fn is_note_off(&self) -> bool {
        match self {
            ScoreEvent::NoteOff { .. } => true,
            ScoreEvent::NoteOn { velocity, .. } => *velocity == 0,
            _ => false,
        }
    }

    pub fn is_note(&self) -> bool {
        matches!(self, ScoreEvent::NoteOn { .. } | ScoreEvent::NoteOff { .. })
    }

    pub fn pitch(&self) -> Option<u8> {
        match self {
            ScoreEvent::NoteOn { pitch, .. } | ScoreEvent::NoteOff { pitch, .. } => Some(*pitch),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Major,
    Minor,
}

/// Key signature as a root pitch class plus mode, tracking the number of
/// fifths for scale-degree arithmetic.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySignature {
    pub root: u8,
    pub mode: Mode,
    pub fifths: i8,
}

impl Default for KeySignature {
    fn default() -> Self {
        Self::from_fifths(0, false)
    }
}

impl KeySignature {
    pub fn from_fifths(fifths: i8, minor: bool) -> Self {
        let relative = if minor { 9 } else { 0 };
        let root = ((fifths as i32 * 7 + relative).rem_euclid(12)) as u8;
        Self {
            root,
            mode: if minor { Mode::Minor } else { Mode::Major },
            fifths,
        }
    }

    /// Distance of a note from the tonic of the parallel major scale,
    /// in semitones within the octave.
    pub fn semitones_from_tonic(&self, note: u8) -> usize {
        (note as i32 - 7 * self.fifths as i32).rem_euclid(12) as usize
    }

    pub fn name(&self) -> String {
        const NAMES: [&str; 12] = [
            "C", "C#", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B",
        ];
        let suffix = match self.mode {
            Mode::Major => "",
            Mode::Minor => "m",
        };
        format!("{}{}", NAMES[self.root as usize], suffix)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSignature {
    pub numerator: u8,
    pub denominator: u8,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

impl TimeSignature {
    pub fn new(numerator: u8, denominator: u8) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Felt beats per bar; compound meters (6/8, 9/8, 12/8) group in threes.
    pub fn beat_count(&self) -> u8 {
        if self.denominator == 8 && self.numerator % 3 == 0 {
            self.numerator / 3
        } else {
            self.numerator
        }
    }

    pub fn quarters_per_bar(&self) -> f64 {
        4.0 * self.numerator as f64 / self.denominator as f64
    }
}

/// A note-on paired with its matching note-off: the unit the contour engine
/// works on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Note {
    pub pitch: u8,
    pub velocity: u8,
    /// Onset in seconds relative to the first full bar (negative in a pickup).
    pub onset: f64,
    pub duration: f64,
}

/// Seek table entry for one song position marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekEntry {
    /// Index of the first event after the marker.
    pub event_index: usize,
    /// Number of note-ons before the marker (the contour cursor target).
    pub contour_index: usize,
    /// Performance time at the marker, relative to the first full bar.
    pub time: f64,
}

/// An immutable, normalized tune: the flattened event list (with injected
/// per-beat song position markers), key, meter, tempo and seek table.
#[derive(Debug, Clone)]
pub struct Tune {
    events: Vec<ScoreEvent>,
    key: KeySignature,
    time_signature: TimeSignature,
    tempo: u32,
    offset: f64,
    bar_duration: f64,
    beat_duration: f64,
    lowest_pitch: u8,
    highest_pitch: u8,
    positions: Vec<SeekEntry>,
}

impl Tune {
    /// Build a tune from raw events (no markers), repeating the sequence
    /// `repeats` times with repetition markers in between. Song position
    /// markers are injected once per beat and indexed into the seek table.
    ///
    /// `offset` is the pickup-bar length in seconds; the performance clock
    /// starts at `-offset` so beat arithmetic aligns with the first full bar.
    pub fn from_parts(
        base_events: Vec<ScoreEvent>,
        key: KeySignature,
        time_signature: TimeSignature,
        tempo: u32,
        offset: f64,
        repeats: usize,
    ) -> Self {
        let quarter_duration = tempo as f64 / 1e6;
        let bar_duration = time_signature.quarters_per_bar() * quarter_duration;
        let beat_duration = bar_duration / time_signature.beat_count() as f64;

        let mut lowest: u8 = 127;
        let mut highest: u8 = 0;
        for ev in &base_events {
            if let Some(p) = ev.pitch() {
                lowest = lowest.min(p);
                highest = highest.max(p);
            }
        }
        if lowest > highest {
            (lowest, highest) = (0, 127);
        }

        let mut events = Vec::with_capacity(base_events.len() * repeats.max(1));
        let mut positions = Vec::new();
        let mut cursor = -offset;
        let mut next_mark = 0.0;
        let mut note_ons = 0usize;

        for repetition in 0..repeats.max(1) {
            if repetition > 0 {
                events.push(ScoreEvent::Repetition {
                    index: repetition as u32,
                    time: 0.0,
                });
            }
            for ev in &base_events {
                let mut remaining = ev.time();
                // place any beat markers crossed by this delta
                while cursor + remaining >= next_mark - 1e-9 {
                    let gap = (next_mark - cursor).max(0.0);
                    events.push(ScoreEvent::SongPosition {
                        index: positions.len() as u16,
                        time: gap,
                    });
                    positions.push(SeekEntry {
                        event_index: events.len(),
                        contour_index: note_ons,
                        time: next_mark,
                    });
                    remaining -= gap;
                    cursor = next_mark;
                    next_mark += beat_duration;
                }
                events.push(ev.with_time(remaining));
                cursor += remaining;
                if ev.is_note_on() {
                    note_ons += 1;
                }
            }
        }

        Self {
            events,
            key,
            time_signature,
            tempo,
            offset,
            bar_duration,
            beat_duration,
            lowest_pitch: lowest,
            highest_pitch: highest,
            positions,
        }
    }

    pub fn events(&self) -> &[ScoreEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn key(&self) -> KeySignature {
        self.key
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    /// Tempo in microseconds per quarter note.
    pub fn tempo(&self) -> u32 {
        self.tempo
    }

    /// Pickup-bar length in seconds.
    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn bar_duration(&self) -> f64 {
        self.bar_duration
    }

    pub fn beat_duration(&self) -> f64 {
        self.beat_duration
    }

    /// Lowest and highest pitch in the tune.
    pub fn ambitus(&self) -> (u8, u8) {
        (self.lowest_pitch, self.highest_pitch)
    }

    pub fn semitones_from_tonic(&self, note: u8) -> usize {
        self.key.semitones_from_tonic(note)
    }

    /// Seek entry for a song position, if the position exists.
    pub fn seek(&self, position: u16) -> Option<SeekEntry> {
        self.positions.get(position as usize).copied()
    }

    pub fn max_position(&self) -> u16 {
        self.positions.len().saturating_sub(1) as u16
    }

    /// Whether a performance time lands on a beat, within the trigger
    /// tolerance.
    pub fn is_on_beat(&self, performance_time: f64) -> bool {
        let beat_position = performance_time.rem_euclid(self.bar_duration) / self.beat_duration;
        (beat_position - beat_position.round()).abs() <= TRIGGER_DELTA
    }

    /// All note-ons paired with their matching note-offs, in score order.
    pub fn notes(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = Vec::new();
        let mut open: HashMap<u8, usize> = HashMap::new();
        let mut cursor = -self.offset;

        for ev in &self.events {
            cursor += ev.time();
            match *ev {
                ScoreEvent::NoteOn {
                    pitch, velocity, ..
                } if velocity > 0 => {
                    open.insert(pitch, notes.len());
                    notes.push(Note {
                        pitch,
                        velocity,
                        onset: cursor,
                        duration: 0.0,
                    });
                }
                ScoreEvent::NoteOff { pitch, .. } | ScoreEvent::NoteOn { pitch, .. } => {
                    if let Some(idx) = open.remove(&pitch) {
                        notes[idx].duration = cursor - notes[idx].onset;
                    }
                }
                _ => {}
            }
        }

        notes
    }

    pub fn note_on_count(&self) -> usize {
        self.events.iter().filter(|e| e.is_note_on()).count()
    }
}
