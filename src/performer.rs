//! One playing instance: a groover driven by a playback thread, wired to
//! the synchronization coordinator through channels.
//!
//! Three concerns run side by side: the playback loop pulls score events,
//! performs them and paces them into the output sink; the listener thread
//! applies inbound sync messages to the groover; an optional clock thread
//! broadcasts tempo pulses for followers.

use crate::groover::Groover;
use crate::model::score::ScoreEvent;
use crate::player::{OutputSink, Player};
use crate::sync::{InstanceId, SyncMessage, unpack_tempo};
use crate::util::CLOCK_PPQN;
use anyhow::bail;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackState {
    Stopped,
    Playing,
    Done,
}

struct Shared {
    state: Mutex<PlaybackState>,
    changed: Condvar,
}

impl Shared {
    fn set(&self, next: PlaybackState) {
        if let Ok(mut state) = self.state.lock() {
            // done is terminal
            if *state != PlaybackState::Done {
                *state = next;
            }
        }
        self.changed.notify_all();
    }

    fn get(&self) -> PlaybackState {
        self.state
            .lock()
            .map_or(PlaybackState::Done, |state| *state)
    }
}

#[derive(Debug, Clone)]
pub struct PerformerOptions {
    pub id: InstanceId,
    /// Controller numbers mapped to the contour they drive, for inbound
    /// control changes.
    pub controls: BTreeMap<u8, String>,
    /// Controller number whose outbound value is relayed to the coordinator.
    pub intensity_control: u8,
    /// Broadcast 24-per-quarter clock pulses while playing.
    pub send_clock: bool,
    /// Begin playing without waiting for a start message.
    pub autostart: bool,
    /// Cooperative shutdown, shared with the hosting process.
    pub quit: Arc<AtomicBool>,
}

/// Run one performer to completion. Returns the player so a recorded
/// performance can still be saved.
pub fn run<S: OutputSink + 'static>(
    groover: Arc<Groover>,
    mut player: Player<S>,
    options: PerformerOptions,
    inbound: Receiver<SyncMessage>,
    outbound: Sender<(InstanceId, SyncMessage)>,
) -> anyhow::Result<Player<S>> {
    let shared = Arc::new(Shared {
        state: Mutex::new(if options.autostart {
            PlaybackState::Playing
        } else {
            PlaybackState::Stopped
        }),
        changed: Condvar::new(),
    });
    let listener_done = Arc::new(AtomicBool::new(false));

    let listener = {
        let groover = Arc::clone(&groover);
        let shared = Arc::clone(&shared);
        let done = Arc::clone(&listener_done);
        let controls = options.controls.clone();
        let id = options.id.clone();

        thread::spawn(move || {
            loop {
                let message = match inbound.recv_timeout(Duration::from_millis(50)) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => {
                        if done.load(Ordering::Relaxed) {
                            return;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                };

                match message {
                    SyncMessage::Start | SyncMessage::Continue => {
                        debug!("{id}: resuming");
                        shared.set(PlaybackState::Playing);
                    }
                    SyncMessage::Stop => {
                        debug!("{id}: stopping");
                        shared.set(PlaybackState::Stopped);
                    }
                    SyncMessage::SongPosition(position) => {
                        // seeking mid-flight would tear the event stream
                        if shared.get() == PlaybackState::Stopped {
                            groover.jump_to_pos(position);
                        } else {
                            warn!("{id}: ignoring seek to {position} while playing..!");
                        }
                    }
                    SyncMessage::Tempo(payload) => {
                        groover.set_tempo(unpack_tempo(&payload));
                    }
                    SyncMessage::Clock => groover.set_clock(),
                    SyncMessage::Reset => groover.reset_clock(),
                    SyncMessage::ControlChange { control, value } => {
                        let Some(name) = controls.get(&control) else {
                            debug!("{id}: unmapped control {control}");
                            continue;
                        };
                        if let Err(why) =
                            groover.set_contour_value(name, value as f64 / 127.0)
                        {
                            warn!("{id}: {why}");
                        }
                    }
                }
            }
        })
    };

    let clock = if options.send_clock {
        let groover = Arc::clone(&groover);
        let shared = Arc::clone(&shared);
        let outbound = outbound.clone();
        let id = options.id.clone();

        Some(thread::spawn(move || {
            loop {
                match shared.get() {
                    PlaybackState::Done => return,
                    PlaybackState::Stopped => {
                        thread::sleep(Duration::from_millis(50));
                        continue;
                    }
                    PlaybackState::Playing => {}
                }

                let pulse = 60.0 / (groover.bpm() * CLOCK_PPQN as f64);
                thread::sleep(Duration::from_secs_f64(pulse));
                if outbound.send((id.clone(), SyncMessage::Clock)).is_err() {
                    return;
                }
            }
        }))
    } else {
        None
    };

    // playback runs on the calling thread
    let id = options.id.clone();
    let result = playback_loop(
        &groover,
        &mut player,
        &id,
        options.intensity_control,
        &shared,
        &outbound,
        &options.quit,
    );

    shared.set(PlaybackState::Done);
    listener_done.store(true, Ordering::Relaxed);
    if listener.join().is_err() {
        warn!("{id}: listener thread panicked..!");
    }
    if let Some(clock) = clock
        && clock.join().is_err()
    {
        warn!("{id}: clock thread panicked..!");
    }

    result?;
    Ok(player)
}

fn playback_loop<S: OutputSink>(
    groover: &Groover,
    player: &mut Player<S>,
    id: &str,
    intensity_control: u8,
    shared: &Shared,
    outbound: &Sender<(InstanceId, SyncMessage)>,
    quit: &AtomicBool,
) -> anyhow::Result<()> {
    loop {
        // park until someone starts us
        {
            let Ok(mut state) = shared.state.lock() else {
                bail!("Playback state lock poisoned..!");
            };
            while *state == PlaybackState::Stopped {
                if quit.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let Ok((next, _)) = shared
                    .changed
                    .wait_timeout(state, Duration::from_millis(50))
                else {
                    bail!("Playback state lock poisoned..!");
                };
                state = next;
            }
            if *state == PlaybackState::Done {
                return Ok(());
            }
        }

        info!("{id}: playing");
        player.init_playback();

        while shared.get() == PlaybackState::Playing && !quit.load(Ordering::Relaxed) {
            let Some(event) = groover.next_event() else {
                // tune exhausted: close with a chord tone and the drone
                let mut tail = groover.end_notes();
                tail.extend(groover.release());
                player.flush(&tail)?;
                shared.set(PlaybackState::Done);
                info!("{id}: finished");
                return Ok(());
            };

            let performed = match groover.perform(event) {
                Ok(performed) => performed,
                Err(why) => {
                    error!("{id}: {why}");
                    shared.set(PlaybackState::Done);
                    return Err(why);
                }
            };

            for out in &performed {
                match out {
                    ScoreEvent::SongPosition { index, .. } => {
                        let _ = outbound.send((id.to_string(), SyncMessage::SongPosition(*index)));
                    }
                    ScoreEvent::ControlChange { controller, value, .. }
                        if *controller == intensity_control =>
                    {
                        let _ = outbound.send((
                            id.to_string(),
                            SyncMessage::ControlChange {
                                control: *controller,
                                value: *value,
                            },
                        ));
                    }
                    _ => {}
                }
            }

            player.play(&performed)?;
        }

        // stopped mid-tune: silence whatever is sounding
        let open = groover.release();
        player.flush(&open)?;
        player.reset()?;

        if quit.load(Ordering::Relaxed) {
            info!("{id}: interrupted");
            return Ok(());
        }
        info!("{id}: paused");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::score::{KeySignature, TimeSignature, Tune};
    use crate::model::settings::GrooverConfig;
    use crossbeam_channel::unbounded;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct MemorySink {
        sent: Arc<StdMutex<Vec<ScoreEvent>>>,
    }

    impl OutputSink for MemorySink {
        fn send(&mut self, event: &ScoreEvent) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(*event);
            Ok(())
        }
    }

    fn quick_tune() -> Arc<Tune> {
        let mut events = Vec::new();
        for &p in &[62u8, 64, 66, 67] {
            events.push(ScoreEvent::NoteOn {
                pitch: p,
                velocity: 90,
                time: 0.0,
            });
            events.push(ScoreEvent::NoteOff { pitch: p, time: 0.005 });
        }
        Arc::new(Tune::from_parts(
            events,
            KeySignature::from_fifths(2, false),
            TimeSignature::new(4, 4),
            // fast enough that tests don't dawdle
            10_000,
            0.0,
            1,
        ))
    }

    fn options(id: &str) -> PerformerOptions {
        PerformerOptions {
            id: id.to_string(),
            controls: BTreeMap::from([(49, "intensity".to_string())]),
            intensity_control: 49,
            send_clock: false,
            autostart: true,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn plays_the_tune_to_the_end() {
        env_logger::try_init().unwrap_or(());

        let groover =
            Arc::new(Groover::new(quick_tune(), GrooverConfig::load(None).unwrap()).unwrap());
        let sink = MemorySink::default();
        let sent = Arc::clone(&sink.sent);
        let player = Player::new(sink, false);

        let (_in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();

        run(groover, player, options("solo"), in_rx, out_tx).unwrap();

        let sent = sent.lock().unwrap();
        assert!(sent.iter().any(|e| e.is_note_on()));
        assert!(sent.iter().any(|e| e.is_note_off()));

        // every beat was announced to the coordinator
        let positions: Vec<u16> = out_rx
            .try_iter()
            .filter_map(|(_, m)| match m {
                SyncMessage::SongPosition(p) => Some(p),
                _ => None,
            })
            .collect();
        assert!(!positions.is_empty());
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn waits_for_a_start_message() {
        env_logger::try_init().unwrap_or(());

        let groover =
            Arc::new(Groover::new(quick_tune(), GrooverConfig::load(None).unwrap()).unwrap());
        let sink = MemorySink::default();
        let sent = Arc::clone(&sink.sent);
        let player = Player::new(sink, false);

        let (in_tx, in_rx) = unbounded();
        let (out_tx, _out_rx) = unbounded();

        let mut opts = options("waiter");
        opts.autostart = false;

        let handle = thread::spawn(move || run(groover, player, opts, in_rx, out_tx));

        thread::sleep(Duration::from_millis(50));
        assert!(sent.lock().unwrap().is_empty());

        in_tx.send(SyncMessage::Start).unwrap();
        handle.join().unwrap().unwrap();
        assert!(!sent.lock().unwrap().is_empty());
    }

    #[test]
    fn inbound_controls_reach_the_groover() {
        env_logger::try_init().unwrap_or(());

        let groover =
            Arc::new(Groover::new(quick_tune(), GrooverConfig::load(None).unwrap()).unwrap());
        let player = Player::new(MemorySink::default(), false);

        let (in_tx, in_rx) = unbounded();
        let (out_tx, _out_rx) = unbounded();

        let mut opts = options("listener");
        opts.autostart = false;

        let g = Arc::clone(&groover);
        let handle = thread::spawn(move || run(g, player, opts, in_rx, out_tx));

        in_tx
            .send(SyncMessage::ControlChange { control: 49, value: 127 })
            .unwrap();
        in_tx.send(SyncMessage::Tempo(vec![90])).unwrap();
        thread::sleep(Duration::from_millis(50));

        // the tempo override is observable immediately
        assert!((groover.bpm() - 90.0).abs() < 11.0);

        in_tx.send(SyncMessage::Start).unwrap();
        handle.join().unwrap().unwrap();
    }
}
