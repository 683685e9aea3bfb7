use anyhow::{Context, Result};
use ceol::performer::{self, PerformerOptions};
use ceol::{
    Args, Coordinator, Groover, GrooverConfig, InstanceId, LogSink, Player, SyncConfig,
    SyncMessage, import_midi_file, tempo_to_bpm,
};
use clap::Parser;
use crossbeam_channel::unbounded;
use crossbeam_channel::{Receiver, Sender};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("Importing MIDI file: '{}'...", args.midi.display());
    let tune = Arc::new(import_midi_file(&args.midi, args.repeat.max(1))?);
    info!(
        "Imported {} events in {} over {} beats..!",
        tune.len(),
        tune.key().name(),
        tune.max_position() + 1
    );

    let mut config = GrooverConfig::load(args.config.as_deref())?;
    if let Some(bpm) = args.bpm {
        config.values.bpm = Some(bpm as f64);
    }
    config.values.transpose = args.transpose;
    if let Some(diatonic) = args.diatonic {
        config.values.diatonic_errors = diatonic;
    }
    if let Some(seed) = args.seed {
        config.values.seed = seed;
    }
    if let Some(impact) = args.human_impact {
        config.velocity.human_impact = impact;
        config.tempo.human_impact = impact;
        config.ornament.human_impact = impact;
    }

    let sync = SyncConfig {
        intensity_control: args.intensity_control,
        human_impact_control: args.human_impact_control,
        seed: config.values.seed,
        ..SyncConfig::default()
    };
    let bpm = args
        .bpm
        .unwrap_or_else(|| tempo_to_bpm(tune.tempo()).round() as u32);

    // inbound controls: the automation map inverted, plus the relay controls
    let mut controls: BTreeMap<u8, String> = config
        .automation
        .iter()
        .map(|(name, control)| (*control, name.clone()))
        .collect();
    controls.insert(sync.intensity_control, "intensity".to_string());
    controls.insert(sync.human_impact_control, "human_impact".to_string());

    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = Arc::clone(&quit);
        ctrlc::set_handler(move || {
            warn!("Ctrl-C received, stopping playback..!");
            quit.store(true, Ordering::Relaxed);
        })
        .context("Error setting Ctrl-C handler..!")?;
    }

    let performers = args.performers.max(1);
    let (to_coordinator_tx, to_coordinator_rx) = unbounded::<(InstanceId, SyncMessage)>();
    let (from_coordinator_tx, from_coordinator_rx) = unbounded::<(InstanceId, SyncMessage)>();

    let mut coordinator = Coordinator::new(sync.clone(), bpm);
    let mut inboxes: HashMap<InstanceId, Sender<SyncMessage>> = HashMap::new();
    let mut handles = Vec::new();

    for index in 0..performers {
        let id = format!("performer-{index}");
        coordinator.register(&id, false);

        let mut config = config.clone();
        // every voice gets its own decisions
        config.values.seed = config.values.seed.wrapping_add(index as u64);

        let groover = Arc::new(Groover::new(Arc::clone(&tune), config)?);
        let player = Player::new(
            LogSink::new(&id, args.verbose),
            args.save.is_some(),
        );

        let (inbox_tx, inbox_rx) = unbounded::<SyncMessage>();
        inboxes.insert(id.clone(), inbox_tx);

        let options = PerformerOptions {
            id: id.clone(),
            controls: controls.clone(),
            intensity_control: sync.intensity_control,
            send_clock: false,
            autostart: args.autostart,
            quit: Arc::clone(&quit),
        };
        let outbound = to_coordinator_tx.clone();

        handles.push((
            id,
            thread::spawn(move || performer::run(groover, player, options, inbox_rx, outbound)),
        ));
    }
    drop(to_coordinator_tx);

    let coordinator_handle = thread::spawn(move || {
        coordinator.run(to_coordinator_rx, from_coordinator_tx);
    });
    let router_handle = thread::spawn(move || route(from_coordinator_rx, inboxes));

    let tempo = ceol::bpm_to_tempo(bpm as f64);
    for (id, handle) in handles {
        let player = handle
            .join()
            .map_err(|_| anyhow::anyhow!("{id} panicked..!"))??;

        if let Some(path) = args.save.as_ref() {
            let path = save_path(path, &id, performers);
            player.save(&path, tempo, config.values.midi_channel)?;
        }
    }

    if coordinator_handle.join().is_err() {
        warn!("Coordinator thread panicked..!");
    }
    if router_handle.join().is_err() {
        warn!("Router thread panicked..!");
    }

    info!("Playback finished, exiting..!");
    Ok(())
}

/// Deliver coordinator output to the addressed performer.
fn route(
    from_coordinator: Receiver<(InstanceId, SyncMessage)>,
    inboxes: HashMap<InstanceId, Sender<SyncMessage>>,
) {
    for (id, message) in from_coordinator {
        let Some(inbox) = inboxes.get(&id) else {
            warn!("Message for unknown performer '{id}'..!");
            continue;
        };
        if inbox.send(message).is_err() {
            // that performer is already gone
            continue;
        }
    }
}

fn save_path(base: &Path, id: &str, performers: usize) -> PathBuf {
    if performers == 1 {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "performance".to_string());
    base.with_file_name(format!("{stem}-{id}.mid"))
}
