/// Command-line front end for the servo arm.
///
/// servoctl ports
/// servoctl move --joint 1 --angle 120
/// servoctl play --file media/commands/commands.json --delay-ms 300
/// servoctl flash --port /dev/ttyUSB0
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, select, tick, Receiver};
use gethostname::gethostname;
use std::path::PathBuf;
use std::time::Duration;

use servodriver::config_loader::{self, DriverSettings};
use servodriver::dispatcher::{CommandDispatcher, TickOutcome};
use servodriver::joints::DEFAULT_SPEED;
use servodriver::player::{play_entry, play_step, AutoPlayback, PlaybackEvent};
use servodriver::ports::{list_ports, NO_PORTS_PLACEHOLDER};
use servodriver::provisioning::{ProvisionEvent, ProvisionRequest, ProvisioningPipeline, ProvisioningTask};
use servodriver::sequence::{LoadStatus, SequenceStore};
use servodriver::serial_link::MemoryPort;
use servodriver::toolchain::ArduinoCli;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long)]
    debug: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List serial ports
    Ports,
    /// Move one joint
    Move {
        #[arg(long)]
        port: Option<String>,
        /// 1 column, 2 left shoulder, 3 right shoulder, 4 grip
        #[arg(long)]
        joint: u8,
        #[arg(long)]
        angle: u8,
        #[arg(long, default_value_t = DEFAULT_SPEED)]
        speed: u8,
    },
    /// Play a recorded command file
    Play {
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Play only this command (numbered from 1)
        #[arg(long)]
        step: Option<usize>,
        /// Print frames instead of opening a port
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate, compile and upload the controller firmware
    Flash {
        #[arg(long)]
        port: Option<String>,
        /// Sketch folder (defaults to the current directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let hostname = gethostname().to_string_lossy().to_string();
    let settings = config_loader::load_driver_settings(&hostname)?;

    match args.command {
        Cmd::Ports => {
            let ports = list_ports();
            if ports.is_empty() {
                println!("{}", NO_PORTS_PLACEHOLDER);
            }
            for port in ports {
                println!("{}", port);
            }
            Ok(())
        }
        Cmd::Move { port, joint, angle, speed } => {
            let mut dispatcher = open_dispatcher(&settings, port, false)?.0;
            dispatcher.request_update(joint, angle, speed)?;
            drain(&mut dispatcher);
            Ok(())
        }
        Cmd::Play { port, file, delay_ms, step, dry_run } => {
            let path = file.unwrap_or_else(|| settings.sequence_file.clone());
            let (store, status) = SequenceStore::load(&path)?;
            if status == LoadStatus::FileNotFound {
                return Err(anyhow!("No command file at {:?}", path));
            }
            let (mut dispatcher, memory) = open_dispatcher(&settings, port, dry_run)?;
            let delay = delay_ms.map(Duration::from_millis).unwrap_or(settings.auto_delay);

            match step {
                Some(number) => {
                    play_step(&store, number.checked_sub(1), &mut dispatcher)?;
                    drain(&mut dispatcher);
                }
                None => play_all(&store, delay, &mut dispatcher)?,
            }
            if let Some(memory) = memory {
                for frame in memory.frames() {
                    println!("{}", frame);
                }
            }
            Ok(())
        }
        Cmd::Flash { port, dir } => {
            let sketch_dir = match dir {
                Some(dir) => dir,
                None => std::env::current_dir().context("Cannot determine current directory")?,
            };
            let request = ProvisionRequest { sketch_dir, port: port.or_else(|| settings.servo_port.clone()) };
            let pipeline = ProvisioningPipeline::new(ArduinoCli::new(settings.arduino_cli.clone()), settings.provision_settings());
            flash(pipeline, request)
        }
    }
}

/// Connect to the configured (or given) port, or to an in-memory port for a dry run.
fn open_dispatcher(
    settings: &DriverSettings,
    port: Option<String>,
    dry_run: bool,
) -> Result<(CommandDispatcher, Option<MemoryPort>)> {
    let mut dispatcher = CommandDispatcher::new(settings.dispatcher_settings());
    if dry_run {
        let memory = MemoryPort::new();
        dispatcher.attach("dry-run", Box::new(memory.clone()))?;
        return Ok((dispatcher, Some(memory)));
    }
    let port = port
        .or_else(|| settings.servo_port.clone())
        .ok_or_else(|| anyhow!("No serial port given; pass --port or set SERVO_PORT"))?;
    dispatcher.connect(&port)?;
    Ok((dispatcher, None))
}

fn ctrlc_channel() -> Result<Receiver<()>> {
    let (tx, rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })?;
    Ok(rx)
}

fn report(outcome: TickOutcome) {
    if let TickOutcome::Failed { command, error } = outcome {
        log::error!(target: "dispatcher", "Dropped joint {} -> {}: {}", command.joint.index(), command.angle, error);
    }
}

fn drain(dispatcher: &mut CommandDispatcher) {
    let ticker = tick(dispatcher.tick_period());
    while dispatcher.pending() > 0 {
        let _ = ticker.recv();
        report(dispatcher.tick());
    }
}

fn play_all(store: &SequenceStore, delay: Duration, dispatcher: &mut CommandDispatcher) -> Result<()> {
    let interrupted = ctrlc_channel()?;
    let mut playback = AutoPlayback::start(store, delay)?;
    let events = playback.events().clone();
    let ticker = tick(dispatcher.tick_period());
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(PlaybackEvent::Entry { index, entry }) => {
                    println!("{}", store.label(index).unwrap_or_else(|| entry.to_string()));
                    play_entry(&entry, dispatcher)?;
                }
                Ok(PlaybackEvent::Finished { played }) => {
                    log::info!(target: "player", "Played {} of {} command(s)", played, playback.total());
                    break;
                }
                Ok(PlaybackEvent::Cancelled { played }) => {
                    log::warn!(target: "player", "Stopped after {} of {} command(s)", played, playback.total());
                    break;
                }
                Err(_) => break,
            },
            recv(ticker) -> _ => report(dispatcher.tick()),
            recv(interrupted) -> _ => playback.cancel(),
        }
    }
    drain(dispatcher);
    Ok(())
}

fn flash(pipeline: ProvisioningPipeline<ArduinoCli>, request: ProvisionRequest) -> Result<()> {
    let interrupted = ctrlc_channel()?;
    let task = ProvisioningTask::spawn(pipeline, request);
    loop {
        select! {
            recv(task.events()) -> event => match event {
                Ok(ProvisionEvent::StageStarted { stage, .. }) => println!("... {}", stage),
                Ok(ProvisionEvent::Finished(Ok(report))) => {
                    println!("Firmware uploaded to {} in {:.1} s", report.port, report.elapsed.as_secs_f32());
                    return Ok(());
                }
                Ok(ProvisionEvent::Finished(Err(e))) => return Err(anyhow!(e.user_message())),
                Err(_) => return Err(anyhow!("Provisioning worker stopped unexpectedly")),
            },
            recv(interrupted) -> _ => task.cancel(),
        }
    }
}
