use clap::Parser;
use eframe::egui;
use gethostname::gethostname;
use std::time::Duration;

use servodriver::config_loader::{self, DriverSettings};
use servodriver::dispatcher::{CommandDispatcher, TickOutcome};
use servodriver::joints::{Joint, Pose, ANGLE_MAX, ANGLE_MIN, SPEED_MAX, SPEED_MIN};
use servodriver::player::{parse_delay_ms, play_entry, play_step, AutoPlayback, PlaybackEvent};
use servodriver::ports::{list_ports, selected_port, PortId, NO_PORTS_PLACEHOLDER};
use servodriver::provisioning::{ProvisionEvent, ProvisionRequest, ProvisioningPipeline, ProvisioningTask};
use servodriver::sequence::{LoadStatus, SequenceStore};
use servodriver::toolchain::ArduinoCli;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long)]
    debug: bool,
}

enum Action {
    RefreshPorts,
    ToggleConnection,
    Move(Joint),
    Record,
    Delete,
    Step,
    Auto,
    Cancel,
    Save,
    Load,
    Flash,
}

struct ServoGUI {
    settings: DriverSettings,
    dispatcher: CommandDispatcher,
    ports: Vec<PortId>,
    port_text: String,
    targets: Pose, // slider values; snap back to the dispatcher's state on rejection
    store: SequenceStore,
    selected: Option<usize>,
    delay_text: String,
    sequence_path: String,
    playback: Option<AutoPlayback>,
    provisioning: Option<ProvisioningTask>,
    stage: String,
    message: String,
}

impl ServoGUI {
    fn new(settings: DriverSettings) -> Self {
        let dispatcher = CommandDispatcher::new(settings.dispatcher_settings());
        let targets = dispatcher.joints();
        let mut gui = Self {
            delay_text: settings.auto_delay.as_millis().to_string(),
            sequence_path: settings.sequence_file.display().to_string(),
            port_text: settings.servo_port.clone().unwrap_or_default(),
            settings,
            dispatcher,
            ports: Vec::new(),
            targets,
            store: SequenceStore::new(),
            selected: None,
            playback: None,
            provisioning: None,
            stage: String::new(),
            message: String::new(),
        };
        gui.refresh_ports();
        gui.load_sequence();
        gui
    }

    fn log(&mut self, msg: &str) {
        log::info!(target: "servo_gui", "{}", msg);
        self.message.push_str(msg);
        self.message.push('\n');
    }

    fn refresh_ports(&mut self) {
        self.ports = list_ports();
        if self.port_text.is_empty() || !self.ports.contains(&self.port_text) {
            self.port_text = self.ports.first().cloned().unwrap_or_else(|| NO_PORTS_PLACEHOLDER.to_string());
        }
    }

    fn toggle_connection(&mut self) {
        if self.dispatcher.is_connected() {
            let discarded = self.dispatcher.disconnect();
            self.log(&format!("Disconnected ({} pending command(s) discarded)", discarded));
            return;
        }
        let Some(port) = selected_port(&self.port_text) else {
            self.log("Select a serial port first");
            return;
        };
        match self.dispatcher.connect(&port) {
            Ok(()) => self.log(&format!("Connected to {}", port)),
            Err(e) => self.log(&e.to_string()),
        }
    }

    fn move_joint(&mut self, joint: Joint) {
        let target = self.targets[joint.slot()];
        if let Err(e) = self.dispatcher.request_joint(joint, target.angle, target.speed) {
            self.targets[joint.slot()] = self.dispatcher.joint(joint);
            self.log(&e.to_string());
        }
    }

    fn delete_selected(&mut self) {
        let Some(index) = self.selected else {
            self.log("Select a command to delete");
            return;
        };
        if self.store.delete(index).is_some() {
            self.selected = if self.store.is_empty() { None } else { Some(index.min(self.store.len() - 1)) };
        }
    }

    fn start_auto(&mut self) {
        if self.playback.is_some() {
            return;
        }
        if !self.dispatcher.is_connected() {
            self.log("Not connected: open a serial port before playing");
            return;
        }
        let delay = match parse_delay_ms(&self.delay_text) {
            Ok(delay) => delay,
            Err(e) => return self.log(&e.to_string()),
        };
        match AutoPlayback::start(&self.store, delay) {
            Ok(playback) => self.playback = Some(playback),
            Err(e) => self.log(&e.to_string()),
        }
    }

    fn save_sequence(&mut self) {
        match self.store.save(self.sequence_path.trim().as_ref()) {
            Ok(()) => self.log(&format!("Saved {} command(s)", self.store.len())),
            Err(e) => self.log(&e.to_string()),
        }
    }

    fn load_sequence(&mut self) {
        match SequenceStore::load(self.sequence_path.trim().as_ref()) {
            Ok((store, status)) => {
                self.store = store;
                self.selected = None;
                match status {
                    LoadStatus::Loaded(n) => self.log(&format!("Loaded {} command(s)", n)),
                    LoadStatus::FileNotFound => self.log("No saved commands yet"),
                }
            }
            Err(e) => self.log(&e.to_string()),
        }
    }

    fn start_flash(&mut self) {
        if self.provisioning.is_some() {
            return;
        }
        let sketch_dir = match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => return self.log(&format!("Cannot determine sketch folder: {}", e)),
        };
        let pipeline = ProvisioningPipeline::new(
            ArduinoCli::new(self.settings.arduino_cli.clone()),
            self.settings.provision_settings(),
        );
        let request = ProvisionRequest { sketch_dir, port: selected_port(&self.port_text) };
        self.provisioning = Some(ProvisioningTask::spawn(pipeline, request));
    }

    /// Drain worker events and send at most one queued frame.
    fn poll(&mut self) {
        let mut playback_done = false;
        if let Some(playback) = &self.playback {
            while let Ok(event) = playback.events().try_recv() {
                match event {
                    PlaybackEvent::Entry { index, entry } => {
                        self.selected = Some(index);
                        if let Err(e) = play_entry(&entry, &mut self.dispatcher) {
                            self.message.push_str(&format!("{}\n", e));
                            playback_done = true;
                            break;
                        }
                    }
                    PlaybackEvent::Finished { played } | PlaybackEvent::Cancelled { played } => {
                        self.message.push_str(&format!("Played {} of {} command(s)\n", played, playback.total()));
                        playback_done = true;
                    }
                }
            }
        }
        if playback_done {
            self.playback = None;
        }

        let mut flash_result = None;
        if let Some(task) = &self.provisioning {
            while let Ok(event) = task.events().try_recv() {
                match event {
                    ProvisionEvent::StageStarted { stage, .. } => self.stage = stage.to_string(),
                    ProvisionEvent::Finished(result) => flash_result = Some(result),
                }
            }
        }
        if let Some(result) = flash_result {
            self.provisioning = None;
            self.stage.clear();
            match result {
                Ok(report) => self.log(&format!("Firmware uploaded to {}", report.port)),
                Err(e) => self.log(&e.user_message()),
            }
        }

        if let TickOutcome::Failed { command, error } = self.dispatcher.tick() {
            self.log(&format!("Joint {} update lost: {}", command.joint.index(), error));
        }
    }
}

impl eframe::App for ServoGUI {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll();
        if self.dispatcher.pending() > 0 {
            ctx.request_repaint_after(self.dispatcher.tick_period());
        } else if self.playback.is_some() || self.provisioning.is_some() {
            ctx.request_repaint_after(Duration::from_millis(20));
        }

        let mut action = None;
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.horizontal(|ui| {
                egui::ComboBox::from_id_source("port_select")
                    .selected_text(self.port_text.as_str())
                    .show_ui(ui, |ui| {
                        for port in &self.ports {
                            ui.selectable_value(&mut self.port_text, port.clone(), port.as_str());
                        }
                    });
                if ui.button("Refresh").clicked() {
                    action = Some(Action::RefreshPorts);
                }
                let label = if self.dispatcher.is_connected() { "Disconnect" } else { "Connect" };
                if ui.button(label).clicked() {
                    action = Some(Action::ToggleConnection);
                }
            });

            ui.separator();
            for joint in Joint::ALL {
                let target = &mut self.targets[joint.slot()];
                ui.label(joint.label());
                ui.horizontal(|ui| {
                    let angle = ui.add(egui::Slider::new(&mut target.angle, ANGLE_MIN..=ANGLE_MAX).text("angle"));
                    let speed = ui.add(egui::Slider::new(&mut target.speed, SPEED_MIN..=SPEED_MAX).text("speed"));
                    if angle.changed() || speed.changed() {
                        action = Some(Action::Move(joint));
                    }
                });
            }

            ui.separator();
            ui.heading("Commands");
            egui::ScrollArea::vertical().max_height(200.0).show(ui, |ui| {
                for index in 0..self.store.len() {
                    if let Some(label) = self.store.label(index) {
                        if ui.selectable_label(self.selected == Some(index), label).clicked() {
                            self.selected = Some(index);
                        }
                    }
                }
            });
            ui.horizontal(|ui| {
                if ui.button("Record").clicked() {
                    action = Some(Action::Record);
                }
                if ui.button("Delete").clicked() {
                    action = Some(Action::Delete);
                }
                if ui.button("Step").clicked() {
                    action = Some(Action::Step);
                }
                if self.playback.is_some() {
                    if ui.button("Cancel").clicked() {
                        action = Some(Action::Cancel);
                    }
                } else if ui.button("Auto").clicked() {
                    action = Some(Action::Auto);
                }
                ui.label("Delay (ms):");
                ui.add(egui::TextEdit::singleline(&mut self.delay_text).desired_width(60.0));
            });
            ui.horizontal(|ui| {
                ui.add(egui::TextEdit::singleline(&mut self.sequence_path).desired_width(260.0));
                if ui.button("Save").clicked() {
                    action = Some(Action::Save);
                }
                if ui.button("Load").clicked() {
                    action = Some(Action::Load);
                }
            });

            ui.separator();
            ui.horizontal(|ui| {
                let flashing = self.provisioning.is_some();
                if ui.add_enabled(!flashing, egui::Button::new("Upload firmware")).clicked() {
                    action = Some(Action::Flash);
                }
                if flashing {
                    ui.spinner();
                    ui.label(self.stage.as_str());
                }
            });

            ui.separator();
            ui.collapsing("Messages", |ui| {
                egui::ScrollArea::vertical()
                    .max_height(200.0)
                    .auto_shrink([false; 2])
                    .stick_to_bottom(true)
                    .show(ui, |ui| {
                        ui.add(
                            egui::TextEdit::multiline(&mut self.message)
                                .desired_width(f32::INFINITY)
                                .interactive(false),
                        );
                    });
            });
        });

        match action {
            Some(Action::RefreshPorts) => self.refresh_ports(),
            Some(Action::ToggleConnection) => {
                self.toggle_connection();
                self.targets = self.dispatcher.joints();
            }
            Some(Action::Move(joint)) => self.move_joint(joint),
            Some(Action::Record) => {
                let index = self.store.append(&self.dispatcher.joints());
                self.selected = Some(index);
            }
            Some(Action::Delete) => self.delete_selected(),
            Some(Action::Step) => {
                if let Err(e) = play_step(&self.store, self.selected, &mut self.dispatcher) {
                    self.log(&e.to_string());
                }
            }
            Some(Action::Auto) => self.start_auto(),
            Some(Action::Cancel) => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.cancel();
                }
            }
            Some(Action::Save) => self.save_sequence(),
            Some(Action::Load) => self.load_sequence(),
            Some(Action::Flash) => self.start_flash(),
            None => {}
        }
    }
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let hostname = gethostname().to_string_lossy().to_string();
    let settings = match config_loader::load_driver_settings(&hostname) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Missing/invalid servo settings for host '{}': {:#}", hostname, e);
            std::process::exit(1);
        }
    };

    let app = ServoGUI::new(settings);
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("Servo Arm Control")
            .with_inner_size([520.0, 760.0]),
        vsync: false,
        ..Default::default()
    };
    let _ = eframe::run_native("Servo Arm Control", options, Box::new(|_cc| Box::new(app)));
}
