//! # Lattice CLI
//!
//! Headless scenario runner for the Lattice physics layer.
//!
//! ## Commands
//! - `run` - Build a scene from a session config, step it and report
//! - `config` - Print or write the effective session config
//! - `layers` - Print the layer table and its collision matrix

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use glam::{Vec2, Vec3};
use lattice_core::{FixedTimeStep, ManualClock, Transform};
use lattice_physics::{
    Body, BodyEvent, BodyKey, BodyMode, CharacterInput, CharacterSettings, LayerTable, NetworkRole,
    PhysicsSession, SessionConfig, Shape, ShapeDesc, StateRecorder, StateRecorderState,
};
use serde::Serialize;

/// Lattice physics CLI
#[derive(Parser)]
#[command(name = "lattice")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Session config (JSON); defaults are used when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Step a generated scene and print statistics
    Run {
        /// Number of ticks to simulate
        #[arg(short, long, default_value = "600")]
        ticks: u32,

        /// Tick rate in Hz
        #[arg(long, default_value = "60")]
        hz: f64,

        /// Dynamic crates, dropped on a grid
        #[arg(short, long, default_value = "64")]
        bodies: u32,

        /// Sensor volumes on the floor
        #[arg(short, long, default_value = "4")]
        sensors: u32,

        /// Characters, each registered as a listening peer
        #[arg(short, long, default_value = "2")]
        listeners: u32,

        /// Distance between consecutive characters
        #[arg(long, default_value = "20")]
        listener_spacing: f32,

        /// Log statistics every N ticks (0 disables)
        #[arg(long, default_value = "60")]
        report_every: u32,

        /// Round-trip check of a full snapshot every tick
        #[arg(long)]
        validate: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective session config
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the layer table
    Layers,
}

/// Generated scene parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioOptions {
    pub ticks: u32,
    pub hz: f64,
    pub bodies: u32,
    pub sensors: u32,
    pub listeners: u32,
    pub listener_spacing: f32,
    pub report_every: u32,
    pub validate: bool,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            ticks: 600,
            hz: 60.0,
            bodies: 64,
            sensors: 4,
            listeners: 2,
            listener_spacing: 20.0,
            report_every: 60,
            validate: false,
        }
    }
}

/// Summary of a scenario run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub ticks: u32,
    pub bodies: usize,
    pub bodies_created: u32,
    pub overlap_starts: u32,
    pub overlap_ends: u32,
    pub jumps: u32,
    pub sync_groups: usize,
    pub simulated: usize,
    pub trickled: usize,
    pub snapshot_bytes: usize,
    pub validation_failures: u32,
    pub average_tick_ms: f64,
    pub max_tick_ms: f64,
}

impl ScenarioReport {
    fn record_events(&mut self, events: &[BodyEvent]) {
        for event in events {
            match event {
                BodyEvent::BodyCreated { .. } => self.bodies_created += 1,
                BodyEvent::OverlapStart { .. } => self.overlap_starts += 1,
                BodyEvent::OverlapEnd { .. } => self.overlap_ends += 1,
                BodyEvent::Jump { .. } => self.jumps += 1,
                _ => {}
            }
        }
    }
}

/// Load the session config from `path`, or the defaults
pub fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load session config {}", path.display())),
        None => Ok(SessionConfig::default()),
    }
}

fn build_scene(session: &mut PhysicsSession, options: &ScenarioOptions) -> Result<Vec<BodyKey>> {
    let ground = session.next_body_key();
    session.add_body(
        Body::new(ground)
            .with_layer("STATIC")
            .with_shape(Shape::new(ShapeDesc::Box {
                size: Vec3::new(400.0, 1.0, 400.0),
            }))
            .with_transform(Transform::from_position(Vec3::new(0.0, -0.5, 0.0))),
    )?;

    let crate_shape = Shape::new(ShapeDesc::cube(1.0));
    let side = (options.bodies as f32).sqrt().ceil().max(1.0) as u32;
    for i in 0..options.bodies {
        let (x, z) = ((i % side) as f32, (i / side) as f32);
        let key = session.next_body_key();
        session.add_body(
            Body::new(key)
                .with_layer("DYNAMIC")
                .with_mode(BodyMode::Dynamic)
                .with_shape(crate_shape.clone())
                .with_transform(Transform::from_position(Vec3::new(
                    x * 2.0 - side as f32,
                    2.0 + (i % 3) as f32,
                    z * 2.0 - side as f32,
                ))),
        )?;
    }

    let sensor_shape = Shape::new(ShapeDesc::Box {
        size: Vec3::new(4.0, 2.0, 4.0),
    });
    for i in 0..options.sensors {
        let key = session.next_body_key();
        session.add_body(
            Body::new(key)
                .with_layer("TRIGGER")
                .with_mode(BodyMode::Sensor)
                .with_shape(sensor_shape.clone())
                .with_transform(Transform::from_position(Vec3::new(
                    i as f32 * 6.0 - side as f32,
                    1.0,
                    0.0,
                ))),
        )?;
    }

    let capsule = Shape::new(ShapeDesc::Capsule {
        radius: 0.3,
        height: 1.75,
    });
    let mut characters = Vec::with_capacity(options.listeners as usize);
    for i in 0..options.listeners {
        let key = session.next_body_key();
        session.add_body(
            Body::character(key, CharacterSettings::default())
                .with_shape(capsule.clone())
                .with_transform(Transform::from_position(Vec3::new(
                    i as f32 * options.listener_spacing,
                    1.0,
                    -(side as f32) - 4.0,
                ))),
        )?;
        session.register_listener(i + 1, key);
        characters.push(key);
    }

    session.worlds_mut().main_mut().optimize_broadphase();
    Ok(characters)
}

/// Build the generated scene on an authority session and step it
pub fn run_scenario(config: &SessionConfig, options: &ScenarioOptions) -> Result<ScenarioReport> {
    if options.hz <= 0.0 {
        bail!("The tick rate must be positive, got {}", options.hz);
    }
    let step = FixedTimeStep::from_hz(options.hz);
    let dt = step.delta().as_secs_f32();
    let clock = Arc::new(ManualClock::new(0));
    let mut session = PhysicsSession::with_clock(config, NetworkRole::Authority, clock.clone())
        .context("Failed to create the physics session")?;

    let characters = build_scene(&mut session, options)?;
    let mut report = ScenarioReport {
        bodies: session.body_count(),
        ..ScenarioReport::default()
    };
    report.record_events(&session.drain_events());

    let mut total_ms = 0.0;
    for tick in 0..options.ticks {
        for (i, key) in characters.iter().enumerate() {
            let angle = (tick as f32 * dt * 0.5) + i as f32;
            session.set_character_input(
                *key,
                CharacterInput {
                    move_direction: Vec2::new(angle.cos(), angle.sin()),
                    run: i % 2 == 1,
                    jump: tick % 90 == 45,
                },
            );
        }

        let started = Instant::now();
        let stats = session.process(dt)?;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        total_ms += elapsed;
        report.max_tick_ms = report.max_tick_ms.max(elapsed);
        clock.advance(step.step_millis());

        report.record_events(&session.drain_events());

        if options.validate {
            let world = session.worlds().main();
            let mut recorder = StateRecorder::new();
            world.save_state(&mut recorder, StateRecorderState::ALL, None);
            if !world.validate_state(&mut recorder) {
                log::error!("Snapshot of tick {} does not round trip", tick);
                report.validation_failures += 1;
            }
        }

        if options.report_every > 0 && (tick + 1) % options.report_every == 0 {
            log::info!(
                "Tick {:>5}: {:.3} ms, {:?}, {} overlap starts, {} overlap ends",
                tick + 1,
                elapsed,
                stats,
                report.overlap_starts,
                report.overlap_ends
            );
        }
    }

    let mut group_ids = Vec::new();
    for group in session.sync_groups().groups().iter().filter(|g| !g.is_empty()) {
        report.sync_groups += 1;
        report.simulated += group.simulated().len();
        report.trickled += group.trickled().len();
        group_ids.push(group.id());
    }
    for id in group_ids {
        report.snapshot_bytes += session.snapshot_custom_data(Some(id))?.len();
    }

    report.ticks = options.ticks;
    if options.ticks > 0 {
        report.average_tick_ms = total_ms / options.ticks as f64;
    }
    Ok(report)
}

fn print_layers(layers: &LayerTable) {
    let names: Vec<&str> = layers.layer_names().collect();
    println!("{:<3} {:<12} {:>10}", "#", "layer", "broadphase");
    for (index, name) in names.iter().enumerate() {
        let broadphase = layers
            .broadphase_of(index as u8)
            .map_or_else(|| "-".to_string(), |b| b.to_string());
        println!("{:<3} {:<12} {:>10}", index, name, broadphase);
    }
    println!();
    println!("Collision pairs:");
    for pair in layers.collide_pairs() {
        println!("  {:?}", pair);
    }
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            ticks,
            hz,
            bodies,
            sensors,
            listeners,
            listener_spacing,
            report_every,
            validate,
            json,
        } => {
            let options = ScenarioOptions {
                ticks,
                hz,
                bodies,
                sensors,
                listeners,
                listener_spacing,
                report_every,
                validate,
            };
            log::info!("Running {} ticks at {} Hz...", ticks, hz);
            let report = run_scenario(&config, &options)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                log::info!("Bodies: {} ({} created)", report.bodies, report.bodies_created);
                log::info!(
                    "Overlaps: {} started, {} ended",
                    report.overlap_starts,
                    report.overlap_ends
                );
                log::info!(
                    "Sync groups: {} ({} simulated, {} trickled, {} snapshot bytes)",
                    report.sync_groups,
                    report.simulated,
                    report.trickled,
                    report.snapshot_bytes
                );
                log::info!(
                    "Tick time: {:.3} ms average, {:.3} ms max",
                    report.average_tick_ms,
                    report.max_tick_ms
                );
                if validate {
                    log::info!("Snapshot validation failures: {}", report.validation_failures);
                }
            }
            if report.validation_failures > 0 {
                bail!("{} snapshots failed validation", report.validation_failures);
            }
        }

        Commands::Config { output } => {
            let json = config.to_json_string()?;
            match output {
                Some(output) => {
                    std::fs::write(&output, json)
                        .with_context(|| format!("Failed to write {}", output.display()))?;
                    log::info!("Config written to {}", output.display());
                }
                None => println!("{}", json),
            }
        }

        Commands::Layers => print_layers(&LayerTable::from_config(&config.layers)),
    }

    Ok(())
}
