//! Rayflow CLI - drive chunked renders and viewer sessions from the terminal.

use std::sync::Arc;
use std::time::Instant;

use rayflow::prelude::*;
use rayflow::synthetic::{PinholeRaySource, SphereEvaluator};
use rayflow::util::{Mat4, Vec3};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("RAYFLOW_BUILD_DATE");
const BUILD_TIME: &str = env!("RAYFLOW_BUILD_TIME");
const BUILD_PROFILE: &str = env!("RAYFLOW_BUILD_PROFILE");
const BUILD_TARGET: &str = env!("RAYFLOW_BUILD_TARGET");

/// Options for the `demo` command.
struct DemoArgs {
    clients: u64,
    frames: usize,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Parse global flags
    let mut level = "info";
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "error",
            _ => filtered_args.push(arg),
        }
    }
    #[allow(clippy::let_unit_value)]
    let _trace_guard = init_logging(level);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let result = match filtered_args[0] {
        "demo" | "d" => parse_demo(&filtered_args[1..]).and_then(|(settings, demo)| cmd_demo(settings, demo)),
        "config" | "c" => cmd_config(filtered_args.get(1).copied()),
        "version" | "-V" | "--version" => {
            println!("rayflow {} (built {} {})", VERSION, BUILD_DATE, BUILD_TIME);
            println!("{} build for {}", BUILD_PROFILE, BUILD_TARGET);
            Ok(())
        }
        "help" | "h" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!();
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(feature = "chrome-trace")]
type TraceGuard = Option<tracing_chrome::FlushGuard>;
#[cfg(not(feature = "chrome-trace"))]
type TraceGuard = ();

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the fmt subscriber; with `RAYFLOW_TRACE=1` also record a
/// Chrome trace to `trace.json`.
#[cfg(feature = "chrome-trace")]
fn init_logging(level: &str) -> TraceGuard {
    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    if std::env::var("RAYFLOW_TRACE").ok().as_deref() != Some("1") {
        let subscriber = tracing_subscriber::registry().with(env_filter(level)).with(fmt);
        let _ = tracing::subscriber::set_global_default(subscriber);
        return None;
    }

    let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .file("trace.json")
        .build();
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt)
        .with(chrome_layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

#[cfg(not(feature = "chrome-trace"))]
fn init_logging(level: &str) -> TraceGuard {
    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    let subscriber = tracing_subscriber::registry().with(env_filter(level)).with(fmt);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_help() {
    println!("rayflow - chunked ray rendering with per-client viewer sessions");
    println!();
    println!("USAGE:");
    println!("    rayflow-cli [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    d, demo [FLAGS]             Render an analytic sphere for simulated clients");
    println!("    c, config [path]            Print effective settings (and where they live)");
    println!("    version                     Show version and build date");
    println!("    h, help                     Show this help");
    println!();
    println!("DEMO FLAGS:");
    println!("    --clients <n>               Number of simulated viewers (default 2)");
    println!("    --frames <n>                Camera moves per viewer (default 3)");
    println!("    --width <px> --height <px>  Image size");
    println!("    --stride <n>                Pixel stride for ray generation");
    println!("    --chunk <n>                 Rays per evaluator call");
    println!("    --settings <file>           Load settings from a file");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose    Show debug output");
    println!("    -vv, --trace     Show trace output (very verbose)");
    println!("    -q, --quiet      Only show errors");
    println!();
    println!("NOTES:");
    println!("    - RUST_LOG overrides the verbosity flags");
    println!("    - With --features chrome-trace, RAYFLOW_TRACE=1 writes trace.json");
}

fn flag_value<T: std::str::FromStr>(args: &[&str], i: usize, name: &str) -> anyhow::Result<T> {
    let raw = args
        .get(i + 1)
        .ok_or_else(|| anyhow::anyhow!("missing value for {}", name))?;
    raw.parse()
        .map_err(|_| anyhow::anyhow!("invalid value for {}: {}", name, raw))
}

fn parse_demo(args: &[&str]) -> anyhow::Result<(Settings, DemoArgs)> {
    let mut settings = match args.iter().position(|&a| a == "--settings") {
        Some(i) => {
            let path: String = flag_value(args, i, "--settings")?;
            Settings::load_from(std::path::Path::new(&path))?
        }
        None => Settings::load(),
    };
    let mut demo = DemoArgs { clients: 2, frames: 3 };

    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "--clients" => demo.clients = flag_value(args, i, "--clients")?,
            "--frames" => demo.frames = flag_value(args, i, "--frames")?,
            "--width" => settings.image_width = flag_value(args, i, "--width")?,
            "--height" => settings.image_height = flag_value(args, i, "--height")?,
            "--stride" => settings.render.render_stride = flag_value(args, i, "--stride")?,
            "--chunk" => settings.render.chunk_size = flag_value(args, i, "--chunk")?,
            "--settings" => {}
            other => anyhow::bail!("unknown demo flag: {}", other),
        }
        i += 2;
    }
    Ok((settings, demo))
}

/// Camera on a circle around the demo sphere.
fn orbit_camera(angle: f32, aspect: f32) -> CameraState {
    let target = Vec3::new(0.0, 0.0, -4.0);
    let eye = target + Vec3::new(angle.sin(), 0.3, angle.cos()) * 4.0;
    CameraState {
        fov: std::f32::consts::FRAC_PI_3,
        aspect,
        c2w: Mat4::look_at_rh(eye, target, Vec3::Y).inverse(),
    }
}

fn cmd_demo(settings: Settings, demo: DemoArgs) -> anyhow::Result<()> {
    let config = settings.render.clone().validated();
    info!(
        "Demo: {} clients x {} frames, {}x{} @ stride {}, chunk {}",
        demo.clients, demo.frames, settings.image_width, settings.image_height, config.render_stride, config.chunk_size
    );

    let rays = PinholeRaySource::new(settings.image_width, settings.image_height, config.render_stride);
    let manager = SessionManager::new(Arc::new(SphereEvaluator::default()), Arc::new(rays), config);

    let mut displays = Vec::new();
    for id in 0..demo.clients {
        let display = SceneDisplay::new(settings.viewer.clone());
        manager.on_connect(id, Box::new(display.clone()))?;
        displays.push((id, display));
    }
    manager.set_ready(true);

    let aspect = settings.image_width as f32 / settings.image_height.max(1) as f32;
    let start = Instant::now();
    for frame in 0..demo.frames {
        let frame_start = Instant::now();
        let ids = manager.client_ids();
        // Sessions render independently
        let published: usize = ids
            .par_iter()
            .map(|&id| {
                let angle = frame as f32 * 0.4 + id as f32 * std::f32::consts::FRAC_PI_2;
                match manager.on_client_event(id, ClientEvent::CameraMoved(orbit_camera(angle, aspect))) {
                    Ok(Some(output)) => {
                        debug!(client = id, points = output.num_points(), "frame published");
                        1
                    }
                    Ok(None) => 0,
                    Err(e) => {
                        warn!(client = id, "render failed: {}", e);
                        if let Some(session) = manager.session(id) {
                            session.state_machine().reset();
                        }
                        0
                    }
                }
            })
            .sum();
        info!("Frame {}: {} of {} clients published in {:.1?}", frame, published, ids.len(), frame_start.elapsed());

        // Let consumers catch up so the next move is not dropped as in-flight
        for id in &ids {
            if let Some(session) = manager.session(*id) {
                let deadline = Instant::now() + manager.config().poll_interval() * 10;
                while session.state_machine().is_visualizing() && Instant::now() < deadline {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
        }
    }

    println!();
    println!("=== Demo Summary ===");
    println!("Total time: {:.2?}", start.elapsed());
    for (id, display) in &displays {
        match display.scene() {
            Some(scene) => {
                let center = scene.bounds.map(|b| b.center()).unwrap_or(Vec3::ZERO);
                println!(
                    "  client {}: {} ({} points, {} depth lines, center [{:.2}, {:.2}, {:.2}])",
                    id,
                    scene.status,
                    scene.points.len(),
                    scene.depth_lines.as_ref().map_or(0, Vec::len),
                    center.x,
                    center.y,
                    center.z
                );
            }
            None => println!("  client {}: nothing displayed", id),
        }
    }

    for id in manager.client_ids() {
        manager.on_disconnect(id);
    }
    Ok(())
}

fn cmd_config(path: Option<&str>) -> anyhow::Result<()> {
    let settings = match path {
        Some(p) => Settings::load_from(std::path::Path::new(p))?,
        None => Settings::load(),
    };
    match (path, Settings::path()) {
        (Some(p), _) => println!("# {}", p),
        (None, Some(p)) => println!("# {}", p.display()),
        (None, None) => println!("# (no config directory, using defaults)"),
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
