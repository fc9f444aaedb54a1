use std::{
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::SystemTime,
};

use anyhow::Context;
use chrono::{DateTime, Local};
use clap::Parser;
use log::error;
use qhyccd_sweep::{
    config::{get_out_dir, SweepConfig},
    device::CameraDriver,
    session::{DeviceSession, SessionOptions},
    simulator::{SimulatedCamera, SimulatedDriver},
    sweep::{run_sweep, SweepReport},
};

/// Single-frame sweeps over temperature, offset, gain and exposure.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file. Defaults are written there if it does not exist.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Use the built-in simulated camera instead of the SDK.
    #[arg(long)]
    simulate: bool,
    /// Print every capture of the sweep and exit.
    #[arg(long)]
    print_plan: bool,
}

fn now() -> String {
    let dtime: DateTime<Local> = SystemTime::now().into();
    dtime.format("%H:%M:%S").to_string()
}

fn print_plan(cfg: &SweepConfig) {
    let plan = cfg.plan();
    for p in plan.points() {
        println!(
            "{:>5}/{}: temperature {:>6.2} C, offset {:>4}, gain {:>4}, exposure {:>10} us, repeat {}",
            p.number,
            plan.total(),
            p.temperature,
            p.offset,
            p.gain,
            p.exposure_us,
            p.repeat
        );
    }
}

fn run<Drv: CameraDriver>(driver: Drv, cfg: &SweepConfig, running: &AtomicBool) -> SweepReport {
    let opts = SessionOptions {
        camera: cfg.camera.clone(),
        read_mode: cfg.read_mode,
    };
    let mut session = DeviceSession::open(driver, &opts).unwrap_or_else(|e| {
        error!("{e}");
        eprintln!("[{}] Could not start camera session: {e}", now());
        process::exit(e.exit_code());
    });
    println!("[{}] Connected to {}", now(), session.id());
    let report = run_sweep(&mut session, cfg, running);
    if let Err(e) = session.close() {
        error!("Camera teardown failed: {e}");
    }
    report
}

#[cfg(feature = "qhyccd")]
fn run_hardware(cfg: &SweepConfig, running: &AtomicBool) -> anyhow::Result<SweepReport> {
    Ok(run(qhyccd_sweep::QhyDriver::new(), cfg, running))
}

#[cfg(not(feature = "qhyccd"))]
fn run_hardware(_cfg: &SweepConfig, _running: &AtomicBool) -> anyhow::Result<SweepReport> {
    anyhow::bail!("built without the `qhyccd` feature, rebuild with it or pass --simulate")
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let path = args
        .config
        .unwrap_or_else(|| get_out_dir().join("qhysweep.ini"));
    let cfg = SweepConfig::load_or_default(&path)
        .with_context(|| format!("loading {}", path.display()))?;

    if args.print_plan {
        print_plan(&cfg);
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    // ctrl + c stops the sweep after the current capture
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
            println!("\nCtrl + C received!");
        })
        .context("setting Ctrl-C handler")?;
    }

    let report = if args.simulate {
        let camera = SimulatedCamera::qhy600m().with_filter_wheel(7, 0, 3);
        run(SimulatedDriver::new(camera), &cfg, &running)
    } else {
        run_hardware(&cfg, &running)?
    };

    println!(
        "[{}] {} of {} images saved, {} capture failures, {} write failures, {} unsettled{}",
        now(),
        report.saved.len(),
        report.planned,
        report.failed_captures,
        report.failed_writes,
        report.unsettled,
        if report.interrupted {
            ", interrupted"
        } else {
            ""
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Args::command().debug_assert();
        let args = Args::parse_from(["qhysweep_capture", "--simulate", "-c", "run.ini"]);
        assert!(args.simulate);
        assert!(!args.print_plan);
        assert_eq!(args.config, Some(PathBuf::from("run.ini")));
    }
}
