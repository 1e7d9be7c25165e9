//! asokad - A fleet controller for HomePlug-AV smart power outlets.
//!
//! Discovers outlets on a single Ethernet segment, takes over their PIB
//! master MAC, polls power/on-off status, and applies on/off commands from
//! the configuration file and (optionally) an interactive terminal UI.

mod config;
mod datalog;
mod device;
mod dispatcher;
mod frame;
mod mac;
mod pib;
mod transport;
mod tui;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;

use config::Config;
use datalog::Datalog;
use device::Report;
use dispatcher::Dispatcher;
use mac::Mac;
use transport::RawTransport;

/// Tick interval for the run loop, in seconds. Matches the device state
/// machine's retransmission/poll cadence in `device.rs`.
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Maximum raw Ethernet frame this daemon will read.
const MAX_FRAME_LEN: usize = 1600;

#[derive(Parser, Debug)]
#[command(name = "asokad")]
#[command(about = "Fleet controller for HomePlug-AV smart power outlets")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/asokad.conf")]
    config: PathBuf,

    /// Stay attached to the terminal and show the interactive device list
    #[arg(short, long)]
    interactive: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&args.config)?;

    let transport = RawTransport::bind(&config.master.interface)?;
    let mut dispatcher = Dispatcher::new(config.master.mac, config.master.interface.clone(), transport);
    dispatcher.reload(&config)?;
    let dispatcher = Arc::new(Mutex::new(dispatcher));

    let datalog = match &config.master.datalog {
        Some(path) => Some(Mutex::new(Datalog::open(std::path::Path::new(path))?)),
        None => None,
    };

    drop_privileges(&config)?;

    let stop = Arc::new(AtomicBool::new(false));
    install_signal_handlers(Arc::clone(&stop))?;

    let (reload_tx, reload_rx) = mpsc::channel();
    install_sighup_handler(reload_tx)?;

    let worker_stop = Arc::clone(&stop);
    let worker_dispatcher = Arc::clone(&dispatcher);
    let config_path = args.config.clone();

    let worker = std::thread::spawn(move || {
        run_loop(worker_stop, worker_dispatcher, datalog, reload_rx, config_path)
    });

    if args.interactive {
        tui::run(Arc::clone(&dispatcher))?;
        stop.store(true, Ordering::SeqCst);
    }

    worker.join().expect("run loop thread panicked")?;
    Ok(())
}

fn run_loop(
    stop: Arc<AtomicBool>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    datalog: Option<Mutex<Datalog>>,
    reload_rx: mpsc::Receiver<()>,
    config_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut last_tick = now_unix();
    let mut buf = vec![0u8; MAX_FRAME_LEN];

    while !stop.load(Ordering::SeqCst) {
        if reload_rx.try_recv().is_ok() {
            match Config::load(&config_path) {
                Ok(config) => {
                    let mut dispatcher = dispatcher.lock().expect("dispatcher lock poisoned");
                    match dispatcher.reload(&config) {
                        Ok(()) => log::info!("configuration reloaded"),
                        Err(e) => log::warn!("failed to reload configuration: {e}"),
                    }
                }
                Err(e) => log::warn!("failed to reload configuration: {e}"),
            }
        }

        let now = now_unix();
        let elapsed = Duration::from_secs(now.saturating_sub(last_tick));
        let wait = TICK_INTERVAL.saturating_sub(elapsed);

        // Clone the transport handle and drop the dispatcher lock before
        // blocking, so device_on/device_off/device_info callers never wait
        // on an in-flight recv.
        let transport = dispatcher.lock().expect("dispatcher lock poisoned").transport();
        if transport.wait_readable(wait)? {
            let n = transport.recv(&mut buf)?;
            let (_, reports) = dispatcher
                .lock()
                .expect("dispatcher lock poisoned")
                .handle_inbound(now, &buf[..n]);
            log_reports(&datalog, now, &reports);
        }

        let now = now_unix();
        if now.saturating_sub(last_tick) >= TICK_INTERVAL.as_secs() {
            last_tick = now;
            dispatcher.lock().expect("dispatcher lock poisoned").tick_all(now);
        }
    }
    Ok(())
}

/// Append one datalog line per report actually received this call — never a
/// periodic snapshot of every configured device.
fn log_reports(datalog: &Option<Mutex<Datalog>>, now: u64, reports: &[(Mac, Report)]) {
    let Some(datalog) = datalog else { return };
    let mut datalog = datalog.lock().expect("datalog lock poisoned");
    for (mac, report) in reports {
        if let Err(e) = datalog.report(now as f64, *mac, report.is_on, report.power_w) {
            log::warn!("datalog write failed: {e}");
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

#[cfg(target_os = "linux")]
fn drop_privileges(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(gid) = config.master.gid {
        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))?;
    }
    if let Some(uid) = config.master.uid {
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn drop_privileges(_config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    Ok(())
}

fn install_signal_handlers(stop: Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    })?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn install_sighup_handler(reload_tx: mpsc::Sender<()>) -> Result<(), Box<dyn std::error::Error>> {
    let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGHUP])?;
    std::thread::spawn(move || {
        for _ in signals.forever() {
            if reload_tx.send(()).is_err() {
                break;
            }
        }
    });
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn install_sighup_handler(_reload_tx: mpsc::Sender<()>) -> Result<(), Box<dyn std::error::Error>> {
    Ok(())
}
