//! Operator console for the Zephyr test stand

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zephyr_core::config::StandConfig;
use zephyr_core::demo::{spawn_demo_stand, DemoStandConfig};
use zephyr_core::export::CsvExporter;
use zephyr_core::params::{Calibration, PidParameters, Setpoints};
use zephyr_core::protocol::{list_ports, ActiveCommand};
use zephyr_core::session::Session;

/// How long the console waits for stand traffic before checking stdin again
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about = "Zephyr test stand control")]
struct Cli {
    /// Config file (default: <config dir>/zephyr/stand.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports,

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Interactive operator console
    Console {
        /// Serial port (overrides the config file)
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate (overrides the config file)
        #[arg(short, long)]
        baud: Option<u32>,

        /// Run against the simulated stand
        #[arg(long)]
        demo: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Operator log lines are printed by the console itself
    let default_filter = if cli.verbose {
        "debug"
    } else {
        "info,zephyr::oplog=off"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().or_else(StandConfig::default_path);

    match cli.command {
        Commands::Ports => {
            let ports = list_ports();
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "{}  [{:04x}:{:04x}] {}",
                        port.name,
                        vid,
                        pid,
                        port.product.unwrap_or_default()
                    ),
                    _ => println!("{}", port.name),
                }
            }
            Ok(())
        }
        Commands::InitConfig { force } => {
            let path = config_path.context("No config directory on this platform; pass --config")?;
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            StandConfig::default().save(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Commands::Console { port, baud, demo } => {
            let mut config = match &config_path {
                Some(path) => StandConfig::load_or_default(path)?,
                None => StandConfig::default(),
            };
            if let Some(port) = port {
                config.connection.port_name = port;
            }
            if let Some(baud) = baud {
                config.connection.baud_rate = baud;
            }
            console(config, demo).await
        }
    }
}

enum Flow {
    Continue,
    Quit,
}

async fn console(config: StandConfig, demo: bool) -> Result<()> {
    let exporter = CsvExporter::new(&config.export_dir);
    let mut session = Session::new(config, Box::new(exporter));

    let _stand = if demo {
        let (link, handle) = spawn_demo_stand(DemoStandConfig::default());
        session.attach_stream(link)?;
        info!("running against the simulated stand");
        Some(handle)
    } else {
        if session.config().connection.port_name.is_empty() {
            bail!("No serial port configured; pass --port or set connection.port_name");
        }
        session
            .initialize()
            .await
            .context("Failed to connect to the test stand")?;
        None
    };

    print_help();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut cursor = 0;

    loop {
        cursor = print_log(&session, cursor);

        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match run_command(&mut session, line.trim()).await {
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Continue) => {}
                    Err(e) => println!("error: {:#}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                break;
            }

            item = session.recv(POLL_INTERVAL) => {
                if let Some(item) = item {
                    if let Err(e) = session.process(item).await {
                        print_log(&session, cursor);
                        return Err(e).context("Session ended");
                    }
                }
                // Events are not shown individually; the operator log covers them
                session.drain_events();
            }
        }
    }

    let result = session.close().await;
    print_log(&session, cursor);
    result.context("Shutdown failed")
}

async fn run_command(session: &mut Session, line: &str) -> Result<Flow> {
    let mut parts = line.split_whitespace();
    let Some(word) = parts.next() else {
        return Ok(Flow::Continue);
    };
    let args: Vec<&str> = parts.collect();
    debug!(command = word, ?args, "operator command");

    match word {
        "test" => session.begin(ActiveCommand::TestConnection).await?,
        "pid" => session.begin(ActiveCommand::PidTuneTest).await?,
        "ignite" => session.begin(ActiveCommand::Ignition).await?,
        "idle" => session.shutdown().await?,
        "setpoints" => session.send_setpoints(Setpoints::parse(&args)?).await?,
        "k" => session.send_k_values(PidParameters::parse(&args)?).await?,
        "cal" => session.send_calibration(Calibration::parse(&args)?).await?,
        "export" => {
            let path = session.retry_export()?;
            println!("Exported to {}", path.display());
        }
        "status" => print_status(session),
        "help" => print_help(),
        "quit" | "exit" => return Ok(Flow::Quit),
        other => println!("Unknown command '{}', type 'help'", other),
    }
    Ok(Flow::Continue)
}

fn print_log(session: &Session, cursor: usize) -> usize {
    let lines = session.log().since(cursor);
    for line in lines {
        println!("{}", line);
    }
    cursor + lines.len()
}

fn print_status(session: &Session) {
    let store = session.store();
    let unit = session.config().pressure_unit.label();
    println!("Session   {}", session.id());
    println!("State     {}", session.state());
    println!(
        "Records   {} ({:.1} s, {:?} layout)",
        store.len(),
        store.duration().as_secs_f64(),
        store.layout()
    );
    if let Some(latest) = store.latest(1).first() {
        let [fuel, ox] = latest.record.delta_pressure();
        let pressure = latest.record.pressure();
        println!("dP        fuel {:.2} {}  ox {:.2} {}", fuel, unit, ox, unit);
        println!("P0..P5    {:.1?} {}", pressure, unit);
        println!("Outputs   {:.1?}", latest.record.output());
    }
    let params = session.parameters();
    println!("Setpoints {}", params.setpoints.to_wire());
    println!("PID       {}", params.pid.to_wire());
    println!("Cal       {}", params.calibration.to_wire());
}

fn print_help() {
    println!("Commands:");
    println!("  test | pid | ignite          start a stand sequence");
    println!("  idle                         stop and return to idle");
    println!("  setpoints <v1> <v2>          send valve setpoints");
    println!("  k <kp1> <ki1> <kd1> <kp2> <ki2> <kd2>");
    println!("  cal <v_min> <v_max> <p_min> <p_max> <v_ref>");
    println!("  export                       export the last run again");
    println!("  status | help | quit");
}
