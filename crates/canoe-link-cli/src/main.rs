//! canoe-link CLI - operate a CANoe bench from the shell

use anyhow::{bail, Context, Result};
use canoe_link::{
    CaptureLog, EnsurePolicy, LinkConfig, Session, SimulatedApplication, Value,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "canoe-link")]
#[command(author, version, about = "Read, write and capture CANoe system variables")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run against a simulated configuration loaded from a JSON graph
    #[arg(long, global = true, value_name = "GRAPH")]
    simulate: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and show the application identity
    Info,

    /// Read a variable, searching namespaces in order
    Read {
        name: String,

        /// Namespace to search (repeatable; default: from config)
        #[arg(long = "ns", value_name = "NAMESPACE")]
        namespaces: Vec<String>,
    },

    /// Write a variable
    Write {
        name: String,

        /// New value: true/false, a number, or text
        value: String,

        /// Namespace to search (repeatable; default: from config)
        #[arg(long = "ns", value_name = "NAMESPACE")]
        namespaces: Vec<String>,
    },

    /// Create a variable if it does not exist yet
    Ensure {
        namespace: String,
        name: String,
        default: String,

        /// Overwrite an existing variable with the default
        #[arg(long)]
        reset: bool,
    },

    /// Call a CAPL function
    Invoke {
        procedure: String,

        /// Arguments: true/false, numbers, or text
        args: Vec<String>,
    },

    /// Sample a numeric variable into a CSV capture log
    Capture {
        name: String,

        /// Namespace to search (repeatable; default: from config)
        #[arg(long = "ns", value_name = "NAMESPACE")]
        namespaces: Vec<String>,

        /// Number of samples
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Delay between samples
        #[arg(short, long, default_value = "1000")]
        interval_ms: u64,

        /// CSV file to append to (default: from config)
        #[arg(short, long)]
        log: Option<PathBuf>,
    },

    /// List every namespace and variable with its current value
    List,

    /// Control the measurement
    Measurement {
        #[arg(value_enum)]
        action: MeasurementAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MeasurementAction {
    Start,
    Stop,
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = match &cli.config {
        Some(path) => LinkConfig::from_file(path)?,
        None => LinkConfig::default(),
    };
    let mut session = open_session(&config, cli.simulate.as_deref())?;

    let result = run(&mut session, &config, cli.command);
    session.disconnect();
    result
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("canoe_link={default_level}")))
        .context("Invalid log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

fn open_session(config: &LinkConfig, simulate: Option<&Path>) -> Result<Session> {
    let mut session = match simulate {
        Some(path) => {
            tracing::debug!(graph = %path.display(), "using simulated application");
            let sim = SimulatedApplication::from_json_file(path)?;
            Session::with_config(sim.connector(), config)
        }
        None => Session::from_config(config),
    };
    session.connect().context("Failed to connect to CANoe")?;
    Ok(session)
}

fn run(session: &mut Session, config: &LinkConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Info => show_info(session),
        Commands::Read { name, namespaces } => {
            let candidates = candidates(session, namespaces);
            let handle = session.resolve(&name, candidates.as_slice())?.or_not_found(&name)?;
            let value = session.read_value(&handle)?;
            println!("{}\t{value}", handle.qualified_name());
            Ok(())
        }
        Commands::Write {
            name,
            value,
            namespaces,
        } => {
            let candidates = candidates(session, namespaces);
            let handle = session.resolve(&name, candidates.as_slice())?.or_not_found(&name)?;
            session.write(&handle, Value::parse(&value))?;
            eprintln!("Wrote {} = {value}", handle.qualified_name());
            Ok(())
        }
        Commands::Ensure {
            namespace,
            name,
            default,
            reset,
        } => {
            let policy = if reset {
                EnsurePolicy::ResetToDefault
            } else {
                EnsurePolicy::KeepExisting
            };
            let handle =
                session.ensure_variable_with(&namespace, &name, Value::parse(&default), policy)?;
            let value = session.read_value(&handle)?;
            println!("{}\t{value}", handle.qualified_name());
            Ok(())
        }
        Commands::Invoke { procedure, args } => {
            let args: Vec<Value> = args.iter().map(|arg| Value::parse(arg)).collect();
            let result = session.invoke_procedure_with(&procedure, &args)?;
            if !result.is_null() {
                println!("{result}");
            }
            Ok(())
        }
        Commands::Capture {
            name,
            namespaces,
            count,
            interval_ms,
            log,
        } => {
            let path = match log.or_else(|| config.capture_log.clone()) {
                Some(path) => path,
                None => bail!("No capture log given; pass --log or set capture_log in the config"),
            };
            let candidates = candidates(session, namespaces);
            capture(session, &name, &candidates, count, interval_ms, &path)
        }
        Commands::List => list_variables(session),
        Commands::Measurement { action } => {
            match action {
                MeasurementAction::Start => session.start_measurement()?,
                MeasurementAction::Stop => session.stop_measurement()?,
                MeasurementAction::Status => {}
            }
            let running = session.measurement_running()?;
            println!("{}", if running { "running" } else { "stopped" });
            Ok(())
        }
    }
}

fn candidates(session: &Session, namespaces: Vec<String>) -> Vec<String> {
    if namespaces.is_empty() {
        session.candidates().to_vec()
    } else {
        namespaces
    }
}

fn show_info(session: &mut Session) -> Result<()> {
    let info = session.connect()?;
    let running = session.measurement_running()?;

    println!("Application: {}", info.application);
    println!("Version: {}", info.version);
    println!("Connection: #{}", info.generation);
    println!("Measurement: {}", if running { "running" } else { "stopped" });
    println!("Namespace search order: {}", session.candidates().join(", "));
    Ok(())
}

fn capture(
    session: &mut Session,
    name: &str,
    candidates: &[String],
    count: usize,
    interval_ms: u64,
    path: &Path,
) -> Result<()> {
    let handle = session.resolve(name, candidates)?.or_not_found(name)?;
    let mut log = CaptureLog::csv(path)
        .with_context(|| format!("Failed to open capture log '{}'", path.display()))?;

    for i in 0..count {
        if i > 0 {
            std::thread::sleep(Duration::from_millis(interval_ms));
        }
        let value = session.read(&handle)?;
        let record = log.append(value)?;
        println!("{}\t{}", record.timestamp.to_rfc3339(), record.value);
    }

    eprintln!(
        "Appended {} readings of {} to '{}'",
        log.len(),
        handle.qualified_name(),
        path.display()
    );
    Ok(())
}

fn list_variables(session: &mut Session) -> Result<()> {
    let mut unreadable = 0;
    let mut total = 0;
    for listing in session.list_all_variables()? {
        if matches!(listing.value, canoe_link::ListedValue::Unreadable(_)) {
            unreadable += 1;
        }
        total += 1;
        println!("{}::{}\t{}", listing.namespace, listing.name, listing.value);
    }

    if total == 0 {
        eprintln!("No variables found");
    } else if unreadable > 0 {
        eprintln!("{total} entries, {unreadable} unreadable");
    }
    Ok(())
}
