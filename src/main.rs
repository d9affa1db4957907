//! CLI Entry Point for rust_eudaq
//!
//! Provides command-line interface for:
//! - Converting event files between registered formats
//! - Listing the registered components
//! - Running a producer or a data collector behind a command endpoint
//! - Driving a complete run from a configuration file
//!
//! # Usage
//!
//! ```bash
//! rust_eudaq collector --control 127.0.0.1:44000 --data 127.0.0.1:44001 --dir data
//! rust_eudaq producer --name DRS4 --type DRS4Producer --control 127.0.0.1:44010 --data 127.0.0.1:44001
//! rust_eudaq run --config config/rust_eudaq.toml --run 42 --duration 30s
//! rust_eudaq convert -i data/run000042.raw -o run42.jsonl
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_eudaq::collector::DataCollector;
use rust_eudaq::config::{EudaqConfig, DEFAULT_CONFIG_PATH};
use rust_eudaq::file::{format_for_path, FileWriter};
use rust_eudaq::logging;
use rust_eudaq::network::{CommandEndpoint, DataReceiver, DataSender, RemoteLink};
use rust_eudaq::producer::{EventSink, ProducerRuntime, RuntimeConfig};
use rust_eudaq::registry::{self, str2hash, Role};
use rust_eudaq::run_control::{ComponentKind, ComponentLink, LocalLink, RunControl};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PROGRESS_EVERY: u64 = 1000;

#[derive(Parser)]
#[command(name = "rust_eudaq")]
#[command(about = "Run control and event transport for modular data acquisition", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert an event file, formats chosen by extension
    Convert {
        /// Input file
        #[arg(short, long)]
        input: PathBuf,

        /// Output file; events are only read when unset
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after this many events
        #[arg(long)]
        max_events: Option<u64>,

        /// Skip data events numbered below this
        #[arg(long, default_value_t = 0)]
        skip_events: u32,

        /// Print every event
        #[arg(long)]
        print: bool,
    },

    /// List registered components per role
    List,

    /// Run one producer behind a command endpoint
    Producer {
        /// Instance name
        #[arg(long)]
        name: String,

        /// Registered producer type
        #[arg(long = "type")]
        producer_type: String,

        /// Control endpoint address
        #[arg(long)]
        control: String,

        /// Data collector address
        #[arg(long)]
        data: String,
    },

    /// Run a data collector behind a command endpoint
    Collector {
        /// Control endpoint address
        #[arg(long)]
        control: String,

        /// Data channel address
        #[arg(long)]
        data: Option<String>,

        /// Output directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Configure, start, stop and terminate every configured component
    Run {
        /// Run number
        #[arg(long)]
        run: u32,

        /// Run length; waits for Ctrl+C when unset
        #[arg(long, value_parser = parse_duration)]
        duration: Option<Duration>,
    },
}

fn parse_duration(text: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(text).map_err(|e| e.to_string())
}

fn load_config(path: &Path) -> Result<EudaqConfig> {
    if path.exists() {
        EudaqConfig::load_from(path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(EudaqConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Convert {
            input,
            output,
            max_events,
            skip_events,
            print,
        } => convert(&input, output.as_deref(), max_events, skip_events, print),
        Commands::List => {
            list();
            Ok(())
        }
        Commands::Producer {
            name,
            producer_type,
            control,
            data,
        } => run_producer(&config, &name, &producer_type, &control, &data).await,
        Commands::Collector { control, data, dir } => {
            run_collector(config, &control, data, dir).await
        }
        Commands::Run { run, duration } => run_daq(config, run, duration).await,
    }
}

fn convert(
    input: &Path,
    output: Option<&Path>,
    max_events: Option<u64>,
    skip_events: u32,
    print: bool,
) -> Result<()> {
    let registry = registry::global();
    let mut reader = registry.create_reader(&format_for_path(input), input)?;
    let mut writer: Option<Box<dyn FileWriter>> = match output {
        Some(path) => Some(registry.create_writer(&format_for_path(path), path)?),
        None => None,
    };

    let mut read = 0u64;
    while let Some(event) = reader.next_event()? {
        read += 1;
        let number = event.event_number();
        if number > 0 && number < skip_events {
            continue;
        }
        if print {
            println!("{event}");
        }
        if let Some(writer) = writer.as_mut() {
            writer.write(&event)?;
        }
        if read % PROGRESS_EVERY == 0 {
            info!(events = read, offset = reader.position(), "converting");
        }
        if max_events.is_some_and(|max| read >= max) {
            break;
        }
    }
    if let Some(writer) = writer.as_mut() {
        writer.close()?;
        info!(read, written = writer.events_written(), "conversion finished");
    } else {
        info!(read, "read finished");
    }
    Ok(())
}

fn list() {
    let registry = registry::global();
    for role in Role::ALL {
        println!("{role}:");
        for name in registry.list(role) {
            println!("  {name}");
        }
    }
}

async fn run_producer(
    config: &EudaqConfig,
    name: &str,
    producer_type: &str,
    control: &str,
    data: &str,
) -> Result<()> {
    let producer = registry::global().create_producer(producer_type, name)?;
    let sink = DataSender::connect(data)
        .await
        .with_context(|| format!("connecting to data collector at {data}"))?;
    let (handle, task) = ProducerRuntime::spawn(
        name,
        producer_type,
        producer,
        str2hash(name),
        Box::new(sink),
        RuntimeConfig::from(&config.run_control),
    );
    let endpoint = CommandEndpoint::bind(control, handle)
        .await?
        .with_command_timeout(config.run_control.command_timeout);
    info!(producer = name, r#type = producer_type, control, data, "producer ready");

    tokio::select! {
        served = endpoint.run() => served?,
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
    }
    task.abort();
    Ok(())
}

async fn run_collector(
    config: EudaqConfig,
    control: &str,
    data: Option<String>,
    dir: Option<PathBuf>,
) -> Result<()> {
    let mut collector = config.collector;
    if let Some(data) = data {
        collector.data_address = data;
    }
    if let Some(dir) = dir {
        collector.data_dir = dir;
    }
    let receiver = DataReceiver::bind(&collector.data_address).await?;
    let (handle, events, task) = DataCollector::spawn(collector, registry::global());
    tokio::spawn(receiver.run(events));
    let endpoint = CommandEndpoint::bind(control, handle)
        .await?
        .with_command_timeout(config.run_control.command_timeout);

    tokio::select! {
        served = endpoint.run() => served?,
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
    }
    task.abort();
    Ok(())
}

async fn run_daq(config: EudaqConfig, run: u32, duration: Option<Duration>) -> Result<()> {
    config.validate()?;
    let registry = registry::global();
    let log = registry.create_log_collector(&config.log_collector)?;
    let mut controller: Box<dyn RunControl> =
        registry.create_run_controller(&config.run_control.kind, &config.run_control, log)?;

    let local_events = match &config.collector.address {
        Some(address) => {
            let link = RemoteLink::new(&config.collector.name, ComponentKind::Collector, address);
            controller.add_component(Arc::new(link), toml::Table::new());
            None
        }
        None => {
            let (handle, events, _task) =
                DataCollector::spawn(config.collector.clone(), Arc::clone(&registry));
            controller.add_component(Arc::new(LocalLink::new(handle)), toml::Table::new());
            Some(events)
        }
    };

    for producer in config.enabled_producers() {
        let link: Arc<dyn ComponentLink> = match &producer.address {
            Some(address) => Arc::new(RemoteLink::new(
                &producer.name,
                ComponentKind::Producer,
                address,
            )),
            None => {
                let sink: Box<dyn EventSink> = match &local_events {
                    Some(events) => Box::new(events.clone()),
                    None => Box::new(DataSender::connect(&config.collector.data_address).await?),
                };
                let (handle, _task) = ProducerRuntime::spawn(
                    &producer.name,
                    &producer.r#type,
                    registry.create_producer(&producer.r#type, &producer.name)?,
                    str2hash(&producer.name),
                    sink,
                    RuntimeConfig::from(&config.run_control),
                );
                Arc::new(LocalLink::new(handle))
            }
        };
        controller.add_component(link, producer.params.clone());
    }
    info!(components = ?controller.components(), run, "run control ready");

    controller.configure().await?;
    controller.start_run(run).await?;
    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = tokio::signal::ctrl_c() => warn!("interrupted, stopping run"),
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }
    let stopped = controller.stop_run().await;

    for (name, status) in controller.status().await {
        match status {
            Ok(status) => println!(
                "{name:<20} {:<12} run {:<6} events {:<8} {}",
                status.state.to_string(),
                status.run_number,
                status.events,
                status.last_error.unwrap_or_default()
            ),
            Err(e) => println!("{name:<20} unreachable: {e}"),
        }
    }
    controller.terminate().await?;
    stopped?;
    Ok(())
}
