#![deny(unused_imports)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::builder::styling;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use env_logger::Builder;
use log::LevelFilter;

use zygomon::config::Config;
use zygomon::hide::StaticBackend;
use zygomon::monitor::Monitor;
use zygomon::util;

const ABOUT: &str =
    "Traces the application spawner and intercepts sandboxed processes before they run untrusted code";

#[derive(Parser)]
#[command(author, version, about = ABOUT, long_about = None)]
struct Cli {
    /// Enable debugging
    #[arg(short, long)]
    debug: bool,

    /// Silents out debug, info, error logging.
    #[arg(short, long)]
    silent: bool,

    /// Set verbosity level, repeat option for more verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Specify a command (if any)
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Default, Parser)]
struct RunOpt {
    /// Specify a configuration file to use. Command line options supersede the ones specified in the configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Command name to treat as a hide target, can be repeated. Supersedes configuration file.
    #[arg(short, long, value_name = "NAME")]
    target: Option<Vec<String>>,

    /// Match confidence threshold in percent. Supersedes configuration file.
    #[arg(long)]
    threshold: Option<u8>,
}

impl TryFrom<RunOpt> for Config {
    type Error = anyhow::Error;
    fn try_from(opt: RunOpt) -> Result<Self, Self::Error> {
        let mut conf = Self::default();

        if let Some(conf_file) = opt.config {
            conf = Config::from_file(conf_file)?;
        }

        // command line supersedes configuration
        if let Some(targets) = opt.target {
            conf.hide.targets = targets;
        }

        if let Some(threshold) = opt.threshold {
            conf.hide.threshold = threshold;
        }

        Ok(conf)
    }
}

#[derive(Debug, Parser)]
struct ConfigOpt {
    /// Dump the default configuration
    #[arg(long)]
    dump: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor until a termination signal
    Run(RunOpt),
    /// Configuration helper
    Config(ConfigOpt),
}

impl Command {
    fn config(co: ConfigOpt) -> anyhow::Result<()> {
        if co.dump {
            let conf = Config::default();
            println!("{}", serde_yaml::to_string(&conf)?);
        }
        Ok(())
    }

    fn run(opt: Option<RunOpt>) -> anyhow::Result<()> {
        // checking that we are running as root
        if util::get_current_uid() != 0 {
            return Err(anyhow!(
                "You need to be root to run this program, this is necessary to trace the spawner"
            ));
        }

        let config: Config = opt.unwrap_or_default().try_into()?;
        let backend = Arc::new(StaticBackend::new(config.hide.targets.clone()));

        let mut monitor = Monitor::new(config, backend);
        let handle = monitor.handle();
        ctrlc::set_handler(move || handle.shutdown())?;

        monitor.run()?;
        Ok(())
    }
}

fn main() -> Result<(), anyhow::Error> {
    let c = {
        let c: clap::Command = Cli::command();
        let styles = styling::Styles::styled()
            .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
            .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
            .literal(styling::AnsiColor::Blue.on_default() | styling::Effects::BOLD)
            .placeholder(styling::AnsiColor::Cyan.on_default());
        c.styles(styles)
    };

    let cli: Cli = Cli::from_arg_matches(&c.get_matches())?;

    // setting log level according to the verbosity level
    let mut log_level = LevelFilter::Warn;
    match cli.verbose {
        1 => log_level = LevelFilter::Info,
        2 => log_level = LevelFilter::Debug,
        3..=u8::MAX => log_level = LevelFilter::Trace,
        _ => {}
    }

    // silent out logging if specified in CLI
    if cli.silent {
        log_level = LevelFilter::Off;
    }

    // handling debugging flag
    if cli.debug {
        log_level = LevelFilter::Debug;
    }

    // building the logger
    Builder::new().filter_level(log_level).init();

    match cli.command {
        Some(Command::Run(o)) => Command::run(Some(o)),
        Some(Command::Config(o)) => Command::config(o),
        None => Command::run(None),
    }
}
