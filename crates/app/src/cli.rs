use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use fieldbus::S7Client;
use roller_inspect::inspection::{
    Channel, PlantConfig, SensorBit,
    config::Overrides,
    pipeline,
    plc::{PlcLayout, probe},
};

#[derive(Debug, Parser)]
#[command(name = "roller-inspect", version, about = "Two-channel roller inspection line")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start capture, inference, slot control and the PLC link.
    Run(RunArgs),
    /// Parse the plant file and print the resolved settings.
    CheckConfig(ConfigArgs),
    /// Connect to the PLC once and print the sensor bits.
    ProbePlc(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Plant configuration file (TOML).
    #[arg(short, long, default_value = "plant.toml")]
    pub config: PathBuf,
    /// Override the PLC host from the file.
    #[arg(long)]
    pub plc_host: Option<String>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub base: ConfigArgs,
    /// Root folder for evidence images.
    #[arg(long)]
    pub evidence_root: Option<PathBuf>,
    /// Save every frame with a roller marker, not only defects.
    #[arg(long)]
    pub archive_all: bool,
    /// Write a Chrome trace of worker spans to this file.
    #[arg(long)]
    pub chrome_trace: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
    /// Keep a JSON status snapshot at this path.
    #[arg(long)]
    pub status_file: Option<PathBuf>,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            evidence_root: self.evidence_root.clone(),
            plc_host: self.base.plc_host.clone(),
            archive_all: self.archive_all,
            chrome_trace: self.chrome_trace.clone(),
            metrics_addr: self.metrics_addr,
            status_file: self.status_file.clone(),
        }
    }
}

fn load(args: &ConfigArgs, overrides: Overrides) -> Result<PlantConfig> {
    let mut config = PlantConfig::load(&args.config)?;
    config.apply(&Overrides {
        plc_host: args.plc_host.clone(),
        ..overrides
    });
    Ok(config)
}

pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let config = load(&args.base, args.overrides())?;
            pipeline::run(config)
        }
        Command::CheckConfig(args) => {
            let config = load(&args, Overrides::default())?;
            print_summary(&config);
            Ok(())
        }
        Command::ProbePlc(args) => {
            let config = load(&args, Overrides::default())?;
            let mut link = S7Client::new(config.plc.endpoint());
            let sensors = probe(&mut link, &PlcLayout::plant_default(config.plc.db))?;
            println!("{} DB{}", config.plc.endpoint().address(), config.plc.db);
            for bit in SensorBit::ALL {
                println!("  {:<14} {}", bit.name(), u8::from(sensors.get(bit)));
            }
            Ok(())
        }
    }
}

fn print_summary(config: &PlantConfig) {
    println!("evidence root : {}", config.evidence_root.display());
    println!("archive all   : {}", config.archive_all);
    println!(
        "plc           : {} rack {} slot {} DB{}",
        config.plc.endpoint().address(),
        config.plc.rack,
        config.plc.slot,
        config.plc.db
    );
    for channel in Channel::ALL {
        let cfg = config.channel(channel);
        let roles = config.roles(channel);
        println!(
            "{channel:<2}            : {}x{} flip={} model={} presence={} finalize={} gate={}",
            cfg.width,
            cfg.height,
            cfg.flip,
            cfg.model.path.display(),
            roles.presence.name(),
            roles.finalize.name(),
            roles.gate.name()
        );
    }
    match &config.head {
        Some(head) => println!("head model    : {}", head.model.path.display()),
        None => println!("head model    : none"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_become_overrides() {
        let cli = Cli::parse_from([
            "roller-inspect",
            "run",
            "--config",
            "line2.toml",
            "--archive-all",
            "--plc-host",
            "10.1.1.9",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.base.config, PathBuf::from("line2.toml"));
        let overrides = args.overrides();
        assert!(overrides.archive_all);
        assert_eq!(overrides.plc_host.as_deref(), Some("10.1.1.9"));
    }
}
