use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use orvibo::{
    ControllerConfig, DeviceController, MacAddress, NoopScheduler, PowerState, SwitchReport,
};

/// Control an Orvibo S20 smart plug on your LAN.
#[derive(Parser)]
#[command(name = "s20ctl", version)]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Switch the plug on
    On {
        /// IP address of the plug
        #[arg(long)]
        ip: IpAddr,
        /// MAC address of the plug, e.g. ac:cf:23:00:11:22
        #[arg(long)]
        mac: MacAddress,
        /// Minutes until auto power-off; 0 leaves the plug on
        #[arg(long, default_value_t = 0)]
        minutes: u32,
    },
    /// Switch the plug off
    Off {
        /// IP address of the plug
        #[arg(long)]
        ip: IpAddr,
        /// MAC address of the plug, e.g. ac:cf:23:00:11:22
        #[arg(long)]
        mac: MacAddress,
    },
    /// Broadcast a discovery probe and list responding plugs
    Discover {
        /// Seconds to listen for replies
        #[arg(long, default_value_t = 3)]
        wait: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut ctl = DeviceController::new(NoopScheduler, ControllerConfig::default())
        .context("binding UDP port 10000 (is another session already running?)")?;

    match args.command {
        CliCommand::On { ip, mac, minutes } => {
            let report = ctl.power_on(SocketAddr::new(ip, orvibo::PORT), mac, minutes)?;
            print_report(&report)
        }
        CliCommand::Off { ip, mac } => {
            let report = ctl.power_off(SocketAddr::new(ip, orvibo::PORT), mac)?;
            print_report(&report)
        }
        CliCommand::Discover { wait } => {
            let plugs = ctl.discover(Duration::from_secs(wait))?;
            if plugs.is_empty() {
                println!("no plugs answered");
            }
            for plug in plugs {
                println!(
                    "{}  {}  type={}  relay={}",
                    plug.addr.ip(),
                    plug.mac,
                    plug.soc,
                    if plug.state == 1 { "on" } else { "off" },
                );
            }
            Ok(())
        }
    }
}

fn print_report(report: &SwitchReport) -> anyhow::Result<()> {
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    if !report.acknowledged {
        anyhow::bail!("the plug did not acknowledge the command");
    }
    println!(
        "plug is {}",
        match report.state {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Unknown => "in an unknown state",
        }
    );
    Ok(())
}
