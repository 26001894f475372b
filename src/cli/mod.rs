pub mod actions;

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::config::ControllerConfig;

fn group_arg() -> Arg {
    Arg::new("group")
        .long("group")
        .short('g')
        .help("Group number (1-4)")
        .value_name("N")
        .required(true)
        .value_parser(clap::value_parser!(u8))
}

fn set_arg() -> Arg {
    Arg::new("set")
        .long("set")
        .help("Dose selection: 0 stops, 1 or 2 dispenses")
        .value_name("SET")
        .required(true)
        .value_parser(clap::value_parser!(u16))
}

/// Build the command line interface.
pub fn build_cli() -> Command {
    Command::new("brewctl")
        .about("Supervisory controller for multi-group espresso machines over Modbus RTU")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Configuration file (TOML, or JSON when the extension is .json)")
                .value_name("PATH")
                .global(true),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .help("Serial port of the machine")
                .value_name("PORT")
                .global(true),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .short('b')
                .help("Baud rate (8N1)")
                .value_name("BAUD")
                .value_parser(clap::value_parser!(u32))
                .global(true),
        )
        .arg(
            Arg::new("slave-id")
                .long("slave-id")
                .help("Modbus slave address of the machine")
                .value_name("ID")
                .value_parser(clap::value_parser!(u8))
                .global(true),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .help("Per-request timeout in milliseconds")
                .value_name("MS")
                .value_parser(clap::value_parser!(u64))
                .global(true),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .help("Talk to the built-in machine simulator instead of a serial port")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .short('j')
                .help("Output results in JSON format")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the HTTP API and the periodic health check")
                .arg(
                    Arg::new("bind")
                        .long("bind")
                        .help("Listen address of the HTTP API")
                        .value_name("ADDR"),
                )
                .arg(
                    Arg::new("health-interval")
                        .long("health-interval")
                        .help("Seconds between health checks (0 disables them)")
                        .value_name("SECS")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(Command::new("info").about("Show machine identification"))
        .subcommand(Command::new("status").about("Show the status of every group"))
        .subcommand(Command::new("health").about("Run a health check"))
        .subcommand(
            Command::new("deliver")
                .about("Start a coffee delivery")
                .arg(group_arg())
                .arg(
                    Arg::new("coffee-type")
                        .long("coffee-type")
                        .short('t')
                        .help("single_short, single_medium, single_long, double_short, double_medium or double_long")
                        .value_name("TYPE")
                        .required(true),
                )
                .arg(
                    Arg::new("wait")
                        .long("wait")
                        .short('w')
                        .help("Wait until the delivery finishes")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("stop")
                .about("Stop the delivery on a group")
                .arg(group_arg()),
        )
        .subcommand(
            Command::new("purge")
                .about("Start a purge on a group")
                .arg(group_arg()),
        )
        .subcommand(
            Command::new("water")
                .about("Hot water dispenser")
                .arg(set_arg()),
        )
        .subcommand(
            Command::new("mat")
                .about("MAT dispenser")
                .arg(set_arg()),
        )
        .subcommand(
            Command::new("scan")
                .about("Read every holding register in a range and report the readable ones")
                .arg(
                    Arg::new("start")
                        .long("start")
                        .help("First address")
                        .value_name("ADDR")
                        .default_value("0")
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("end")
                        .long("end")
                        .help("Last address (inclusive)")
                        .value_name("ADDR")
                        .default_value("527")
                        .value_parser(clap::value_parser!(u16)),
                ),
        )
        .subcommand(Command::new("ports").about("List serial ports visible to this host"))
        .subcommand(Command::new("config").about("Print the effective configuration"))
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_cli().get_matches()
}

/// Effective configuration: file (or defaults), then `BREWCTL_*`
/// environment variables, then command line flags.
pub fn load_config(matches: &ArgMatches) -> Result<ControllerConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };
    config.apply_env()?;
    apply_flags(&mut config, matches);
    config.validate()?;
    Ok(config)
}

fn apply_flags(config: &mut ControllerConfig, matches: &ArgMatches) {
    if let Some(port) = matches.get_one::<String>("port") {
        config.serial.port = port.clone();
    }
    if let Some(baud) = matches.get_one::<u32>("baud") {
        config.serial.baud_rate = *baud;
    }
    if let Some(id) = matches.get_one::<u8>("slave-id") {
        config.serial.slave_id = *id;
    }
    if let Some(timeout) = matches.get_one::<u64>("timeout-ms") {
        config.serial.timeout_ms = *timeout;
    }
    if matches.get_flag("simulate") {
        config.simulate = true;
    }
    if let Some(("serve", serve)) = matches.subcommand() {
        if let Some(bind) = serve.get_one::<String>("bind") {
            config.http.bind = bind.clone();
        }
        if let Some(interval) = serve.get_one::<u64>("health-interval") {
            config.scheduler.health_interval_secs = *interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_flags_override_config() {
        let matches = build_cli()
            .try_get_matches_from([
                "brewctl",
                "--port",
                "/dev/ttyS3",
                "--baud",
                "19200",
                "--simulate",
                "serve",
                "--bind",
                "0.0.0.0:9000",
                "--health-interval",
                "0",
            ])
            .unwrap();
        let mut config = ControllerConfig::default();
        apply_flags(&mut config, &matches);
        assert_eq!(config.serial.port, "/dev/ttyS3");
        assert_eq!(config.serial.baud_rate, 19200);
        assert!(config.simulate);
        assert_eq!(config.http.bind, "0.0.0.0:9000");
        assert_eq!(config.scheduler.health_interval_secs, 0);
    }

    #[test]
    fn test_deliver_requires_group_and_type() {
        assert!(build_cli()
            .try_get_matches_from(["brewctl", "deliver", "--group", "1"])
            .is_err());
        let matches = build_cli()
            .try_get_matches_from(["brewctl", "deliver", "-g", "2", "-t", "double_long", "--json"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "deliver");
        assert_eq!(sub.get_one::<u8>("group"), Some(&2));
        assert!(sub.get_flag("json"));
    }
}
