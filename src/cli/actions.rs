use anyhow::{anyhow, Result};
use clap::ArgMatches;
use serde::Serialize;
use std::{sync::Arc, time::Duration};

use super::load_config;
use crate::{
    api,
    config::ControllerConfig,
    controller::Controller,
    driver::snapshot::{HealthReport, MachineInfo, MachineStatus},
    error::MachineError,
    events::MachineEvent,
    orchestrator::DeliveryRecord,
    protocol::registers::{register_at, CoffeeType},
    tasks::{run_blocking, spawn_health_scheduler},
    utils::enumerate_ports,
};

/// Execute the parsed command line.
pub async fn run(matches: ArgMatches) -> Result<()> {
    let config = load_config(&matches)?;
    let json = matches.get_flag("json");

    match matches.subcommand() {
        Some(("serve", _)) => serve(config).await,
        Some(("config", _)) => {
            if json {
                println!("{}", config.to_json()?);
            } else {
                print!("{}", config.to_toml()?);
            }
            Ok(())
        }
        Some(("ports", _)) => {
            let ports = enumerate_ports();
            if json {
                return print_json(&ports);
            }
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "{} ({}, {:04x}:{:04x} {})",
                        port.port_name,
                        port.port_type,
                        vid,
                        pid,
                        port.product.as_deref().unwrap_or("")
                    ),
                    _ => println!("{} ({})", port.port_name, port.port_type),
                }
            }
            Ok(())
        }
        Some((name, sub)) => {
            let (controller, _events) = Controller::from_config(config);
            let controller = Arc::new(controller);
            let result = one_shot(controller.clone(), name, sub, json).await;
            run_blocking(move || controller.shutdown()).await?;
            result
        }
        None => Err(anyhow!("No command given")),
    }
}

async fn one_shot(
    controller: Arc<Controller>,
    name: &str,
    sub: &ArgMatches,
    json: bool,
) -> Result<()> {
    match name {
        "info" => {
            let info = run_blocking(move || controller.info()).await?;
            if json {
                return print_json(&info);
            }
            print_info(&info);
            if !info.connection_status {
                return Err(anyhow!("Machine not connected on {}", info.port));
            }
            Ok(())
        }
        "status" => {
            let status = run_blocking(move || controller.status()).await?;
            if json {
                return print_json(&status);
            }
            print_status(&status);
            if !status.connected {
                return Err(anyhow!("Machine not connected"));
            }
            Ok(())
        }
        "health" => {
            let health = run_blocking(move || controller.run_health_check()).await?;
            if json {
                return print_json(&health);
            }
            print_health(&health);
            Ok(())
        }
        "deliver" => {
            let group = required_group(sub)?;
            let coffee_type = sub
                .get_one::<String>("coffee-type")
                .ok_or_else(|| anyhow!("--coffee-type is required"))?;
            let coffee_type = CoffeeType::parse(coffee_type)?;
            let wait = sub.get_flag("wait");
            let attempt = run_blocking(move || {
                if wait {
                    controller.orchestrator().deliver_and_wait(group, coffee_type)
                } else {
                    controller.deliver(group, coffee_type)
                }
            })
            .await?;
            let receipt = attempt.result?;
            if json {
                return print_json(&serde_json::json!({
                    "receipt": receipt,
                    "delivery": attempt.record,
                }));
            }
            println!("{}", receipt.message);
            if let Some(record) = attempt.record {
                print_record(&record);
            }
            Ok(())
        }
        "stop" => {
            let group = required_group(sub)?;
            let stopped = run_blocking(move || controller.stop(group)).await??;
            report(json, &format!("Stop command sent to group {group}"), stopped)
        }
        "purge" => {
            let group = required_group(sub)?;
            run_blocking(move || controller.purge(group)).await??;
            report(json, &format!("Purge started on group {group}"), None)
        }
        "water" => {
            let set = required_set(sub)?;
            run_blocking(move || controller.water(set)).await??;
            report(json, &format!("Hot water command {set} sent"), None)
        }
        "mat" => {
            let set = required_set(sub)?;
            run_blocking(move || controller.mat(set)).await??;
            report(json, &format!("MAT command {set} sent"), None)
        }
        "scan" => {
            let start = *sub.get_one::<u16>("start").unwrap_or(&0);
            let end = *sub.get_one::<u16>("end").unwrap_or(&start);
            if end < start {
                return Err(anyhow!("Scan range is empty: {start}..={end}"));
            }
            let found = run_blocking(move || scan(&controller, start, end)).await??;
            if json {
                return print_json(&found);
            }
            if found.is_empty() {
                println!("No readable registers in {start}..={end}");
            }
            for reg in found {
                println!(
                    "0x{:04X} ({:>5}) = 0x{:04X} ({}){}",
                    reg.address,
                    reg.address,
                    reg.value,
                    reg.value,
                    reg.name.map(|n| format!("  {n}")).unwrap_or_default()
                );
            }
            Ok(())
        }
        other => Err(anyhow!("Unknown command: {other}")),
    }
}

async fn serve(config: ControllerConfig) -> Result<()> {
    let bind = config.http.bind.clone();
    let interval = config.scheduler.health_interval_secs;
    let (controller, events) = Controller::from_config(config);
    let controller = Arc::new(controller);

    let drain = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            log_event(&event);
        }
    });

    // Best effort: the API answers with the not-connected shapes until the
    // machine comes up.
    let connector = controller.clone();
    if let Err(err) = run_blocking(move || connector.connect(None, None)).await? {
        log::warn!("Machine not reachable at startup: {err}");
    }

    let scheduler = if interval > 0 {
        log::info!("Health check every {interval}s");
        Some(spawn_health_scheduler(
            controller.clone(),
            Duration::from_secs(interval),
        ))
    } else {
        None
    };

    let result = api::serve(controller.clone(), &bind, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {err}");
        }
        log::info!("Shutdown requested");
    })
    .await;

    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    run_blocking(move || controller.shutdown()).await?;
    drain.abort();
    result
}

fn log_event(event: &MachineEvent) {
    match event {
        MachineEvent::Delivery(record) => log::info!(
            "delivery {} on group {}: {}",
            record.id,
            record.group_number,
            record.status
        ),
        MachineEvent::Maintenance(entry) => log::debug!(
            "maintenance event {}: {}",
            entry.kind,
            entry.description
        ),
    }
}

#[derive(Debug, Serialize)]
struct ScannedRegister {
    address: u16,
    value: u16,
    name: Option<&'static str>,
}

/// Read every address in the range one word at a time. Rejected addresses
/// are skipped; losing the line aborts the scan.
fn scan(controller: &Controller, start: u16, end: u16) -> Result<Vec<ScannedRegister>> {
    let machine = controller.machine();
    machine.connect()?;
    let mut found = Vec::new();
    for address in start..=end {
        match machine.read_registers(address, 1) {
            Ok(words) => {
                if let Some(&value) = words.first() {
                    found.push(ScannedRegister {
                        address,
                        value,
                        name: register_at(address).map(|reg| reg.name),
                    });
                }
            }
            Err(
                err @ (MachineError::ConnectionFailed { .. }
                | MachineError::ConnectionUnavailable { .. }),
            ) => return Err(err.into()),
            Err(err) => log::debug!("register 0x{address:04X} not readable: {err}"),
        }
    }
    Ok(found)
}

fn required_group(sub: &ArgMatches) -> Result<u8> {
    sub.get_one::<u8>("group")
        .copied()
        .ok_or_else(|| anyhow!("--group is required"))
}

fn required_set(sub: &ArgMatches) -> Result<u16> {
    sub.get_one::<u16>("set")
        .copied()
        .ok_or_else(|| anyhow!("--set is required"))
}

fn report(json: bool, message: &str, record: Option<DeliveryRecord>) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "success": true,
            "message": message,
            "delivery": record,
        }));
    }
    println!("{message}");
    if let Some(record) = record {
        print_record(&record);
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn or_unknown<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn print_info(info: &MachineInfo) {
    println!("Port:             {} @ {} baud", info.port, info.baudrate);
    println!(
        "Connected:        {}",
        if info.connection_status { "yes" } else { "no" }
    );
    println!("Serial number:    {}", or_unknown(info.serial_number.as_ref()));
    println!(
        "Firmware:         {}",
        or_unknown(info.firmware_version.as_ref())
    );
    println!("Groups:           {}", or_unknown(info.number_of_groups));
    println!("Blocked:          {}", or_unknown(info.is_blocked));
    if let Some(config) = &info.machine_config {
        println!(
            "Configuration:    {} dose(s) (raw 0x{:04X})",
            config.doses_available, config.raw_config
        );
    }
}

fn print_status(status: &MachineStatus) {
    if !status.connected {
        println!("Not connected");
        return;
    }
    println!("Blocked: {}", or_unknown(status.machine_blocked));
    for (name, group) in &status.groups {
        println!(
            "{name}: {} (busy={}, sensor_fault={}, purge_in={}s)",
            group.current_action.as_deref().unwrap_or("unknown"),
            or_unknown(group.is_busy),
            or_unknown(group.sensor_fault),
            or_unknown(group.purge_countdown)
        );
    }
}

fn print_health(health: &HealthReport) {
    println!("Overall: {}", health.overall_status);
    println!(
        "Connection: {}",
        if health.connection { "ok" } else { "down" }
    );
    for error in &health.errors {
        println!("  error:   {error}");
    }
    for warning in &health.warnings {
        println!("  warning: {warning}");
    }
}

fn print_record(record: &DeliveryRecord) {
    println!(
        "Delivery #{}: {} on group {} is {}{}",
        record.id,
        record.coffee_type.label(),
        record.group_number,
        record.status,
        record
            .error_message
            .as_ref()
            .map(|m| format!(" ({m})"))
            .unwrap_or_default()
    );
}
