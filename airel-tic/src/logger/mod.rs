//! Continuous records logging.
//!
//! Drives one or many TICs through a wall-clock-aligned measurement cycle
//! and stores the records they emit in daily Retrospect-compatible files.
//! [`run`] supervises a single device with reconnection; [`run_many`]
//! spawns one worker per TIC found on the bus and keeps scanning for
//! newcomers.

mod config;
mod cycle;
mod records;

pub use config::{CyclePhase, LoggerConfig, PhaseMode};
pub use cycle::MeasurementCycle;
pub use records::{RecordsWriter, TimedFile, FIELDS, MONITORED_COUNTERS};

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::device::Tic;
use crate::error::Result;
use crate::tracing::prelude::*;
use crate::transport::usb::{UsbContext, UsbDeviceAddress, UsbTransport};
use crate::transport::PortSpec;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Run the logger against one device until `shutdown` fires.
///
/// Connection and device errors are logged and retried after a short
/// delay, so the logger rides out device resets and cable glitches.
pub async fn run(
    ctx: &UsbContext,
    spec: &PortSpec,
    config: &LoggerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting measurements");
    info!(?config, "Using configuration");

    while !shutdown.is_cancelled() {
        if let Err(e) = connect_and_collect(ctx, spec, config, &shutdown).await {
            error!(error = %e, "TIC error");
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    info!("Measurements stopped");
    Ok(())
}

async fn connect_and_collect(
    ctx: &UsbContext,
    spec: &PortSpec,
    config: &LoggerConfig,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut device = Tic::open(ctx, spec).await?;
    let result = collect_data(&mut device, config, shutdown).await;
    if let Err(e) = device.close().await {
        debug!(error = %e, "error while closing the device");
    }
    result
}

/// Supervise one worker per connected device until `shutdown` fires.
///
/// Workers that die release their bus address, so a replugged device is
/// picked up again by the next scan.
pub async fn run_many(
    ctx: &UsbContext,
    config: &LoggerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting logger manager");

    let mut exclude: HashSet<(u8, u8)> = HashSet::new();
    let mut workers: HashMap<(u8, u8), (UsbDeviceAddress, JoinHandle<()>)> = HashMap::new();

    loop {
        for addr in ctx.find_all(&exclude)? {
            info!(serial = %addr.serial_number, "Found new device");
            let key = (addr.bus, addr.address);
            let handle = tokio::spawn(run_device(
                ctx.clone(),
                addr.clone(),
                config.clone(),
                shutdown.clone(),
            ));
            workers.insert(key, (addr, handle));
            exclude.insert(key);
        }

        let dead: Vec<(u8, u8)> = workers
            .iter()
            .filter(|(_, (_, handle))| handle.is_finished())
            .map(|(key, _)| *key)
            .collect();
        for key in dead {
            if let Some((addr, handle)) = workers.remove(&key) {
                let _ = handle.await;
                exclude.remove(&key);
                info!(serial = %addr.serial_number, "Device worker stopped");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(DISCOVERY_INTERVAL) => {}
        }
    }

    for (_, (addr, handle)) in workers {
        info!(serial = %addr.serial_number, "Stopping worker");
        let _ = handle.await;
    }

    info!("Logger manager stopped");
    Ok(())
}

async fn run_device(
    ctx: UsbContext,
    addr: UsbDeviceAddress,
    config: LoggerConfig,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let result = async {
            let transport = UsbTransport::open_at(&ctx, &addr)?;
            let mut device = Tic::from_transport(Box::new(transport)).await?;
            let result = collect_data(&mut device, &config, &shutdown).await;
            if let Err(e) = device.close().await {
                debug!(error = %e, "error while closing the device");
            }
            result
        }
        .await;

        // The supervisor reaps this worker and rediscovers the device
        if let Err(e) = result {
            error!(serial = %addr.serial_number, error = %e, "TIC error");
            return;
        }
    }
}

async fn collect_data(
    device: &mut Tic,
    config: &LoggerConfig,
    shutdown: &CancellationToken,
) -> Result<()> {
    let system_info = device.get_system_info().await?;
    let serial_number = system_info
        .get("serial_number")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    info!(serial = %serial_number, "Connected");
    debug!(?system_info, "System info");
    let debug_info = device.get_debug_info().await?;
    debug!(?debug_info, "Debug info");

    device.reset_settings(Some(config.device_settings())).await?;
    let settings = device.get_settings().await?;
    info!(?settings, "Settings");

    let flag_descriptions = device.get_flag_descriptions().await?;
    debug!(?flag_descriptions, "Flag descriptions");

    let mut writer = RecordsWriter::new(Path::new("."), &serial_number);
    let mut cycle = MeasurementCycle::new(config.measurement_cycle.clone(), config.cycle_shift);
    let mut counters: HashMap<&str, i64> =
        MONITORED_COUNTERS.iter().map(|name| (*name, 0)).collect();

    while !shutdown.is_cancelled() {
        let now = Utc::now().with_timezone(&config.local_tz);
        let ts = now.timestamp_micros() as f64 / 1e6;

        if let Some(mode) = cycle.mode_due(ts) {
            info!(mode = ?mode, until = cycle.next_change(), "Set opmode");
            match mode {
                PhaseMode::Standard(mode) => device.set_mode(mode).await?,
                PhaseMode::Custom(params) => device.set_custom_mode(params).await?,
            }
        }

        let wait = (cycle.next_change() - ts).clamp(0.0, 1.0);
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = device.receive_message(Duration::from_secs_f64(wait)) => message?,
        };
        let Some(message) = message else { continue };

        match message.get("event").and_then(Value::as_str) {
            Some("record") => {
                let Some(record) = message.get("params").and_then(Value::as_object) else {
                    continue;
                };

                // The extended-fields setting may not have kicked in yet
                if !record.contains_key("a_electrometer_current_mean") {
                    continue;
                }

                let now = Utc::now().with_timezone(&config.local_tz);
                writer.append_record(record, &now)?;

                info!(
                    opmode = record.get("opmode").and_then(Value::as_str).unwrap_or("unknown"),
                    settling = record
                        .get("is_settling")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    pos_conc = record_field(record, "pos_concentration_mean"),
                    neg_conc = record_field(record, "neg_concentration_mean"),
                    a_current = record_field(record, "a_electrometer_current_mean"),
                    b_current = record_field(record, "b_electrometer_current_mean"),
                    "Record"
                );

                for name in MONITORED_COUNTERS {
                    let value = record.get(*name).and_then(Value::as_i64).unwrap_or(0);
                    let previous = counters.insert(*name, value).unwrap_or(0);
                    if value != previous {
                        info!(counter = *name, from = previous, to = value, "Counter changed");
                    }
                }
            }
            Some("raw_em_record") => {
                if let Some(params) = message.get("params").and_then(Value::as_object) {
                    let now = Utc::now().with_timezone(&chrono_tz::UTC);
                    writer.append_raw_em(params, &now)?;
                }
            }
            _ => debug!(message = %message, "Other message"),
        }
    }

    Ok(())
}

fn record_field(record: &serde_json::Map<String, Value>, name: &str) -> f64 {
    record.get(name).and_then(Value::as_f64).unwrap_or(f64::NAN)
}
