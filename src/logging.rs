use crate::models::Reading;
use crate::time_utils::get_uptime_string;
use log::{debug, error, info, warn};

/// Target of the per-reading record lines.
pub(crate) const READINGS_TARGET: &str = "readings";

const SPLASH_SCREEN: &str = r#"
  ____  __  __ _____  __   ___   ___
 | __ )|  \/  | ____|/ /_ ( _ ) / _ \
 |  _ \| |\/| |  _| | '_ \/ _ \| | | |
 | |_) | |  | | |___| (_) | (_) | |_| |
 |____/|_|  |_|_____|\___/ \___/ \___/   analytics"#;

pub(crate) enum LogLevel {
    Info,
    Warn,
    Error,
}

/// `RUST_LOG` overrides the default `info` filter.
pub(crate) fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

pub(crate) fn print_splash_screen() {
    info!("{}", SPLASH_SCREEN);
}

/// One CSV-like line per successful tick: `timestamp,temp C,pressure hPa,humidity %RH`.
pub(crate) fn log_reading(timestamp: &str, data: &Reading) {
    info!(
        target: READINGS_TARGET,
        "{},{:.2} C,{:.2} hPa,{:.3} %RH",
        timestamp, data.temperature, data.pressure, data.humidity
    );

    if let Some(gas) = data.gas_resistance {
        debug!(target: READINGS_TARGET, "🍃 Gas resistance: {:.0} Ohm", gas);
    }
}

pub(crate) fn log_sensor_error(sensor_name: &str, error: impl std::fmt::Debug) {
    log_message(
        LogLevel::Error,
        &format!("🚫 {} Error: {:?}", sensor_name, error),
    );
}

pub(crate) fn log_message(level: LogLevel, message: &str) {
    let prefix = get_uptime_string();

    match level {
        LogLevel::Error => error!("\x1b[31m{} {}\x1b[0m", prefix, message),
        LogLevel::Warn => warn!("\x1b[38;5;11m{} {}\x1b[0m", prefix, message),
        LogLevel::Info => info!("\x1b[38;5;40m{} {}\x1b[0m", prefix, message),
    }
}
