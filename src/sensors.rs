use crate::bme680::{Bme680, GasHeater, SensorSettings};
use crate::config::Settings;
use crate::logging::{LogLevel, log_message};
use crate::models::Reading;
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

/// Source of one measurement per tick.
pub(crate) trait Sensor {
    /// `Ok(None)` when the device has no new data for this tick.
    fn poll(&mut self) -> anyhow::Result<Option<Reading>>;
}

pub(crate) struct WeatherStation<I2C, D> {
    bme680: Bme680<I2C, D>,
}

impl<I2C: I2c, D: DelayNs> WeatherStation<I2C, D> {
    pub(crate) fn new(i2c: I2C, delay: D, settings: &Settings) -> anyhow::Result<Self> {
        let mut bme680 = Bme680::new(i2c, delay)?;
        bme680.setup(&sensor_settings(settings))?;
        log_message(
            LogLevel::Info,
            &format!("✅ BME680 at {:#04x} initialized successfully!", bme680.address()),
        );

        Ok(Self { bme680 })
    }
}

impl<I2C: I2c, D: DelayNs> Sensor for WeatherStation<I2C, D> {
    fn poll(&mut self) -> anyhow::Result<Option<Reading>> {
        self.bme680.read_measurements()
    }
}

fn sensor_settings(settings: &Settings) -> SensorSettings {
    SensorSettings {
        temperature_offset: settings.temp_offset.unwrap_or(0.0),
        gas_heater: settings.enable_gas_sensor.then(GasHeater::default),
        ..SensorSettings::default()
    }
}

/// BME680 on I2C bus 1 of the Raspberry Pi header.
#[cfg(target_os = "linux")]
pub(crate) type HostStation = WeatherStation<rppal::i2c::I2c, rppal::hal::Delay>;

#[cfg(target_os = "linux")]
pub(crate) fn open_station(settings: &Settings) -> anyhow::Result<HostStation> {
    use anyhow::Context;

    let i2c = rppal::i2c::I2c::new().context("‼️ Failed to open the I2C bus")?;
    WeatherStation::new(i2c, rppal::hal::Delay::new(), settings)
}

#[cfg(not(target_os = "linux"))]
pub(crate) struct HostStation;

#[cfg(not(target_os = "linux"))]
pub(crate) fn open_station(_settings: &Settings) -> anyhow::Result<HostStation> {
    anyhow::bail!("‼️ I2C access is only supported on Linux hosts")
}

#[cfg(not(target_os = "linux"))]
impl Sensor for HostStation {
    fn poll(&mut self) -> anyhow::Result<Option<Reading>> {
        anyhow::bail!("no I2C bus on this platform")
    }
}
