mod bme680;
mod config;
mod logging;
mod models;
mod network;
mod sampler;
mod sensors;
mod tasks;
mod time_utils;

use crate::config::Settings;
use crate::network::HttpClient;
use crate::sampler::Sampler;
use crate::tasks::{Shutdown, collector_task};
use crate::time_utils::SystemClock;
use anyhow::Context;
use embassy_executor::Spawner;
use log::{error, info};

static SHUTDOWN: Shutdown = Shutdown::new();

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    logging::init();
    logging::print_splash_screen();

    let code = match Box::pin(run()).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };

    std::process::exit(code);
}

async fn run() -> anyhow::Result<()> {
    let path = config::config_path()?;
    let settings = Settings::load(&path)?;
    info!(
        "⚙️ Config {}: tick every {}s, upload every {}s ({} readings)",
        path.display(),
        settings.polling_rate,
        settings.upload_frequency,
        settings.batch_size()
    );

    ctrlc::set_handler(|| SHUTDOWN.trigger()).context("‼️ Failed to install signal handler")?;

    let station = sensors::open_station(&settings)?;

    let clock = SystemClock::new(settings.timezone()?);
    let mut sampler = Sampler::new(station, clock, &settings);
    let client = HttpClient::new(&settings)?;

    collector_task(&mut sampler, &client, &SHUTDOWN).await;

    Ok(())
}
