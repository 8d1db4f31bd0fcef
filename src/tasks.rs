use crate::logging::{LogLevel, log_message};
use crate::network::Uploader;
use crate::sampler::Sampler;
use crate::sensors::Sensor;
use crate::time_utils::Clock;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stop request shared between the signal handler and the collector.
pub(crate) struct Shutdown {
    requested: AtomicBool,
    signal: Signal<CriticalSectionRawMutex, ()>,
}

impl Shutdown {
    pub(crate) const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            signal: Signal::new(),
        }
    }

    pub(crate) fn trigger(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.signal.signal(())
        }
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        if self.is_triggered() {
            return;
        }

        self.signal.wait().await
    }
}

/// Collect a batch, upload it, repeat until shutdown.
///
/// Uploading never overlaps sampling: the next window starts only after
/// `send` has returned.
pub(crate) async fn collector_task<S: Sensor, C: Clock, U: Uploader>(
    sampler: &mut Sampler<S, C>,
    uploader: &U,
    shutdown: &Shutdown,
) {
    log_message(LogLevel::Info, "📡 Collector running");

    loop {
        let batch = match sampler.collect_batch(shutdown).await {
            Ok(Some(batch)) => batch,
            Ok(None) => break,
            Err(fault) => {
                log_message(LogLevel::Error, &format!("{:#}", fault));
                continue;
            }
        };

        if shutdown.is_triggered() {
            log_message(
                LogLevel::Warn,
                &format!("Shutdown requested, batch of {} readings not sent", batch.len()),
            );
            break;
        }

        uploader.send(batch);
    }

    log_message(LogLevel::Info, "📡 Collector stopped");
}
