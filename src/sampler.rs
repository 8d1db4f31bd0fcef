use crate::config::Settings;
use crate::logging::{log_reading, log_sensor_error};
use crate::models::Batch;
use crate::sensors::Sensor;
use crate::tasks::Shutdown;
use crate::time_utils::{Clock, advance_deadline, format_timestamp};
use anyhow::{Context, bail};
use embassy_futures::select::{Either, select};
use embassy_time::Duration;

/// Owns the tick cadence and the batch being filled.
pub(crate) struct Sampler<S, C> {
    sensor: S,
    clock: C,
    interval: Duration,
    batch_size: usize,
    max_missed_ticks: Option<u32>,
}

impl<S: Sensor, C: Clock> Sampler<S, C> {
    pub(crate) fn new(sensor: S, clock: C, settings: &Settings) -> Self {
        Self {
            sensor,
            clock,
            interval: settings.polling_interval(),
            batch_size: settings.batch_size(),
            max_missed_ticks: settings.max_missed_ticks,
        }
    }

    /// Blocks until `batch_size` readings are collected.
    ///
    /// Returns `Ok(None)` once shutdown is requested; the partial batch is
    /// dropped. Ticks without data do not count towards the batch.
    pub(crate) async fn collect_batch(
        &mut self,
        shutdown: &Shutdown,
    ) -> anyhow::Result<Option<Batch>> {
        let mut readings = Vec::with_capacity(self.batch_size);
        let mut closed_at = None;
        let mut missed_ticks = 0_u32;
        let mut next_tick = self.clock.now() + self.interval;

        while readings.len() < self.batch_size {
            if shutdown.is_triggered() {
                return Ok(None);
            }

            if let Either::Second(()) =
                select(self.clock.sleep_until(next_tick), shutdown.wait()).await
            {
                return Ok(None);
            }

            match self.sensor.poll() {
                Ok(Some(reading)) => {
                    let at = self.clock.local_now();
                    log_reading(&format_timestamp(&at), &reading);

                    readings.push(reading);
                    closed_at = Some(at);
                    missed_ticks = 0;
                }
                Ok(None) => missed_ticks += 1,
                Err(e) => {
                    log_sensor_error("BME680", e);
                    missed_ticks += 1;
                }
            }

            if let Some(limit) = self.max_missed_ticks
                && missed_ticks >= limit
            {
                bail!(
                    "‼️ BME680 returned no data for {} consecutive ticks, dropping {} readings",
                    missed_ticks,
                    readings.len()
                );
            }

            next_tick = advance_deadline(next_tick, self.clock.now(), self.interval);
        }

        let closed_at = closed_at.context("batch closed without any reading")?;
        Ok(Some(Batch {
            readings,
            closed_at,
        }))
    }

    #[cfg(test)]
    pub(crate) fn parts(&self) -> (&S, &C) {
        (&self.sensor, &self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{READINGS_TARGET, capture};
    use crate::models::{Payload, reading};
    use crate::sensors::tests::ScriptedSensor;
    use crate::time_utils::tests::FakeClock;
    use embassy_futures::block_on;
    use embassy_time::Instant;
    use log::Level;

    fn settings(polling_rate: u64, upload_frequency: u64) -> Settings {
        Settings::parse(&format!(
            r#"{{"polling_rate": {polling_rate}, "upload_frequency": {upload_frequency},
                "user": "u", "password": "p", "url": "http://h/"}}"#
        ))
        .unwrap()
    }

    fn steady(n: usize) -> ScriptedSensor {
        ScriptedSensor::new((0..n).map(|i| Some(reading(20.0 + i as f32, 1000.0, 50.0))))
    }

    #[test]
    fn batch_holds_window_over_interval_readings() {
        for (p, w) in [(1, 1), (1, 3), (2, 10), (5, 60), (3, 3)] {
            let expected = (w / p) as usize;
            let mut sampler = Sampler::new(steady(expected), FakeClock::new(), &settings(p, w));

            let batch = block_on(sampler.collect_batch(&Shutdown::new()))
                .unwrap()
                .unwrap();

            assert_eq!(batch.len(), expected, "polling {p}s, window {w}s");
            assert_eq!(sampler.parts().1.wakes.len(), expected);
        }
    }

    #[test]
    fn ticks_follow_the_cadence() {
        let mut sampler = Sampler::new(steady(4), FakeClock::new(), &settings(2, 8));

        block_on(sampler.collect_batch(&Shutdown::new())).unwrap();

        let wakes = &sampler.parts().1.wakes;
        assert_eq!(
            wakes,
            &[2, 4, 6, 8].map(Instant::from_secs).to_vec()
        );
    }

    #[test]
    fn slow_tick_skips_to_next_boundary() {
        // second wake-up lands 2.5 intervals late
        let clock = FakeClock::with_latencies([
            Duration::from_ticks(0),
            Duration::from_millis(2_500),
        ]);
        let mut sampler = Sampler::new(steady(3), clock, &settings(1, 3));

        block_on(sampler.collect_batch(&Shutdown::new())).unwrap();

        let wakes = &sampler.parts().1.wakes;
        assert_eq!(
            wakes,
            &vec![
                Instant::from_secs(1),
                Instant::from_millis(4_500),
                Instant::from_secs(5),
            ]
        );
    }

    #[test]
    fn failed_read_wastes_a_tick_silently() {
        capture::start();
        let sensor = ScriptedSensor::new([
            Some(reading(20.0, 1000.0, 50.0)),
            None,
            Some(reading(22.0, 1002.0, 52.0)),
        ]);
        let mut sampler = Sampler::new(sensor, FakeClock::new(), &settings(1, 2));

        let batch = block_on(sampler.collect_batch(&Shutdown::new()))
            .unwrap()
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(sampler.parts().0.polls, 3);
        assert_eq!(sampler.parts().1.wakes.len(), 3);
        assert_eq!(batch.timestamp(), "2024-01-01 00:00:03");
        assert_eq!(capture::lines(READINGS_TARGET, Level::Info).len(), 2);
    }

    #[test]
    fn bus_errors_count_as_missed_ticks() {
        let sensor = ScriptedSensor::with_results([
            Err(anyhow::anyhow!("NoAcknowledge")),
            Ok(Some(reading(20.0, 1000.0, 50.0))),
        ]);
        let mut sampler = Sampler::new(sensor, FakeClock::new(), &settings(1, 1));

        let batch = block_on(sampler.collect_batch(&Shutdown::new()))
            .unwrap()
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(sampler.parts().0.polls, 2);
    }

    #[test]
    fn end_to_end_window_means() {
        capture::start();
        let sensor = ScriptedSensor::new([
            Some(reading(20.0, 1000.0, 50.0)),
            Some(reading(21.0, 1001.0, 51.0)),
            Some(reading(22.0, 1002.0, 52.0)),
        ]);
        let mut sampler = Sampler::new(sensor, FakeClock::new(), &settings(1, 3));

        let batch = block_on(sampler.collect_batch(&Shutdown::new()))
            .unwrap()
            .unwrap();
        let payload = Payload::from_batch(&batch).unwrap();

        let summary: Vec<_> = payload
            .data
            .iter()
            .map(|s| (s.dimension1, s.dimension2.as_str(), s.value))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("Temperature", "2024-01-01 00:00:03", 21.0),
                ("Pressure", "2024-01-01 00:00:03", 1001.0),
                ("Humidity", "2024-01-01 00:00:03", 51.0),
            ]
        );
        assert_eq!(
            capture::lines(READINGS_TARGET, Level::Info),
            vec![
                "2024-01-01 00:00:01,20.00 C,1000.00 hPa,50.000 %RH".to_string(),
                "2024-01-01 00:00:02,21.00 C,1001.00 hPa,51.000 %RH".to_string(),
                "2024-01-01 00:00:03,22.00 C,1002.00 hPa,52.000 %RH".to_string(),
            ]
        );
    }

    #[test]
    fn stalled_sensor_reports_fault() {
        let mut config = settings(1, 5);
        config.max_missed_ticks = Some(3);
        let sensor = ScriptedSensor::new([Some(reading(20.0, 1000.0, 50.0))]);
        let mut sampler = Sampler::new(sensor, FakeClock::new(), &config);

        let err = block_on(sampler.collect_batch(&Shutdown::new())).unwrap_err();

        assert!(err.to_string().contains("3 consecutive ticks"));
        assert_eq!(sampler.parts().0.polls, 4);
    }

    #[test]
    fn shutdown_stops_before_next_tick() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut sampler = Sampler::new(steady(3), FakeClock::new(), &settings(1, 3));

        let batch = block_on(sampler.collect_batch(&shutdown)).unwrap();

        assert_eq!(batch, None);
        assert_eq!(sampler.parts().0.polls, 0);
    }
}
