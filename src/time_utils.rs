use crate::config::TIMESTAMP_PATTERN;
use chrono::{Local, NaiveDateTime, Utc};
use chrono_tz::Tz;
use embassy_time::{Duration, Instant, Timer};

/// Time source of the sampling loop.
///
/// `now` is monotonic and drives the tick schedule, `local_now` is the
/// wall clock used to stamp readings.
pub(crate) trait Clock {
    fn now(&self) -> Instant;

    async fn sleep_until(&mut self, deadline: Instant);

    fn local_now(&self) -> NaiveDateTime;
}

pub(crate) struct SystemClock {
    timezone: Option<Tz>,
}

impl SystemClock {
    pub(crate) fn new(timezone: Option<Tz>) -> Self {
        Self { timezone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        Timer::at(deadline).await
    }

    fn local_now(&self) -> NaiveDateTime {
        match &self.timezone {
            Some(tz) => Utc::now().with_timezone(tz).naive_local(),
            None => Local::now().naive_local(),
        }
    }
}

/// Next tick deadline, snapped to the cadence boundary after `now`.
///
/// Overruns shorter than one interval keep the regular cadence, longer ones
/// skip the missed boundaries instead of bursting to catch up. A wake-up
/// before the deadline leaves it untouched.
pub(crate) fn advance_deadline(next_tick: Instant, now: Instant, interval: Duration) -> Instant {
    if now < next_tick {
        return next_tick;
    }

    let overrun = (now - next_tick).as_ticks();
    let step = interval.as_ticks().max(1);
    let missed = overrun / step;

    next_tick + Duration::from_ticks(missed * step + step)
}

pub(crate) fn format_timestamp(at: &NaiveDateTime) -> String {
    at.format(TIMESTAMP_PATTERN).to_string()
}

pub(crate) fn get_uptime_string() -> String {
    let micros = Instant::now().as_micros();
    let seconds = micros / 1_000_000;
    let millis = (micros % 1_000_000) / 1_000;
    format!("[{:>4}.{:03}s]", seconds, millis)
}
