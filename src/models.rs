use crate::time_utils::format_timestamp;
use anyhow::Context;
use chrono::NaiveDateTime;
use serde::Serialize;

/// One compensated BME680 measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Reading {
    pub(crate) temperature: f32,
    pub(crate) pressure: f32,
    pub(crate) humidity: f32,
    pub(crate) gas_resistance: Option<f32>,
}

/// Readings of one upload window, sealed with the time of the last reading.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Batch {
    pub(crate) readings: Vec<Reading>,
    pub(crate) closed_at: NaiveDateTime,
}

impl Batch {
    pub(crate) fn len(&self) -> usize {
        self.readings.len()
    }

    pub(crate) fn values(&self, metric: Metric) -> impl Iterator<Item = f32> + '_ {
        self.readings.iter().map(move |r| match metric {
            Metric::Temperature => r.temperature,
            Metric::Pressure => r.pressure,
            Metric::Humidity => r.humidity,
        })
    }

    pub(crate) fn timestamp(&self) -> String {
        format_timestamp(&self.closed_at)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Metric {
    Temperature,
    Pressure,
    Humidity,
}

impl Metric {
    /// Upload order.
    pub(crate) const ALL: [Metric; 3] = [Metric::Temperature, Metric::Pressure, Metric::Humidity];

    pub(crate) fn name(self) -> &'static str {
        match self {
            Metric::Temperature => "Temperature",
            Metric::Pressure => "Pressure",
            Metric::Humidity => "Humidity",
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub(crate) struct MetricSample {
    pub(crate) dimension1: &'static str,
    pub(crate) dimension2: String,
    pub(crate) value: f64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub(crate) struct Payload {
    pub(crate) data: Vec<MetricSample>,
}

impl Payload {
    pub(crate) fn from_batch(batch: &Batch) -> anyhow::Result<Self> {
        let timestamp = batch.timestamp();

        let mut data = Vec::with_capacity(Metric::ALL.len());
        for metric in Metric::ALL {
            let value = mean(batch.values(metric))
                .with_context(|| format!("cannot average an empty {} series", metric.name()))?;

            data.push(MetricSample {
                dimension1: metric.name(),
                dimension2: timestamp.clone(),
                value,
            });
        }

        Ok(Self { data })
    }
}

pub(crate) fn mean(values: impl IntoIterator<Item = f32>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0_f64, 0_usize), |(sum, count), v| (sum + f64::from(v), count + 1));

    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
pub(crate) fn reading(temperature: f32, pressure: f32, humidity: f32) -> Reading {
    Reading {
        temperature,
        pressure,
        humidity,
        gas_resistance: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn mean_of_injected_values() {
        assert_eq!(mean([20.0, 22.0, 24.0]), Some(22.0));
        assert_eq!(mean([1013.25]), Some(1013.25));
        assert_eq!(mean(std::iter::empty::<f32>()), None);
    }

    #[test]
    fn payload_keeps_metric_order_and_timestamp() {
        let batch = Batch {
            readings: vec![
                reading(20.0, 1000.0, 50.0),
                reading(21.0, 1001.0, 51.0),
                reading(22.0, 1002.0, 52.0),
            ],
            closed_at: at(0, 0, 3),
        };

        let payload = Payload::from_batch(&batch).unwrap();

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"data": [
                {"dimension1": "Temperature", "dimension2": "2024-01-01 00:00:03", "value": 21.0},
                {"dimension1": "Pressure", "dimension2": "2024-01-01 00:00:03", "value": 1001.0},
                {"dimension1": "Humidity", "dimension2": "2024-01-01 00:00:03", "value": 51.0}
            ]})
        );
    }

    #[test]
    fn empty_batch_cannot_be_averaged() {
        let batch = Batch {
            readings: Vec::new(),
            closed_at: at(12, 0, 0),
        };

        let err = Payload::from_batch(&batch).unwrap_err();
        assert!(err.to_string().contains("Temperature"));
    }
}
