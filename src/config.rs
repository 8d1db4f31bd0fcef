use anyhow::{Context, bail};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub(crate) const TIMESTAMP_PATTERN: &str = "%Y-%m-%d %H:%M:%S";
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const CONFIG_FILE_NAME: &str = "bme680-nextcloud-analytics.json";
pub(crate) const CONFIG_PATH_ENV: &str = "BME680_ANALYTICS_CONFIG";

const DEFAULT_POLLING_RATE_S: u64 = 1;
const DEFAULT_UPLOAD_FREQUENCY_S: u64 = 60;

/// Contents of the JSON configuration file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct Settings {
    /// Seconds between two sensor ticks.
    #[serde(default = "default_polling_rate")]
    pub(crate) polling_rate: u64,
    /// Seconds covered by one uploaded batch.
    #[serde(default = "default_upload_frequency")]
    pub(crate) upload_frequency: u64,
    #[serde(default)]
    pub(crate) temp_offset: Option<f32>,
    #[serde(default)]
    pub(crate) enable_gas_sensor: bool,
    pub(crate) user: String,
    pub(crate) password: String,
    pub(crate) url: String,
    /// IANA zone used for the batch timestamps, host local time when absent.
    #[serde(default)]
    pub(crate) timezone: Option<String>,
    /// Consecutive empty ticks after which the current window is abandoned.
    #[serde(default)]
    pub(crate) max_missed_ticks: Option<u32>,
}

fn default_polling_rate() -> u64 {
    DEFAULT_POLLING_RATE_S
}

fn default_upload_frequency() -> u64 {
    DEFAULT_UPLOAD_FREQUENCY_S
}

impl Settings {
    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("‼️ Cannot read config file {}", path.display()))?;

        Self::parse(&raw)
    }

    pub(crate) fn parse(raw: &str) -> anyhow::Result<Self> {
        let settings: Settings =
            serde_json::from_str(raw).context("‼️ Invalid json in config file.")?;
        settings.validate()?;

        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.polling_rate == 0 {
            bail!("‼️ polling_rate must be at least 1 second");
        }

        if self.upload_frequency < self.polling_rate {
            bail!(
                "‼️ upload_frequency ({}s) must not be shorter than polling_rate ({}s)",
                self.upload_frequency,
                self.polling_rate
            );
        }

        // a window that is not a whole number of ticks can never be filled
        if self.upload_frequency % self.polling_rate != 0 {
            bail!(
                "‼️ upload_frequency ({}s) must be a multiple of polling_rate ({}s)",
                self.upload_frequency,
                self.polling_rate
            );
        }

        if self.max_missed_ticks == Some(0) {
            bail!("‼️ max_missed_ticks must be at least 1 when set");
        }

        Url::parse(&self.url).with_context(|| format!("‼️ Invalid upload url {:?}", self.url))?;
        self.timezone()?;

        Ok(())
    }

    pub(crate) fn batch_size(&self) -> usize {
        (self.upload_frequency / self.polling_rate) as usize
    }

    pub(crate) fn polling_interval(&self) -> embassy_time::Duration {
        embassy_time::Duration::from_secs(self.polling_rate)
    }

    pub(crate) fn timezone(&self) -> anyhow::Result<Option<Tz>> {
        match &self.timezone {
            Some(name) => name
                .parse::<Tz>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("‼️ Unknown timezone {:?}: {}", name, e)),
            None => Ok(None),
        }
    }
}

/// Location of the configuration file.
///
/// `BME680_ANALYTICS_CONFIG` (also picked up from a `.env` file) wins over
/// the per-user default `$HOME/.config/bme680-nextcloud-analytics.json`.
pub(crate) fn config_path() -> anyhow::Result<PathBuf> {
    dotenvy::dotenv().ok();

    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }

    let home = std::env::var("HOME").context("‼️ HOME is not set, cannot locate config file")?;
    Ok(default_config_path(Path::new(&home)))
}

fn default_config_path(home: &Path) -> PathBuf {
    home.join(".config").join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{"user": "sensor", "password": "secret", "url": "https://cloud.example/api"}"#;

    #[test]
    fn applies_defaults() {
        let settings = Settings::parse(MINIMAL).unwrap();

        assert_eq!(settings.polling_rate, 1);
        assert_eq!(settings.upload_frequency, 60);
        assert_eq!(settings.temp_offset, None);
        assert!(!settings.enable_gas_sensor);
        assert_eq!(settings.batch_size(), 60);
        assert_eq!(settings.polling_interval(), embassy_time::Duration::from_secs(1));
        assert_eq!(settings.timezone().unwrap(), None);
    }

    #[test]
    fn reads_all_keys() {
        let settings = Settings::parse(
            r#"{
                "polling_rate": 5,
                "upload_frequency": 300,
                "temp_offset": -1.5,
                "enable_gas_sensor": true,
                "user": "sensor",
                "password": "secret",
                "url": "https://cloud.example/api",
                "timezone": "Europe/Kyiv",
                "max_missed_ticks": 10
            }"#,
        )
        .unwrap();

        assert_eq!(settings.batch_size(), 60);
        assert_eq!(settings.temp_offset, Some(-1.5));
        assert!(settings.enable_gas_sensor);
        assert_eq!(settings.max_missed_ticks, Some(10));
        assert_eq!(settings.timezone().unwrap(), Some(chrono_tz::Europe::Kyiv));
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = Settings::parse("{ polling_rate: 1").unwrap_err();
        assert!(format!("{err:#}").contains("Invalid json in config file."));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        assert!(Settings::parse(r#"{"url": "https://cloud.example/api"}"#).is_err());
    }

    #[test]
    fn window_must_be_multiple_of_interval() {
        let raw = r#"{"polling_rate": 7, "upload_frequency": 60, "user": "u", "password": "p", "url": "http://h/"}"#;
        let err = Settings::parse(raw).unwrap_err();
        assert!(err.to_string().contains("multiple of polling_rate"));
    }

    #[test]
    fn rejects_degenerate_intervals() {
        let zero = r#"{"polling_rate": 0, "user": "u", "password": "p", "url": "http://h/"}"#;
        let short = r#"{"polling_rate": 10, "upload_frequency": 5, "user": "u", "password": "p", "url": "http://h/"}"#;
        let no_misses = r#"{"max_missed_ticks": 0, "user": "u", "password": "p", "url": "http://h/"}"#;

        assert!(Settings::parse(zero).is_err());
        assert!(Settings::parse(short).is_err());
        assert!(Settings::parse(no_misses).is_err());
    }

    #[test]
    fn rejects_unknown_timezone_and_bad_url() {
        let tz = r#"{"timezone": "Mars/Olympus", "user": "u", "password": "p", "url": "http://h/"}"#;
        let url = r#"{"user": "u", "password": "p", "url": "not a url"}"#;

        assert!(Settings::parse(tz).is_err());
        assert!(Settings::parse(url).is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.user, "sensor");
        assert_eq!(settings.password, "secret");
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("absent.json"));
    }

    #[test]
    fn default_path_is_per_user() {
        assert_eq!(
            default_config_path(Path::new("/home/pi")),
            PathBuf::from("/home/pi/.config/bme680-nextcloud-analytics.json")
        );
    }
}
