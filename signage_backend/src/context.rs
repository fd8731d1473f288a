//! Environmental context: the weather/time snapshot each cycle is driven by.
//!
//! The collector never fails a cycle. When the weather service cannot be
//! reached or answers with something unusable, a fixed fallback context
//! (clear, 12°C) is returned instead.

use async_trait::async_trait;
use chrono::Timelike;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::config::LocationConfig;
use crate::http_client::build_http_client_with_timeout;

const WEATHER_TIMEOUT_SECS: u64 = 10;
const FALLBACK_TEMP_C: f64 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    #[serde(rename = "clear")]
    Clear,
    #[serde(rename = "partly cloudy")]
    PartlyCloudy,
    #[serde(rename = "cloudy")]
    Cloudy,
    #[serde(rename = "rain")]
    Rain,
    #[serde(rename = "snow")]
    Snow,
    #[serde(rename = "storm")]
    Storm,
    #[serde(rename = "mixed")]
    Mixed,
}

impl Condition {
    pub fn label(self) -> &'static str {
        match self {
            Condition::Clear => "clear",
            Condition::PartlyCloudy => "partly cloudy",
            Condition::Cloudy => "cloudy",
            Condition::Rain => "rain",
            Condition::Snow => "snow",
            Condition::Storm => "storm",
            Condition::Mixed => "mixed",
        }
    }

    /// Case-insensitive label lookup. Unknown labels become [`Condition::Mixed`].
    pub fn from_label(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "clear" => Condition::Clear,
            "partly cloudy" => Condition::PartlyCloudy,
            "cloudy" => Condition::Cloudy,
            "rain" => Condition::Rain,
            "snow" => Condition::Snow,
            "storm" => Condition::Storm,
            _ => Condition::Mixed,
        }
    }

    /// WMO weather interpretation code, as reported by Open-Meteo.
    pub fn from_weather_code(code: i64) -> Self {
        match code {
            0 | 1 => Condition::Clear,
            2 => Condition::PartlyCloudy,
            3 | 45 | 48 => Condition::Cloudy,
            51 | 53 | 55 | 61 | 63 | 65 => Condition::Rain,
            71 | 73 | 75 | 77 | 85 | 86 => Condition::Snow,
            95 | 96 | 99 => Condition::Storm,
            _ => Condition::Mixed,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub city: String,
    pub lat: f64,
    pub lon: f64,
    pub temp_c: f64,
    pub condition: Condition,
    /// Local wall-clock hour. Taken as given; nothing clamps it to 0..=23.
    pub hour: i32,
    pub is_day: bool,
}

/// Anything that can produce the context for a cycle.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn collect(&self) -> Context;
}

/// Open-Meteo backed collector.
pub struct WeatherCollector {
    client: Client,
    location: LocationConfig,
}

impl WeatherCollector {
    pub fn new(location: LocationConfig) -> Self {
        Self {
            client: build_http_client_with_timeout(Some(Duration::from_secs(
                WEATHER_TIMEOUT_SECS,
            ))),
            location,
        }
    }

    async fn fetch_current_weather(&self) -> anyhow::Result<Value> {
        let lat = self.location.lat.to_string();
        let lon = self.location.lon.to_string();
        let response = self
            .client
            .get(&self.location.weather_url)
            .query(&[
                ("latitude", lat.as_str()),
                ("longitude", lon.as_str()),
                ("current_weather", "true"),
                ("hourly", "weathercode,temperature_2m"),
                ("timezone", self.location.timezone.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        Ok(body)
    }
}

#[async_trait]
impl ContextSource for WeatherCollector {
    async fn collect(&self) -> Context {
        let hour = current_local_hour();
        match self.fetch_current_weather().await {
            Ok(body) => {
                let context = context_from_payload(&self.location, &body, hour);
                tracing::debug!(
                    "Weather for {}: {} at {:.1}°C",
                    context.city,
                    context.condition,
                    context.temp_c
                );
                context
            }
            Err(e) => {
                tracing::debug!("Weather fetch failed ({:#}); using fallback context", e);
                fallback_context(&self.location, hour)
            }
        }
    }
}

pub fn current_local_hour() -> i32 {
    chrono::Local::now().hour() as i32
}

/// Build a context from an Open-Meteo forecast body. Missing fields take the
/// service's neutral defaults (10°C, code 0, daytime).
pub fn context_from_payload(location: &LocationConfig, body: &Value, hour: i32) -> Context {
    let current = body.get("current_weather").unwrap_or(&Value::Null);
    let temp_c = current
        .get("temperature")
        .and_then(Value::as_f64)
        .unwrap_or(10.0);
    let code = current
        .get("weathercode")
        .and_then(Value::as_f64)
        .map(|c| c as i64)
        .unwrap_or(0);
    let is_day = match current.get("is_day") {
        Some(Value::Bool(flag)) => *flag,
        Some(value) => value.as_f64().map(|v| v != 0.0).unwrap_or(true),
        None => true,
    };

    Context {
        city: location.city.clone(),
        lat: location.lat,
        lon: location.lon,
        temp_c,
        condition: Condition::from_weather_code(code),
        hour,
        is_day,
    }
}

pub fn fallback_context(location: &LocationConfig, hour: i32) -> Context {
    Context {
        city: location.city.clone(),
        lat: location.lat,
        lon: location.lon,
        temp_c: FALLBACK_TEMP_C,
        condition: Condition::Clear,
        hour,
        is_day: (7..20).contains(&hour),
    }
}
