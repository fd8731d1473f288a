//! Context → prompt composition and the model selection policy.
//!
//! Everything here is a pure function of the [`Context`]: no I/O, no clock,
//! no randomness.

use crate::context::{Condition, Context};
use crate::model::ModelKey;

pub const NEGATIVE_PROMPT: &str = "low quality, deformed, extra fingers, watermark, text";

/// Below this temperature the higher-capacity model is used.
pub const COLD_THRESHOLD_C: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub prompt: String,
    pub negative_prompt: String,
    pub model_key: ModelKey,
}

pub fn compose_prompt(context: &Context) -> ComposedPrompt {
    let prompt = format!(
        "city street, {}, {}, ultra-detailed",
        weather_phrase(context.condition),
        time_of_day_phrase(context.hour)
    );
    ComposedPrompt {
        prompt,
        negative_prompt: NEGATIVE_PROMPT.to_string(),
        model_key: select_model(context.condition, context.hour, context.temp_c),
    }
}

/// Half-open hour buckets; anything outside 6..20 (including out-of-range
/// hours) is night.
pub fn time_of_day_phrase(hour: i32) -> &'static str {
    match hour {
        6..=9 => "soft morning light, warm tone",
        10..=16 => "bright daylight, vibrant colors",
        17..=19 => "golden hour, cinematic lighting",
        _ => "night scene, moody lighting",
    }
}

pub fn weather_phrase(condition: Condition) -> &'static str {
    match condition {
        Condition::Clear => "clear sky",
        Condition::PartlyCloudy => "scattered clouds",
        Condition::Cloudy => "overcast sky",
        Condition::Rain => "rainy day, wet streets",
        Condition::Snow => "fresh snowfall",
        Condition::Storm => "dramatic thunderstorm",
        Condition::Mixed => "dynamic weather",
    }
}

/// Colder, darker or stormier scenes get SDXL; everything else stays on the
/// faster SD 1.5.
pub fn select_model(condition: Condition, hour: i32, temp_c: f64) -> ModelKey {
    let severe_weather = matches!(condition, Condition::Storm | Condition::Snow);
    let dark = hour < 7 || hour >= 20;
    let cold = temp_c < COLD_THRESHOLD_C;

    if severe_weather || dark || cold {
        ModelKey::Sdxl
    } else {
        ModelKey::Sd15
    }
}
