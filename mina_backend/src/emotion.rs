use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EMOTION_SCALE_MAX: u8 = 10;

pub const DEFAULT_MOOD: &str = "neutral";
pub const DEFAULT_STRESS: u8 = 3;
pub const DEFAULT_TRUST_IN_USER: u8 = 5;
pub const DEFAULT_CURRENT_GOAL: &str = "get to know the user";

/// The agent's affect. Numeric fields live on a 0-10 scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmotionState {
    pub mood: String,
    pub stress: u8,
    pub trust_in_user: u8,
    pub current_goal: String,
}

impl Default for EmotionState {
    fn default() -> Self {
        Self {
            mood: DEFAULT_MOOD.to_string(),
            stress: DEFAULT_STRESS,
            trust_in_user: DEFAULT_TRUST_IN_USER,
            current_goal: DEFAULT_CURRENT_GOAL.to_string(),
        }
    }
}

impl EmotionState {
    /// Repair an untrusted record field by field. Anything unusable keeps the
    /// fallback's value, so the result is always fully populated.
    pub fn validate(raw: &Value, fallback: &EmotionState) -> EmotionState {
        let field = |name: &str| raw.as_object().and_then(|map| map.get(name));

        EmotionState {
            mood: text_field(field("mood"), &fallback.mood),
            stress: scale_field("stress", field("stress"), fallback.stress),
            trust_in_user: scale_field(
                "trust_in_user",
                field("trust_in_user"),
                fallback.trust_in_user,
            ),
            current_goal: text_field(field("current_goal"), &fallback.current_goal),
        }
    }

    /// Validate `delta` against the current state and replace it wholesale.
    pub fn merge(&mut self, delta: &Value) {
        *self = Self::validate(delta, self);
    }

    pub fn to_prompt_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| {
            format!(
                "mood: {}\nstress: {}\ntrust_in_user: {}\ncurrent_goal: {}",
                self.mood, self.stress, self.trust_in_user, self.current_goal
            )
        })
    }
}

/// Read an integer out of a loosely typed JSON value.
///
/// Accepts integers, floats (rounded half away from zero) and numeric strings.
pub(crate) fn parse_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>().ok().or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.round() as i64)
            })
        }
        _ => None,
    }
}

fn scale_field(name: &str, value: Option<&Value>, fallback: u8) -> u8 {
    let Some(value) = value else {
        return fallback;
    };
    match parse_integer(value) {
        Some(n) if n < 0 => {
            tracing::debug!("Emotion field '{}' is negative ({}); keeping {}", name, n, fallback);
            fallback
        }
        Some(n) => n.min(EMOTION_SCALE_MAX as i64) as u8,
        None => {
            tracing::debug!("Emotion field '{}' is not numeric ({}); keeping {}", name, value, fallback);
            fallback
        }
    }
}

fn text_field(value: Option<&Value>, fallback: &str) -> String {
    let text = match value {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        _ => String::new(),
    };
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}
