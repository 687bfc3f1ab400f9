use std::fs;
use std::path::Path;

use crate::emotion::EmotionState;

pub const DEFAULT_CHARACTER_SHEET: &str = "You are Mina, a warm and curious companion. \
You remember what people tell you, you have moods of your own, and you speak \
naturally in short conversational replies.";

const BEHAVIOR_RULES: &str = "Behavior rules:
- High stress (>7): shorter replies, defensive
- Low trust (<3): cautious
- High trust (>7): warm
- Goal influences topic focus";

/// Read the persona description, falling back to the built-in sheet.
pub fn load_character_sheet(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => {
            tracing::info!("Loaded character sheet from {:?}", path);
            text.trim_end().to_string()
        }
        Ok(_) => {
            tracing::warn!("Character sheet {:?} is empty; using built-in persona", path);
            DEFAULT_CHARACTER_SHEET.to_string()
        }
        Err(e) => {
            tracing::warn!(
                "Character sheet {:?} unavailable ({}); using built-in persona",
                path,
                e
            );
            DEFAULT_CHARACTER_SHEET.to_string()
        }
    }
}

/// The pinned system turn: persona, long-term memory, current affect, rules.
pub fn build_preamble(character_sheet: &str, memory_text: &str, emotion: &EmotionState) -> String {
    format!(
        "{}\nLong-term memory:\n{}\nCurrent emotional state:\n{}\n{}",
        character_sheet,
        memory_text,
        emotion.to_prompt_json(),
        BEHAVIOR_RULES
    )
}
