//! Sound-resource URI builders
//!
//! Pure functions that turn a logical prompt request into the media URIs the
//! call-control bus understands (`sound:`, `recording:`, `number:`,
//! `digits:`, `characters:`). Every builder is deterministic.

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Hash word used when a digit string contains `#` and none was supplied
pub const DEFAULT_HASH_WORD: &str = "pound";

/// Longest silence file shipped with the core sound set
const MAX_SILENCE_SECS: u64 = 10;

/// A single playable sound resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SoundUri(String);

impl SoundUri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SoundUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SoundUri {
    fn from(uri: &str) -> Self {
        Self(uri.to_string())
    }
}

/// Stored recording
pub fn recording(name: &str) -> SoundUri {
    SoundUri(format!("recording:{}", name))
}

/// Sound file from the sound library
pub fn sound(name: &str) -> SoundUri {
    SoundUri(format!("sound:{}", name))
}

/// Spoken number
pub fn number(n: i64) -> Vec<SoundUri> {
    vec![SoundUri(format!("number:{}", n))]
}

/// Digits read one at a time
///
/// `*` is read as "star" and `#` as `hash_word` (or "pound" when empty).
/// Letters are spelled out and whitespace is skipped.
pub fn digits(digits: &str, hash_word: &str) -> Vec<SoundUri> {
    let hash_word = if hash_word.is_empty() {
        DEFAULT_HASH_WORD
    } else {
        hash_word
    };

    digits
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '0'..='9' => SoundUri(format!("digits:{}", c)),
            '*' => sound("star"),
            '#' => sound(hash_word),
            other => SoundUri(format!("characters:{}", other.to_ascii_lowercase())),
        })
        .collect()
}

/// Human readable duration: hours, minutes and seconds, skipping zero parts
pub fn duration(d: Duration) -> Vec<SoundUri> {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut uris = Vec::new();
    for (value, unit) in [(hours, "hours"), (minutes, "minutes"), (seconds, "seconds")] {
        if value > 0 {
            uris.extend(number(value as i64));
            uris.push(sound(unit));
        }
    }

    if uris.is_empty() {
        uris.extend(number(0));
        uris.push(sound("seconds"));
    }

    uris
}

/// Weekday, month, day of month and 12-hour clock time
pub fn date_time<T>(t: &T) -> Vec<SoundUri>
where
    T: Datelike + Timelike,
{
    let mut uris = vec![
        sound(&format!("digits/day-{}", t.weekday().num_days_from_sunday())),
        sound(&format!("digits/mon-{}", t.month0())),
    ];
    uris.extend(number(t.day() as i64));

    let (pm, hour) = t.hour12();
    uris.extend(number(hour as i64));

    match t.minute() {
        0 => uris.push(sound("digits/oclock")),
        m if m < 10 => {
            uris.push(sound("digits/oh"));
            uris.extend(number(m as i64));
        }
        m => uris.extend(number(m as i64)),
    }

    uris.push(sound(if pm { "digits/p-m" } else { "digits/a-m" }));
    uris
}

/// Silence for the given number of whole seconds
pub fn wait(d: Duration) -> Vec<SoundUri> {
    let mut remaining = d.as_secs();
    let mut uris = Vec::new();

    while remaining > 0 {
        let chunk = remaining.min(MAX_SILENCE_SECS);
        uris.push(sound(&format!("silence/{}", chunk)));
        remaining -= chunk;
    }

    uris
}
