//! Keyboard shortcut chords and the in-page speed input popup.
//!
//! The popup is a small state machine: the shortcut toggles it, Enter applies
//! a typed speed, Escape or a click outside dismisses it. Rendering belongs to
//! the [`crate::host::Document`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SpeedError;
use crate::speed::Speed;

/// Toggles closer together than this are ignored.
pub const TOGGLE_DEBOUNCE_MS: u64 = 200;

// =============================================================================
// Shortcut
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShortcutError {
    #[error("shortcut is empty")]
    Empty,
    #[error("shortcut has no key, only modifiers")]
    MissingKey,
    #[error("shortcut has more than one key: {0:?} and {1:?}")]
    MultipleKeys(String, String),
}

/// A key chord such as `Ctrl + .`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Shortcut {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
    pub key: String,
}

impl Default for Shortcut {
    fn default() -> Self {
        Self {
            ctrl: true,
            alt: false,
            shift: false,
            meta: false,
            key: ".".to_string(),
        }
    }
}

impl FromStr for Shortcut {
    type Err = ShortcutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ShortcutError::Empty);
        }

        let mut chord = Self {
            ctrl: false,
            alt: false,
            shift: false,
            meta: false,
            key: String::new(),
        };

        // `+` itself can be the key: "Ctrl + +"
        let parts = s
            .split(" + ")
            .flat_map(|segment| {
                if segment.trim() == "+" {
                    vec!["+"]
                } else {
                    segment.split('+').collect()
                }
            })
            .map(str::trim)
            .filter(|part| !part.is_empty());

        for part in parts {
            match part.to_ascii_lowercase().as_str() {
                "ctrl" | "control" => chord.ctrl = true,
                "alt" | "option" => chord.alt = true,
                "shift" => chord.shift = true,
                "meta" | "cmd" | "command" => chord.meta = true,
                _ => {
                    if !chord.key.is_empty() {
                        return Err(ShortcutError::MultipleKeys(chord.key, part.to_string()));
                    }
                    chord.key = part.to_string();
                }
            }
        }

        if chord.key.is_empty() {
            return Err(ShortcutError::MissingKey);
        }
        Ok(chord)
    }
}

impl fmt::Display for Shortcut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(5);
        if self.ctrl {
            parts.push("Ctrl");
        }
        if self.alt {
            parts.push("Alt");
        }
        if self.shift {
            parts.push("Shift");
        }
        if self.meta {
            parts.push("Meta");
        }
        parts.push(&self.key);
        write!(f, "{}", parts.join(" + "))
    }
}

impl TryFrom<String> for Shortcut {
    type Error = ShortcutError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Shortcut> for String {
    fn from(chord: Shortcut) -> Self {
        chord.to_string()
    }
}

// =============================================================================
// Popup
// =============================================================================

/// Keys the popup reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupKey {
    Enter,
    Escape,
    Other,
}

/// Result of feeding input to the popup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PopupOutcome {
    /// A valid speed was entered; the popup closed.
    Applied(Speed),
    /// The popup closed without a change.
    Dismissed,
    /// Enter with unusable text; the popup stays open.
    Rejected,
    /// Nothing to do (popup closed, or an unhandled key).
    Ignored,
}

/// Parse typed text such as `1.5` or `1.5x`.
pub fn parse_speed_text(text: &str) -> Result<Speed, SpeedError> {
    let trimmed = text.trim();
    let number = trimmed
        .strip_suffix(['x', 'X'])
        .unwrap_or(trimmed)
        .trim();
    let value: f64 = number.parse().map_err(|_| SpeedError::NotANumber)?;
    Speed::new(value)
}

/// In-page speed input popup state.
#[derive(Debug, Clone, Default)]
pub struct SpeedInput {
    open: bool,
    text: String,
    last_toggle_ms: Option<u64>,
}

impl SpeedInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Open (prefilled with `current`) or close the popup.
    ///
    /// Returns the new visibility, or `None` when the toggle was debounced.
    pub fn toggle(&mut self, now_ms: u64, current: Speed) -> Option<bool> {
        if let Some(last) = self.last_toggle_ms {
            if now_ms.saturating_sub(last) < TOGGLE_DEBOUNCE_MS {
                return None;
            }
        }
        self.last_toggle_ms = Some(now_ms);

        if self.open {
            self.close();
        } else {
            self.open = true;
            self.text = current.get().to_string();
        }
        Some(self.open)
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        if self.open {
            self.text = text.into();
        }
    }

    pub fn key(&mut self, key: PopupKey) -> PopupOutcome {
        if !self.open {
            return PopupOutcome::Ignored;
        }
        match key {
            PopupKey::Enter => match parse_speed_text(&self.text) {
                Ok(speed) => {
                    self.close();
                    PopupOutcome::Applied(speed)
                }
                Err(_) => PopupOutcome::Rejected,
            },
            PopupKey::Escape => {
                self.close();
                PopupOutcome::Dismissed
            }
            PopupKey::Other => PopupOutcome::Ignored,
        }
    }

    pub fn click_outside(&mut self) -> PopupOutcome {
        if !self.open {
            return PopupOutcome::Ignored;
        }
        self.close();
        PopupOutcome::Dismissed
    }

    pub fn close(&mut self) {
        self.open = false;
        self.text.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shortcut_round_trips() {
        let chord: Shortcut = "Ctrl + .".parse().unwrap();
        assert_eq!(chord, Shortcut::default());
        assert_eq!(chord.to_string(), "Ctrl + .");
    }

    #[test]
    fn modifiers_are_normalized() {
        let chord: Shortcut = "shift+control+K".parse().unwrap();
        assert!(chord.ctrl && chord.shift && !chord.alt);
        assert_eq!(chord.to_string(), "Ctrl + Shift + K");

        let plus: Shortcut = "Alt + +".parse().unwrap();
        assert_eq!(plus.key, "+");
        assert!(plus.alt);
    }

    #[test]
    fn malformed_shortcuts() {
        assert_eq!("".parse::<Shortcut>(), Err(ShortcutError::Empty));
        assert_eq!("Ctrl + Alt".parse::<Shortcut>(), Err(ShortcutError::MissingKey));
        assert!(matches!(
            "Ctrl + a + b".parse::<Shortcut>(),
            Err(ShortcutError::MultipleKeys(_, _))
        ));
    }

    #[test]
    fn speed_text_accepts_suffix() {
        assert_eq!(parse_speed_text("1.5").unwrap().get(), 1.5);
        assert_eq!(parse_speed_text(" 2x ").unwrap().get(), 2.0);
        assert_eq!(parse_speed_text("0.25X").unwrap().get(), 0.25);
        assert!(parse_speed_text("fast").is_err());
        assert!(parse_speed_text("20").is_err());
    }

    #[test]
    fn enter_applies_and_closes() {
        let mut popup = SpeedInput::new();
        assert_eq!(popup.toggle(0, Speed::DEFAULT), Some(true));
        assert_eq!(popup.text(), "1");
        popup.set_text("1.75");
        assert_eq!(
            popup.key(PopupKey::Enter),
            PopupOutcome::Applied(Speed::new(1.75).unwrap())
        );
        assert!(!popup.is_open());
    }

    #[test]
    fn invalid_text_keeps_popup_open() {
        let mut popup = SpeedInput::new();
        popup.toggle(0, Speed::DEFAULT);
        popup.set_text("99");
        assert_eq!(popup.key(PopupKey::Enter), PopupOutcome::Rejected);
        assert!(popup.is_open());
        assert_eq!(popup.key(PopupKey::Escape), PopupOutcome::Dismissed);
        assert!(!popup.is_open());
    }

    #[test]
    fn outside_click_dismisses() {
        let mut popup = SpeedInput::new();
        assert_eq!(popup.click_outside(), PopupOutcome::Ignored);
        popup.toggle(0, Speed::DEFAULT);
        assert_eq!(popup.click_outside(), PopupOutcome::Dismissed);
    }

    #[test]
    fn rapid_toggles_are_debounced() {
        let mut popup = SpeedInput::new();
        assert_eq!(popup.toggle(1_000, Speed::DEFAULT), Some(true));
        assert_eq!(popup.toggle(1_100, Speed::DEFAULT), None);
        assert!(popup.is_open());
        assert_eq!(popup.toggle(1_200, Speed::DEFAULT), Some(false));
    }
}
