//! Persisted light/dark theme preference.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{AgentError, Result};
use crate::store::Store;

const THEME_KEY: &str = "theme";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Theme {
  Light,
  Dark,
}

impl Theme {
  fn toggled(self) -> Self {
    match self {
      Self::Light => Self::Dark,
      Self::Dark => Self::Light,
    }
  }
}

impl fmt::Display for Theme {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Light => "light",
      Self::Dark => "dark",
    })
  }
}

impl FromStr for Theme {
  type Err = AgentError;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "light" => Ok(Self::Light),
      "dark" => Ok(Self::Dark),
      other => Err(AgentError::InvalidState(format!("unknown theme '{}'", other))),
    }
  }
}

pub struct ThemePreference<S: Store> {
  store: Arc<S>,
}

impl<S: Store> ThemePreference<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store }
  }

  /// The explicitly stored theme, if any.
  pub fn stored(&self) -> Result<Option<Theme>> {
    self
      .store
      .preference(THEME_KEY)?
      .map(|value| value.parse())
      .transpose()
  }

  /// Effective theme: a stored choice wins over the system preference.
  pub fn resolve(&self, system_prefers_dark: bool) -> Result<Theme> {
    Ok(self.stored()?.unwrap_or(if system_prefers_dark {
      Theme::Dark
    } else {
      Theme::Light
    }))
  }

  /// Flip the effective theme and persist the result.
  pub fn toggle(&self, system_prefers_dark: bool) -> Result<Theme> {
    let next = self.resolve(system_prefers_dark)?.toggled();
    self.store.set_preference(THEME_KEY, &next.to_string())?;
    Ok(next)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::SqliteStore;

  fn preference() -> ThemePreference<SqliteStore> {
    ThemePreference::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
  }

  #[test]
  fn system_preference_applies_until_a_choice_is_stored() {
    let theme = preference();
    assert_eq!(theme.resolve(true).unwrap(), Theme::Dark);
    assert_eq!(theme.resolve(false).unwrap(), Theme::Light);
    assert!(theme.stored().unwrap().is_none());
  }

  #[test]
  fn toggle_persists_and_overrides_system() {
    let theme = preference();

    assert_eq!(theme.toggle(false).unwrap(), Theme::Dark);
    assert_eq!(theme.resolve(false).unwrap(), Theme::Dark);

    assert_eq!(theme.toggle(true).unwrap(), Theme::Light);
    assert_eq!(theme.resolve(true).unwrap(), Theme::Light);
    assert_eq!(theme.stored().unwrap(), Some(Theme::Light));
  }
}
