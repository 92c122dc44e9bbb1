use std::ffi::{OsStr, OsString};
use thiserror::Error;

/// Variables whose override is prepended to the inherited value instead of replacing it.
pub const EXTENDED_PATH_VARS: &[&str] = &["PYTHONPATH"];

/// Ordered environment overrides with unique keys. Setting an existing key replaces its value in
/// place, so the first-set order is what gets logged.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EnvOverrides {
    entries: Vec<(String, String)>,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ParseEnvAssignmentError {
    #[error("expected KEY=VALUE, got: {0}")]
    MissingEquals(String),

    #[error("empty variable name in: {0}")]
    EmptyKey(String),
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies `other` on top of `self`; keys present in both take `other`'s value.
    pub fn extend(&mut self, other: &EnvOverrides) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Parses a `KEY=VALUE` assignment as given on a command line.
    pub fn parse_assignment(text: &str) -> Result<(String, String), ParseEnvAssignmentError> {
        let Some((key, value)) = text.split_once('=') else {
            return Err(ParseEnvAssignmentError::MissingEquals(text.to_string()));
        };
        if key.trim().is_empty() {
            return Err(ParseEnvAssignmentError::EmptyKey(text.to_string()));
        }
        Ok((key.trim().to_string(), value.to_string()))
    }

    /// Resolves the final value of each override against the inherited value of the same
    /// variable (as returned by `inherited`).
    pub fn resolve<F>(&self, inherited: F) -> Vec<(String, OsString)>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        self.entries
            .iter()
            .map(|(key, value)| {
                let resolved = if EXTENDED_PATH_VARS.contains(&key.as_str()) {
                    prepend_path_list(value, inherited(key.as_str()).as_deref())
                } else {
                    OsString::from(value)
                };
                (key.clone(), resolved)
            })
            .collect()
    }

    /// Space-separated `KEY=VALUE` list for log lines.
    pub fn describe(&self) -> String {
        self.iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvOverrides {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut overrides = Self::new();
        for (key, value) in iter {
            overrides.set(key, value);
        }
        overrides
    }
}

fn prepend_path_list(head: &str, inherited: Option<&OsStr>) -> OsString {
    let Some(inherited) = inherited.filter(|value| !value.is_empty()) else {
        return OsString::from(head);
    };
    let parts = std::iter::once(OsString::from(head)).chain(std::env::split_paths(inherited).map(
        |path| path.into_os_string(),
    ));
    match std::env::join_paths(parts) {
        Ok(joined) => joined,
        Err(_) => OsString::from(head),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_set_replaces_value_in_place() {
        let mut env = EnvOverrides::new();
        env.set("PER_ENABLED", "1");
        env.set("N_STEP", "3");
        env.set("PER_ENABLED", "0");
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("PER_ENABLED"), Some("0"));
        assert_eq!(env.describe(), "PER_ENABLED=0 N_STEP=3");
    }

    #[test]
    fn extend_overrides_shared_keys() {
        let mut base = EnvOverrides::from_iter([("VEC_ENV_COUNT", "12"), ("N_STEP", "3")]);
        base.extend(&EnvOverrides::new().with("VEC_ENV_COUNT", "8"));
        assert_eq!(base.get("VEC_ENV_COUNT"), Some("8"));
        assert_eq!(base.get("N_STEP"), Some("3"));
    }

    #[test]
    fn parses_assignments() {
        assert_eq!(
            EnvOverrides::parse_assignment("N_STEP=3"),
            Ok(("N_STEP".to_string(), "3".to_string()))
        );
        assert_eq!(
            EnvOverrides::parse_assignment("EXTRA=a=b"),
            Ok(("EXTRA".to_string(), "a=b".to_string()))
        );
        assert!(matches!(
            EnvOverrides::parse_assignment("N_STEP"),
            Err(ParseEnvAssignmentError::MissingEquals(_))
        ));
        assert!(matches!(
            EnvOverrides::parse_assignment("=3"),
            Err(ParseEnvAssignmentError::EmptyKey(_))
        ));
    }

    #[test]
    fn pythonpath_is_extended_not_replaced() {
        let env = EnvOverrides::new()
            .with("PYTHONPATH", "/repo/gym_mod")
            .with("N_STEP", "3");
        let resolved = env.resolve(|key| match key {
            "PYTHONPATH" => Some(OsString::from("/site")),
            "N_STEP" => Some(OsString::from("1")),
            _ => None,
        });
        let expected_path = std::env::join_paths(["/repo/gym_mod", "/site"]).expect("join");
        assert_eq!(
            resolved,
            vec![
                ("PYTHONPATH".to_string(), expected_path),
                ("N_STEP".to_string(), OsString::from("3")),
            ]
        );
    }

    #[test]
    fn pythonpath_without_inherited_value_is_used_as_is() {
        let env = EnvOverrides::new().with("PYTHONPATH", "/repo/gym_mod");
        let resolved = env.resolve(|_| None);
        assert_eq!(resolved[0].1, OsString::from("/repo/gym_mod"));
    }
}
