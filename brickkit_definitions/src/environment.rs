use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Result;

/// Environments are well defined strings
///
/// Every run of the engine happens against exactly one of these.
/// The value suffixes resolved names of principals and resources,
/// and selects per-environment tag overrides in conventions.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development environment
    Dev,
    /// Acceptance environment
    Acc,
    /// Production environment
    ///
    /// Conventions typically tighten ownership rules here.
    Prd,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Dev
    }
}

impl ToString for Environment {
    fn to_string(&self) -> String {
        // NB: this corresponds to serde serialization atm - used in name resolution
        format!("{:?}", self).to_lowercase()
    }
}

impl Environment {
    /// The suffix appended to resolved names, e.g. `analytics_dev`
    pub fn suffix(self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Acc => "acc",
            Environment::Prd => "prd",
        }
    }

    pub fn from_str_loose(s: &str) -> Result<Environment> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "acc" => Ok(Environment::Acc),
            "prd" => Ok(Environment::Prd),
            _ => bail!("Unknown environment '{}' (expected dev, acc or prd)", s),
        }
    }
}

// Encoded as usize for the atomic: 0 = unset, 1..=3 map to the enum.
const ENV_UNSET: usize = 0;

static CURRENT: AtomicUsize = AtomicUsize::new(ENV_UNSET);

fn encode(e: Environment) -> usize {
    match e {
        Environment::Dev => 1,
        Environment::Acc => 2,
        Environment::Prd => 3,
    }
}

fn decode(v: usize) -> Environment {
    match v {
        2 => Environment::Acc,
        3 => Environment::Prd,
        _ => Environment::Dev,
    }
}

impl Environment {
    /// The single accessor for the process-wide environment
    ///
    /// First call reads `DATABRICKS_ENV` (default dev) and freezes the
    /// value for the rest of the run. `Environment::force` can override
    /// it programmatically, which tests rely on.
    pub fn current() -> Environment {
        let cur = CURRENT.load(Ordering::SeqCst);
        if cur != ENV_UNSET {
            return decode(cur);
        }
        let initial = match env::var("DATABRICKS_ENV") {
            Ok(val) => match Environment::from_str_loose(&val) {
                Ok(e) => e,
                Err(_) => {
                    warn!("Ignoring invalid DATABRICKS_ENV value '{}', using dev", val);
                    Environment::Dev
                }
            },
            Err(_) => Environment::Dev,
        };
        // first writer wins if two threads race the initial read
        let _ = CURRENT.compare_exchange(
            ENV_UNSET,
            encode(initial),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        decode(CURRENT.load(Ordering::SeqCst))
    }

    /// Override the process environment
    ///
    /// Intended for tests and embedders that resolve the environment
    /// themselves. Takes effect for all subsequent `current()` calls.
    pub fn force(e: Environment) {
        CURRENT.store(encode(e), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::Environment;

    #[test]
    fn environment_suffixes() {
        assert_eq!(Environment::Dev.suffix(), "dev");
        assert_eq!(Environment::Acc.suffix(), "acc");
        assert_eq!(Environment::Prd.suffix(), "prd");
    }

    #[test]
    fn environment_parses_loosely() {
        assert_eq!(Environment::from_str_loose("PRD").unwrap(), Environment::Prd);
        assert_eq!(Environment::from_str_loose("dev").unwrap(), Environment::Dev);
        assert!(Environment::from_str_loose("staging").is_err());
    }

    #[test]
    fn environment_force_wins() {
        Environment::force(Environment::Acc);
        assert_eq!(Environment::current(), Environment::Acc);
        Environment::force(Environment::Dev);
        assert_eq!(Environment::current(), Environment::Dev);
    }
}
