//! Parameters read from environment variables.
//!
//! These are knobs that are not worth a constructor argument in most uses
//! (location of the external minimizer, its time limit, self-checking of results).
//! Each parameter is read once, on first access, and falls back to its default
//! if the variable is unset or cannot be parsed.
//!
//! ```
//! use marco_subsets::params::EnvParam;
//! static ROUNDS: EnvParam<u32> = EnvParam::new("MARCO_DOCTEST_ROUNDS", "3");
//!
//! assert_eq!(ROUNDS.get(), 3);
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::OnceCell;

/// Location of the external group-MUS extractor. Relative paths are resolved
/// against the directory of the running executable.
pub static MUSER_PATH: EnvParam<PathBuf> = EnvParam::new("MARCO_MUSER_PATH", "muser2-static");

/// Time limit (in seconds) given to a single run of the external extractor. `0` means no limit.
pub static MUSER_TIMEOUT: EnvParam<u64> = EnvParam::new("MARCO_MUSER_TIMEOUT", "0");

/// If true, `shrink` and `grow` re-check their results with additional oracle calls.
pub static CHECK_RESULTS: EnvParam<bool> = EnvParam::new("MARCO_CHECK_RESULTS", "false");

pub struct EnvParam<T> {
    value: OnceCell<T>,
    env: &'static str,
    default: &'static str,
}

impl<T> EnvParam<T> {
    pub const fn new(env: &'static str, default: &'static str) -> EnvParam<T> {
        EnvParam {
            value: OnceCell::new(),
            env,
            default,
        }
    }

    /// Name of the environment variable backing this parameter.
    pub fn env(&self) -> &'static str {
        self.env
    }
}

impl<T: FromStr> EnvParam<T> {
    fn parse_default(&self) -> T {
        match T::from_str(self.default) {
            Ok(value) => value,
            Err(_) => panic!("{}: invalid default value \"{}\"", self.env, self.default),
        }
    }

    fn read(&self) -> T {
        match std::env::var(self.env) {
            Ok(raw) => T::from_str(&raw).unwrap_or_else(|_| {
                tracing::warn!(
                    param = self.env,
                    value = %raw,
                    default = self.default,
                    "could not parse parameter, using default"
                );
                self.parse_default()
            }),
            Err(std::env::VarError::NotPresent) => self.parse_default(),
            Err(err) => {
                tracing::warn!(param = self.env, %err, default = self.default, "unreadable parameter, using default");
                self.parse_default()
            }
        }
    }

    /// Returns the value of the parameter, reading it from the environment on first access.
    ///
    /// # Panic
    /// Panics if the default value cannot be parsed.
    pub fn get(&self) -> T
    where
        T: Copy,
    {
        *self.get_ref()
    }

    pub fn get_ref(&self) -> &T {
        self.value.get_or_init(|| self.read())
    }

    /// Forces the value of the parameter.
    ///
    /// # Panic
    /// Panics if the parameter was already read or set.
    pub fn set(&self, value: T) {
        if self.value.set(value).is_err() {
            panic!("Parameter {} is already initialized (i.e. was previously accessed).", self.env);
        }
    }
}
