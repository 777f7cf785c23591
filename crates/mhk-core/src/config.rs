use std::{collections::HashMap, env, fs, path::Path, time::Duration};

use crate::{
    admission::{AdmissionConfig, FailureMode},
    auth::AuthConfig,
    dispatch::DispatcherConfig,
    errors::Error,
    Result,
};

/// Runtime configuration for the command pipeline.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Prepended to every shared-store key (`"{prefix}cmd_rate_limit:..."`).
    pub key_prefix: String,
    pub admission: AdmissionConfig,
    pub auth: AuthConfig,
    pub dispatcher: DispatcherConfig,
}

impl Config {
    /// Read the process environment, falling back to `./.env` for unset keys.
    pub fn load() -> Result<Self> {
        let dotenv = read_dotenv(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok().or_else(|| dotenv.get(key).cloned()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Lookup(&lookup);
        let defaults = Config::default();

        let key_prefix = env.str("CACHE_KEY_PREFIX").unwrap_or_default();

        let admission = AdmissionConfig {
            capacity: env
                .parse("RATE_LIMIT_CAPACITY")?
                .unwrap_or(defaults.admission.capacity),
            leak_interval: env
                .parse("RATE_LIMIT_LEAK_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.admission.leak_interval),
            failure_mode: match env.str("RATE_LIMIT_FAILURE_MODE") {
                Some(v) => parse_failure_mode(&v)?,
                None => defaults.admission.failure_mode,
            },
        };
        if admission.leak_interval.is_zero() {
            return Err(Error::Config(
                "RATE_LIMIT_LEAK_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        let auth = AuthConfig {
            timeout: env
                .parse("AUTH_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.auth.timeout),
            token_ttl: env
                .parse("AUTH_TOKEN_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.auth.token_ttl),
        };

        let dispatcher = DispatcherConfig {
            max_concurrency: env
                .parse("DISPATCHER_MAX_CONCURRENCY")?
                .unwrap_or(defaults.dispatcher.max_concurrency),
            queue_capacity: env
                .parse("DISPATCHER_QUEUE_CAPACITY")?
                .unwrap_or(defaults.dispatcher.queue_capacity),
        };
        dispatcher.validate()?;

        Ok(Self {
            key_prefix,
            admission,
            auth,
            dispatcher,
        })
    }
}

struct Lookup<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    /// Trimmed, non-empty value.
    fn str(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.str(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw:?}"))),
        }
    }
}

fn parse_failure_mode(raw: &str) -> Result<FailureMode> {
    match raw.to_lowercase().as_str() {
        "closed" | "fail_closed" | "fail-closed" => Ok(FailureMode::FailClosed),
        "open" | "fail_open" | "fail-open" => Ok(FailureMode::FailOpen),
        other => Err(Error::Config(format!(
            "RATE_LIMIT_FAILURE_MODE must be `open` or `closed`, got {other:?}"
        ))),
    }
}

fn read_dotenv(path: &Path) -> HashMap<String, String> {
    let Ok(contents) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    parse_dotenv(&contents)
}

fn parse_dotenv(contents: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let v = v.trim();
        let unquoted = v
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
            .unwrap_or(v);
        vars.insert(key.to_string(), unquoted.to_string());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.key_prefix, "");
        assert_eq!(cfg.admission.capacity, 5);
        assert_eq!(cfg.admission.leak_interval, Duration::from_secs(1));
        assert_eq!(cfg.admission.failure_mode, FailureMode::FailClosed);
        assert_eq!(cfg.auth.timeout, Duration::from_secs(60));
        assert_eq!(cfg.auth.token_ttl, Duration::from_secs(600));
        assert_eq!(cfg.dispatcher.max_concurrency, 4);
        assert_eq!(cfg.dispatcher.queue_capacity, 100);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = Config::from_lookup(vars(&[
            ("CACHE_KEY_PREFIX", "mehrak:"),
            ("RATE_LIMIT_CAPACITY", "10"),
            ("RATE_LIMIT_LEAK_INTERVAL_MS", "250"),
            ("RATE_LIMIT_FAILURE_MODE", " Open "),
            ("AUTH_TIMEOUT_SECS", "30"),
            ("DISPATCHER_MAX_CONCURRENCY", "1"),
            ("DISPATCHER_QUEUE_CAPACITY", ""),
        ]))
        .unwrap();

        assert_eq!(cfg.key_prefix, "mehrak:");
        assert_eq!(cfg.admission.capacity, 10);
        assert_eq!(cfg.admission.leak_interval, Duration::from_millis(250));
        assert_eq!(cfg.admission.failure_mode, FailureMode::FailOpen);
        assert_eq!(cfg.auth.timeout, Duration::from_secs(30));
        assert_eq!(cfg.dispatcher.max_concurrency, 1);
        // Blank falls back to the default.
        assert_eq!(cfg.dispatcher.queue_capacity, 100);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for pairs in [
            [("RATE_LIMIT_CAPACITY", "five")],
            [("RATE_LIMIT_FAILURE_MODE", "sometimes")],
            [("DISPATCHER_MAX_CONCURRENCY", "0")],
            [("RATE_LIMIT_LEAK_INTERVAL_MS", "0")],
        ] {
            let err = Config::from_lookup(vars(&pairs)).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{pairs:?}: {err}");
        }
    }

    #[test]
    fn dotenv_lines_are_parsed() {
        let vars = parse_dotenv(
            "# comment\n\nCACHE_KEY_PREFIX=\"bot:\"\nexport AUTH_TIMEOUT_SECS = 45\nbroken line\n=x\n",
        );
        assert_eq!(vars.get("CACHE_KEY_PREFIX").map(String::as_str), Some("bot:"));
        assert_eq!(vars.get("AUTH_TIMEOUT_SECS").map(String::as_str), Some("45"));
        assert_eq!(vars.len(), 2);
    }
}
