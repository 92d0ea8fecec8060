//! Runtime configuration from the environment.
//! Defaults match a collaborator service and event stream running on localhost:3000.

use crate::models::field::FieldId;
use crate::models::reading::{RangeTable, SensorType};
use crate::services::normalizer::ReadingNormalizer;
use crate::services::router::{BackoffPolicy, RouterSettings};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_STREAM_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_COLLABORATOR_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_FIELD_ID: &str = "field-1";
pub const DEFAULT_RANGES_FILE: &str = "ranges.json";
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
pub const DEFAULT_READ_POLL_MS: u64 = 500;
pub const DEFAULT_STREAM_CONNECT_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_BATTERY_LOW_PCT: f64 = 20.0;
pub const DEFAULT_SUBSCRIBER_QUEUE_WARN: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// host:port of the newline-delimited JSON event stream.
    pub stream_addr: String,
    pub collaborator_base_url: String,
    /// Field for events that name neither a field nor a mapped device.
    pub default_field_id: FieldId,
    /// Lowercased MAC address to field.
    pub device_fields: HashMap<String, FieldId>,
    pub sensor_aliases: Vec<(String, SensorType)>,
    pub ranges_file: Option<PathBuf>,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Transport read timeout; bounds how long a shutdown waits on an idle stream.
    pub read_poll: Duration,
    /// Bounds a single stream connect attempt, and with it how long a stop can wait on one.
    pub stream_connect_timeout: Duration,
    pub http_timeout: Duration,
    pub battery_low_pct: f64,
    pub subscriber_queue_warn: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let stream_addr = var("STREAM_ADDR").unwrap_or_else(|| DEFAULT_STREAM_ADDR.to_string());
        let collaborator_base_url =
            var("COLLABORATOR_BASE_URL").unwrap_or_else(|| DEFAULT_COLLABORATOR_BASE_URL.to_string());
        let default_field_id = FieldId::new(var("DEFAULT_FIELD_ID").unwrap_or_else(|| DEFAULT_FIELD_ID.to_string()))
            .map_err(|e| format!("DEFAULT_FIELD_ID: {}", e))?;

        let device_fields = match var("FIELD_DEVICE_MAP") {
            Some(raw) => parse_device_map(&raw).map_err(|e| format!("FIELD_DEVICE_MAP: {}", e))?,
            None => HashMap::new(),
        };
        let sensor_aliases = match var("SENSOR_TYPE_ALIASES") {
            Some(raw) => parse_aliases(&raw).map_err(|e| format!("SENSOR_TYPE_ALIASES: {}", e))?,
            None => Vec::new(),
        };

        // Prefer env var; fall back to ranges.json in the working directory
        let ranges_file = match var("RANGES_FILE") {
            Some(path) => Some(PathBuf::from(path)),
            None => Some(PathBuf::from(DEFAULT_RANGES_FILE)).filter(|p| p.is_file()),
        };

        let millis = |key: &str, default: u64| -> Result<Duration, String> {
            parse_number(var(key), key, default).map(Duration::from_millis)
        };
        let reconnect_initial = millis("RECONNECT_INITIAL_MS", DEFAULT_RECONNECT_INITIAL_MS)?;
        let reconnect_max = millis("RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)?;
        if reconnect_initial.is_zero() || reconnect_max < reconnect_initial {
            return Err("RECONNECT_INITIAL_MS must be > 0 and not above RECONNECT_MAX_MS".to_string());
        }
        let read_poll = millis("READ_POLL_MS", DEFAULT_READ_POLL_MS)?;
        if read_poll.is_zero() {
            return Err("READ_POLL_MS must be > 0".to_string());
        }
        let stream_connect_timeout = millis("STREAM_CONNECT_TIMEOUT_MS", DEFAULT_STREAM_CONNECT_TIMEOUT_MS)?;
        if stream_connect_timeout.is_zero() {
            return Err("STREAM_CONNECT_TIMEOUT_MS must be > 0".to_string());
        }
        let http_timeout =
            Duration::from_secs(parse_number(var("HTTP_TIMEOUT_SECS"), "HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?);

        let battery_low_pct = parse_number(var("BATTERY_LOW_PCT"), "BATTERY_LOW_PCT", DEFAULT_BATTERY_LOW_PCT)?;
        if !(0.0..=100.0).contains(&battery_low_pct) {
            return Err("BATTERY_LOW_PCT must be between 0 and 100".to_string());
        }
        let subscriber_queue_warn = parse_number(
            var("SUBSCRIBER_QUEUE_WARN"),
            "SUBSCRIBER_QUEUE_WARN",
            DEFAULT_SUBSCRIBER_QUEUE_WARN,
        )?;

        Ok(Config {
            stream_addr,
            collaborator_base_url,
            default_field_id,
            device_fields,
            sensor_aliases,
            ranges_file,
            reconnect_initial,
            reconnect_max,
            read_poll,
            stream_connect_timeout,
            http_timeout,
            battery_low_pct,
            subscriber_queue_warn,
        })
    }

    /// Built-in defaults, overridden per entry by the ranges file when one is configured.
    pub fn load_ranges(&self) -> Result<RangeTable, String> {
        match &self.ranges_file {
            Some(path) => RangeTable::load(path).map_err(|e| format!("{}: {}", path.display(), e)),
            None => Ok(RangeTable::defaults()),
        }
    }

    pub fn router_settings(&self, ranges: Arc<RangeTable>) -> RouterSettings {
        RouterSettings {
            default_field_id: self.default_field_id.clone(),
            device_fields: self.device_fields.clone(),
            normalizer: ReadingNormalizer::with_aliases(self.sensor_aliases.iter().map(|(n, t)| (n, *t))),
            ranges,
            backoff: BackoffPolicy {
                initial: self.reconnect_initial,
                max: self.reconnect_max,
                ..BackoffPolicy::default()
            },
            battery_low_pct: self.battery_low_pct,
            queue_warn: self.subscriber_queue_warn,
        }
    }
}

fn parse_number<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T, String> {
    match raw {
        Some(s) => s.parse::<T>().map_err(|_| format!("{} is not a valid number: {}", key, s)),
        None => Ok(default),
    }
}

/// Splits `a=b, c=d` into trimmed pairs; empty items are skipped.
fn pairs(raw: &str) -> Result<Vec<(&str, &str)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (k, v) = item
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, got {:?}", item))?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || v.is_empty() {
                return Err(format!("expected key=value, got {:?}", item));
            }
            Ok((k, v))
        })
        .collect()
}

fn parse_device_map(raw: &str) -> Result<HashMap<String, FieldId>, String> {
    pairs(raw)?
        .into_iter()
        .map(|(mac, field)| {
            let field = FieldId::new(field).map_err(|e| e.to_string())?;
            Ok((mac.to_ascii_lowercase(), field))
        })
        .collect()
}

fn parse_aliases(raw: &str) -> Result<Vec<(String, SensorType)>, String> {
    pairs(raw)?
        .into_iter()
        .map(|(name, target)| {
            let sensor_type = target.parse::<SensorType>().map_err(|e| e.to_string())?;
            Ok((name.to_ascii_lowercase(), sensor_type))
        })
        .collect()
}

/// Loads `KEY=value` lines into the process environment. Variables that are already set win.
pub fn load_env_file(path: &Path) -> Result<usize, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let mut applied = 0;
    for (index, line) in content.lines().enumerate() {
        let Some((key, value)) =
            parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        if std::env::var_os(&key).is_none() {
            // Mutating the process environment is unsafe once other threads may read it;
            // this runs before any are spawned.
            unsafe {
                std::env::set_var(&key, value);
            }
            applied += 1;
        }
    }
    Ok(applied)
}

/// `None` for blank lines and comments.
pub fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid variable name {:?}", key));
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => {
            let rest = &raw[1..];
            let end = rest
                .find(quote)
                .ok_or_else(|| format!("unterminated {} quote", quote))?;
            let trailing = rest[end + 1..].trim();
            if !trailing.is_empty() && !trailing.starts_with('#') {
                return Err("unexpected characters after closing quote".to_string());
            }
            rest[..end].to_string()
        }
        _ => raw.split(" #").next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.stream_addr, DEFAULT_STREAM_ADDR);
        assert_eq!(cfg.collaborator_base_url, DEFAULT_COLLABORATOR_BASE_URL);
        assert_eq!(cfg.default_field_id.as_str(), "field-1");
        assert!(cfg.device_fields.is_empty());
        assert_eq!(cfg.reconnect_initial, Duration::from_millis(1000));
        assert_eq!(cfg.reconnect_max, Duration::from_secs(30));
        assert_eq!(cfg.stream_connect_timeout, Duration::from_secs(2));
        assert_eq!(cfg.http_timeout, Duration::from_secs(10));
        assert_eq!(cfg.battery_low_pct, 20.0);
        assert_eq!(cfg.subscriber_queue_warn, 1024);
    }

    #[test]
    fn maps_and_aliases_are_parsed() {
        let cfg = config_from(&[
            ("FIELD_DEVICE_MAP", "A4:CF:12:9B:3E:01=north, 00:11=south,"),
            ("SENSOR_TYPE_ALIASES", "plomb=lead, Mercure=MERCURY"),
        ])
        .unwrap();
        assert_eq!(cfg.device_fields.get("a4:cf:12:9b:3e:01").map(FieldId::as_str), Some("north"));
        assert_eq!(cfg.device_fields.len(), 2);
        assert_eq!(
            cfg.sensor_aliases,
            vec![("plomb".to_string(), SensorType::Lead), ("mercure".to_string(), SensorType::Mercury)]
        );

        let settings = cfg.router_settings(Arc::new(RangeTable::defaults()));
        assert_eq!(settings.normalizer.resolve_type("Plomb"), Some(SensorType::Lead));
    }

    #[test]
    fn bad_values_are_reported_by_name() {
        let err = config_from(&[("SENSOR_TYPE_ALIASES", "plomb=unobtainium")]).unwrap_err();
        assert!(err.starts_with("SENSOR_TYPE_ALIASES"), "{}", err);
        let err = config_from(&[("FIELD_DEVICE_MAP", "nonsense")]).unwrap_err();
        assert!(err.starts_with("FIELD_DEVICE_MAP"), "{}", err);
        let err = config_from(&[("RECONNECT_MAX_MS", "10")]).unwrap_err();
        assert!(err.contains("RECONNECT_MAX_MS"), "{}", err);
        let err = config_from(&[("BATTERY_LOW_PCT", "abc")]).unwrap_err();
        assert!(err.contains("BATTERY_LOW_PCT"), "{}", err);
        let err = config_from(&[("STREAM_CONNECT_TIMEOUT_MS", "0")]).unwrap_err();
        assert!(err.contains("STREAM_CONNECT_TIMEOUT_MS"), "{}", err);
    }

    #[test]
    fn stream_connect_timeout_is_independent_of_http_timeout() {
        let cfg = config_from(&[("HTTP_TIMEOUT_SECS", "30"), ("STREAM_CONNECT_TIMEOUT_MS", "750")]).unwrap();
        assert_eq!(cfg.http_timeout, Duration::from_secs(30));
        assert_eq!(cfg.stream_connect_timeout, Duration::from_millis(750));
    }

    #[test]
    fn explicit_ranges_file_is_loaded() {
        let cfg = config_from(&[("RANGES_FILE", "tests/data/ranges.json")]).unwrap();
        let ranges = cfg.load_ranges().unwrap();
        assert_eq!(ranges.critical_limit(SensorType::Lead), Some(0.05));
        assert!(ranges.optimal(SensorType::Ph).is_some());

        let missing = config_from(&[("RANGES_FILE", "tests/data/does-not-exist.json")]).unwrap();
        assert!(missing.load_ranges().is_err());
    }

    #[test]
    fn env_lines() {
        assert_eq!(parse_env_line("  # comment"), Ok(None));
        assert_eq!(parse_env_line(""), Ok(None));
        assert_eq!(
            parse_env_line("export STREAM_ADDR=10.0.0.5:3000 # lab"),
            Ok(Some(("STREAM_ADDR".into(), "10.0.0.5:3000".into())))
        );
        assert_eq!(
            parse_env_line(r#"FIELD_DEVICE_MAP="aa:bb=north, cc:dd=south""#),
            Ok(Some(("FIELD_DEVICE_MAP".into(), "aa:bb=north, cc:dd=south".into())))
        );
        assert_eq!(parse_env_line("EMPTY="), Ok(Some(("EMPTY".into(), String::new()))));
        assert!(parse_env_line("NO_EQUALS").is_err());
        assert!(parse_env_line("A='open").is_err());
        assert!(parse_env_line("BAD KEY=1").is_err());
    }
}
