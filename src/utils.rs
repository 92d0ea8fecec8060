use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Guarded data is only ever replaced wholesale, so a poisoned lock still holds a consistent value.

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Text of a caught panic payload.
pub fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Coerce a JSON value to a finite `f64`: numbers as-is, strings when they parse as numbers.
pub fn coerce_finite(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Accepts RFC 3339 strings or integer epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Non-empty trimmed string, if the value is one.
pub fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coercion_accepts_numbers_and_numeric_strings() {
        assert_eq!(coerce_finite(&json!(6.2)), Some(6.2));
        assert_eq!(coerce_finite(&json!(" 45 ")), Some(45.0));
        assert_eq!(coerce_finite(&json!("not-a-number")), None);
        assert_eq!(coerce_finite(&json!("NaN")), None);
        assert_eq!(coerce_finite(&json!("inf")), None);
        assert_eq!(coerce_finite(&json!(true)), None);
        assert_eq!(coerce_finite(&Value::Null), None);
    }

    #[test]
    fn timestamps_parse_from_rfc3339_and_millis() {
        let expected = Utc.with_ymd_and_hms(2025, 5, 15, 10, 50, 0).unwrap();
        assert_eq!(parse_timestamp(&json!("2025-05-15T10:50:00Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2025-05-15T12:50:00+02:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!(1747306200000i64)), Some(expected));
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }
}
