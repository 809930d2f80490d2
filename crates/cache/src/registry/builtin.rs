//! Built-in encoders and their reconstruction functions

use super::{Context, OBJECT_TAG, REFERENCE_KEY, Registry, TYPE_KEY, TypeKey, int_arg, str_arg};
use crate::value::{Args, Value};
use crate::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};

/// Rebuilds [`Value::Bytes`] from base64 text
pub const BYTES_FROM_BASE64: &str = "callcache::builtin:bytes_from_base64";
/// Rebuilds [`Value::Date`] from an ISO 8601 date
pub const DATE_FROM_ISO: &str = "callcache::builtin:date_from_iso";
/// Rebuilds [`Value::DateTime`] from RFC 3339 text
pub const DATETIME_FROM_RFC3339: &str = "callcache::builtin:datetime_from_rfc3339";
/// Rebuilds [`Value::Duration`] from `days, seconds, microseconds`
pub const DURATION: &str = "callcache::builtin:duration";

const DATE_FORMAT: &str = "%Y-%m-%d";
const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

pub(super) fn register(registry: &Registry) {
    registry.register_encoder(TypeKey::Any, encode_generic);
    registry.register_encoder(TypeKey::Callable, encode_callable);
    registry.register_encoder(TypeKey::Bytes, encode_bytes);
    registry.register_encoder(TypeKey::Date, encode_date);
    registry.register_encoder(TypeKey::DateTime, encode_datetime);
    registry.register_encoder(TypeKey::Duration, encode_duration);

    let symbols: [(&str, fn(&Context<'_>, &Args) -> Result<Value>); 4] = [
        (BYTES_FROM_BASE64, bytes_from_base64),
        (DATE_FROM_ISO, date_from_iso),
        (DATETIME_FROM_RFC3339, datetime_from_rfc3339),
        (DURATION, duration),
    ];
    for (reference, func) in symbols {
        if let Err(e) = registry.register_function(reference, func) {
            tracing::error!(reference, "Built-in symbol rejected: {e}");
        }
    }
}

/// Opaque objects that describe their own reconstruction call
fn encode_generic(
    registry: &Registry,
    value: &Value,
    ctx: &Context<'_>,
) -> Result<serde_json::Value> {
    let Value::Object(obj) = value else {
        return Err(Error::encode(
            value.type_name(),
            "value has no generic representation",
        ));
    };
    let reconstruction = obj
        .reconstruction()
        .ok_or_else(|| Error::encode(obj.type_name(), "object has no reconstruction call"))?;
    // Must decode again later
    registry.resolve(&reconstruction.callable)?;
    registry.call_tree(&reconstruction.callable, &reconstruction.args, ctx)
}

fn encode_callable(
    registry: &Registry,
    value: &Value,
    _ctx: &Context<'_>,
) -> Result<serde_json::Value> {
    let Value::Callable(callable) = value else {
        return Err(Error::encode(value.type_name(), "not a callable"));
    };
    if !registry.is_registered(&callable.reference) {
        return Err(Error::resolution(
            &callable.reference,
            "callable is not registered and could not be decoded",
        ));
    }
    Ok(serde_json::json!({
        TYPE_KEY: OBJECT_TAG,
        REFERENCE_KEY: callable.reference,
    }))
}

fn encode_bytes(registry: &Registry, value: &Value, ctx: &Context<'_>) -> Result<serde_json::Value> {
    let Value::Bytes(bytes) = value else {
        return Err(Error::encode(value.type_name(), "not bytes"));
    };
    registry.call_tree(BYTES_FROM_BASE64, &Args::new().arg(STANDARD.encode(bytes)), ctx)
}

fn encode_date(registry: &Registry, value: &Value, ctx: &Context<'_>) -> Result<serde_json::Value> {
    let Value::Date(date) = value else {
        return Err(Error::encode(value.type_name(), "not a date"));
    };
    registry.call_tree(
        DATE_FROM_ISO,
        &Args::new().arg(date.format(DATE_FORMAT).to_string()),
        ctx,
    )
}

fn encode_datetime(
    registry: &Registry,
    value: &Value,
    ctx: &Context<'_>,
) -> Result<serde_json::Value> {
    let Value::DateTime(ts) = value else {
        return Err(Error::encode(value.type_name(), "not a timestamp"));
    };
    registry.call_tree(
        DATETIME_FROM_RFC3339,
        &Args::new().arg(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        ctx,
    )
}

/// Durations are stored like calendar deltas: whole days, seconds within the
/// day and microseconds within the second, the last two never negative
fn encode_duration(
    registry: &Registry,
    value: &Value,
    ctx: &Context<'_>,
) -> Result<serde_json::Value> {
    let Value::Duration(delta) = value else {
        return Err(Error::encode(value.type_name(), "not a duration"));
    };
    let micros = delta
        .num_microseconds()
        .ok_or_else(|| Error::encode("duration", "duration overflows microseconds"))?;
    let days = micros.div_euclid(MICROS_PER_DAY);
    let rest = micros.rem_euclid(MICROS_PER_DAY);
    let args = Args::new()
        .arg(days)
        .arg(rest / MICROS_PER_SECOND)
        .arg(rest % MICROS_PER_SECOND);
    registry.call_tree(DURATION, &args, ctx)
}

fn bytes_from_base64(_ctx: &Context<'_>, args: &Args) -> Result<Value> {
    let text = str_arg(args, 0, "base64 text")?;
    STANDARD
        .decode(text.trim_end())
        .map(Value::Bytes)
        .map_err(|e| Error::decode(format!("invalid base64: {e}")))
}

fn date_from_iso(_ctx: &Context<'_>, args: &Args) -> Result<Value> {
    let text = str_arg(args, 0, "date")?;
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map(Value::Date)
        .map_err(|e| Error::decode(format!("invalid date {text:?}: {e}")))
}

fn datetime_from_rfc3339(_ctx: &Context<'_>, args: &Args) -> Result<Value> {
    let text = str_arg(args, 0, "timestamp")?;
    DateTime::parse_from_rfc3339(text)
        .map(|ts| Value::DateTime(ts.with_timezone(&Utc)))
        .map_err(|e| Error::decode(format!("invalid timestamp {text:?}: {e}")))
}

fn duration(_ctx: &Context<'_>, args: &Args) -> Result<Value> {
    let days = int_arg(args, 0, "days")?;
    let seconds = int_arg(args, 1, "seconds")?;
    let micros = int_arg(args, 2, "microseconds")?;
    let out_of_range = || Error::decode("duration out of range");
    let total = TimeDelta::try_days(days)
        .and_then(|d| d.checked_add(&TimeDelta::try_seconds(seconds)?))
        .and_then(|d| d.checked_add(&TimeDelta::microseconds(micros)))
        .ok_or_else(out_of_range)?;
    Ok(Value::Duration(total))
}
