//! Conversions between rendered parameter values and PostgreSQL types.
//!
//! Bound values arrive as JSON values; the server-inferred parameter type
//! decides how each one is encoded. Result columns are decoded back into JSON
//! values so rows can be handed to serde.

use std::error::Error as StdError;
use std::net::IpAddr;
use std::str::FromStr;

use bytes::BytesMut;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_types::{FromSql, IsNull, Kind, ToSql, Type, to_sql_checked};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use crate::error::DriverError;

type BoxError = Box<dyn StdError + Sync + Send>;

/// A bound parameter value, encoded according to the type the server
/// inferred for its placeholder.
#[derive(Debug, Clone, Copy)]
pub struct SqlParam<'a>(pub &'a Value);

impl ToSql for SqlParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        encode(self.0, ty, out)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn encode(value: &Value, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if value.is_null() {
        return Ok(IsNull::Yes);
    }

    match *ty {
        Type::BOOL => match value {
            Value::Bool(b) => b.to_sql(ty, out),
            _ => Err(mismatch(value, ty)),
        },
        Type::INT2 => i16::try_from(integer(value, ty)?)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(integer(value, ty)?)?.to_sql(ty, out),
        Type::INT8 => integer(value, ty)?.to_sql(ty, out),
        Type::OID => u32::try_from(integer(value, ty)?)?.to_sql(ty, out),
        Type::FLOAT4 => (float(value, ty)? as f32).to_sql(ty, out),
        Type::FLOAT8 => float(value, ty)?.to_sql(ty, out),
        Type::NUMERIC => {
            let decimal = match value {
                Value::Number(n) => Decimal::from_str(&n.to_string())
                    .or_else(|_| Decimal::from_scientific(&n.to_string()))?,
                Value::String(s) => Decimal::from_str(s.trim())?,
                _ => return Err(mismatch(value, ty)),
            };
            decimal.to_sql(ty, out)
        }
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(mismatch(value, ty)),
            };
            text.to_sql(ty, out)
        }
        Type::UUID => Uuid::parse_str(text(value, ty)?)?.to_sql(ty, out),
        Type::TIMESTAMPTZ => {
            let parsed: DateTime<FixedOffset> = text(value, ty)?.parse()?;
            parsed.with_timezone(&Utc).to_sql(ty, out)
        }
        Type::TIMESTAMP => {
            let s = text(value, ty)?;
            let parsed = NaiveDateTime::from_str(s)
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))?;
            parsed.to_sql(ty, out)
        }
        Type::DATE => NaiveDate::from_str(text(value, ty)?)?.to_sql(ty, out),
        Type::TIME => NaiveTime::from_str(text(value, ty)?)?.to_sql(ty, out),
        Type::JSON | Type::JSONB => value.to_sql(ty, out),
        Type::BYTEA => {
            match value {
                Value::String(s) => out.extend_from_slice(s.as_bytes()),
                Value::Array(items) => {
                    for item in items {
                        let byte = item
                            .as_u64()
                            .and_then(|b| u8::try_from(b).ok())
                            .ok_or_else(|| mismatch(value, ty))?;
                        out.extend_from_slice(&[byte]);
                    }
                }
                _ => return Err(mismatch(value, ty)),
            }
            Ok(IsNull::No)
        }
        _ => match ty.kind() {
            Kind::Array(_) => match value {
                Value::Array(items) => {
                    let params: Vec<SqlParam<'_>> = items.iter().map(SqlParam).collect();
                    params.to_sql(ty, out)
                }
                _ => Err(mismatch(value, ty)),
            },
            Kind::Domain(inner) => encode(value, inner, out),
            Kind::Enum(_) => {
                out.extend_from_slice(text(value, ty)?.as_bytes());
                Ok(IsNull::No)
            }
            // Extension text types such as citext.
            _ => match value {
                Value::String(s) => {
                    out.extend_from_slice(s.as_bytes());
                    Ok(IsNull::No)
                }
                _ => Err(format!("unsupported parameter type {}", ty.name()).into()),
            },
        },
    }
}

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    format!("cannot bind {} as {}", json_type(value), ty.name()).into()
}

fn integer(value: &Value, ty: &Type) -> Result<i64, BoxError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| mismatch(value, ty)),
        Value::String(s) => Ok(s.trim().parse()?),
        _ => Err(mismatch(value, ty)),
    }
}

fn float(value: &Value, ty: &Type) -> Result<f64, BoxError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| mismatch(value, ty)),
        Value::String(s) => Ok(s.trim().parse()?),
        _ => Err(mismatch(value, ty)),
    }
}

fn text<'a>(value: &'a Value, ty: &Type) -> Result<&'a str, BoxError> {
    value.as_str().ok_or_else(|| mismatch(value, ty))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A column value decoded into JSON.
///
/// Accepts every type so arrays of any member type decode through the
/// driver's array support; types without a decoder fail in `from_sql`.
struct Decoded(Value);

impl<'a> FromSql<'a> for Decoded {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode_value(ty, raw).map(Self)
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(Self(Value::Null))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Decode every column of a driver row, in column order.
pub fn decode_row(row: &tokio_postgres::Row) -> Result<Vec<Value>, DriverError> {
    (0..row.len()).map(|idx| decode_column(row, idx)).collect()
}

fn decode_column(row: &tokio_postgres::Row, idx: usize) -> Result<Value, DriverError> {
    row.try_get::<_, Decoded>(idx)
        .map(|decoded| decoded.0)
        .map_err(|e| decode_error(row, idx, e.to_string()))
}

fn decode_value(ty: &Type, raw: &[u8]) -> Result<Value, BoxError> {
    let value = match *ty {
        Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
        Type::INT2 => Value::from(i16::from_sql(ty, raw)?),
        Type::INT4 => Value::from(i32::from_sql(ty, raw)?),
        Type::INT8 => Value::from(i64::from_sql(ty, raw)?),
        Type::OID => Value::from(u32::from_sql(ty, raw)?),
        Type::CHAR => Value::String(char::from(i8::from_sql(ty, raw)? as u8).to_string()),
        Type::FLOAT4 => float_value(f64::from(f32::from_sql(ty, raw)?)),
        Type::FLOAT8 => float_value(f64::from_sql(ty, raw)?),
        // Kept as text so no precision is lost.
        Type::NUMERIC => Value::String(Decimal::from_sql(ty, raw)?.to_string()),
        Type::MONEY => Value::String(Decimal::new(i64::from_sql(&Type::INT8, raw)?, 2).to_string()),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN | Type::XML => {
            Value::String(String::from_sql(&Type::TEXT, raw)?)
        }
        Type::UUID => Value::String(Uuid::from_sql(ty, raw)?.to_string()),
        Type::TIMESTAMP => serde_json::to_value(NaiveDateTime::from_sql(ty, raw)?)?,
        Type::TIMESTAMPTZ => serde_json::to_value(DateTime::<Utc>::from_sql(ty, raw)?)?,
        Type::DATE => serde_json::to_value(NaiveDate::from_sql(ty, raw)?)?,
        Type::TIME => serde_json::to_value(NaiveTime::from_sql(ty, raw)?)?,
        Type::TIMETZ => Value::String(timetz_text(raw)?),
        Type::INTERVAL => Value::String(interval_text(raw)?),
        Type::INET => Value::String(inet_text(raw, false)?),
        Type::CIDR => Value::String(inet_text(raw, true)?),
        Type::MACADDR => Value::String(macaddr_text(raw)?),
        Type::JSON | Type::JSONB => Value::from_sql(ty, raw)?,
        Type::BYTEA => serde_json::to_value(<Vec<u8>>::from_sql(ty, raw)?)?,
        _ => match ty.kind() {
            Kind::Array(_) => Value::Array(
                Vec::<Decoded>::from_sql(ty, raw)?
                    .into_iter()
                    .map(|decoded| decoded.0)
                    .collect(),
            ),
            Kind::Domain(inner) => decode_value(inner, raw)?,
            Kind::Enum(_) => Value::String(std::str::from_utf8(raw)?.to_string()),
            _ => text_fallback(ty, raw)?,
        },
    };
    Ok(value)
}

/// Extension types such as `citext` send their text form.
fn text_fallback(ty: &Type, raw: &[u8]) -> Result<Value, BoxError> {
    match std::str::from_utf8(raw) {
        Ok(text) if !text.contains('\0') => Ok(Value::String(text.to_string())),
        _ => Err(format!("unsupported column type `{}`", ty.name()).into()),
    }
}

fn be_i64(raw: &[u8]) -> Result<i64, BoxError> {
    Ok(i64::from_be_bytes(<[u8; 8]>::try_from(raw)?))
}

fn be_i32(raw: &[u8]) -> Result<i32, BoxError> {
    Ok(i32::from_be_bytes(<[u8; 4]>::try_from(raw)?))
}

/// Render an interval the way the server does with `IntervalStyle = postgres`,
/// e.g. `1 year 2 mons 3 days 04:05:06.5`.
fn interval_text(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() != 16 {
        return Err("invalid interval length".into());
    }
    let micros = be_i64(&raw[..8])?;
    let days = be_i32(&raw[8..12])?;
    let months = be_i32(&raw[12..])?;

    let mut parts = Vec::new();
    for (n, unit) in [(months / 12, "year"), (months % 12, "mon"), (days, "day")] {
        match n {
            0 => {}
            1 => parts.push(format!("1 {unit}")),
            n => parts.push(format!("{n} {unit}s")),
        }
    }

    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 {
            "-"
        } else if months < 0 || days < 0 {
            "+"
        } else {
            ""
        };
        parts.push(format!("{sign}{}", clock_text(micros.unsigned_abs())));
    }
    Ok(parts.join(" "))
}

/// `HH:MM:SS` with a fractional part only when there is one.
fn clock_text(micros: u64) -> String {
    let hours = micros / 3_600_000_000;
    let minutes = micros / 60_000_000 % 60;
    let seconds = micros / 1_000_000 % 60;
    let fraction = micros % 1_000_000;

    let mut text = format!("{hours:02}:{minutes:02}:{seconds:02}");
    if fraction != 0 {
        let digits = format!("{fraction:06}");
        text.push('.');
        text.push_str(digits.trim_end_matches('0'));
    }
    text
}

/// `10:30:00+02`, or `10:30:00-03:30` for offsets with minutes.
fn timetz_text(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() != 12 {
        return Err("invalid timetz length".into());
    }
    let micros = u64::try_from(be_i64(&raw[..8])?)?;
    // The server stores seconds west of UTC.
    let east = -be_i32(&raw[8..])?;

    let sign = if east < 0 { '-' } else { '+' };
    let east = east.unsigned_abs();
    let mut text = format!("{}{sign}{:02}", clock_text(micros), east / 3600);
    if east % 3600 != 0 {
        text.push_str(&format!(":{:02}", east % 3600 / 60));
    }
    Ok(text)
}

/// `inet` values omit a full-length netmask; `cidr` values always carry it.
fn inet_text(raw: &[u8], cidr: bool) -> Result<String, BoxError> {
    let [family, bits, _, len, address @ ..] = raw else {
        return Err("invalid inet value".into());
    };
    if usize::from(*len) != address.len() {
        return Err("invalid inet address length".into());
    }

    let (ip, full) = match (*family, address.len()) {
        (2, 4) => (IpAddr::from(<[u8; 4]>::try_from(address)?), 32),
        (3, 16) => (IpAddr::from(<[u8; 16]>::try_from(address)?), 128),
        _ => return Err(format!("unknown inet family {family}").into()),
    };

    Ok(if cidr || *bits != full {
        format!("{ip}/{bits}")
    } else {
        ip.to_string()
    })
}

fn macaddr_text(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() != 6 {
        return Err("invalid macaddr length".into());
    }
    Ok(raw
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

fn decode_error(row: &tokio_postgres::Row, idx: usize, message: impl Into<String>) -> DriverError {
    let column = &row.columns()[idx];
    DriverError::decode(column.name(), column.type_().name(), message)
}

/// JSON has no NaN or infinity; those are returned as text.
fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or_else(|| Value::String(f.to_string()), Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn encoded(value: Value, ty: &Type) -> Result<Option<Vec<u8>>, BoxError> {
        let mut out = BytesMut::new();
        match SqlParam(&value).to_sql(ty, &mut out)? {
            IsNull::Yes => Ok(None),
            IsNull::No => Ok(Some(out.to_vec())),
        }
    }

    fn native<T: ToSql>(value: T, ty: &Type) -> Vec<u8> {
        let mut out = BytesMut::new();
        value.to_sql(ty, &mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn test_null_is_null_for_any_type() {
        assert_eq!(encoded(Value::Null, &Type::INT4).unwrap(), None);
        assert_eq!(encoded(Value::Null, &Type::TEXT).unwrap(), None);
    }

    #[test]
    fn test_integers_follow_parameter_type() {
        assert_eq!(encoded(json!(3), &Type::INT4).unwrap(), Some(native(3i32, &Type::INT4)));
        assert_eq!(encoded(json!(3), &Type::INT8).unwrap(), Some(native(3i64, &Type::INT8)));
        assert_eq!(encoded(json!("7"), &Type::INT2).unwrap(), Some(native(7i16, &Type::INT2)));
        assert!(encoded(json!(70000), &Type::INT2).is_err());
        assert!(encoded(json!(1.5), &Type::INT4).is_err());
    }

    #[test]
    fn test_text_and_bool() {
        assert_eq!(encoded(json!("acme"), &Type::TEXT).unwrap(), Some(b"acme".to_vec()));
        assert_eq!(encoded(json!(12), &Type::VARCHAR).unwrap(), Some(b"12".to_vec()));
        assert_eq!(encoded(json!(true), &Type::BOOL).unwrap(), Some(native(true, &Type::BOOL)));
        assert!(encoded(json!("yes"), &Type::BOOL).is_err());
    }

    #[test]
    fn test_numeric_from_number_and_text() {
        let expected = native(Decimal::from_str("12.50").unwrap(), &Type::NUMERIC);
        assert_eq!(encoded(json!("12.50"), &Type::NUMERIC).unwrap(), Some(expected));
        assert!(encoded(json!(12.5), &Type::NUMERIC).unwrap().is_some());
        assert!(encoded(json!("twelve"), &Type::NUMERIC).is_err());
    }

    #[test]
    fn test_uuid_and_timestamps() {
        let id = Uuid::new_v4();
        assert_eq!(
            encoded(json!(id.to_string()), &Type::UUID).unwrap(),
            Some(native(id, &Type::UUID))
        );
        assert!(encoded(json!("not-a-uuid"), &Type::UUID).is_err());

        assert!(encoded(json!("2024-05-01T10:00:00Z"), &Type::TIMESTAMPTZ).unwrap().is_some());
        assert!(encoded(json!("2024-05-01 10:00:00"), &Type::TIMESTAMP).unwrap().is_some());
        assert!(encoded(json!("2024-05-01"), &Type::DATE).unwrap().is_some());
    }

    #[test]
    fn test_arrays_use_member_type() {
        assert_eq!(
            encoded(json!([1, 2, 3]), &Type::INT4_ARRAY).unwrap(),
            Some(native(vec![1i32, 2, 3], &Type::INT4_ARRAY))
        );
        assert!(encoded(json!(1), &Type::INT4_ARRAY).is_err());
    }

    #[test]
    fn test_json_parameters() {
        let value = json!({"tier": "gold"});
        assert_eq!(
            encoded(value.clone(), &Type::JSONB).unwrap(),
            Some(native(value, &Type::JSONB))
        );
    }

    #[test]
    fn test_enum_parameters_and_values() {
        let mood = Type::new(
            "mood".to_string(),
            0,
            Kind::Enum(vec!["happy".to_string(), "sad".to_string()]),
            "public".to_string(),
        );
        assert_eq!(encoded(json!("happy"), &mood).unwrap(), Some(b"happy".to_vec()));
        assert_eq!(decode_value(&mood, b"sad").unwrap(), json!("sad"));
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode_value(&Type::INT4, &native(7i32, &Type::INT4)).unwrap(), json!(7));
        assert_eq!(decode_value(&Type::BOOL, &native(true, &Type::BOOL)).unwrap(), json!(true));
        assert_eq!(decode_value(&Type::CHAR, &native(b'a' as i8, &Type::CHAR)).unwrap(), json!("a"));
        assert_eq!(decode_value(&Type::TEXT, b"acme").unwrap(), json!("acme"));

        let amount = Decimal::from_str("12.50").unwrap();
        assert_eq!(
            decode_value(&Type::NUMERIC, &native(amount, &Type::NUMERIC)).unwrap(),
            json!("12.50")
        );
        assert_eq!(
            decode_value(&Type::MONEY, &native(1234i64, &Type::INT8)).unwrap(),
            json!("12.34")
        );
    }

    #[test]
    fn test_decode_arrays_of_any_member_type() {
        let floats = native(vec![Some(1.5f32), None], &Type::FLOAT4_ARRAY);
        assert_eq!(decode_value(&Type::FLOAT4_ARRAY, &floats).unwrap(), json!([1.5, null]));

        let amounts = native(
            vec![Decimal::from_str("1.10").unwrap(), Decimal::from_str("2").unwrap()],
            &Type::NUMERIC_ARRAY,
        );
        assert_eq!(
            decode_value(&Type::NUMERIC_ARRAY, &amounts).unwrap(),
            json!(["1.10", "2"])
        );

        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let dates = native(vec![day], &Type::DATE_ARRAY);
        assert_eq!(decode_value(&Type::DATE_ARRAY, &dates).unwrap(), json!(["2024-05-01"]));

        let at = day.and_hms_opt(10, 0, 0).unwrap().and_utc();
        let stamps = native(vec![at], &Type::TIMESTAMPTZ_ARRAY);
        assert_eq!(
            decode_value(&Type::TIMESTAMPTZ_ARRAY, &stamps).unwrap(),
            json!([serde_json::to_value(at).unwrap()])
        );
    }

    #[test]
    fn test_decode_domain_uses_base_type() {
        let positive = Type::new(
            "positive_int".to_string(),
            0,
            Kind::Domain(Type::INT4),
            "public".to_string(),
        );
        assert_eq!(decode_value(&positive, &native(5i32, &Type::INT4)).unwrap(), json!(5));
    }

    fn interval(micros: i64, days: i32, months: i32) -> Vec<u8> {
        let mut raw = micros.to_be_bytes().to_vec();
        raw.extend_from_slice(&days.to_be_bytes());
        raw.extend_from_slice(&months.to_be_bytes());
        raw
    }

    #[test]
    fn test_decode_interval() {
        let decode = |raw: Vec<u8>| decode_value(&Type::INTERVAL, &raw).unwrap();

        assert_eq!(decode(interval(0, 0, 0)), json!("00:00:00"));
        assert_eq!(decode(interval(0, 1, 0)), json!("1 day"));
        assert_eq!(
            decode(interval(4 * 3_600_000_000 + 5 * 60_000_000 + 6_500_000, 3, 14)),
            json!("1 year 2 mons 3 days 04:05:06.5")
        );
        assert_eq!(decode(interval(-3_600_000_000, 0, 0)), json!("-01:00:00"));
        assert_eq!(decode(interval(3_600_000_000, -1, 0)), json!("-1 days +01:00:00"));
        assert!(decode_value(&Type::INTERVAL, &[0; 4]).is_err());
    }

    #[test]
    fn test_decode_timetz() {
        let mut raw = (10i64 * 3_600_000_000 + 30 * 60_000_000).to_be_bytes().to_vec();
        raw.extend_from_slice(&(-7200i32).to_be_bytes());
        assert_eq!(decode_value(&Type::TIMETZ, &raw).unwrap(), json!("10:30:00+02"));

        let mut raw = 0i64.to_be_bytes().to_vec();
        raw.extend_from_slice(&12600i32.to_be_bytes());
        assert_eq!(decode_value(&Type::TIMETZ, &raw).unwrap(), json!("00:00:00-03:30"));
    }

    #[test]
    fn test_decode_network_types() {
        assert_eq!(
            decode_value(&Type::INET, &[2, 32, 0, 4, 192, 168, 0, 1]).unwrap(),
            json!("192.168.0.1")
        );
        assert_eq!(
            decode_value(&Type::INET, &[2, 24, 0, 4, 10, 0, 0, 7]).unwrap(),
            json!("10.0.0.7/24")
        );
        assert_eq!(
            decode_value(&Type::CIDR, &[2, 32, 1, 4, 10, 0, 0, 0]).unwrap(),
            json!("10.0.0.0/32")
        );

        let mut v6 = vec![3, 128, 0, 16];
        v6.extend_from_slice(&[0; 15]);
        v6.push(1);
        assert_eq!(decode_value(&Type::INET, &v6).unwrap(), json!("::1"));

        assert_eq!(
            decode_value(&Type::MACADDR, &[0x08, 0x00, 0x2b, 0x01, 0x02, 0x03]).unwrap(),
            json!("08:00:2b:01:02:03")
        );
        assert!(decode_value(&Type::INET, &[9, 0]).is_err());
    }

    #[test]
    fn test_unknown_types_fall_back_to_text() {
        let citext = Type::new("citext".to_string(), 0, Kind::Simple, "public".to_string());
        assert_eq!(decode_value(&citext, b"Acme").unwrap(), json!("Acme"));

        let binary = Type::new("opaque".to_string(), 0, Kind::Simple, "public".to_string());
        assert!(decode_value(&binary, &[0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_float_values() {
        assert_eq!(float_value(1.5), json!(1.5));
        assert_eq!(float_value(f64::NAN), json!("NaN"));
    }
}
