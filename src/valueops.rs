//! Value transform pipeline for push devices.
//!
//! Hardware that reports raw readings (a 0..4095 ADC count, tenths of a
//! degree) gets a per-device `convert` chain in its configuration; each op
//! is applied in order to the reported JSON value before it becomes the
//! device status.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// One step of a conversion chain, tagged by `type` in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueOp {
    Add { value: f64 },
    Subtract { value: f64 },
    Multiply { value: f64 },
    Divide { value: f64 },
    /// Cross-multiply: rescale `0..value_max_in` onto `0..value_max_out`.
    Xmulti { value_max_out: f64, value_max_in: f64 },
    Absolute,
    Round {
        #[serde(default)]
        decimals: i32,
    },
    Floor,
    Cast { cast_type: CastType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastType {
    Int,
    Number,
    Boolean,
}

/// Apply a conversion chain left to right.
pub fn apply_ops(value: Value, ops: &[ValueOp]) -> Result<Value, Error> {
    ops.iter().try_fold(value, |v, op| apply_op(v, op))
}

fn apply_op(value: Value, op: &ValueOp) -> Result<Value, Error> {
    match op {
        ValueOp::Add { value: opd } => number(as_number(&value)? + opd),
        ValueOp::Subtract { value: opd } => number(as_number(&value)? - opd),
        ValueOp::Multiply { value: opd } => number(as_number(&value)? * opd),
        ValueOp::Divide { value: opd } => {
            if *opd == 0.0 {
                return Err(Error::InvalidValue("division by zero".into()));
            }
            number(as_number(&value)? / opd)
        }
        ValueOp::Xmulti {
            value_max_out,
            value_max_in,
        } => {
            if *value_max_in == 0.0 {
                return Err(Error::InvalidValue("xmulti with zero input range".into()));
            }
            number(as_number(&value)? * value_max_out / value_max_in)
        }
        ValueOp::Absolute => number(as_number(&value)?.abs()),
        ValueOp::Round { decimals } => {
            let m = 10f64.powi(*decimals);
            number((as_number(&value)? * m).round() / m)
        }
        ValueOp::Floor => number(as_number(&value)?.floor()),
        ValueOp::Cast { cast_type } => cast(value, *cast_type),
    }
}

fn cast(value: Value, to: CastType) -> Result<Value, Error> {
    match to {
        CastType::Int => Ok(Value::from(as_number(&value)?.trunc() as i64)),
        CastType::Number => number(as_number(&value)?),
        CastType::Boolean => Ok(Value::Bool(truthy(&value))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Result<f64, Error> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::InvalidValue(format!("non-finite number {}", n))),
        Value::Bool(true) => Ok(1.0),
        Value::Bool(false) => Ok(0.0),
        other => Err(Error::InvalidValue(format!(
            "expected a number, got {}",
            other
        ))),
    }
}

fn number(f: f64) -> Result<Value, Error> {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| Error::InvalidValue(format!("non-finite result {}", f)))
}
