//! Helpers shared across the rig: evaluation-result casting and xPSR decoding

use std::fmt;

/// A debugger evaluation result cast into a host-side type.
///
/// The machine interface reports every value as text; this mirrors the
/// casting the debugger's console applies (hex addresses, char literals,
/// booleans) so test code can compare against plain Rust values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    /// Smart-cast a textual evaluation result.
    ///
    /// Handles char literals (`2 '\002'`), booleans, hex values with
    /// function (`0x0304 <func>`) or string (`0x65 ""`) suffixes, decimal
    /// integers and floats. Anything else is kept as a string.
    pub fn parse(data: &str) -> Value {
        let mut data = data.trim();

        // char values arrive as `2 '\002'`; keep the numeric part
        if let Some(idx) = data.find(" '") {
            data = &data[..idx];
        }

        let lower = data.to_lowercase();
        if lower.contains("false") {
            return Value::Bool(false);
        }
        if lower.contains("true") {
            return Value::Bool(true);
        }

        if let Some(hex) = data.strip_prefix("0x").or_else(|| data.strip_prefix("0X")) {
            // function pointers (`0x0304 <func_name>`) and char pointers
            // (`0x65 "text"`) carry a suffix after the address
            let hex = hex
                .split(" <")
                .next()
                .unwrap_or(hex)
                .split(" \"")
                .next()
                .unwrap_or(hex);
            if let Ok(v) = i64::from_str_radix(hex.trim(), 16) {
                return Value::Int(v);
            }
        }

        if let Ok(v) = data.parse::<i64>() {
            return Value::Int(v);
        }
        if let Ok(v) = data.parse::<f64>() {
            return Value::Float(v);
        }

        Value::Str(data.to_string())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

/// True if the xPSR value indicates the core is inside an IT block.
///
/// IT state lives in xPSR bits [26:25] (IT[1:0]) and [15:10] (IT[7:2]) on
/// Arm Cortex-M. Function-call evaluation is unsafe while any of them are
/// set.
pub fn xpsr_in_it_block(xpsr: u32) -> bool {
    (xpsr >> 25) & 0b11 != 0 || (xpsr >> 10) & 0b11_1111 != 0
}

/// Human-readable multi-line description of an xPSR value.
pub fn xpsr_describe(xpsr: u32) -> String {
    let mut ret = format!("xPSR: 0b{:032b} (0x{:08x})\n", xpsr, xpsr);
    ret += &format!("negative (N): ...... {}\n", (xpsr >> 31) & 1);
    ret += &format!("zero (Z): .......... {}\n", (xpsr >> 30) & 1);
    ret += &format!("carry (C): ......... {}\n", (xpsr >> 29) & 1);
    ret += &format!("overflow (V): ...... {}\n", (xpsr >> 28) & 1);
    ret += &format!("cumulative sat. (Q): {}\n", (xpsr >> 27) & 1);
    ret += &format!("if/then/else (IT): . {:02b}     (IT[1:0])\n", (xpsr >> 25) & 0b11);
    ret += &format!("thumb state (T): ... {}\n", (xpsr >> 24) & 1);
    ret += &format!("gt or equal (GE): .. {}\n", (xpsr >> 16) & 0b1111);
    ret += &format!("if/then/else (IT): . {:06b} (IT[7:2])\n", (xpsr >> 10) & 0b11_1111);
    ret
}
