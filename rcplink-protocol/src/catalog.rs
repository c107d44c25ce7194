//! Parameter catalog.
//!
//! The catalog is a static table describing every addressable parameter:
//! how its values are written on the wire, whether it can be read or
//! written, and which numeric domain and coordinate bounds apply. It is
//! loaded once (from YAML, JSON or code) and validated up front so the codec
//! never has to interpret type strings per message.
//!
//! ```yaml
//! parameters:
//!   - address: mixer:input:fader:level
//!     kind: { type: scaled, scale: 100 }
//!     access: read_write
//!     min: -32768
//!     max: 1000
//!     rows: 64
//!   - address: mixer:input:label
//!     kind: { type: string }
//! ```

use crate::command::Value;
use crate::error::{CatalogError, ProtocolError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Wire representation of a parameter's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    /// Plain decimal integer.
    Integer,
    /// Fixed-point value; the raw integer is `text * scale`.
    Scaled { scale: u32 },
    /// Fixed-point frequency in Hz; also accepts a `k` suffix on input.
    Frequency { scale: u32 },
    /// `0` or `1`.
    Boolean,
    /// Double-quoted text.
    String,
}

impl ParamKind {
    /// Short name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ParamKind::Integer => "integer",
            ParamKind::Scaled { .. } => "scaled",
            ParamKind::Frequency { .. } => "frequency",
            ParamKind::Boolean => "boolean",
            ParamKind::String => "string",
        }
    }

    /// Integer scale factor between wire text and raw value.
    pub fn scale(&self) -> u32 {
        match self {
            ParamKind::Scaled { scale } | ParamKind::Frequency { scale } => *scale,
            _ => 1,
        }
    }

    /// Number of fractional digits on the wire.
    pub fn decimals(&self) -> u32 {
        self.scale().checked_ilog10().unwrap_or(0)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ParamKind::Integer | ParamKind::Scaled { .. } | ParamKind::Frequency { .. }
        )
    }
}

/// Access mode of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl Access {
    pub fn readable(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

fn default_true() -> bool {
    true
}

/// Definition of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    /// Colon-delimited address.
    pub address: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub access: Access,
    /// Whether row/column tokens appear on the wire.
    #[serde(default = "default_true")]
    pub indexed: bool,
    /// The device reports the column in aggregate, so queue deduplication
    /// ignores it.
    #[serde(default)]
    pub aggregate_columns: bool,
    /// Lowest raw value accepted (numeric kinds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    /// Highest raw value accepted (numeric kinds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    /// Number of rows, if bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,
    /// Number of columns, if bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<u32>,
}

impl ParamDef {
    pub fn new(address: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            address: address.into(),
            kind,
            access: Access::default(),
            indexed: true,
            aggregate_columns: false,
            min: None,
            max: None,
            rows: None,
            columns: None,
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_bounds(mut self, rows: u32, columns: u32) -> Self {
        self.rows = Some(rows);
        self.columns = Some(columns);
        self
    }

    pub fn unindexed(mut self) -> Self {
        self.indexed = false;
        self
    }

    pub fn aggregate(mut self) -> Self {
        self.aggregate_columns = true;
        self
    }

    /// Inclusive numeric domain.
    pub fn domain(&self) -> (i64, i64) {
        (self.min.unwrap_or(i64::MIN), self.max.unwrap_or(i64::MAX))
    }

    /// Clamps a raw value into the numeric domain.
    pub fn clamp(&self, raw: i64) -> i64 {
        let (min, max) = self.domain();
        raw.clamp(min, max)
    }

    fn check_domain(&self, raw: i64) -> Result<i64, ProtocolError> {
        let (min, max) = self.domain();
        if raw < min || raw > max {
            return Err(ProtocolError::OutOfRange {
                address: self.address.clone(),
                value: raw,
                min,
                max,
            });
        }
        Ok(raw)
    }

    /// Validates a coordinate against the declared bounds.
    pub fn check_index(&self, row: u32, column: u32) -> Result<(), ProtocolError> {
        let row_ok = self.rows.map_or(true, |n| row < n);
        let column_ok = self.columns.map_or(true, |n| column < n);
        if row_ok && column_ok {
            Ok(())
        } else {
            Err(ProtocolError::IndexOutOfBounds {
                address: self.address.clone(),
                row,
                column,
            })
        }
    }

    /// Converts a value into the canonical form stored in the cache and
    /// queued for transmission.
    pub fn normalize(&self, value: &Value) -> Result<Value, ProtocolError> {
        let mismatch = || ProtocolError::TypeMismatch {
            kind: self.kind.name(),
            value: value.to_string(),
        };

        match self.kind {
            ParamKind::Integer => match value {
                Value::Int(v) => Ok(Value::Int(self.check_domain(*v)?)),
                Value::Float(f) if f.is_finite() => {
                    Ok(Value::Int(self.check_domain(f.round() as i64)?))
                }
                _ => Err(mismatch()),
            },
            ParamKind::Scaled { scale } | ParamKind::Frequency { scale } => match value {
                Value::Int(v) => Ok(Value::Int(self.check_domain(*v)?)),
                Value::Float(f) if f.is_finite() => {
                    let raw = (f * f64::from(scale)).round() as i64;
                    Ok(Value::Int(self.check_domain(raw)?))
                }
                _ => Err(mismatch()),
            },
            ParamKind::Boolean => value.as_bool().map(Value::Bool).ok_or_else(mismatch),
            ParamKind::String => match value {
                Value::Str(s) => Ok(Value::Str(s.clone())),
                _ => Err(mismatch()),
            },
        }
    }

    /// Compares two values using this parameter's native comparison.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match (self.normalize(a), self.normalize(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => a == b,
        }
    }

    /// Formats a value as a wire token.
    pub fn format_value(&self, value: &Value) -> Result<String, ProtocolError> {
        let value = self.normalize(value)?;
        let token = match (self.kind, &value) {
            (ParamKind::Integer, Value::Int(v)) => v.to_string(),
            (ParamKind::Scaled { scale }, Value::Int(v))
            | (ParamKind::Frequency { scale }, Value::Int(v)) => format_fixed(*v, scale),
            (ParamKind::Boolean, Value::Bool(b)) => (if *b { "1" } else { "0" }).to_string(),
            (ParamKind::String, Value::Str(s)) => quote(s),
            _ => {
                return Err(ProtocolError::TypeMismatch {
                    kind: self.kind.name(),
                    value: value.to_string(),
                })
            }
        };
        Ok(token)
    }

    /// Parses a wire token reported by the device.
    pub fn parse_value(&self, token: &str, quoted: bool) -> Result<Value, ProtocolError> {
        let invalid = || ProtocolError::InvalidValue {
            kind: self.kind.name(),
            token: token.to_string(),
        };

        if quoted && self.kind != ParamKind::String {
            return Err(invalid());
        }

        match self.kind {
            ParamKind::Integer => {
                let v = token.parse::<i64>().map_err(|_| invalid())?;
                Ok(Value::Int(self.check_domain(v)?))
            }
            ParamKind::Scaled { .. } => {
                let v = parse_fixed(token, self.kind.decimals()).ok_or_else(invalid)?;
                Ok(Value::Int(self.check_domain(v)?))
            }
            ParamKind::Frequency { .. } => {
                let v = match token.strip_suffix(['k', 'K']) {
                    Some(kilo) => parse_fixed(kilo, self.kind.decimals() + 3),
                    None => parse_fixed(token, self.kind.decimals()),
                }
                .ok_or_else(invalid)?;
                Ok(Value::Int(self.check_domain(v)?))
            }
            ParamKind::Boolean => match token {
                "0" => Ok(Value::Bool(false)),
                "1" => Ok(Value::Bool(true)),
                _ => Err(invalid()),
            },
            ParamKind::String => Ok(Value::Str(token.to_string())),
        }
    }

    /// Parses user-entered text (engineering units) into a value.
    pub fn parse_input(&self, text: &str) -> Result<Value, ProtocolError> {
        match self.kind {
            ParamKind::Boolean => match text.to_ascii_lowercase().as_str() {
                "1" | "on" | "true" => Ok(Value::Bool(true)),
                "0" | "off" | "false" => Ok(Value::Bool(false)),
                _ => Err(ProtocolError::InvalidValue {
                    kind: self.kind.name(),
                    token: text.to_string(),
                }),
            },
            _ => self.parse_value(text, false),
        }
    }
}

/// Formats a raw integer as fixed-point text with `scale`'s decimals.
pub fn format_fixed(raw: i64, scale: u32) -> String {
    if scale <= 1 {
        return raw.to_string();
    }
    let decimals = scale.ilog10() as usize;
    let scale = u64::from(scale);
    let sign = if raw < 0 { "-" } else { "" };
    let abs = raw.unsigned_abs();
    format!(
        "{}{}.{:0width$}",
        sign,
        abs / scale,
        abs % scale,
        width = decimals
    )
}

/// Parses fixed-point text into a raw integer with `decimals` implied digits.
///
/// Returns `None` for malformed text, too many fractional digits, or
/// overflow. Uses integer arithmetic only so round trips are exact.
pub fn parse_fixed(text: &str, decimals: u32) -> Option<i64> {
    let (negative, body) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) || frac_part.len() > decimals as usize {
        return None;
    }

    let int: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };
    let mut frac: i64 = if frac_part.is_empty() {
        0
    } else {
        frac_part.parse().ok()?
    };
    frac = frac.checked_mul(10i64.checked_pow(decimals - frac_part.len() as u32)?)?;

    let raw = int
        .checked_mul(10i64.checked_pow(decimals)?)?
        .checked_add(frac)?;
    Some(if negative { -raw } else { raw })
}

/// Double-quotes a string, escaping `"` and `\`.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Returns whether `address` is a well-formed colon-delimited address.
pub fn is_valid_address(address: &str) -> bool {
    !address.is_empty()
        && address
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '"' && c != '\\')
        && address.split(':').all(|segment| !segment.is_empty())
}

fn validate(def: &ParamDef) -> Result<(), CatalogError> {
    if !is_valid_address(&def.address) {
        return Err(CatalogError::InvalidAddress(def.address.clone()));
    }

    let scale = def.kind.scale();
    if scale == 0 || 10u32.pow(scale.ilog10()) != scale {
        return Err(CatalogError::InvalidScale {
            address: def.address.clone(),
            scale,
        });
    }

    let (min, max) = def.domain();
    if min > max {
        return Err(CatalogError::EmptyDomain {
            address: def.address.clone(),
            min,
            max,
        });
    }

    if def.rows == Some(0) || def.columns == Some(0) {
        return Err(CatalogError::ZeroBounds(def.address.clone()));
    }

    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    parameters: Vec<ParamDef>,
}

/// Validated parameter table keyed by address.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    params: HashMap<String, ParamDef>,
}

impl Catalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a programmatic catalog.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Builds a catalog from definitions, validating each one.
    pub fn from_defs(defs: impl IntoIterator<Item = ParamDef>) -> Result<Self, CatalogError> {
        let mut params = HashMap::new();
        for def in defs {
            validate(&def)?;
            if params.contains_key(&def.address) {
                return Err(CatalogError::DuplicateAddress(def.address));
            }
            params.insert(def.address.clone(), def);
        }
        Ok(Self { params })
    }

    /// Parses a YAML catalog document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_yaml::from_str(yaml)?;
        Self::from_defs(file.parameters)
    }

    /// Parses a JSON catalog document.
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Self::from_defs(file.parameters)
    }

    /// Loads a catalog file; `.json` files are parsed as JSON, anything else
    /// as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| CatalogError::Io(path.to_path_buf(), e))?;
        let catalog = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };
        tracing::debug!(
            "Loaded {} parameters from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Serialises the catalog as YAML, sorted by address.
    pub fn to_yaml(&self) -> Result<String, CatalogError> {
        let mut parameters: Vec<ParamDef> = self.params.values().cloned().collect();
        parameters.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(serde_yaml::to_string(&CatalogFile { parameters })?)
    }

    /// Looks up a parameter.
    pub fn get(&self, address: &str) -> Option<&ParamDef> {
        self.params.get(address)
    }

    /// Looks up a parameter, failing with `UnknownAddress`.
    pub fn require(&self, address: &str) -> Result<&ParamDef, ProtocolError> {
        self.get(address)
            .ok_or_else(|| ProtocolError::UnknownAddress(address.to_string()))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.params.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterates over definitions in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &ParamDef> {
        self.params.values()
    }
}

/// Collects definitions and validates them on `build`.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    defs: Vec<ParamDef>,
}

impl CatalogBuilder {
    pub fn param(mut self, def: ParamDef) -> Self {
        self.defs.push(def);
        self
    }

    pub fn build(self) -> Result<Catalog, CatalogError> {
        Catalog::from_defs(self.defs)
    }
}
