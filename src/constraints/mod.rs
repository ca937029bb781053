//! Constraint descriptions: parsing, validation and text rendering
//!
//! A constraint description is a JSON object with up to three groups,
//! `freeze`, `set` and `scan`, each a list of records:
//!
//! ```text
//! {
//!   "freeze": [{"type": "xyz", "indices": [0, 1, 2]}],
//!   "set":    [{"type": "angle", "indices": [1, 0, 4], "value": 110.0}],
//!   "scan":   [{"type": "distance", "indices": [1, 0], "start": 1.0, "stop": 1.2, "steps": 3}]
//! }
//! ```
//!
//! Indices are 0-based. Distances are in Angstroms and angles in degrees,
//! matching the line-oriented text block produced by [`ConstraintSet::render`]:
//!
//! ```text
//! $freeze
//! xyz 1 2 3
//! $set
//! angle 2 1 5 110.0
//! $scan
//! distance 2 1 1.0 1.2 3
//! ```

pub mod bind;

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The three constraint groups, in their fixed rendering order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Freeze,
    Set,
    Scan,
}

impl Group {
    /// All groups in rendering order
    pub const ALL: [Group; 3] = [Group::Freeze, Group::Set, Group::Scan];

    /// Key of the group in a constraint description
    pub fn key(&self) -> &'static str {
        match self {
            Group::Freeze => "freeze",
            Group::Set => "set",
            Group::Scan => "scan",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        Group::ALL.into_iter().find(|g| g.key() == key)
    }

    /// Fields a record of this group may carry besides `type` and `indices`
    fn value_fields(&self) -> &'static [&'static str] {
        match self {
            Group::Freeze => &[],
            Group::Set => &["value"],
            Group::Scan => &["start", "stop", "steps"],
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Position of a record within its group, used in error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub group: Group,
    pub index: usize,
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} record {}", self.group, self.index)
    }
}

/// Errors raised while reading a constraint description
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("constraint description must be an object, found {0}")]
    NotAnObject(String),

    #[error("unrecognized constraint key {0:?} (expected freeze, set or scan)")]
    UnknownKey(String),

    #[error("constraint group {0} must be a list of records")]
    NotAList(Group),

    #[error("{0}: record must be an object, found {1}")]
    NotARecord(RecordRef, String),

    #[error("{record}: unrecognized field {field:?}")]
    UnknownField { record: RecordRef, field: String },

    #[error("{record}: missing required field {field:?}")]
    MissingField { record: RecordRef, field: &'static str },

    #[error("{record}: `type` must be a constraint type name, found {found}")]
    InvalidType { record: RecordRef, found: String },

    #[error("{record}: unknown constraint type {name:?}")]
    UnknownType { record: RecordRef, name: String },

    #[error("{record}: {kind} takes {expected} atom indices, found {found}")]
    WrongArity {
        record: RecordRef,
        kind: ConstraintKind,
        expected: usize,
        found: usize,
    },

    #[error("{record}: {kind} needs at least one atom index")]
    EmptyIndices { record: RecordRef, kind: ConstraintKind },

    #[error("{record}: atom indices must be non-negative integers, found {found}")]
    InvalidIndex { record: RecordRef, found: String },

    #[error("{record}: field {field:?} must be a finite number, found {found}")]
    InvalidNumber {
        record: RecordRef,
        field: &'static str,
        found: String,
    },

    #[error("{record}: `steps` must be a positive integer, found {found}")]
    InvalidSteps { record: RecordRef, found: String },

    #[error("{record}: {kind} constraints can only be frozen")]
    UnsupportedPolicy { record: RecordRef, kind: ConstraintKind },

    #[error("line {line}: {message}")]
    Text { line: usize, message: String },

    #[error("invalid JSON: {0}")]
    Json(String),
}

/// Geometric quantity a constraint acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// Cartesian position of each listed atom
    Xyz,
    /// Interatomic distance
    Distance,
    /// Bond angle
    Angle,
    /// Dihedral (torsion) angle
    Dihedral,
    /// Centroid of the listed atoms
    Translation,
    /// Orientation of the listed atoms
    Rotation,
}

impl ConstraintKind {
    /// Parse a type name; `bond` is an alias of `distance`
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name.trim().to_lowercase().as_str() {
            "xyz" => ConstraintKind::Xyz,
            "distance" | "bond" => ConstraintKind::Distance,
            "angle" => ConstraintKind::Angle,
            "dihedral" => ConstraintKind::Dihedral,
            "translation" | "trans-xyz" => ConstraintKind::Translation,
            "rotation" => ConstraintKind::Rotation,
            _ => return None,
        };
        Some(kind)
    }

    /// Canonical name used in the text format
    pub fn name(&self) -> &'static str {
        match self {
            ConstraintKind::Xyz => "xyz",
            ConstraintKind::Distance => "distance",
            ConstraintKind::Angle => "angle",
            ConstraintKind::Dihedral => "dihedral",
            ConstraintKind::Translation => "trans-xyz",
            ConstraintKind::Rotation => "rotation",
        }
    }

    /// Fixed number of atom indices, or `None` for atom lists
    pub fn arity(&self) -> Option<usize> {
        match self {
            ConstraintKind::Distance => Some(2),
            ConstraintKind::Angle => Some(3),
            ConstraintKind::Dihedral => Some(4),
            ConstraintKind::Xyz | ConstraintKind::Translation | ConstraintKind::Rotation => None,
        }
    }

    /// Does the constraint act on a single scalar that can be set or scanned?
    pub fn is_scalar(&self) -> bool {
        self.arity().is_some()
    }

    /// Is the quantity an angle (degrees in descriptions)?
    pub fn is_angular(&self) -> bool {
        matches!(self, ConstraintKind::Angle | ConstraintKind::Dihedral)
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A number from a description that remembers whether it was written as an integer
#[derive(Debug, Clone, Copy)]
pub struct Scalar {
    value: f64,
    integral: bool,
}

impl Scalar {
    pub fn integer(value: i64) -> Self {
        Self {
            value: value as f64,
            integral: true,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_integral(&self) -> bool {
        self.integral
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self {
            value,
            integral: false,
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.integral {
            write!(f, "{}", self.value as i64)
        } else {
            f.write_str(&format_number(self.value))
        }
    }
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        if scalar.integral {
            Value::from(scalar.value as i64)
        } else {
            Value::from(scalar.value)
        }
    }
}

/// What a constraint does with its coordinate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Policy {
    /// Hold the current value
    Freeze,
    /// Drive to a target value
    Set { value: Scalar },
    /// Sweep `steps` values from `start` to `stop` inclusive
    Scan {
        start: Scalar,
        stop: Scalar,
        steps: usize,
    },
}

impl Policy {
    /// Group the policy belongs to
    pub fn group(&self) -> Group {
        match self {
            Policy::Freeze => Group::Freeze,
            Policy::Set { .. } => Group::Set,
            Policy::Scan { .. } => Group::Scan,
        }
    }
}

/// A single validated constraint record
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintRecord {
    pub kind: ConstraintKind,
    /// 0-based atom indices
    pub indices: Vec<usize>,
    pub policy: Policy,
}

impl ConstraintRecord {
    fn validate(&self, record: RecordRef) -> Result<(), SchemaError> {
        match self.kind.arity() {
            Some(expected) if expected != self.indices.len() => {
                return Err(SchemaError::WrongArity {
                    record,
                    kind: self.kind,
                    expected,
                    found: self.indices.len(),
                })
            }
            None if self.indices.is_empty() => {
                return Err(SchemaError::EmptyIndices {
                    record,
                    kind: self.kind,
                })
            }
            _ => {}
        }
        if !self.kind.is_scalar() && self.policy != Policy::Freeze {
            return Err(SchemaError::UnsupportedPolicy {
                record,
                kind: self.kind,
            });
        }
        match self.policy {
            Policy::Freeze => {}
            Policy::Set { value } => check_finite(record, "value", value.value())?,
            Policy::Scan { start, stop, steps } => {
                check_finite(record, "start", start.value())?;
                check_finite(record, "stop", stop.value())?;
                if steps == 0 {
                    return Err(SchemaError::InvalidSteps {
                        record,
                        found: "0".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// One line of the text format, with 1-based indices
    pub fn render(&self) -> String {
        let mut fields = vec![self.kind.name().to_string()];
        fields.extend(self.indices.iter().map(|i| (i + 1).to_string()));
        match self.policy {
            Policy::Freeze => {}
            Policy::Set { value } => fields.push(value.to_string()),
            Policy::Scan { start, stop, steps } => {
                fields.push(start.to_string());
                fields.push(stop.to_string());
                fields.push(steps.to_string());
            }
        }
        fields.join(" ")
    }
}

fn check_finite(record: RecordRef, field: &'static str, value: f64) -> Result<(), SchemaError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SchemaError::InvalidNumber {
            record,
            field,
            found: value.to_string(),
        })
    }
}

/// Shortest form that reads back to the same value.
///
/// Integral values keep a `.0`; magnitudes below 1e-4 or from 1e16 up use
/// an exponent with a sign and at least two digits (`1e-07`, `2.5e+16`).
pub fn format_number(value: f64) -> String {
    let magnitude = value.abs();
    if value != 0.0 && magnitude.is_finite() && !(1e-4..1e16).contains(&magnitude) {
        let formatted = format!("{:e}", value);
        return match formatted.split_once('e') {
            Some((mantissa, exponent)) => {
                let (sign, digits) = match exponent.strip_prefix('-') {
                    Some(digits) => ('-', digits),
                    None => ('+', exponent),
                };
                format!("{}e{}{:0>2}", mantissa, sign, digits)
            }
            None => formatted,
        };
    }
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// An ordered, validated set of constraints.
///
/// Records are kept per group in declaration order; iteration always yields
/// the freeze group, then set, then scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintSet {
    freeze: Vec<ConstraintRecord>,
    set: Vec<ConstraintRecord>,
    scan: Vec<ConstraintRecord>,
}

impl ConstraintSet {
    /// Empty constraint set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON constraint description
    pub fn parse(description: &Value) -> Result<Self, SchemaError> {
        let map = match description {
            Value::Object(map) => map,
            Value::Null => return Ok(Self::default()),
            other => return Err(SchemaError::NotAnObject(other.to_string())),
        };
        if let Some(key) = map.keys().find(|k| Group::from_key(k).is_none()) {
            return Err(SchemaError::UnknownKey(key.clone()));
        }

        let mut constraints = Self::default();
        for group in Group::ALL {
            let items = match map.get(group.key()) {
                None | Some(Value::Null) => continue,
                Some(Value::Array(items)) => items,
                Some(_) => return Err(SchemaError::NotAList(group)),
            };
            for (index, item) in items.iter().enumerate() {
                let record = RecordRef { group, index };
                let parsed = parse_record(record, item)?;
                constraints.group_mut(group).push(parsed);
            }
        }
        Ok(constraints)
    }

    /// Parse the line-oriented text block produced by [`ConstraintSet::render`]
    pub fn parse_text(text: &str) -> Result<Self, SchemaError> {
        let mut constraints = Self::default();
        let mut current: Option<Group> = None;
        for (n, raw) in text.lines().enumerate() {
            let line_no = n + 1;
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('$') {
                current = Some(Group::from_key(header.trim()).ok_or_else(|| SchemaError::Text {
                    line: line_no,
                    message: format!("unknown section ${}", header.trim()),
                })?);
                continue;
            }
            let group = current.ok_or_else(|| SchemaError::Text {
                line: line_no,
                message: "constraint line before any $freeze/$set/$scan header".to_string(),
            })?;
            let record = parse_text_line(group, line).map_err(|message| SchemaError::Text {
                line: line_no,
                message,
            })?;
            let position = RecordRef {
                group,
                index: constraints.group(group).len(),
            };
            record.validate(position).map_err(|e| SchemaError::Text {
                line: line_no,
                message: e.to_string(),
            })?;
            constraints.group_mut(group).push(record);
        }
        Ok(constraints)
    }

    /// Append a record after validating it
    pub fn push(
        &mut self,
        kind: ConstraintKind,
        indices: Vec<usize>,
        policy: Policy,
    ) -> Result<&mut Self, SchemaError> {
        let group = policy.group();
        let record = ConstraintRecord {
            kind,
            indices,
            policy,
        };
        record.validate(RecordRef {
            group,
            index: self.group(group).len(),
        })?;
        self.group_mut(group).push(record);
        Ok(self)
    }

    /// Records of one group in declaration order
    pub fn group(&self, group: Group) -> &[ConstraintRecord] {
        match group {
            Group::Freeze => &self.freeze,
            Group::Set => &self.set,
            Group::Scan => &self.scan,
        }
    }

    fn group_mut(&mut self, group: Group) -> &mut Vec<ConstraintRecord> {
        match group {
            Group::Freeze => &mut self.freeze,
            Group::Set => &mut self.set,
            Group::Scan => &mut self.scan,
        }
    }

    /// All records with their positions, freeze group first
    pub fn records(&self) -> impl Iterator<Item = (RecordRef, &ConstraintRecord)> {
        Group::ALL.into_iter().flat_map(move |group| {
            self.group(group)
                .iter()
                .enumerate()
                .map(move |(index, r)| (RecordRef { group, index }, r))
        })
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.freeze.len() + self.set.len() + self.scan.len()
    }

    /// No records at all?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Does the set contain scan records?
    pub fn has_scan(&self) -> bool {
        !self.scan.is_empty()
    }

    /// Replace the scan records by set records holding one scan point.
    ///
    /// The new set records follow the existing ones, in scan-record order.
    pub fn with_scan_point(&self, point: &[f64]) -> Self {
        debug_assert_eq!(point.len(), self.scan.len());
        let mut set = self.set.clone();
        set.extend(self.scan.iter().zip(point).map(|(record, &value)| ConstraintRecord {
            kind: record.kind,
            indices: record.indices.clone(),
            policy: Policy::Set {
                value: value.into(),
            },
        }));
        Self {
            freeze: self.freeze.clone(),
            set,
            scan: Vec::new(),
        }
    }

    /// Render the line-oriented text block
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for group in Group::ALL {
            let records = self.group(group);
            if records.is_empty() {
                continue;
            }
            lines.push(format!("${}", group.key()));
            lines.extend(records.iter().map(ConstraintRecord::render));
        }
        lines.join("\n")
    }

    /// JSON description equivalent to this set
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for group in Group::ALL {
            let records = self.group(group);
            if records.is_empty() {
                continue;
            }
            let list = records
                .iter()
                .map(|r| {
                    let mut obj = Map::new();
                    obj.insert("type".into(), Value::from(r.kind.name()));
                    obj.insert("indices".into(), Value::from(r.indices.clone()));
                    match r.policy {
                        Policy::Freeze => {}
                        Policy::Set { value } => {
                            obj.insert("value".into(), Value::from(value));
                        }
                        Policy::Scan { start, stop, steps } => {
                            obj.insert("start".into(), Value::from(start));
                            obj.insert("stop".into(), Value::from(stop));
                            obj.insert("steps".into(), Value::from(steps));
                        }
                    }
                    Value::Object(obj)
                })
                .collect();
            map.insert(group.key().into(), Value::Array(list));
        }
        Value::Object(map)
    }
}

impl fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for ConstraintSet {
    type Err = SchemaError;

    /// Parse a JSON constraint description from text
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s).map_err(|e| SchemaError::Json(e.to_string()))?;
        Self::parse(&value)
    }
}

fn parse_record(record: RecordRef, item: &Value) -> Result<ConstraintRecord, SchemaError> {
    let obj = item
        .as_object()
        .ok_or_else(|| SchemaError::NotARecord(record, item.to_string()))?;

    let allowed = record.group.value_fields();
    if let Some(field) = obj
        .keys()
        .find(|k| k.as_str() != "type" && k.as_str() != "indices" && !allowed.contains(&k.as_str()))
    {
        return Err(SchemaError::UnknownField {
            record,
            field: field.clone(),
        });
    }

    let kind = match obj.get("type") {
        None => {
            return Err(SchemaError::MissingField {
                record,
                field: "type",
            })
        }
        Some(Value::String(name)) => {
            ConstraintKind::from_name(name).ok_or_else(|| SchemaError::UnknownType {
                record,
                name: name.clone(),
            })?
        }
        Some(other) => {
            return Err(SchemaError::InvalidType {
                record,
                found: other.to_string(),
            })
        }
    };

    let indices = match obj.get("indices") {
        None => {
            return Err(SchemaError::MissingField {
                record,
                field: "indices",
            })
        }
        Some(Value::Array(list)) => list
            .iter()
            .map(|v| {
                v.as_u64().map(|i| i as usize).ok_or_else(|| SchemaError::InvalidIndex {
                    record,
                    found: v.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(SchemaError::InvalidIndex {
                record,
                found: other.to_string(),
            })
        }
    };

    let policy = match record.group {
        Group::Freeze => Policy::Freeze,
        Group::Set => Policy::Set {
            value: number_field(record, obj, "value")?,
        },
        Group::Scan => Policy::Scan {
            start: number_field(record, obj, "start")?,
            stop: number_field(record, obj, "stop")?,
            steps: steps_field(record, obj)?,
        },
    };

    let parsed = ConstraintRecord {
        kind,
        indices,
        policy,
    };
    parsed.validate(record)?;
    Ok(parsed)
}

fn number_field(
    record: RecordRef,
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Scalar, SchemaError> {
    let value = obj
        .get(field)
        .ok_or(SchemaError::MissingField { record, field })?;
    if let Some(integer) = value.as_i64() {
        return Ok(Scalar::integer(integer));
    }
    value
        .as_f64()
        .map(Scalar::from)
        .ok_or_else(|| SchemaError::InvalidNumber {
            record,
            field,
            found: value.to_string(),
        })
}

fn steps_field(record: RecordRef, obj: &Map<String, Value>) -> Result<usize, SchemaError> {
    let value = obj.get("steps").ok_or(SchemaError::MissingField {
        record,
        field: "steps",
    })?;
    match value.as_u64() {
        Some(steps) if steps > 0 => Ok(steps as usize),
        _ => Err(SchemaError::InvalidSteps {
            record,
            found: value.to_string(),
        }),
    }
}

fn parse_text_line(group: Group, line: &str) -> Result<ConstraintRecord, String> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next().ok_or_else(|| "empty constraint line".to_string())?;
    let kind =
        ConstraintKind::from_name(name).ok_or_else(|| format!("unknown constraint type {:?}", name))?;
    let rest: Vec<&str> = tokens.collect();

    let (index_tokens, value_tokens) = match kind.arity() {
        Some(n) => {
            if rest.len() < n {
                return Err(format!("{} takes {} atom indices", kind, n));
            }
            rest.split_at(n)
        }
        None => (rest.as_slice(), &[][..]),
    };

    let mut indices = Vec::new();
    for token in index_tokens {
        indices.extend(parse_index_token(token)?);
    }

    let number = |s: &str| match s.parse::<i64>() {
        Ok(integer) => Ok(Scalar::integer(integer)),
        Err(_) => s
            .parse::<f64>()
            .map(Scalar::from)
            .map_err(|_| format!("invalid number {:?}", s)),
    };
    let policy = match (group, value_tokens) {
        (Group::Freeze, []) => Policy::Freeze,
        (Group::Set, [value]) => Policy::Set {
            value: number(*value)?,
        },
        (Group::Scan, [start, stop, steps]) => Policy::Scan {
            start: number(*start)?,
            stop: number(*stop)?,
            steps: steps
                .parse::<usize>()
                .map_err(|_| format!("invalid step count {:?}", steps))?,
        },
        (group, values) => {
            return Err(format!(
                "unexpected {} value field(s) for a ${} line",
                values.len(),
                group
            ))
        }
    };

    Ok(ConstraintRecord {
        kind,
        indices,
        policy,
    })
}

/// Parse `3`, `1-5` or `1,2,7` (1-based) into 0-based indices
fn parse_index_token(token: &str) -> Result<Vec<usize>, String> {
    let mut indices = Vec::new();
    for part in token.split(',').filter(|p| !p.is_empty()) {
        let one_based = |s: &str| match s.parse::<usize>() {
            Ok(i) if i >= 1 => Ok(i - 1),
            _ => Err(format!("invalid atom index {:?}", s)),
        };
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (one_based(lo)?, one_based(hi)?);
                if hi < lo {
                    return Err(format!("empty atom range {:?}", part));
                }
                indices.extend(lo..=hi);
            }
            None => indices.push(one_based(part)?),
        }
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_description() -> Value {
        json!({
            "freeze": [{"type": "xyz", "indices": [0, 1, 2, 3, 4]}],
            "set": [{"type": "angle", "indices": [1, 0, 4], "value": 110.0}],
            "scan": [
                {"type": "distance", "indices": [1, 0], "start": 1.0, "stop": 1.2, "steps": 3},
                {"type": "dihedral", "indices": [0, 4, 5, 6], "start": 110.0, "stop": 150.0, "steps": 3}
            ]
        })
    }

    const FULL_TEXT: &str = "$freeze\nxyz 1 2 3 4 5\n$set\nangle 2 1 5 110.0\n$scan\ndistance 2 1 1.0 1.2 3\ndihedral 1 5 6 7 110.0 150.0 3";

    #[test]
    fn test_render_full_description() {
        let constraints = ConstraintSet::parse(&full_description()).unwrap();
        assert_eq!(constraints.render(), FULL_TEXT);
        assert_eq!(constraints.len(), 4);
    }

    #[test]
    fn test_render_ignores_key_order() {
        let reordered = json!({
            "scan": [{"type": "bond", "indices": [1, 0], "start": 1.0, "stop": 1.2, "steps": 3}],
            "freeze": [{"indices": [0, 1], "type": "xyz"}]
        });
        let constraints = ConstraintSet::parse(&reordered).unwrap();
        assert_eq!(
            constraints.render(),
            "$freeze\nxyz 1 2\n$scan\ndistance 2 1 1.0 1.2 3"
        );
    }

    #[test]
    fn test_empty_description_renders_nothing() {
        let constraints = ConstraintSet::parse(&json!({})).unwrap();
        assert!(constraints.is_empty());
        assert_eq!(constraints.render(), "");
        assert!(ConstraintSet::parse(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_top_level_key() {
        let err = ConstraintSet::parse(&json!({"not_recognized_keyword": [["xyz", [0, 1]]]})).unwrap_err();
        assert_eq!(err, SchemaError::UnknownKey("not_recognized_keyword".into()));
    }

    #[test]
    fn test_first_unknown_key_in_declaration_order() {
        let err: SchemaError = r#"{"set": [], "zzz": 1, "aaa": 2}"#.parse::<ConstraintSet>().unwrap_err();
        assert_eq!(err, SchemaError::UnknownKey("zzz".into()));
    }

    #[test]
    fn test_tuple_type_is_rejected() {
        let err = ConstraintSet::parse(&json!({
            "scan": [{"type": ["bond", [0, 1]], "start": 0.8, "stop": 1.2, "steps": 4}]
        }))
        .unwrap_err();
        match err {
            SchemaError::InvalidType { record, .. } => {
                assert_eq!(record, RecordRef { group: Group::Scan, index: 0 });
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err_message_mentions_record(&json!({
            "scan": [{"type": ["bond", [0, 1]], "indices": [0, 1], "start": 0.8, "stop": 1.2, "steps": 4}]
        })));
    }

    fn err_message_mentions_record(description: &Value) -> bool {
        ConstraintSet::parse(description)
            .unwrap_err()
            .to_string()
            .contains("scan record 0")
    }

    #[test]
    fn test_wrong_arity() {
        let err = ConstraintSet::parse(&json!({
            "set": [{"type": "angle", "indices": [0, 1], "value": 90.0}]
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::WrongArity { expected: 3, found: 2, .. }
        ));
    }

    #[test]
    fn test_missing_and_unknown_fields() {
        let missing = ConstraintSet::parse(&json!({
            "scan": [{"type": "distance", "indices": [0, 1], "start": 1.0, "steps": 2}]
        }))
        .unwrap_err();
        assert!(matches!(missing, SchemaError::MissingField { field: "stop", .. }));

        let unknown = ConstraintSet::parse(&json!({
            "freeze": [{"type": "distance", "indices": [0, 1], "value": 1.0}]
        }))
        .unwrap_err();
        assert!(matches!(unknown, SchemaError::UnknownField { .. }));
    }

    #[test]
    fn test_invalid_values() {
        let negative = ConstraintSet::parse(&json!({"freeze": [{"type": "xyz", "indices": [-1]}]}));
        assert!(matches!(negative, Err(SchemaError::InvalidIndex { .. })));

        let zero_steps = ConstraintSet::parse(&json!({
            "scan": [{"type": "distance", "indices": [0, 1], "start": 1.0, "stop": 2.0, "steps": 0}]
        }));
        assert!(matches!(zero_steps, Err(SchemaError::InvalidSteps { .. })));

        let set_xyz = ConstraintSet::parse(&json!({"set": [{"type": "xyz", "indices": [0], "value": 1.0}]}));
        assert!(matches!(set_xyz, Err(SchemaError::UnsupportedPolicy { .. })));

        let empty_xyz = ConstraintSet::parse(&json!({"freeze": [{"type": "xyz", "indices": []}]}));
        assert!(matches!(empty_xyz, Err(SchemaError::EmptyIndices { .. })));
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(110.0), "110.0");
        assert_eq!(format_number(-180.0), "-180.0");
        assert_eq!(format_number(1.2), "1.2");
        assert_eq!(format_number(0.125), "0.125");
        assert_eq!(format_number(0.0001), "0.0001");
        assert_eq!(format_number(1e-7), "1e-07");
        assert_eq!(format_number(-2.5e-5), "-2.5e-05");
        assert_eq!(format_number(1e16), "1e+16");
        assert_eq!(format_number(0.0), "0.0");
    }

    #[test]
    fn test_integers_render_as_written() {
        let constraints = ConstraintSet::parse(&json!({
            "set": [
                {"type": "dihedral", "indices": [0, 1, 2, 3], "value": -180},
                {"type": "dihedral", "indices": [1, 2, 3, 4], "value": -180.0}
            ],
            "scan": [{"type": "angle", "indices": [0, 1, 2], "start": 100, "stop": 1e-7, "steps": 2}]
        }))
        .unwrap();
        let text = "$set\ndihedral 1 2 3 4 -180\ndihedral 2 3 4 5 -180.0\n$scan\nangle 1 2 3 100 1e-07 2";
        assert_eq!(constraints.render(), text);
        assert_eq!(ConstraintSet::parse_text(text).unwrap().render(), text);
        assert_eq!(constraints.to_value()["set"][0]["value"], json!(-180));
        assert_eq!(constraints.to_value()["set"][1]["value"], json!(-180.0));
    }

    #[test]
    fn test_text_round_trip() {
        let constraints = ConstraintSet::parse_text(FULL_TEXT).unwrap();
        assert_eq!(constraints, ConstraintSet::parse(&full_description()).unwrap());
        assert_eq!(constraints.render(), FULL_TEXT);
    }

    #[test]
    fn test_text_ranges_and_comments() {
        let text = "# frozen block\n$freeze\nxyz 1-3,5\ntrans-xyz 4\n\n$set\nbond 1 2 1.5 # target";
        let constraints = ConstraintSet::parse_text(text).unwrap();
        assert_eq!(constraints.group(Group::Freeze)[0].indices, vec![0, 1, 2, 4]);
        assert_eq!(constraints.group(Group::Freeze)[1].kind, ConstraintKind::Translation);
        assert_eq!(
            constraints.group(Group::Set)[0].policy,
            Policy::Set { value: 1.5.into() }
        );
    }

    #[test]
    fn test_text_errors_report_line() {
        let err = ConstraintSet::parse_text("$freeze\ndistance 1").unwrap_err();
        assert!(matches!(err, SchemaError::Text { line: 2, .. }));
        let err = ConstraintSet::parse_text("distance 1 2").unwrap_err();
        assert!(matches!(err, SchemaError::Text { line: 1, .. }));
    }

    #[test]
    fn test_with_scan_point() {
        let constraints = ConstraintSet::parse(&full_description()).unwrap();
        let point = constraints.with_scan_point(&[1.1, 130.0]);
        assert!(!point.has_scan());
        assert_eq!(
            point.render(),
            "$freeze\nxyz 1 2 3 4 5\n$set\nangle 2 1 5 110.0\ndistance 2 1 1.1\ndihedral 1 5 6 7 130.0"
        );
    }

    #[test]
    fn test_to_value_round_trip() {
        let constraints = ConstraintSet::parse(&full_description()).unwrap();
        let again = ConstraintSet::parse(&constraints.to_value()).unwrap();
        assert_eq!(again, constraints);
    }

    #[test]
    fn test_push_validates() {
        let mut constraints = ConstraintSet::new();
        constraints
            .push(ConstraintKind::Distance, vec![0, 1], Policy::Set { value: 0.74.into() })
            .unwrap();
        assert!(constraints
            .push(ConstraintKind::Dihedral, vec![0, 1, 2], Policy::Freeze)
            .is_err());
        assert_eq!(constraints.len(), 1);
    }
}
