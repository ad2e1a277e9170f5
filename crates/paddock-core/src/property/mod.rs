//! Typed, validated, persisted per-container configuration.
//!
//! Properties are declared once in a [`Registry`]: a name, a value kind,
//! flags, the states in which the property may change, a default function
//! and an optional validator, all plain function values. Containers store
//! only explicitly set values; everything else resolves through defaults.

pub mod data;
pub mod defs;

use std::collections::BTreeMap;

use crate::container::State;
use crate::error::{Error, ErrorKind, Result};
use crate::holder::Holder;
use crate::ContainerId;

pub use data::DataDef;
pub use defs::names;

/// A property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// String.
    Str(String),
    /// List of strings.
    List(Vec<String>),
    /// Map of interface (or other key) to unsigned value.
    UintMap(BTreeMap<String, u64>),
}

/// The kind of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Boolean.
    Bool,
    /// Signed integer.
    Int,
    /// Unsigned integer.
    Uint,
    /// String.
    Str,
    /// List of strings.
    List,
    /// Map of string to unsigned value.
    UintMap,
}

impl Value {
    /// The kind of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Uint(_) => ValueKind::Uint,
            Self::Str(_) => ValueKind::Str,
            Self::List(_) => ValueKind::List,
            Self::UintMap(_) => ValueKind::UintMap,
        }
    }

    /// Stable on-disk and client-facing encoding.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Uint(v) => v.to_string(),
            Self::Str(v) => v.clone(),
            Self::List(items) => items.join("; "),
            Self::UintMap(map) => map
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    /// Parse a value of `kind` from its wire encoding.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` when the text does not parse as `kind`.
    pub fn from_wire(kind: ValueKind, text: &str, unit_suffix: bool) -> Result<Self> {
        match kind {
            ValueKind::Bool => match text {
                "true" => Ok(Self::Bool(true)),
                "false" => Ok(Self::Bool(false)),
                _ => Err(Error::invalid_value(format!("invalid boolean: {text}"))),
            },
            ValueKind::Int => text
                .parse()
                .map(Self::Int)
                .map_err(|_| Error::invalid_value(format!("invalid integer: {text}"))),
            ValueKind::Uint => parse_uint(text, unit_suffix).map(Self::Uint),
            ValueKind::Str => Ok(Self::Str(text.to_string())),
            ValueKind::List => Ok(Self::List(split_list(text))),
            ValueKind::UintMap => {
                let mut map = BTreeMap::new();
                for item in split_list(text) {
                    let (key, value) = item
                        .split_once(':')
                        .ok_or_else(|| Error::invalid_value(format!("invalid map entry: {item}")))?;
                    map.insert(key.trim().to_string(), parse_uint(value.trim(), unit_suffix)?);
                }
                Ok(Self::UintMap(map))
            }
        }
    }

    /// The boolean inside, or false for other kinds.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        matches!(self, Self::Bool(true))
    }

    /// The signed integer inside, or 0.
    #[must_use]
    pub fn as_int(&self) -> i64 {
        match self {
            Self::Int(v) => *v,
            Self::Uint(v) => i64::try_from(*v).unwrap_or(i64::MAX),
            _ => 0,
        }
    }

    /// The unsigned integer inside, or 0.
    #[must_use]
    pub fn as_uint(&self) -> u64 {
        match self {
            Self::Uint(v) => *v,
            Self::Int(v) => u64::try_from(*v).unwrap_or(0),
            _ => 0,
        }
    }

    /// The string inside, or empty.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Str(v) => v,
            _ => "",
        }
    }

    /// The list inside, or empty.
    #[must_use]
    pub fn as_list(&self) -> &[String] {
        match self {
            Self::List(v) => v,
            _ => &[],
        }
    }

    /// The map inside, or empty.
    #[must_use]
    pub fn as_uint_map(&self) -> BTreeMap<String, u64> {
        match self {
            Self::UintMap(v) => v.clone(),
            _ => BTreeMap::new(),
        }
    }
}

/// Split a `;`-separated list, trimming and dropping empty items.
#[must_use]
pub fn split_list(text: &str) -> Vec<String> {
    text.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an unsigned integer, optionally honoring K/M/G/T suffixes.
///
/// # Errors
///
/// Returns `InvalidValue` on malformed input or overflow.
pub fn parse_uint(text: &str, unit_suffix: bool) -> Result<u64> {
    let text = text.trim();
    if unit_suffix {
        if let Some(last) = text.chars().last() {
            let mult: Option<u64> = match last.to_ascii_uppercase() {
                'K' => Some(1 << 10),
                'M' => Some(1 << 20),
                'G' => Some(1 << 30),
                'T' => Some(1 << 40),
                _ => None,
            };
            if let Some(mult) = mult {
                let base: u64 = text[..text.len() - 1]
                    .trim()
                    .parse()
                    .map_err(|_| Error::invalid_value(format!("invalid number: {text}")))?;
                return base
                    .checked_mul(mult)
                    .ok_or_else(|| Error::invalid_value(format!("number too large: {text}")));
            }
        }
    }
    text.parse()
        .map_err(|_| Error::invalid_value(format!("invalid number: {text}")))
}

/// Property flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropFlags(u32);

impl PropFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Write through to the kv store.
    pub const PERSISTENT: Self = Self(1);
    /// Never surfaced to enumeration.
    pub const HIDDEN: Self = Self(1 << 1);
    /// A non-isolated child may not set this.
    pub const PARENT_RO: Self = Self(1 << 2);
    /// Falls back to the parent's effective value for non-isolated children.
    pub const PARENT_DEF: Self = Self(1 << 3);
    /// Only a privileged client may change this.
    pub const SUPERUSER: Self = Self(1 << 4);
    /// Only a privileged client or a root-owned container may change this.
    pub const RESTROOT: Self = Self(1 << 5);
    /// Auto-reset on start in OS virt mode for unprivileged owners.
    pub const OS_MODE: Self = Self(1 << 6);
    /// The value is a path, translated through the client root.
    pub const PATH: Self = Self(1 << 7);
    /// Uint values accept K/M/G/T suffixes.
    pub const UNIT_SUFFIX: Self = Self(1 << 8);

    /// Whether every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PropFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// States in which static properties may change.
pub const STATIC_PROPERTY: &[State] = &[State::Stopped];

/// States in which dynamic properties may change.
pub const DYNAMIC_PROPERTY: &[State] =
    &[State::Stopped, State::Running, State::Paused, State::Meta];

/// Every state.
pub const ANY_STATE: &[State] = &[
    State::Stopped,
    State::Running,
    State::Paused,
    State::Meta,
    State::Dead,
];

/// Context handed to default and check functions.
pub struct PropCtx<'a> {
    /// The container table.
    pub holder: &'a Holder,
    /// The container being read or validated.
    pub id: ContainerId,
    /// Credentials of the client performing the change, when one is known.
    pub client_privileged: bool,
}

impl<'a> PropCtx<'a> {
    /// Context for an internal (privileged) access.
    #[must_use]
    pub fn internal(holder: &'a Holder, id: ContainerId) -> Self {
        Self {
            holder,
            id,
            client_privileged: true,
        }
    }

    /// Resolve another property of the same container.
    #[must_use]
    pub fn get(&self, name: &str) -> Value {
        self.holder.effective_value(self.id, name)
    }

    /// Whether the property is still at its default.
    #[must_use]
    pub fn is_default(&self, name: &str) -> bool {
        !self.holder.has_explicit_value(self.id, name)
    }

    /// Names of the links shaping applies to.
    #[must_use]
    pub fn link_names(&self) -> Vec<String> {
        self.holder.link_names()
    }
}

/// One property declaration.
pub struct PropDef {
    /// Property name.
    pub name: &'static str,
    /// Human-readable description.
    pub desc: &'static str,
    /// Value kind.
    pub kind: ValueKind,
    /// Behavior flags.
    pub flags: PropFlags,
    /// States in which the property may be mutated.
    pub states: &'static [State],
    /// Default-value function.
    pub default: fn(&PropCtx<'_>) -> Value,
    /// Validator, run before a value is accepted.
    pub check: Option<fn(&PropCtx<'_>, &Value) -> Result<()>>,
}

impl PropDef {
    /// Whether the property may change in `state`.
    #[must_use]
    pub fn settable_in(&self, state: State) -> bool {
        self.states.contains(&state)
    }

    /// Whether `flags` are all set on this property.
    #[must_use]
    pub const fn has_flags(&self, flags: PropFlags) -> bool {
        self.flags.contains(flags)
    }
}

/// The property and data registry.
pub struct Registry {
    props: Vec<PropDef>,
    data: Vec<DataDef>,
}

impl Registry {
    /// The standard registry with every property and data item declared.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            props: defs::declarations(),
            data: data::declarations(),
        }
    }

    /// Find a property by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&PropDef> {
        self.props.iter().find(|p| p.name == name)
    }

    /// Find a property by name, or fail with `InvalidProperty`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidProperty` when no such property exists.
    pub fn require(&self, name: &str) -> Result<&PropDef> {
        self.find(name)
            .ok_or_else(|| Error::new(ErrorKind::InvalidProperty, format!("invalid property {name}")))
    }

    /// Find a data item by name.
    #[must_use]
    pub fn find_data(&self, name: &str) -> Option<&DataDef> {
        self.data.iter().find(|d| d.name == name)
    }

    /// Find a data item by name, or fail with `InvalidData`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` when no such data item exists.
    pub fn require_data(&self, name: &str) -> Result<&DataDef> {
        self.find_data(name)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("invalid container data {name}")))
    }

    /// Names of all non-hidden properties.
    #[must_use]
    pub fn list(&self) -> Vec<&'static str> {
        self.props
            .iter()
            .filter(|p| !p.has_flags(PropFlags::HIDDEN))
            .map(|p| p.name)
            .collect()
    }

    /// Names of all data items.
    #[must_use]
    pub fn list_data(&self) -> Vec<&'static str> {
        self.data.iter().map(|d| d.name).collect()
    }

    /// All property declarations.
    #[must_use]
    pub fn props(&self) -> &[PropDef] {
        &self.props
    }
}

/// Explicitly set values of one container.
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    values: BTreeMap<&'static str, Value>,
}

impl PropertyMap {
    /// A map with no explicit values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The explicit value, if one was set.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Whether an explicit value exists.
    #[must_use]
    pub fn has_value(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Store an explicit value.
    pub fn set(&mut self, name: &'static str, value: Value) {
        self.values.insert(name, value);
    }

    /// Forget an explicit value.
    pub fn reset(&mut self, name: &str) {
        self.values.remove(name);
    }

    /// Iterate explicit values.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }
}

/// Split `name[index]` into its parts; plain names return no index.
#[must_use]
pub fn parse_indexed_name(name: &str) -> (&str, Option<&str>) {
    if let Some((base, rest)) = name.split_once('[') {
        if let Some(index) = rest.strip_suffix(']') {
            return (base, Some(index.trim()));
        }
    }
    (name, None)
}

/// Client-visible aliases kept for compatibility with raw knob names.
#[must_use]
pub fn resolve_alias(name: &str) -> Option<&'static str> {
    match name {
        "cpu.smart" => Some(names::CPU_POLICY),
        "memory.limit_in_bytes" => Some(names::MEMORY_LIMIT),
        "memory.low_limit_in_bytes" => Some(names::MEMORY_GUARANTEE),
        "memory.recharge_on_pgfault" => Some(names::RECHARGE_ON_PGFAULT),
        _ => None,
    }
}

/// Translate an aliased value into the canonical property encoding.
#[must_use]
pub fn alias_value_in(name: &str, value: &str) -> String {
    match name {
        "cpu.smart" => if value == "0" { "normal" } else { "rt" }.to_string(),
        "memory.recharge_on_pgfault" => if value == "0" { "false" } else { "true" }.to_string(),
        _ => value.to_string(),
    }
}

/// Translate a canonical value back into the aliased encoding.
#[must_use]
pub fn alias_value_out(name: &str, value: &str) -> String {
    match name {
        "cpu.smart" => if value == "rt" { "1" } else { "0" }.to_string(),
        "memory.recharge_on_pgfault" => if value == "true" { "1" } else { "0" }.to_string(),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let cases = [
            (Value::Bool(true), ValueKind::Bool),
            (Value::Int(-5), ValueKind::Int),
            (Value::Uint(42), ValueKind::Uint),
            (Value::Str("/bin/true".into()), ValueKind::Str),
            (
                Value::List(vec!["a".into(), "b c".into()]),
                ValueKind::List,
            ),
            (
                Value::UintMap([("eth0".to_string(), 100u64)].into_iter().collect()),
                ValueKind::UintMap,
            ),
        ];
        for (value, kind) in cases {
            let text = value.to_wire();
            let back = Value::from_wire(kind, &text, false).unwrap();
            assert_eq!(back, value, "round trip of {text:?}");
        }
    }

    #[test]
    fn test_unit_suffix() {
        assert_eq!(parse_uint("100M", true).unwrap(), 100 << 20);
        assert_eq!(parse_uint("2G", true).unwrap(), 2 << 30);
        assert_eq!(parse_uint("512", true).unwrap(), 512);
        assert!(parse_uint("100M", false).is_err());
        assert!(parse_uint("junk", true).is_err());
    }

    #[test]
    fn test_uint_map_parse() {
        let value = Value::from_wire(ValueKind::UintMap, "eth0: 100; eth1: 2K", true).unwrap();
        let map = value.as_uint_map();
        assert_eq!(map["eth0"], 100);
        assert_eq!(map["eth1"], 2048);

        assert!(Value::from_wire(ValueKind::UintMap, "eth0 = 100", false).is_err());
    }

    #[test]
    fn test_indexed_name() {
        assert_eq!(parse_indexed_name("net_guarantee[eth0]"), ("net_guarantee", Some("eth0")));
        assert_eq!(parse_indexed_name("command"), ("command", None));
        assert_eq!(parse_indexed_name("bad[oops"), ("bad[oops", None));
    }

    #[test]
    fn test_flags() {
        let flags = PropFlags::PERSISTENT | PropFlags::HIDDEN;
        assert!(flags.contains(PropFlags::PERSISTENT));
        assert!(flags.contains(PropFlags::HIDDEN));
        assert!(!flags.contains(PropFlags::SUPERUSER));
    }

    #[test]
    fn test_aliases() {
        assert_eq!(resolve_alias("memory.limit_in_bytes"), Some(names::MEMORY_LIMIT));
        assert_eq!(alias_value_in("cpu.smart", "1"), "rt");
        assert_eq!(alias_value_out("cpu.smart", "normal"), "0");
        assert_eq!(resolve_alias("command"), None);
    }
}
