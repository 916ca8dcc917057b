//! Conversion of program data into typed values.
//!
//! [`FloatArg`] resolves one numeric argument against bounds, a default, a
//! step and a unit table. Out-of-range values are rejected unless the caller
//! asks for [`RangePolicy::Clamp`]; [`FloatProperty`] stores a value together
//! with the policy it was declared with.

use crate::error::{Result, ScpiError};
use crate::protocol::{decode_latin1, Argument};

/// IEEE 488.2 suffix multipliers, longest first so that `MA` wins over `M`.
pub const SI_PREFIXES: [(&str, f64); 12] = [
    ("EX", 1e18),
    ("PE", 1e15),
    ("T", 1e12),
    ("G", 1e9),
    ("MA", 1e6),
    ("K", 1e3),
    ("M", 1e-3),
    ("U", 1e-6),
    ("N", 1e-9),
    ("P", 1e-12),
    ("F", 1e-15),
    ("A", 1e-18),
];

/// Suffixes where a leading `M` means mega rather than milli.
const MEGA_EXCEPTIONS: [(&str, &str); 2] = [("MHZ", "HZ"), ("MOHM", "OHM")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangePolicy {
    #[default]
    Reject,
    Clamp,
}

/// Describes how one numeric argument is interpreted.
#[derive(Debug, Clone)]
pub struct FloatArg<'a> {
    limits: Option<(f64, f64)>,
    policy: RangePolicy,
    default: Option<f64>,
    step: Option<(f64, f64)>,
    units: Vec<(&'a str, f64)>,
    native: f64,
    special: bool,
}

impl Default for FloatArg<'_> {
    fn default() -> Self {
        Self {
            limits: None,
            policy: RangePolicy::Reject,
            default: None,
            step: None,
            units: Vec::new(),
            native: 1.0,
            special: false,
        }
    }
}

impl<'a> FloatArg<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds used both for `MIN`/`MAX` and for the range check.
    pub fn limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Some((min, max));
        self
    }

    pub fn policy(mut self, policy: RangePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn default_value(mut self, value: f64) -> Self {
        self.default = Some(value);
        self
    }

    /// Enables `UP`/`DOWN` relative to `current`.
    pub fn steppable(mut self, current: f64, step: f64) -> Self {
        self.step = Some((current, step));
        self
    }

    /// Accepts `name` (with any SI prefix) as a suffix with factor 1.
    pub fn unit(mut self, name: &'a str) -> Self {
        self.units.push((name, 1.0));
        self
    }

    pub fn units(mut self, table: &[(&'a str, f64)]) -> Self {
        self.units.extend_from_slice(table);
        self
    }

    /// Factor applied when the argument carries no suffix, e.g. the factor
    /// of whichever display unit is currently selected.
    pub fn native_factor(mut self, factor: f64) -> Self {
        self.native = factor;
        self
    }

    /// Accepts `INF`, `NINF` and `NAN`.
    pub fn allow_special(mut self) -> Self {
        self.special = true;
        self
    }

    pub fn resolve(&self, arg: &Argument) -> Result<f64> {
        match arg {
            Argument::Symbol(symbol) => self.symbol(symbol),
            Argument::Number { value, suffix } => {
                let factor = self.factor(suffix.as_deref())?;
                self.check_range(value.as_f64() * factor)
            }
            other => Err(ScpiError::invalid(format!("expected a numeric value, got {other}"))),
        }
    }

    fn symbol(&self, symbol: &str) -> Result<f64> {
        match symbol.to_ascii_uppercase().as_str() {
            "MIN" | "MINIMUM" => self
                .limits
                .map(|(min, _)| min)
                .ok_or_else(|| ScpiError::invalid("no known minimum value")),
            "MAX" | "MAXIMUM" => self
                .limits
                .map(|(_, max)| max)
                .ok_or_else(|| ScpiError::invalid("no known maximum value")),
            "DEF" | "DEFAULT" => self
                .default
                .ok_or_else(|| ScpiError::invalid("no default value")),
            "UP" => match self.step {
                Some((current, step)) => self.check_range(current + step),
                None => Err(ScpiError::invalid("not steppable")),
            },
            "DOWN" => match self.step {
                Some((current, step)) => self.check_range(current - step),
                None => Err(ScpiError::invalid("not steppable")),
            },
            "INF" if self.special => Ok(f64::INFINITY),
            "NINF" if self.special => Ok(f64::NEG_INFINITY),
            "NAN" if self.special => Ok(f64::NAN),
            _ => Err(ScpiError::invalid(format!("unexpected symbol {symbol}"))),
        }
    }

    fn factor(&self, suffix: Option<&str>) -> Result<f64> {
        match suffix {
            None => Ok(self.native),
            Some(suffix) if self.units.is_empty() => {
                Err(ScpiError::invalid(format!("unexpected unit {suffix}")))
            }
            Some(suffix) => unit_factor(suffix, &self.units)
                .ok_or_else(|| ScpiError::invalid(format!("unknown unit {suffix}"))),
        }
    }

    fn check_range(&self, value: f64) -> Result<f64> {
        let Some((min, max)) = self.limits else {
            return Ok(value);
        };
        if (min..=max).contains(&value) {
            return Ok(value);
        }
        match self.policy {
            RangePolicy::Clamp if !value.is_nan() => Ok(value.clamp(min, max)),
            _ => Err(ScpiError::OutOfRange { value, min, max }),
        }
    }
}

/// Looks `suffix` up in `units`, case-insensitively, allowing one SI prefix.
pub fn unit_factor(suffix: &str, units: &[(&str, f64)]) -> Option<f64> {
    let lookup = |name: &str| {
        units
            .iter()
            .find(|(unit, _)| unit.eq_ignore_ascii_case(name))
            .map(|&(_, factor)| factor)
    };

    let upper = suffix.to_ascii_uppercase();
    if let Some(factor) = lookup(&upper) {
        return Some(factor);
    }
    if let Some((_, base)) = MEGA_EXCEPTIONS.iter().find(|(full, _)| *full == upper) {
        if let Some(factor) = lookup(base) {
            return Some(factor * 1e6);
        }
    }
    SI_PREFIXES.iter().find_map(|&(prefix, scale)| {
        upper
            .strip_prefix(prefix)
            .filter(|rest| !rest.is_empty())
            .and_then(lookup)
            .map(|factor| factor * scale)
    })
}

/// Resolves a number with the default (reject) range policy.
pub fn resolve_float(
    arg: &Argument,
    bounds: Option<(f64, f64)>,
    default: Option<f64>,
    units: &[(&str, f64)],
) -> Result<f64> {
    let mut resolver = FloatArg::new().units(units);
    if let Some((min, max)) = bounds {
        resolver = resolver.limits(min, max);
    }
    if let Some(default) = default {
        resolver = resolver.default_value(default);
    }
    resolver.resolve(arg)
}

/// `ON`/`OFF`, a plain number (zero is false) or `DEF` when a default exists.
pub fn resolve_bool(arg: &Argument, default: Option<bool>) -> Result<bool> {
    match arg {
        Argument::Symbol(symbol) => match symbol.to_ascii_uppercase().as_str() {
            "ON" => Ok(true),
            "OFF" => Ok(false),
            "DEF" | "DEFAULT" => default.ok_or_else(|| ScpiError::invalid("no default value")),
            _ => Err(ScpiError::invalid(format!("unrecognized boolean value {symbol}"))),
        },
        Argument::Number { value, suffix: None } => Ok(value.as_f64() != 0.0),
        other => Err(ScpiError::invalid(format!("unrecognized boolean value {other}"))),
    }
}

/// Matches a symbol against mnemonic choices such as `FRONt` or `REAR`.
///
/// The choice is accepted in its full form or as its leading uppercase run.
/// Returns the index of the matching choice.
pub fn resolve_choice(arg: &Argument, choices: &[&str]) -> Result<usize> {
    let Argument::Symbol(symbol) = arg else {
        return Err(ScpiError::invalid(format!("expected one of {choices:?}, got {arg}")));
    };
    let symbol = symbol.to_ascii_uppercase();
    choices
        .iter()
        .position(|choice| {
            let short: String = choice.chars().take_while(|c| !c.is_ascii_lowercase()).collect();
            symbol == choice.to_ascii_uppercase() || symbol == short
        })
        .ok_or_else(|| ScpiError::invalid(format!("expected one of {choices:?}, got {symbol}")))
}

pub fn resolve_string(arg: &Argument) -> Result<String> {
    match arg {
        Argument::Quoted(bytes) => Ok(decode_latin1(bytes)),
        other => Err(ScpiError::invalid(format!("expected a quoted string, got {other}"))),
    }
}

pub fn no_args(args: &[Argument]) -> Result<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(ScpiError::invalid(format!("takes no parameters, got {}", args.len())))
    }
}

pub fn single(args: &[Argument]) -> Result<&Argument> {
    match args {
        [arg] => Ok(arg),
        _ => Err(ScpiError::invalid(format!("takes one parameter, got {}", args.len()))),
    }
}

pub fn pair(args: &[Argument]) -> Result<(&Argument, &Argument)> {
    match args {
        [first, second] => Ok((first, second)),
        _ => Err(ScpiError::invalid(format!("takes two parameters, got {}", args.len()))),
    }
}

/// Settable and queryable number with a declared range policy.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatProperty {
    value: f64,
    default: f64,
    limits: Option<(f64, f64)>,
    policy: RangePolicy,
    step: Option<f64>,
    unit: Option<&'static str>,
}

impl FloatProperty {
    pub fn new(default: f64) -> Self {
        Self {
            value: default,
            default,
            limits: None,
            policy: RangePolicy::Reject,
            step: None,
            unit: None,
        }
    }

    pub fn with_limits(mut self, min: f64, max: f64, policy: RangePolicy) -> Self {
        self.limits = Some((min, max));
        self.policy = policy;
        self
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn get(&self) -> f64 {
        self.value
    }

    pub fn policy(&self) -> RangePolicy {
        self.policy
    }

    pub fn set(&mut self, arg: &Argument) -> Result<f64> {
        let mut resolver = FloatArg::new().default_value(self.default).policy(self.policy);
        if let Some((min, max)) = self.limits {
            resolver = resolver.limits(min, max);
        }
        if let Some(step) = self.step {
            resolver = resolver.steppable(self.value, step);
        }
        if let Some(unit) = self.unit {
            resolver = resolver.unit(unit);
        }
        self.value = resolver.resolve(arg)?;
        Ok(self.value)
    }

    pub fn set_args(&mut self, args: &[Argument]) -> Result<f64> {
        self.set(single(args)?)
    }

    pub fn reset(&mut self) {
        self.value = self.default;
    }

    pub fn format(&self) -> String {
        format!("{}", self.value)
    }
}
