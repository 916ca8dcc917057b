use super::{bool_response, constant, not_implemented, not_implemented_query};
use crate::command_tree::CommandTree;
use crate::config::InstrumentOptions;
use crate::error::Result;
use crate::instrument::{base_commands, hooked, Instrument, InstrumentCore};
use crate::protocol::Argument;
use crate::value::{no_args, resolve_bool, resolve_choice, single, FloatArg, FloatProperty, RangePolicy};

pub const IDENTITY: &str = "SCPISIM,Current source,0,1.0";

/// Largest current the source can deliver, in amperes.
pub const MAX_CURRENT: f64 = 10.0;

/// Compliance voltage range; settings outside it are clamped.
pub const MAX_VOLTAGE_LIMIT: f64 = 210.0;

const TERMINALS: [&str; 2] = ["FRONt", "REAR"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminals {
    Front,
    Rear,
}

impl Terminals {
    fn name(self) -> &'static str {
        match self {
            Terminals::Front => "FRON",
            Terminals::Rear => "REAR",
        }
    }
}

/// Source-measure unit in current-source mode.
///
/// The `current` and `state` setters are hookable: an experiment can watch
/// them to update other instruments.
pub struct CurrentSource {
    core: InstrumentCore<Self>,
    current: f64,
    output: bool,
    terminals: Terminals,
    voltage_limit: FloatProperty,
}

impl CurrentSource {
    pub fn new(options: &InstrumentOptions) -> Result<Self> {
        let mut source = Self {
            core: InstrumentCore::new(IDENTITY, Self::commands()?, options),
            current: 0.0,
            output: false,
            terminals: Terminals::Front,
            voltage_limit: FloatProperty::new(21.0)
                .with_limits(0.02, MAX_VOLTAGE_LIMIT, RangePolicy::Clamp)
                .with_step(1.0)
                .with_unit("V"),
        };
        source.reset();
        Ok(source)
    }

    fn commands() -> Result<CommandTree<Self>> {
        let mut tree = base_commands::<Self>()?;

        let level = "[:SOURce[1]]:CURRent[:LEVel][:IMMediate][:AMPLitude]";
        tree.on_set(level, hooked("current", Self::set_current))?;
        tree.on_query(level, |source: &mut Self, args| {
            no_args(args)?;
            Ok(format!("{:.2}", source.current))
        })?;

        tree.on_set("[:SOURce[1]]:CURRent:VLIMit[:LEVel]", |source: &mut Self, args| {
            source.voltage_limit.set_args(args).map(|_| ())
        })?;
        tree.on_query("[:SOURce[1]]:CURRent:VLIMit[:LEVel]", |source: &mut Self, args| {
            no_args(args)?;
            Ok(source.voltage_limit.format())
        })?;

        tree.on_set("[:SOURce[1]]:FUNCtion[:MODE]", not_implemented::<Self>)?;
        tree.on_query("[:SOURce[1]]:FUNCtion[:MODE]", constant("CURR"))?;
        tree.on_set("[:SOURce[1]]:VOLTage[:LEVel]", not_implemented::<Self>)?;
        tree.on_query("[:SOURce[1]]:VOLTage[:LEVel]", not_implemented_query::<Self>)?;

        tree.on_set(":OUTPut[1][:STATe]", hooked("state", |source: &mut Self, args| {
            source.output = resolve_bool(single(args)?, Some(false))?;
            Ok(())
        }))?;
        tree.on_query(":OUTPut[1][:STATe]", |source: &mut Self, args| {
            no_args(args)?;
            Ok(bool_response(source.output))
        })?;

        tree.on_set(":ROUTe:TERMinals", |source: &mut Self, args| {
            source.terminals = match resolve_choice(single(args)?, &TERMINALS)? {
                0 => Terminals::Front,
                _ => Terminals::Rear,
            };
            Ok(())
        })?;
        tree.on_query(":ROUTe:TERMinals", |source: &mut Self, args| {
            no_args(args)?;
            Ok(source.terminals.name().to_string())
        })?;

        Ok(tree)
    }

    fn set_current(&mut self, args: &[Argument]) -> Result<()> {
        self.current = FloatArg::new()
            .limits(-MAX_CURRENT, MAX_CURRENT)
            .default_value(0.0)
            .steppable(self.current, 0.1)
            .unit("A")
            .resolve(single(args)?)?;
        Ok(())
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn is_on(&self) -> bool {
        self.output
    }

    pub fn terminals(&self) -> Terminals {
        self.terminals
    }

    pub fn voltage_limit(&self) -> f64 {
        self.voltage_limit.get()
    }
}

impl Instrument for CurrentSource {
    fn core(&self) -> &InstrumentCore<Self> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut InstrumentCore<Self> {
        &mut self.core
    }

    fn reset(&mut self) {
        self.current = 0.0;
        self.output = false;
        self.terminals = Terminals::Front;
        self.voltage_limit.reset();
    }
}
