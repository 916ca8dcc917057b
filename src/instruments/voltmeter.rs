use crate::command_tree::CommandTree;
use crate::config::InstrumentOptions;
use crate::error::Result;
use crate::instrument::{base_commands, Instrument, InstrumentCore};
use crate::protocol::Argument;
use crate::value::no_args;

pub const IDENTITY: &str = "SCPISIM,Voltmeter,0,1.0";

/// DC voltmeter whose reading is set from outside, typically by a hook of
/// another instrument in the same experiment.
pub struct Voltmeter {
    core: InstrumentCore<Self>,
    voltage: f64,
}

impl Voltmeter {
    pub fn new(options: &InstrumentOptions) -> Result<Self> {
        let mut voltmeter = Self {
            core: InstrumentCore::new(IDENTITY, Self::commands()?, options),
            voltage: 0.0,
        };
        voltmeter.reset();
        Ok(voltmeter)
    }

    fn commands() -> Result<CommandTree<Self>> {
        let mut tree = base_commands::<Self>()?;
        tree.on_query("[:SENSe[1]]:VOLTage[:DC]", Self::reading)?;
        tree.on_query(":MEASure:VOLTage[:DC]", Self::reading)?;
        tree.on_query(":READ", Self::reading)?;
        Ok(tree)
    }

    fn reading(&mut self, args: &[Argument]) -> Result<String> {
        no_args(args)?;
        Ok(format!("{:.2}", self.voltage))
    }

    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    pub fn set_voltage(&mut self, voltage: f64) {
        self.voltage = voltage;
    }
}

impl Instrument for Voltmeter {
    fn core(&self) -> &InstrumentCore<Self> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut InstrumentCore<Self> {
        &mut self.core
    }

    fn reset(&mut self) {
        self.voltage = 0.0;
    }
}
