//! Superconducting magnet power-supply programmer.
//!
//! Field values are kept in tesla and rates in tesla per second internally.
//! The display units (kilogauss or tesla, per second or per minute) only
//! affect how values are parsed and reported. Deviations from the hardware:
//! the error queue never overflows, boolean settings accept `ON`/`OFF`, and
//! quenches are triggered by command rather than detected.

use super::{bool_response, constant, ignored, not_implemented, not_implemented_query};
use crate::command_tree::{CommandTree, ShortForms};
use crate::config::InstrumentOptions;
use crate::error::{Result, ScpiError};
use crate::instrument::{base_commands, Instrument, InstrumentCore};
use crate::protocol::Argument;
use crate::value::{no_args, pair, resolve_bool, single, FloatArg};
use crate::worker::{Direction, RampState, RampWorker, Rampable};
use std::time::Instant;

pub const IDENTITY: &str = "AMERICAN MAGNETICS INC.,MODEL 420,virtual";

/// Supply output current range, in amperes.
pub const MAX_SUPPLY_CURRENT: f64 = 100.0;

const MAX_RATE: f64 = 1000.0;
const KILOGAUSS: f64 = 0.1;
const TESLA_UNITS: [(&str, f64); 2] = [("T", 1.0), ("G", 1e-4)];
const FIELD_RATE_UNITS: [(&str, f64); 4] = [
    ("T/s", 1.0),
    ("T/min", 1.0 / 60.0),
    ("G/s", 1e-4),
    ("G/min", 1e-4 / 60.0),
];
const CURRENT_RATE_UNITS: [(&str, f64); 2] = [("A/s", 1.0), ("A/min", 1.0 / 60.0)];

/// Coil state shared with the ramp worker.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetModel {
    /// Tesla per ampere
    pub coil_constant: f64,
    /// Henry
    pub inductance: f64,
    pub field: f64,
    pub voltage: f64,
    pub field_target: f64,
    pub field_rate: f64,
    pub current_limit: f64,
}

impl MagnetModel {
    pub fn new(coil_constant: f64, inductance: f64) -> Self {
        Self {
            coil_constant,
            inductance,
            field: 0.0,
            voltage: 0.0,
            field_target: 0.0,
            field_rate: 0.0,
            current_limit: MAX_SUPPLY_CURRENT,
        }
    }
}

impl Rampable for MagnetModel {
    fn position(&self) -> f64 {
        self.field
    }

    fn target(&self) -> f64 {
        self.field_target
    }

    fn rate(&self) -> f64 {
        self.field_rate
    }

    fn limit(&self, direction: Direction) -> f64 {
        direction.sign() * self.current_limit * self.coil_constant
    }

    // All of the supply voltage drops across the coil inductance.
    fn apply(&mut self, position: f64, velocity: f64) {
        self.field = position;
        self.voltage = velocity * self.inductance / self.coil_constant;
    }

    fn fault(&mut self) {
        self.field = 0.0;
        self.voltage = 0.0;
    }
}

pub struct MagnetProgrammer {
    core: InstrumentCore<Self>,
    worker: RampWorker<MagnetModel>,
    coil_constant: f64,
    powered_on: Instant,
    stability: f64,
    voltage_limit: f64,
    rate_per_minute: bool,
    field_in_tesla: bool,
    quench_detect: bool,
}

impl MagnetProgrammer {
    pub fn new(coil_constant: f64, inductance: f64, options: &InstrumentOptions) -> Result<Self> {
        if !(coil_constant.is_finite() && coil_constant > 0.0) {
            return Err(ScpiError::invalid(format!("coil constant must be positive, got {coil_constant}")));
        }
        let model = MagnetModel::new(coil_constant, inductance);
        let worker = RampWorker::spawn(model, options.worker_tick())
            .map_err(|error| ScpiError::Device(format!("cannot start ramp worker: {error}")))?;

        let mut magnet = Self {
            core: InstrumentCore::new(IDENTITY, Self::commands()?, options),
            worker,
            coil_constant,
            powered_on: Instant::now(),
            stability: 0.0,
            voltage_limit: 10.0,
            rate_per_minute: false,
            field_in_tesla: false,
            quench_detect: false,
        };
        magnet.reset();
        Ok(magnet)
    }

    pub fn worker(&self) -> &RampWorker<MagnetModel> {
        &self.worker
    }

    /// Field in tesla.
    pub fn field(&self) -> f64 {
        self.worker.with_model(|model| model.field)
    }

    /// Field target in tesla.
    pub fn field_target(&self) -> f64 {
        self.worker.with_model(|model| model.field_target)
    }

    pub fn ramp_state(&self) -> RampState {
        self.worker.state()
    }

    fn field_factor(&self) -> f64 {
        if self.field_in_tesla {
            1.0
        } else {
            KILOGAUSS
        }
    }

    fn rate_factor(&self) -> f64 {
        if self.rate_per_minute {
            1.0 / 60.0
        } else {
            1.0
        }
    }

    fn model(&self) -> MagnetModel {
        self.worker.with_model(|model| model.clone())
    }

    fn set_field_target(&mut self, arg: &Argument) -> Result<()> {
        let limit = MAX_SUPPLY_CURRENT * self.coil_constant;
        let target = FloatArg::new()
            .limits(-limit, limit)
            .default_value(0.0)
            .units(&TESLA_UNITS)
            .native_factor(self.field_factor())
            .resolve(arg)?;
        self.worker.with_model(|model| model.field_target = target);
        Ok(())
    }

    fn set_field_rate(&mut self, arg: &Argument) -> Result<()> {
        let rate = FloatArg::new()
            .limits(0.0, MAX_RATE)
            .units(&FIELD_RATE_UNITS)
            .native_factor(self.rate_factor() * self.field_factor())
            .resolve(arg)?;
        self.worker.with_model(|model| model.field_rate = rate);
        Ok(())
    }

    fn set_current_target(&mut self, arg: &Argument) -> Result<()> {
        let current = FloatArg::new()
            .limits(-MAX_SUPPLY_CURRENT, MAX_SUPPLY_CURRENT)
            .unit("A")
            .resolve(arg)?;
        let coil = self.coil_constant;
        self.worker.with_model(|model| model.field_target = current * coil);
        Ok(())
    }

    fn set_current_rate(&mut self, arg: &Argument) -> Result<()> {
        let rate = FloatArg::new()
            .limits(0.0, MAX_RATE)
            .units(&CURRENT_RATE_UNITS)
            .native_factor(self.rate_factor())
            .resolve(arg)?;
        let coil = self.coil_constant;
        self.worker.with_model(|model| model.field_rate = rate * coil);
        Ok(())
    }

    fn field_target_response(&self) -> String {
        format!("{:.4}", self.field_target() / self.field_factor())
    }

    fn field_rate_response(&self) -> String {
        let rate = self.model().field_rate;
        format!("{:.4}", rate / self.rate_factor() / self.field_factor())
    }

    fn current_target_response(&self) -> String {
        format!("{:.4}", self.field_target() / self.coil_constant)
    }

    fn current_rate_response(&self) -> String {
        let rate = self.model().field_rate;
        format!("{:.4}", rate / self.rate_factor() / self.coil_constant)
    }

    fn uptime(&self) -> String {
        let seconds = self.powered_on.elapsed().as_secs();
        format!("{:02}:{:02}:{:02}", seconds / 3600, (seconds / 60) % 60, seconds % 60)
    }

    fn quench(&mut self, args: &[Argument]) -> Result<()> {
        let quenched = self.worker.state() == RampState::Faulted;
        if resolve_bool(single(args)?, None)? {
            if !quenched {
                self.worker.fault();
            }
        } else if quenched {
            self.worker.pause();
        }
        Ok(())
    }

    fn query<F>(tree: &mut CommandTree<Self>, pattern: &str, response: F) -> Result<()>
    where
        F: Fn(&Self) -> String + Send + Sync + 'static,
    {
        tree.on_query(pattern, move |magnet: &mut Self, args| {
            no_args(args)?;
            Ok(response(magnet))
        })
    }

    fn setting<F>(tree: &mut CommandTree<Self>, pattern: &str, apply: F) -> Result<()>
    where
        F: Fn(&mut Self, &Argument) -> Result<()> + Send + Sync + 'static,
    {
        tree.on_set(pattern, move |magnet: &mut Self, args| apply(magnet, single(args)?))
    }

    fn commands() -> Result<CommandTree<Self>> {
        let mut tree = base_commands::<Self>()?.extend_with(ShortForms::CaseMarked);

        // System
        tree.on_set(":SYSTem:LOCal", ignored::<Self>)?;
        tree.on_set(":SYSTem:REMote", ignored::<Self>)?;
        Self::query(&mut tree, ":SYSTem:TIME", Self::uptime)?;
        tree.on_set(":SYSTem:TIME:RESet", |magnet: &mut Self, args| {
            no_args(args)?;
            magnet.powered_on = Instant::now();
            Ok(())
        })?;
        tree.on_set("*ETE", not_implemented::<Self>)?;
        tree.on_query("*ETE", not_implemented_query::<Self>)?;
        tree.on_set("*TRG", not_implemented::<Self>)?;

        // Supply limits, front panel only
        tree.on_query(":SUPPly:VOLTage:MINimum", constant("-10"))?;
        tree.on_query(":SUPPly:VOLTage:MAXimum", constant("10"))?;
        tree.on_query(":SUPPly:CURRent:MINimum", constant("-100"))?;
        tree.on_query(":SUPPly:CURRent:MAXimum", constant("100"))?;
        tree.on_query(":SUPPly:TYPE", constant("9"))?;
        tree.on_query(":SUPPly:MODE", constant("3"))?;

        // Configuration
        Self::query(&mut tree, ":STABility", |m| format!("{:.4}", m.stability))?;
        Self::setting(&mut tree, ":CONFigure:STABility", |m, arg| {
            m.stability = FloatArg::new().limits(0.0, 100.0).default_value(0.0).resolve(arg)?;
            Ok(())
        })?;
        Self::query(&mut tree, ":CURRent:LIMit", |m| {
            format!("{:.4}", m.model().current_limit)
        })?;
        Self::setting(&mut tree, ":CONFigure:CURRent:LIMit", |m, arg| {
            let limit = FloatArg::new()
                .limits(0.0, MAX_SUPPLY_CURRENT)
                .default_value(MAX_SUPPLY_CURRENT)
                .unit("A")
                .resolve(arg)?;
            m.worker.with_model(|model| model.current_limit = limit);
            Ok(())
        })?;
        Self::query(&mut tree, ":VOLTage:LIMit", |m| format!("{:.4}", m.voltage_limit))?;
        Self::setting(&mut tree, ":CONFigure:VOLTage:LIMit", |m, arg| {
            m.voltage_limit = FloatArg::new()
                .limits(0.0, 10.0)
                .default_value(10.0)
                .unit("V")
                .resolve(arg)?;
            Ok(())
        })?;
        Self::query(&mut tree, ":COILconst", |m| {
            format!("{:.4}", m.coil_constant / m.field_factor())
        })?;
        tree.on_set(":CONFigure:COILconst", not_implemented::<Self>)?;

        // No energy absorber and no persistent switch are installed.
        tree.on_set(":CONFigure:ABsorber", not_implemented::<Self>)?;
        tree.on_query(":ABsorber", constant("0"))?;
        tree.on_set(":CONFigure:PSwitch", not_implemented::<Self>)?;
        tree.on_query(":PSwitch", constant("0"))?;
        tree.on_set(":PSwitch", |_: &mut Self, _| {
            Err(ScpiError::Device("No persistent switch installed".to_string()))
        })?;
        tree.on_query(":VOLTage:PSwitch", constant("0"))?;
        tree.on_set(":CONFigure:PSwitch:CURRent", not_implemented::<Self>)?;
        tree.on_query(":PSwitch:CURRent", constant("0"))?;
        tree.on_set(":CONFigure:PSwitch:TIME", not_implemented::<Self>)?;
        tree.on_query(":PSwitch:TIME", constant("0"))?;

        // Units
        Self::query(&mut tree, ":RAMP:RATE:UNITS", |m| bool_response(m.rate_per_minute))?;
        Self::setting(&mut tree, ":CONFigure:RAMP:RATE:UNITS", |m, arg| {
            m.rate_per_minute = resolve_bool(arg, Some(false))?;
            Ok(())
        })?;
        Self::query(&mut tree, ":FIELD:UNITS", |m| bool_response(m.field_in_tesla))?;
        Self::setting(&mut tree, ":CONFigure:FIELD:UNITS", |m, arg| {
            m.field_in_tesla = resolve_bool(arg, Some(false))?;
            Ok(())
        })?;

        // Ramp targets and rates
        Self::query(&mut tree, ":FIELD:PROGram", Self::field_target_response)?;
        Self::setting(&mut tree, ":CONFigure:FIELD:PROGram", Self::set_field_target)?;
        Self::query(&mut tree, ":RAMP:RATE:FIELd", Self::field_rate_response)?;
        Self::setting(&mut tree, ":CONFigure:RAMP:RATE:FIELd", Self::set_field_rate)?;
        Self::query(&mut tree, ":RAMP:FIELd", |m| {
            format!("{},{}", m.field_target_response(), m.field_rate_response())
        })?;
        tree.on_set(":CONFigure:RAMP:FIELd", |magnet: &mut Self, args| {
            let (field, rate) = pair(args)?;
            magnet.set_field_target(field)?;
            magnet.set_field_rate(rate)
        })?;
        Self::query(&mut tree, ":CURRent:PROGram", Self::current_target_response)?;
        Self::setting(&mut tree, ":CONFigure:CURRent:PROGram", Self::set_current_target)?;
        Self::query(&mut tree, ":RAMP:RATE:CURRent", Self::current_rate_response)?;
        Self::setting(&mut tree, ":CONFigure:RAMP:RATE:CURRent", Self::set_current_rate)?;
        Self::query(&mut tree, ":RAMP:CURRent", |m| {
            format!("{},{}", m.current_target_response(), m.current_rate_response())
        })?;
        tree.on_set(":CONFigure:RAMP:CURRent", |magnet: &mut Self, args| {
            let (current, rate) = pair(args)?;
            magnet.set_current_target(current)?;
            magnet.set_current_rate(rate)
        })?;

        // Ramp control
        tree.on_set(":RAMP", |magnet: &mut Self, args| {
            no_args(args)?;
            magnet.worker.start();
            Ok(())
        })?;
        tree.on_set(":PAUSE", |magnet: &mut Self, args| {
            no_args(args)?;
            magnet.worker.pause();
            Ok(())
        })?;
        tree.on_set(":ZERO", |magnet: &mut Self, args| {
            no_args(args)?;
            magnet.worker.zero();
            Ok(())
        })?;
        tree.on_set(":UP", |magnet: &mut Self, args| {
            no_args(args)?;
            magnet.worker.manual(Direction::Up);
            Ok(())
        })?;
        tree.on_set(":DOWN", |magnet: &mut Self, args| {
            no_args(args)?;
            magnet.worker.manual(Direction::Down);
            Ok(())
        })?;
        Self::query(&mut tree, ":STATE", |m| m.worker.state().code().to_string())?;

        // Measurements
        Self::query(&mut tree, ":VOLTage:MAGnet", |m| format!("{:.4}", m.model().voltage))?;
        Self::query(&mut tree, ":VOLTage:SUPPly", |m| format!("{:.4}", m.model().voltage))?;
        Self::query(&mut tree, ":CURRent:MAGnet", |m| {
            format!("{:.4}", m.field() / m.coil_constant)
        })?;
        Self::query(&mut tree, ":CURRent:SUPPly", |m| {
            format!("{:.4}", m.field() / m.coil_constant)
        })?;
        Self::query(&mut tree, ":FIELD:MAGnet", |m| format!("{:.4}", m.field() / m.field_factor()))?;

        // Quench protection
        Self::query(&mut tree, ":QUench:DETect", |m| bool_response(m.quench_detect))?;
        Self::setting(&mut tree, ":CONFigure:QUench:DETect", |m, arg| {
            m.quench_detect = resolve_bool(arg, Some(true))?;
            Ok(())
        })?;
        Self::query(&mut tree, ":QUench", |m| {
            bool_response(m.worker.state() == RampState::Faulted)
        })?;
        tree.on_set(":QUench", Self::quench)?;

        Ok(tree)
    }
}

impl Instrument for MagnetProgrammer {
    fn core(&self) -> &InstrumentCore<Self> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut InstrumentCore<Self> {
        &mut self.core
    }

    fn reset(&mut self) {
        self.powered_on = Instant::now();
        self.stability = 0.0;
        self.voltage_limit = 10.0;
        self.rate_per_minute = false;
        self.field_in_tesla = false;
        self.quench_detect = false;
        self.worker.with_model(|model| {
            model.field = 0.0;
            model.voltage = 0.0;
            model.field_target = 0.0;
            model.field_rate = 0.0;
            model.current_limit = MAX_SUPPLY_CURRENT;
        });
    }

    fn self_test(&mut self) -> String {
        "1".to_string()
    }

    fn shutdown(&mut self) {
        self.worker.shutdown();
    }
}
