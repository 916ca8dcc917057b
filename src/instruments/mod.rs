pub mod current_source;
pub mod magnet;
pub mod voltmeter;

pub use current_source::{CurrentSource, Terminals};
pub use magnet::{MagnetModel, MagnetProgrammer};
pub use voltmeter::Voltmeter;

use crate::error::{Result, ScpiError};
use crate::protocol::Argument;
use crate::value::no_args;

/// Set handler for commands the simulated device accepts but does not model.
pub fn not_implemented<T>(_: &mut T, _: &[Argument]) -> Result<()> {
    Err(ScpiError::Device("not implemented".to_string()))
}

/// Query handler counterpart of [`not_implemented`].
pub fn not_implemented_query<T>(_: &mut T, _: &[Argument]) -> Result<String> {
    Err(ScpiError::Device("not implemented".to_string()))
}

/// Set handler that accepts and ignores the command.
pub fn ignored<T>(_: &mut T, args: &[Argument]) -> Result<()> {
    no_args(args)
}

/// Query handler returning a fixed response.
pub fn constant<T>(response: &'static str) -> impl Fn(&mut T, &[Argument]) -> Result<String> {
    move |_, args| {
        no_args(args)?;
        Ok(response.to_string())
    }
}

pub(crate) fn bool_response(value: bool) -> String {
    u8::from(value).to_string()
}
