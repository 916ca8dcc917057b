use scpisim::protocol::{parse_str, Argument, Numeric, ProgramMessageUnit};
use scpisim::value::*;
use scpisim::ScpiError;

fn symbol(text: &str) -> Argument {
    Argument::Symbol(text.to_string())
}

fn int(value: i64, suffix: Option<&str>) -> Argument {
    Argument::Number {
        value: Numeric::Int(value),
        suffix: suffix.map(str::to_string),
    }
}

fn float(value: f64, suffix: Option<&str>) -> Argument {
    Argument::Number {
        value: Numeric::Float(value),
        suffix: suffix.map(str::to_string),
    }
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= 1e-12 * expected.abs().max(1.0),
        "Expected {expected}, got {actual}"
    );
}

fn is_invalid<T: std::fmt::Debug>(result: Result<T, ScpiError>) -> bool {
    matches!(result, Err(ScpiError::InvalidArgument(_)))
}

#[test]
fn test_min_max_follow_bounds() {
    let bounds = Some((-10.0, 10.0));
    assert_eq!(resolve_float(&symbol("MIN"), bounds, None, &[]), Ok(-10.0));
    assert_eq!(resolve_float(&symbol("minimum"), bounds, None, &[]), Ok(-10.0));
    assert_eq!(resolve_float(&symbol("MAX"), bounds, None, &[]), Ok(10.0));
    assert_eq!(resolve_float(&symbol("Maximum"), bounds, None, &[]), Ok(10.0));
    assert!(is_invalid(resolve_float(&symbol("MAX"), None, None, &[])));
}

#[test]
fn test_default_symbol() {
    assert_eq!(resolve_float(&symbol("DEF"), None, Some(0.5), &[]), Ok(0.5));
    assert_eq!(resolve_float(&symbol("default"), None, Some(0.5), &[]), Ok(0.5));
    assert!(is_invalid(resolve_float(&symbol("DEF"), None, None, &[])));
}

#[test]
fn test_up_and_down_step_from_current_value() {
    let spec = FloatArg::new().limits(-10.0, 10.0).steppable(1.0, 0.5);
    assert_eq!(spec.resolve(&symbol("UP")), Ok(1.5));
    assert_eq!(spec.resolve(&symbol("DOWN")), Ok(0.5));

    let at_top = FloatArg::new().limits(-10.0, 10.0).steppable(9.75, 0.5);
    assert!(matches!(at_top.resolve(&symbol("UP")), Err(ScpiError::OutOfRange { .. })));

    assert!(is_invalid(FloatArg::new().resolve(&symbol("UP"))));
}

#[test]
fn test_special_values() {
    assert!(is_invalid(FloatArg::new().resolve(&symbol("INF"))));

    let spec = FloatArg::new().allow_special();
    assert_eq!(spec.resolve(&symbol("INF")), Ok(f64::INFINITY));
    assert_eq!(spec.resolve(&symbol("NINF")), Ok(f64::NEG_INFINITY));
    assert!(spec.resolve(&symbol("NAN")).unwrap().is_nan());
    assert!(is_invalid(spec.resolve(&symbol("LOTS"))));
}

#[test]
fn test_si_prefixes() {
    let volts = [("V", 1.0)];
    assert_close(resolve_float(&int(5, Some("mV")), None, None, &volts).unwrap(), 5e-3);
    assert_close(resolve_float(&int(5, Some("KV")), None, None, &volts).unwrap(), 5e3);
    assert_close(resolve_float(&int(5, Some("MAV")), None, None, &volts).unwrap(), 5e6);
    assert_close(resolve_float(&int(5, Some("uv")), None, None, &volts).unwrap(), 5e-6);
    assert_close(resolve_float(&int(5, Some("v")), None, None, &volts).unwrap(), 5.0);
}

#[test]
fn test_mega_exceptions() {
    let hertz = [("HZ", 1.0)];
    assert_eq!(resolve_float(&int(3, Some("MHZ")), None, None, &hertz), Ok(3e6));
    assert_eq!(resolve_float(&int(3, Some("MHz")), None, None, &hertz), Ok(3e6));
    assert_eq!(resolve_float(&int(3, Some("KHZ")), None, None, &hertz), Ok(3e3));

    let ohms = [("OHM", 1.0)];
    assert_eq!(resolve_float(&int(2, Some("MOHM")), None, None, &ohms), Ok(2e6));
}

#[test]
fn test_unit_table_factors() {
    let field = [("T", 1.0), ("G", 1e-4)];
    assert_close(resolve_float(&int(2, Some("kG")), None, None, &field).unwrap(), 0.2);
    assert_close(resolve_float(&int(2, Some("T")), None, None, &field).unwrap(), 2.0);
    assert_close(resolve_float(&int(2, Some("mT")), None, None, &field).unwrap(), 2e-3);
}

#[test]
fn test_unexpected_units_are_invalid() {
    assert!(is_invalid(resolve_float(&int(1, Some("V")), None, None, &[])));
    assert!(is_invalid(resolve_float(&int(1, Some("A")), None, None, &[("V", 1.0)])));
    assert!(is_invalid(resolve_float(&int(1, Some("M")), None, None, &[("V", 1.0)])));
    assert!(is_invalid(resolve_float(&Argument::Quoted(b"1".to_vec()), None, None, &[])));
}

#[test]
fn test_native_factor_applies_without_suffix() {
    let spec = FloatArg::new().units(&[("T", 1.0), ("G", 1e-4)]).native_factor(0.1);
    assert_close(spec.resolve(&int(2, None)).unwrap(), 0.2);
    assert_close(spec.resolve(&int(2, Some("T"))).unwrap(), 2.0);
}

#[test]
fn test_reject_and_clamp_policies() {
    let reject = FloatArg::new().limits(0.0, 1.0);
    assert_eq!(
        reject.resolve(&int(2, None)),
        Err(ScpiError::OutOfRange {
            value: 2.0,
            min: 0.0,
            max: 1.0,
        })
    );

    let clamp = FloatArg::new().limits(0.0, 1.0).policy(RangePolicy::Clamp);
    assert_eq!(clamp.resolve(&int(2, None)), Ok(1.0));
    assert_eq!(clamp.resolve(&float(-0.5, None)), Ok(0.0));
    assert_eq!(clamp.resolve(&float(0.25, None)), Ok(0.25));
}

#[test]
fn test_out_of_range_message() {
    let error = resolve_float(&int(20, None), Some((-10.0, 10.0)), None, &[]).unwrap_err();
    assert_eq!(error.code(), -222);
    assert_eq!(
        error.to_queue_entry(),
        "-222,\"Data out of range; 20 not within [-10, 10]\""
    );
}

#[test]
fn test_resolve_bool() {
    assert_eq!(resolve_bool(&symbol("ON"), None), Ok(true));
    assert_eq!(resolve_bool(&symbol("off"), None), Ok(false));
    assert_eq!(resolve_bool(&int(1, None), None), Ok(true));
    assert_eq!(resolve_bool(&int(0, None), None), Ok(false));
    assert_eq!(resolve_bool(&float(0.5, None), None), Ok(true));
    assert_eq!(resolve_bool(&symbol("DEF"), Some(false)), Ok(false));

    assert!(is_invalid(resolve_bool(&symbol("DEF"), None)));
    assert!(is_invalid(resolve_bool(&symbol("MAYBE"), None)));
    assert!(is_invalid(resolve_bool(&int(1, Some("V")), None)));
}

#[test]
fn test_resolve_choice() {
    let choices = ["FRONt", "REAR"];
    assert_eq!(resolve_choice(&symbol("FRONT"), &choices), Ok(0));
    assert_eq!(resolve_choice(&symbol("fron"), &choices), Ok(0));
    assert_eq!(resolve_choice(&symbol("Rear"), &choices), Ok(1));
    assert!(is_invalid(resolve_choice(&symbol("FRO"), &choices)));
    assert!(is_invalid(resolve_choice(&int(0, None), &choices)));
}

#[test]
fn test_resolve_string() {
    assert_eq!(resolve_string(&Argument::Quoted(b"abc".to_vec())), Ok("abc".to_string()));
    assert!(is_invalid(resolve_string(&symbol("abc"))));
}

#[test]
fn test_argument_count_helpers() {
    let args = [int(1, None), int(2, None)];
    assert!(no_args(&[]).is_ok());
    assert!(is_invalid(no_args(&args)));
    assert!(is_invalid(single(&args)));
    assert_eq!(single(&args[..1]), Ok(&args[0]));
    assert_eq!(pair(&args), Ok((&args[0], &args[1])));
    assert!(is_invalid(pair(&args[..1])));
}

#[test]
fn test_clamping_property() {
    let mut limit = FloatProperty::new(21.0)
        .with_limits(0.02, 210.0, RangePolicy::Clamp)
        .with_unit("V");
    assert_eq!(limit.policy(), RangePolicy::Clamp);

    assert_eq!(limit.set(&int(500, None)), Ok(210.0));
    assert_eq!(limit.format(), "210");
    assert_eq!(limit.set(&symbol("MIN")), Ok(0.02));
    assert_eq!(limit.set(&int(5, Some("V"))), Ok(5.0));

    limit.reset();
    assert_eq!(limit.get(), 21.0);
}

#[test]
fn test_rejecting_property_keeps_old_value() {
    let mut gain = FloatProperty::new(1.0)
        .with_limits(0.0, 2.0, RangePolicy::Reject)
        .with_step(0.25);
    assert!(matches!(gain.set(&int(5, None)), Err(ScpiError::OutOfRange { .. })));
    assert_eq!(gain.get(), 1.0);

    assert_eq!(gain.set(&symbol("UP")), Ok(1.25));
    assert_eq!(gain.set_args(&[symbol("DEF")]), Ok(1.0));
    assert!(is_invalid(gain.set_args(&[])));
}

#[test]
fn test_formatted_values_resolve_to_themselves() {
    let spec = FloatArg::new().unit("V");
    for value in [0.0, 1.5, -3.25e-4, 123_456.789, 1e-12, 7.0e15] {
        let resolved = spec.resolve(&float(value, None)).unwrap();
        let message = parse_str(&format!(":VOLT {resolved}")).unwrap();
        let reparsed = match &message.units[0] {
            ProgramMessageUnit::Command(command) => spec.resolve(&command.args[0]).unwrap(),
            other => panic!("Expected a command, got {other:?}"),
        };
        assert_eq!(reparsed, resolved, "{resolved} did not survive formatting");
    }
}
