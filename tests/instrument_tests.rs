use scpisim::command_tree::CommandTree;
use scpisim::config::InstrumentOptions;
use scpisim::instrument::*;
use scpisim::instruments::{current_source, voltmeter, CurrentSource, Terminals, Voltmeter};
use scpisim::value::{no_args, single, FloatArg};
use scpisim::ScpiError;
use std::sync::{Arc, Mutex};

fn source() -> CurrentSource {
    CurrentSource::new(&InstrumentOptions::default()).unwrap()
}

/// Minimal instrument with one hookable counter.
struct Counter {
    core: InstrumentCore<Self>,
    count: f64,
    resets: usize,
}

impl Counter {
    fn new() -> Self {
        let mut tree: CommandTree<Self> = base_commands().unwrap();
        tree.on_set(
            ":COUNt",
            hooked("count", |counter: &mut Self, args| {
                counter.count = FloatArg::new().limits(0.0, 100.0).resolve(single(args)?)?;
                Ok(())
            }),
        )
        .unwrap();
        tree.on_query(":COUNt", |counter: &mut Self, args| {
            no_args(args)?;
            Ok(counter.count.to_string())
        })
        .unwrap();
        Self {
            core: InstrumentCore::new("TEST,Counter,0,1", tree, &InstrumentOptions::default()),
            count: 0.0,
            resets: 0,
        }
    }
}

impl Instrument for Counter {
    fn core(&self) -> &InstrumentCore<Self> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut InstrumentCore<Self> {
        &mut self.core
    }

    fn reset(&mut self) {
        self.count = 0.0;
        self.resets += 1;
    }
}

#[test]
fn test_common_commands() {
    let mut counter = Counter::new();
    assert_eq!(counter.ask("*IDN?"), vec!["TEST,Counter,0,1"]);
    assert_eq!(counter.ask("*TST?"), vec!["0"]);
    assert_eq!(counter.ask("*OPC?;*WAI"), vec!["1"]);

    counter.ask(":COUN 7;*RST");
    assert_eq!(counter.count, 0.0);
    assert_eq!(counter.resets, 1);
}

#[test]
fn test_responses_before_a_failure_are_kept() {
    let mut counter = Counter::new();
    let results: Vec<_> = counter.process(b":COUN 3;:COUN?;:BOGUS;*IDN?").collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], Ok("3".to_string()));
    assert_eq!(
        results[1],
        Err(ScpiError::UnsupportedCommand {
            header: ":BOGUS".to_string(),
        })
    );
    assert_eq!(counter.ask(":COUN 4;:COUN?;*IDN? 1;:COUN?"), vec!["4"]);
}

#[test]
fn test_set_effects_before_a_failure_stand() {
    let mut counter = Counter::new();
    assert!(counter.ask(":COUN 5;:COUN 500;:COUN 6").is_empty());
    assert_eq!(counter.count, 5.0);
}

#[test]
fn test_error_queue_is_read_oldest_first() {
    let mut counter = Counter::new();
    counter.ask(":BOGUS");
    counter.ask(":COUN 500");
    assert_eq!(counter.core().errors().pending(), 2);

    assert_eq!(counter.ask("*ERR?"), vec!["-113,\"Undefined header; :BOGUS\""]);
    assert_eq!(
        counter.ask(":SYST:ERR?"),
        vec!["-222,\"Data out of range; 500 not within [0, 100]\""]
    );
    assert_eq!(counter.ask(":SYSTEM:ERROR:NEXT?"), vec![NO_ERROR]);
    assert_eq!(counter.ask("*ERR?"), vec![NO_ERROR]);
    assert_eq!(counter.core().errors().entries().len(), 2);
}

#[test]
fn test_unparseable_line_is_logged() {
    let mut counter = Counter::new();
    let results: Vec<_> = counter.process(b"*IDN?;:COUN ?").collect();
    assert_eq!(results.len(), 2);
    assert!(matches!(results[1], Err(ScpiError::Parse(_))));

    let oversize = vec![b'A'; scpisim::protocol::MAX_MESSAGE_SIZE + 1];
    let results: Vec<_> = counter.process(&oversize).collect();
    assert!(matches!(results[..], [Err(ScpiError::MessageTooLarge { .. })]));
    assert_eq!(counter.core().errors().pending(), 2);
}

#[test]
fn test_event_status_register() {
    let mut counter = Counter::new();
    counter.ask(":BOGUS");
    assert_eq!(counter.ask("*ESR?"), vec!["32"]);
    assert_eq!(counter.ask("*ESR?"), vec!["0"]);

    counter.ask(":COUN 500");
    assert_eq!(counter.ask("*ESR?"), vec!["16"]);

    counter.ask("*OPC");
    assert_eq!(counter.ask("*ESR?"), vec!["1"]);
}

#[test]
fn test_status_byte() {
    let mut counter = Counter::new();
    assert_eq!(counter.ask("*STB?"), vec!["0"]);

    counter.ask("*ESE 32;*SRE 32");
    assert_eq!(counter.ask("*ESE?;*SRE?"), vec!["32", "32"]);
    counter.ask(":BOGUS");
    assert_eq!(counter.ask("*STB?"), vec!["100"]);
    assert_eq!(counter.core().status_byte(), STB_ERROR_QUEUE | STB_EVENT_SUMMARY | STB_MASTER_SUMMARY);

    counter.ask("*CLS");
    assert_eq!(counter.ask("*STB?"), vec!["0"]);
    assert_eq!(counter.ask("*ERR?"), vec![NO_ERROR]);
    assert_eq!(counter.core().status().event_enable, 32);
}

#[test]
fn test_enable_registers_are_bytes() {
    let mut counter = Counter::new();
    assert!(counter.ask("*ESE 256").is_empty());
    assert_eq!(counter.ask("*ERR?"), vec!["-222,\"Data out of range; 256 not within [0, 255]\""]);
    assert!(counter.ask("*SRE ON").is_empty());
    assert_eq!(counter.ask("*ESE?;*SRE?"), vec!["0", "0"]);
}

#[test]
fn test_named_and_wildcard_hooks() {
    let mut counter = Counter::new();
    let named = Arc::new(Mutex::new(Vec::new()));
    let wildcard = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&named);
    counter.add_hook(Some("count"), move |counter: &Counter, _| {
        seen.lock().unwrap().push(counter.count);
    });
    let seen = Arc::clone(&wildcard);
    counter.add_hook(None, move |_: &Counter, name| {
        seen.lock().unwrap().push(name.to_string());
    });
    counter.add_hook(Some("other"), |_: &Counter, _| panic!("Unrelated hook fired"));

    counter.ask(":COUN 2;:COUN 3;:COUN 300");
    assert_eq!(*named.lock().unwrap(), vec![2.0, 3.0]);
    assert_eq!(*wildcard.lock().unwrap(), vec!["count", "count"]);
}

#[test]
fn test_current_source_settings() {
    let mut source = source();
    assert_eq!(source.ask("*IDN?"), vec![current_source::IDENTITY]);
    assert_eq!(
        source.ask(":SOUR:CURR 2.5 A;:OUTP ON;:CURR?;:OUTP?"),
        vec!["2.50", "1"]
    );
    assert_eq!(
        source.ask(":SOURCE1:CURRENT:LEVEL:IMMEDIATE:AMPLITUDE 250 mA;:SOUR:CURR:LEV:IMM:AMPL?"),
        vec!["0.25"]
    );
    assert_eq!(source.ask(":CURR 1;:CURR UP;:CURR?"), vec!["1.10"]);
    assert_eq!(source.ask(":CURR MAX;:CURR?;:CURR MIN;:CURR?"), vec!["10.00", "-10.00"]);
    assert_eq!(source.ask(":CURR DEF;:CURR?"), vec!["0.00"]);
    assert_eq!(source.ask(":OUTP OFF;:OUTPUT1:STATE?"), vec!["0"]);
    assert_eq!(source.ask(":FUNC?"), vec!["CURR"]);
}

#[test]
fn test_current_source_limits() {
    let mut source = source();
    assert!(source.ask(":CURR 20 A").is_empty());
    assert_eq!(
        source.ask("*ERR?"),
        vec!["-222,\"Data out of range; 20 not within [-10, 10]\""]
    );
    assert_eq!(source.current(), 0.0);

    assert_eq!(source.ask(":CURR 1 V;:CURR?"), Vec::<String>::new());
    assert_eq!(source.core().errors().pending(), 1);
}

#[test]
fn test_voltage_limit_is_clamped() {
    let mut source = source();
    assert_eq!(source.ask(":SOUR:CURR:VLIMIT?"), vec!["21"]);
    assert_eq!(source.ask(":SOUR:CURR:VLIMIT 500;:SOUR:CURR:VLIMIT?"), vec!["210"]);
    assert_eq!(source.ask(":CURR:VLIM 0;:CURR:VLIM:LEV?"), vec!["0.02"]);
    assert_eq!(source.ask(":CURR:VLIM 5 V;:CURR:VLIM UP;:CURR:VLIM?"), vec!["6"]);
    assert_eq!(source.core().errors().pending(), 0);
    assert_eq!(source.voltage_limit(), 6.0);

    // The fourth letter of VLIMIT is not a vowel, so the short form keeps it.
    assert!(source.ask(":CURR:VLI?").is_empty());
    assert_eq!(source.core().errors().pending(), 1);
}

#[test]
fn test_terminals_choice() {
    let mut source = source();
    assert_eq!(source.ask(":ROUT:TERM?"), vec!["FRON"]);
    assert_eq!(source.ask(":ROUT:TERM REAR;:ROUT:TERM?"), vec!["REAR"]);
    assert_eq!(source.terminals(), Terminals::Rear);
    assert_eq!(source.ask(":ROUTE:TERMINALS front;:ROUT:TERM?"), vec!["FRON"]);
    assert!(source.ask(":ROUT:TERM SIDE").is_empty());
    assert_eq!(source.core().errors().pending(), 1);
}

#[test]
fn test_unmodelled_commands_are_device_errors() {
    let mut source = source();
    assert!(source.ask(":FUNC VOLT").is_empty());
    assert!(source.ask(":VOLT?").is_empty());
    assert_eq!(source.ask("*ESR?"), vec![ESR_DEVICE_ERROR.to_string()]);
    assert_eq!(source.ask("*ERR?"), vec!["-300,\"Device-specific error; not implemented\""]);
}

#[test]
fn test_current_source_reset() {
    let mut source = source();
    source.ask(":CURR 3;:OUTP ON;:ROUT:TERM REAR;:SOUR:CURR:VLIMIT 100");
    source.ask("*RST");
    assert_eq!(source.ask(":CURR?;:OUTP?;:ROUT:TERM?;:CURR:VLIM?"), vec!["0.00", "0", "FRON", "21"]);
}

#[test]
fn test_current_source_hooks() {
    let mut source = source();
    let names = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&names);
    source.add_hook(None, move |source: &CurrentSource, name| {
        seen.lock().unwrap().push(format!("{name}={}", source.current()));
    });

    source.ask(":CURR 2;:OUTP ON;:ROUT:TERM REAR;:CURR 20");
    assert_eq!(*names.lock().unwrap(), vec!["current=2", "state=2"]);
}

#[test]
fn test_voltmeter_readings() {
    let mut meter = Voltmeter::new(&InstrumentOptions::default()).unwrap();
    assert_eq!(meter.ask("*IDN?"), vec![voltmeter::IDENTITY]);
    assert_eq!(meter.ask(":VOLT?"), vec!["0.00"]);

    meter.set_voltage(1.234);
    assert_eq!(
        meter.ask(":SENS:VOLT:DC?;:MEAS:VOLT?;:READ?"),
        vec!["1.23", "1.23", "1.23"]
    );
    assert!(meter.ask(":VOLT 1").is_empty());
    assert!(matches!(
        meter.process(b":VOLT 1").next(),
        Some(Err(ScpiError::NotSettable { .. }))
    ));
}

#[test]
fn test_full_output_queue_pauses_input() {
    let options = InstrumentOptions {
        queue_depth: 1,
        ..InstrumentOptions::default()
    };
    let mut source = CurrentSource::new(&options).unwrap();
    let port = source.take_port().unwrap();

    port.try_submit(b":CURR 1;:CURR?".to_vec()).unwrap();
    assert_eq!(source.process_messages(8), 1);
    port.try_submit(b":CURR 2;:CURR?".to_vec()).unwrap();
    assert_eq!(source.process_messages(8), 1);

    // One response is held back; nothing more is read until it drains.
    port.try_submit(b":CURR 3;:CURR?".to_vec()).unwrap();
    assert_eq!(source.process_messages(8), 0);
    assert_eq!(source.current(), 2.0);
    assert!(port.try_submit(b"*OPC?".to_vec()).is_err());

    assert_eq!(port.try_response(), Some(b"1.00\n".to_vec()));
    assert_eq!(source.process_messages(8), 1);
    assert_eq!(port.try_response(), Some(b"2.00\n".to_vec()));
    assert_eq!(source.process_messages(8), 0);
    assert_eq!(port.try_response(), Some(b"3.00\n".to_vec()));
    assert_eq!(port.try_response(), None);
}
