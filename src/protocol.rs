//! IEEE 488.2 program message grammar.
//!
//! A program message is one line of text holding `;`-separated program
//! message units. Each unit has a header (`*IDN`, `:SOUR:CURR`, `VOLT`),
//! an optional query marker and an optional comma-separated argument list.
//! Units that cannot be tokenized become [`ProgramMessageUnit::Invalid`] so
//! that the caller can still execute the units in front of them.

use crate::error::{Result, ScpiError};
use core::fmt;

/// Longest program message accepted from a client.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(value) => value as f64,
            Numeric::Float(value) => value,
        }
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Numeric::Int(value) => write!(f, "{value}"),
            Numeric::Float(value) => write!(f, "{value}"),
        }
    }
}

/// One element of a program data list.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// Character program data, e.g. `MAX` or `ON`
    Symbol(String),
    /// Decimal or non-decimal numeric data with an optional unit suffix
    Number { value: Numeric, suffix: Option<String> },
    /// Quoted string data with the doubled-quote escapes removed
    Quoted(Vec<u8>),
    /// Definite or indefinite length arbitrary block data
    Block(Vec<u8>),
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Symbol(symbol) => f.write_str(symbol),
            Argument::Number { value, suffix: Some(suffix) } => write!(f, "{value} {suffix}"),
            Argument::Number { value, suffix: None } => write!(f, "{value}"),
            Argument::Quoted(bytes) => write!(f, "'{}'", decode_latin1(bytes).replace('\'', "''")),
            Argument::Block(bytes) => write!(f, "<block of {} bytes>", bytes.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// `*`-prefixed IEEE 488.2 common command, stored uppercase with the `*`
    Common(String),
    /// Colon-separated mnemonics. `rooted` is false for the shorthand form that
    /// continues from the previous unit's parent.
    Compound { rooted: bool, mnemonics: Vec<String> },
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::Common(name) => f.write_str(name),
            Header::Compound { rooted, mnemonics } => {
                if *rooted {
                    f.write_str(":")?;
                }
                f.write_str(&mnemonics.join(":"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramCommand {
    pub header: Header,
    pub query: bool,
    pub args: Vec<Argument>,
}

impl fmt::Display for ProgramCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)?;
        if self.query {
            f.write_str("?")?;
        }
        for (index, arg) in self.args.iter().enumerate() {
            f.write_str(if index == 0 { " " } else { "," })?;
            write!(f, "{arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgramMessageUnit {
    Command(ProgramCommand),
    /// Nothing between two separators; parsed but never dispatched
    Empty,
    /// Text from the first unparseable unit to the end of the message
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgramMessage {
    pub units: Vec<ProgramMessageUnit>,
}

impl ProgramMessage {
    /// Commands in order, stopping at the first invalid unit.
    pub fn commands(&self) -> impl Iterator<Item = &ProgramCommand> {
        self.units
            .iter()
            .take_while(|unit| !matches!(unit, ProgramMessageUnit::Invalid(_)))
            .filter_map(|unit| match unit {
                ProgramMessageUnit::Command(command) => Some(command),
                _ => None,
            })
    }

    pub fn has_errors(&self) -> bool {
        self.units.iter().any(|unit| matches!(unit, ProgramMessageUnit::Invalid(_)))
    }
}

impl IntoIterator for ProgramMessage {
    type Item = ProgramMessageUnit;
    type IntoIter = std::vec::IntoIter<ProgramMessageUnit>;

    fn into_iter(self) -> Self::IntoIter {
        self.units.into_iter()
    }
}

/// Parses one program message (without its line terminator).
///
/// Fails only when the line as a whole is unusable: longer than
/// [`MAX_MESSAGE_SIZE`] or containing an embedded newline.
pub fn parse(line: &[u8]) -> Result<ProgramMessage> {
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ScpiError::MessageTooLarge {
            length: line.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    if line.contains(&b'\n') {
        return Err(ScpiError::Parse("embedded line terminator".to_string()));
    }

    let mut cursor = Cursor::new(line);
    let mut units = Vec::new();

    cursor.skip_whitespace();
    if cursor.at_end() {
        return Ok(ProgramMessage { units });
    }

    loop {
        let start = cursor.pos;
        match cursor.message_unit() {
            Some(unit) => units.push(unit),
            None => {
                let text = decode_latin1(&line[start..]);
                units.push(ProgramMessageUnit::Invalid(text.trim().to_string()));
                break;
            }
        }
        if !cursor.eat(b';') {
            break;
        }
    }

    Ok(ProgramMessage { units })
}

pub fn parse_str(line: &str) -> Result<ProgramMessage> {
    parse(line.as_bytes())
}

/// Bytes are Latin-1 on the wire; every byte maps to one `char`.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| char::from(byte)).collect()
}

/// Characters outside Latin-1 are sent as `?`.
pub fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Joins the query responses of one program message into a response message.
pub fn encode_response(responses: &[String], line_ending: &[u8]) -> Vec<u8> {
    let mut encoded = encode_latin1(&responses.join(";"));
    encoded.extend_from_slice(line_ending);
    encoded
}

// Everything at or below 0x20 except the newline counts as white space.
fn is_whitespace(byte: u8) -> bool {
    byte <= 0x20 && byte != b'\n'
}

fn is_word(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.pos + offset).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn at_unit_end(&self) -> bool {
        matches!(self.peek(), None | Some(b';'))
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn take_while(&mut self, predicate: impl Fn(u8) -> bool) -> &'a [u8] {
        let start = self.pos;
        while self.peek().is_some_and(&predicate) {
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn message_unit(&mut self) -> Option<ProgramMessageUnit> {
        self.skip_whitespace();
        if self.at_unit_end() {
            return Some(ProgramMessageUnit::Empty);
        }

        let header = self.header()?;
        let query = self.eat(b'?');
        let mut args = Vec::new();

        if !self.at_unit_end() {
            // Arguments are separated from the header by at least one blank.
            if !self.skip_whitespace() {
                return None;
            }
            if !self.at_unit_end() {
                args = self.arguments()?;
            }
        }
        self.skip_whitespace();
        if !self.at_unit_end() {
            return None;
        }

        Some(ProgramMessageUnit::Command(ProgramCommand { header, query, args }))
    }

    fn header(&mut self) -> Option<Header> {
        if self.eat(b'*') {
            let name = self.mnemonic()?;
            return Some(Header::Common(format!("*{name}")));
        }

        let rooted = self.eat(b':');
        let mut mnemonics = vec![self.mnemonic()?];
        while self.eat(b':') {
            mnemonics.push(self.mnemonic()?);
        }
        Some(Header::Compound { rooted, mnemonics })
    }

    fn mnemonic(&mut self) -> Option<String> {
        if !self.peek().is_some_and(|byte| byte.is_ascii_alphabetic()) {
            return None;
        }
        let word = self.take_while(is_word);
        Some(decode_latin1(word).to_ascii_uppercase())
    }

    fn arguments(&mut self) -> Option<Vec<Argument>> {
        let mut args = Vec::new();
        loop {
            args.push(self.argument()?);
            self.skip_whitespace();
            if !self.eat(b',') {
                return Some(args);
            }
            self.skip_whitespace();
        }
    }

    fn argument(&mut self) -> Option<Argument> {
        match self.peek()? {
            quote @ (b'\'' | b'"') => self.quoted(quote),
            b'#' => self.hash_prefixed(),
            b'0'..=b'9' | b'+' | b'-' | b'.' => self.decimal(),
            byte if byte.is_ascii_alphabetic() => {
                let word = self.take_while(is_word);
                Some(Argument::Symbol(decode_latin1(word)))
            }
            _ => None,
        }
    }

    fn quoted(&mut self, quote: u8) -> Option<Argument> {
        self.pos += 1;
        let mut bytes = Vec::new();
        loop {
            let byte = self.peek()?;
            self.pos += 1;
            if byte == quote {
                if self.eat(quote) {
                    bytes.push(quote);
                } else {
                    return Some(Argument::Quoted(bytes));
                }
            } else {
                bytes.push(byte);
            }
        }
    }

    fn hash_prefixed(&mut self) -> Option<Argument> {
        self.pos += 1;
        let radix = match self.peek()? {
            b'H' | b'h' => 16,
            b'Q' | b'q' => 8,
            b'B' | b'b' => 2,
            b'0' => {
                let block = self.input[self.pos + 1..].to_vec();
                self.pos = self.input.len();
                return Some(Argument::Block(block));
            }
            b'1'..=b'9' => return self.definite_block(),
            _ => return None,
        };
        self.pos += 1;
        let digits = self.take_while(|b| char::from(b).is_digit(radix));
        if digits.is_empty() {
            return None;
        }
        let value = i64::from_str_radix(&decode_latin1(digits), radix).ok()?;
        Some(Argument::Number {
            value: Numeric::Int(value),
            suffix: None,
        })
    }

    fn definite_block(&mut self) -> Option<Argument> {
        let width = usize::from(self.peek()? - b'0');
        self.pos += 1;
        let digits = self.input.get(self.pos..self.pos + width)?;
        if !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let length: usize = decode_latin1(digits).parse().ok()?;
        self.pos += width;
        let data = self.input.get(self.pos..self.pos + length)?.to_vec();
        self.pos += length;
        Some(Argument::Block(data))
    }

    fn decimal(&mut self) -> Option<Argument> {
        let start = self.pos;
        if matches!(self.peek(), Some(b'+' | b'-')) {
            self.pos += 1;
        }
        let integer = self.take_while(|b| b.is_ascii_digit());
        let mut fraction: &[u8] = &[];
        let has_point = self.eat(b'.');
        if has_point {
            fraction = self.take_while(|b| b.is_ascii_digit());
        }
        if integer.is_empty() && fraction.is_empty() {
            return None;
        }
        let mantissa = decode_latin1(&self.input[start..self.pos]);

        let mut exponent: i32 = 0;
        let before_exponent = self.pos;
        if self.eat(b'e') || self.eat(b'E') {
            let exponent_start = self.pos;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            let digits = self.take_while(|b| b.is_ascii_digit());
            if digits.is_empty() {
                // Not an exponent; the `E` belongs to a unit suffix.
                self.pos = before_exponent;
            } else {
                exponent = decode_latin1(&self.input[exponent_start..self.pos]).parse().ok()?;
            }
        }

        let value = numeric_value(&mantissa, has_point, exponent)?;

        let before_suffix = self.pos;
        self.skip_whitespace();
        let suffix = self.suffix();
        if suffix.is_none() {
            self.pos = before_suffix;
        }

        Some(Argument::Number { value, suffix })
    }

    fn suffix(&mut self) -> Option<String> {
        let start = self.pos;
        if self.peek() == Some(b'/') && self.peek_at(1).is_some_and(|b| b.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        loop {
            if self.take_while(|b| b.is_ascii_alphabetic()).is_empty() {
                self.pos = start;
                return None;
            }
            if self.peek() == Some(b'-') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 2;
            } else if self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
            let separator = matches!(self.peek(), Some(b'.' | b'/'));
            if separator && self.peek_at(1).is_some_and(|b| b.is_ascii_alphabetic()) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Some(decode_latin1(&self.input[start..self.pos]))
    }
}

// Integers stay integers unless a decimal point or a negative exponent is present.
fn numeric_value(mantissa: &str, has_point: bool, exponent: i32) -> Option<Numeric> {
    if !has_point && exponent >= 0 {
        let integer = mantissa.trim_start_matches('+').parse::<i64>().ok();
        let scale = u32::try_from(exponent).ok().and_then(|e| 10_i64.checked_pow(e));
        if let Some(value) = integer.zip(scale).and_then(|(i, s)| i.checked_mul(s)) {
            return Some(Numeric::Int(value));
        }
    }
    format!("{mantissa}e{exponent}")
        .parse::<f64>()
        .ok()
        .map(Numeric::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_value_integer_scaling() {
        assert_eq!(numeric_value("12", false, 3), Some(Numeric::Int(12_000)));
        assert_eq!(numeric_value("+7", false, 0), Some(Numeric::Int(7)));
        assert_eq!(numeric_value("-12", false, -1), Some(Numeric::Float(-1.2)));
        assert_eq!(numeric_value("1.5", true, 0), Some(Numeric::Float(1.5)));
    }

    #[test]
    fn test_numeric_value_overflow_falls_back_to_float() {
        match numeric_value("9", false, 30) {
            Some(Numeric::Float(value)) => assert!((value - 9e30).abs() < 1e16),
            other => panic!("Expected float, got {other:?}"),
        }
    }

    #[test]
    fn test_latin1_round_trip() {
        let bytes: Vec<u8> = (0x20..=0xFF).collect();
        assert_eq!(encode_latin1(&decode_latin1(&bytes)), bytes);
        assert_eq!(encode_latin1("Ω"), b"?".to_vec());
    }
}
