//! Hierarchical SCPI command registry.
//!
//! Nodes live in an arena; a mnemonic's long form and its short form are two
//! keys mapping to the same node index, so aliases can never drift apart.
//! Command patterns use the usual manual notation:
//!
//! ```text
//! [:SOURce[1]]:CURRent[:LEVel][:IMMediate][:AMPLitude]
//! *IDN
//! :SYSTem:ERRor[:NEXT]?
//! ```
//!
//! Square brackets containing a colon make a whole header group optional;
//! brackets without one make part of a mnemonic optional. Every optional
//! group forks the registration, so one pattern may fill many leaves.

use crate::error::{Result, ScpiError};
use crate::protocol::{Argument, Header};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub type SetHandler<T> = Arc<dyn Fn(&mut T, &[Argument]) -> Result<()> + Send + Sync>;
pub type QueryHandler<T> = Arc<dyn Fn(&mut T, &[Argument]) -> Result<String> + Send + Sync>;

const ROOT: usize = 0;
const VOWELS: &[u8] = b"AEIOUY";

/// How short forms are generated for mnemonics of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShortForms {
    /// First three letters when the fourth is a vowel, otherwise first four.
    #[default]
    Derived,
    /// The leading uppercase run of the pattern, e.g. `FRequency` -> `FR`.
    CaseMarked,
}

/// The set and query entry points stored at a leaf.
pub struct Handlers<T> {
    pub set: Option<SetHandler<T>>,
    pub query: Option<QueryHandler<T>>,
}

impl<T> Handlers<T> {
    fn empty() -> Self {
        Self { set: None, query: None }
    }

    fn is_empty(&self) -> bool {
        self.set.is_none() && self.query.is_none()
    }

    /// Fills the slots present in `other`; each slot can be filled only once.
    fn fill(&mut self, other: &Handlers<T>, pattern: &str) -> Result<()> {
        let taken = (self.set.is_some() && other.set.is_some())
            || (self.query.is_some() && other.query.is_some());
        if taken {
            return Err(ScpiError::AlreadyRegistered {
                pattern: pattern.to_string(),
            });
        }
        if let Some(set) = &other.set {
            self.set = Some(Arc::clone(set));
        }
        if let Some(query) = &other.query {
            self.query = Some(Arc::clone(query));
        }
        Ok(())
    }

    pub fn set_handler(&self, header: &Header) -> Result<&SetHandler<T>> {
        self.set.as_ref().ok_or_else(|| ScpiError::NotSettable {
            header: header.to_string(),
        })
    }

    pub fn query_handler(&self, header: &Header) -> Result<&QueryHandler<T>> {
        self.query.as_ref().ok_or_else(|| ScpiError::NotQueryable {
            header: header.to_string(),
        })
    }
}

impl<T> Clone for Handlers<T> {
    fn clone(&self) -> Self {
        Self {
            set: self.set.clone(),
            query: self.query.clone(),
        }
    }
}

struct Node<T> {
    children: BTreeMap<String, usize>,
    /// Long forms this node was registered under; other keys are short aliases.
    names: BTreeSet<String>,
    handlers: Handlers<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: BTreeMap::new(),
            names: BTreeSet::new(),
            handlers: Handlers::empty(),
        }
    }
}

impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            children: self.children.clone(),
            names: self.names.clone(),
            handlers: self.handlers.clone(),
        }
    }
}

/// Outcome of resolving one header.
pub struct Resolved<'t, T> {
    pub handlers: &'t Handlers<T>,
    /// Parent path the next shorthand header in the same message continues from.
    pub parent: Vec<String>,
}

pub struct CommandTree<T> {
    nodes: Vec<Node<T>>,
    common: BTreeMap<String, Handlers<T>>,
    style: ShortForms,
}

impl<T> Clone for CommandTree<T> {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            common: self.common.clone(),
            style: self.style,
        }
    }
}

impl<T> Default for CommandTree<T> {
    fn default() -> Self {
        Self::new(ShortForms::Derived)
    }
}

impl<T> CommandTree<T> {
    pub fn new(style: ShortForms) -> Self {
        Self {
            nodes: vec![Node::new()],
            common: BTreeMap::new(),
            style,
        }
    }

    /// Deep copy of this tree whose further registrations use `style`.
    pub fn extend_with(&self, style: ShortForms) -> Self {
        let mut tree = self.clone();
        tree.style = style;
        tree
    }

    pub fn style(&self) -> ShortForms {
        self.style
    }

    /// Number of distinct nodes, root excluded.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Registers either or both handlers under every header `pattern` expands to.
    ///
    /// The tree is left untouched when any part of the registration fails.
    pub fn register(
        &mut self,
        pattern: &str,
        set: Option<SetHandler<T>>,
        query: Option<QueryHandler<T>>,
    ) -> Result<()> {
        let handlers = Handlers { set, query };
        if handlers.is_empty() {
            return Err(invalid_pattern(pattern, "no handler given"));
        }
        let body = pattern.trim().trim_end_matches('?');

        if let Some(name) = body.strip_prefix('*') {
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                return Err(invalid_pattern(pattern, "common headers are a single mnemonic"));
            }
            let key = format!("*{}", name.to_ascii_uppercase());
            let mut slot = self.common.get(&key).cloned().unwrap_or_else(Handlers::empty);
            slot.fill(&handlers, pattern)?;
            self.common.insert(key, slot);
            return Ok(());
        }

        let segments = PatternParser::new(body, pattern, self.style).parse()?;

        let mut nodes = self.nodes.clone();
        let leaves = insert(&mut nodes, BTreeSet::from([ROOT]), &segments)?;
        for leaf in leaves {
            if leaf == ROOT {
                return Err(invalid_pattern(pattern, "pattern can match the root"));
            }
            nodes[leaf].handlers.fill(&handlers, pattern)?;
        }
        self.nodes = nodes;
        Ok(())
    }

    pub fn on_set<F>(&mut self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(&mut T, &[Argument]) -> Result<()> + Send + Sync + 'static,
    {
        self.register(pattern, Some(Arc::new(handler)), None)
    }

    pub fn on_query<F>(&mut self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(&mut T, &[Argument]) -> Result<String> + Send + Sync + 'static,
    {
        self.register(pattern, None, Some(Arc::new(handler)))
    }

    /// Resolves `header` in the context of the previous unit's `parent` path.
    pub fn resolve(&self, header: &Header, parent: &[String]) -> Result<Resolved<'_, T>> {
        let unsupported = || ScpiError::UnsupportedCommand {
            header: header.to_string(),
        };

        match header {
            Header::Common(name) => {
                let handlers = self.common.get(name).ok_or_else(unsupported)?;
                Ok(Resolved {
                    handlers,
                    parent: parent.to_vec(),
                })
            }
            Header::Compound { rooted, mnemonics } => {
                let mut path = if *rooted { Vec::new() } else { parent.to_vec() };
                path.extend(mnemonics.iter().cloned());

                let mut node = ROOT;
                for mnemonic in &path {
                    node = *self.nodes[node].children.get(mnemonic).ok_or_else(unsupported)?;
                }
                let handlers = &self.nodes[node].handlers;
                if handlers.is_empty() {
                    return Err(unsupported());
                }
                path.pop();
                Ok(Resolved { handlers, parent: path })
            }
        }
    }
}

fn invalid_pattern(pattern: &str, reason: &str) -> ScpiError {
    ScpiError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Mnemonic { long: BTreeSet<String>, short: BTreeSet<String> },
    Optional(Vec<Segment>),
}

// Steps every current location through `segments`; optional groups keep both
// the locations that skipped the group and those that went through it.
fn insert<T>(
    nodes: &mut Vec<Node<T>>,
    mut locations: BTreeSet<usize>,
    segments: &[Segment],
) -> Result<BTreeSet<usize>> {
    for segment in segments {
        locations = match segment {
            Segment::Mnemonic { long, short } => locations
                .into_iter()
                .map(|location| insert_child(nodes, location, long, short))
                .collect::<Result<_>>()?,
            Segment::Optional(inner) => {
                let taken = insert(nodes, locations.clone(), inner)?;
                locations.union(&taken).copied().collect()
            }
        };
    }
    Ok(locations)
}

// A long form may only reuse a sibling registered under that same long form;
// matching a sibling's short alias is a collision in either order.
fn insert_child<T>(
    nodes: &mut Vec<Node<T>>,
    parent: usize,
    long: &BTreeSet<String>,
    short: &BTreeSet<String>,
) -> Result<usize> {
    let collision = |form: &String| {
        let origin = long
            .iter()
            .find(|l| l.starts_with(form.as_str()))
            .or_else(|| long.iter().next_back())
            .cloned()
            .unwrap_or_default();
        ScpiError::ShortFormCollision {
            short: form.clone(),
            long: origin,
        }
    };

    let mut existing = BTreeSet::new();
    for form in long {
        if let Some(&child) = nodes[parent].children.get(form) {
            if !nodes[child].names.contains(form) {
                return Err(collision(form));
            }
            existing.insert(child);
        }
    }
    let mut existing = existing.into_iter();
    let child = match (existing.next(), existing.next()) {
        (Some(child), None) => child,
        (None, _) => {
            nodes.push(Node::new());
            nodes.len() - 1
        }
        (Some(_), Some(_)) => {
            let name = long.iter().next_back().cloned().unwrap_or_default();
            return Err(ScpiError::ShortFormCollision {
                short: name.clone(),
                long: name,
            });
        }
    };

    for form in long.iter().chain(short) {
        match nodes[parent].children.get(form) {
            Some(&other) if other != child => return Err(collision(form)),
            Some(_) => {}
            None => {
                nodes[parent].children.insert(form.clone(), child);
            }
        }
    }
    nodes[child].names.extend(long.iter().cloned());
    Ok(child)
}

struct PatternParser<'p> {
    chars: Vec<char>,
    pos: usize,
    pattern: &'p str,
    style: ShortForms,
}

#[derive(Debug, Clone)]
enum Piece {
    Required(String),
    Optional(Vec<Piece>),
}

impl<'p> PatternParser<'p> {
    fn new(body: &str, pattern: &'p str, style: ShortForms) -> Self {
        Self {
            chars: body.chars().collect(),
            pos: 0,
            pattern,
            style,
        }
    }

    fn error(&self, reason: &str) -> ScpiError {
        invalid_pattern(self.pattern, &format!("{reason} at offset {}", self.pos))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn parse(mut self) -> Result<Vec<Segment>> {
        let segments = self.header(true)?;
        if self.pos != self.chars.len() {
            return Err(self.error("unbalanced `]`"));
        }
        if segments.is_empty() {
            return Err(self.error("empty header"));
        }
        Ok(segments)
    }

    fn header(&mut self, top: bool) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                None => {
                    if !top {
                        return Err(self.error("missing `]`"));
                    }
                    return Ok(segments);
                }
                Some(']') if !top => return Ok(segments),
                Some('[') if self.bracket_has_colon() => {
                    self.pos += 1;
                    let inner = self.header(false)?;
                    if inner.is_empty() {
                        return Err(self.error("empty optional group"));
                    }
                    self.pos += 1;
                    segments.push(Segment::Optional(inner));
                }
                Some(':') => {
                    self.pos += 1;
                    segments.push(self.mnemonic()?);
                }
                // The leading colon of a header may be left out.
                Some(c) if segments.is_empty() && (c == '[' || is_word(c)) => {
                    segments.push(self.mnemonic()?);
                }
                Some(_) => return Err(self.error("unexpected character")),
            }
        }
    }

    fn bracket_has_colon(&self) -> bool {
        let mut depth = 0usize;
        for &c in &self.chars[self.pos..] {
            match c {
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        return false;
                    }
                }
                ':' => return true,
                _ => {}
            }
        }
        false
    }

    fn mnemonic(&mut self) -> Result<Segment> {
        let pieces = self.pieces()?;
        let mut long = BTreeSet::new();
        let mut short = BTreeSet::new();

        for variant in expand(&pieces) {
            if variant.is_empty() {
                return Err(self.error("mnemonic may be empty"));
            }
            if !variant.starts_with(|c: char| c.is_ascii_alphabetic()) {
                return Err(self.error("mnemonic must start with a letter"));
            }
            let upper = variant.to_ascii_uppercase();
            if let Some(form) = self.short_form(&variant, &upper)? {
                short.insert(form);
            }
            long.insert(upper);
        }
        let short = short.difference(&long).cloned().collect();
        Ok(Segment::Mnemonic { long, short })
    }

    fn short_form(&self, variant: &str, upper: &str) -> Result<Option<String>> {
        match self.style {
            ShortForms::Derived => Ok(derived_short_form(upper)),
            ShortForms::CaseMarked if variant == upper => Ok(None),
            ShortForms::CaseMarked => {
                let marked: String = variant
                    .chars()
                    .take_while(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_')
                    .collect();
                if marked.is_empty() {
                    Err(self.error(&format!("cannot derive a short form from {variant}")))
                } else {
                    Ok(Some(marked))
                }
            }
        }
    }

    fn pieces(&mut self) -> Result<Vec<Piece>> {
        let mut pieces = Vec::new();
        loop {
            match self.peek() {
                Some(c) if is_word(c) => {
                    let start = self.pos;
                    while self.peek().is_some_and(is_word) {
                        self.pos += 1;
                    }
                    pieces.push(Piece::Required(self.chars[start..self.pos].iter().collect()));
                }
                Some('[') if !self.bracket_has_colon() => {
                    self.pos += 1;
                    let inner = self.pieces()?;
                    if self.peek() != Some(']') || inner.is_empty() {
                        return Err(self.error("malformed optional mnemonic part"));
                    }
                    self.pos += 1;
                    pieces.push(Piece::Optional(inner));
                }
                _ => break,
            }
        }
        if pieces.is_empty() {
            return Err(self.error("expected a mnemonic"));
        }
        Ok(pieces)
    }
}

fn is_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Every spelling of a mnemonic with optional parts, e.g. `QU[ICK]`.
fn expand(pieces: &[Piece]) -> BTreeSet<String> {
    let mut variants = BTreeSet::from([String::new()]);
    for piece in pieces {
        variants = match piece {
            Piece::Required(text) => variants.iter().map(|v| format!("{v}{text}")).collect(),
            Piece::Optional(inner) => {
                let tails = expand(inner);
                let mut next = variants.clone();
                for v in &variants {
                    next.extend(tails.iter().map(|tail| format!("{v}{tail}")));
                }
                next
            }
        };
    }
    variants
}

/// Short form under the vowel rule, when it differs from the long form.
pub fn derived_short_form(long: &str) -> Option<String> {
    let bytes = long.as_bytes();
    if bytes.len() > 3 && VOWELS.contains(&bytes[3].to_ascii_uppercase()) {
        Some(long[..3].to_string())
    } else if bytes.len() > 4 {
        Some(long[..4].to_string())
    } else {
        None
    }
}
