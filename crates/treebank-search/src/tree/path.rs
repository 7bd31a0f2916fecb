//! Structural path expressions over [`Element`] trees.
//!
//! Supports the subset of XPath 1.0 that structural treebank queries use:
//! `/` and `//` steps, name tests and `*`, `.`, `@attr`, predicates with
//! `and`, `or`, `not()`, comparisons, string and number literals,
//! `lower-case()` and positional predicates such as `[1]`.

use std::collections::HashSet;

use super::Element;
use crate::error::{Result, SearchError};

// ---------------------------------------------------------------------------
// Expression types
// ---------------------------------------------------------------------------

/// A compiled path expression.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    start: PathStart,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathStart {
    Context,
    Root,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    /// `//`: children of every descendant-or-self node.
    Descendant,
    SelfNode,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Name(String),
    Any,
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Position(usize),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CompareOp, Operand),
    Exists(Operand),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(String),
    Number(f64),
    Nodes {
        path: PathExpr,
        attribute: Option<String>,
    },
    LowerCase(Box<Operand>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn is_relational(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }

    fn apply_numbers(self, left: f64, right: f64) -> bool {
        match self {
            Self::Eq => left == right,
            Self::NotEq => left != right,
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl PathExpr {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize_path_input(input)?;
        if tokens.is_empty() {
            return Err(SearchError::Pattern("empty path expression".to_string()));
        }
        let mut parser = PathParser { tokens, index: 0 };
        let (path, attribute) = parser.parse_path(false)?;
        debug_assert!(attribute.is_none());
        if let Some(token) = parser.peek() {
            return Err(SearchError::Pattern(format!(
                "unexpected token near byte {}",
                token.position
            )));
        }
        Ok(path)
    }

    /// Elements selected with `context` as the context node and as the root
    /// of absolute paths.
    pub fn select<'a>(&self, context: &'a Element) -> Vec<&'a Element> {
        self.select_within(context, context)
    }

    /// True when the expression selects at least one element.
    pub fn matches(&self, context: &Element) -> bool {
        !self.select(context).is_empty()
    }

    fn select_within<'a>(&self, context: &'a Element, root: &'a Element) -> Vec<&'a Element> {
        let mut current = match self.start {
            PathStart::Context => vec![Cursor::Node(context)],
            PathStart::Root => vec![Cursor::Document(root)],
        };

        for step in &self.steps {
            let mut seen = HashSet::new();
            let mut next = Vec::new();
            for cursor in &current {
                for group in step.candidate_groups(*cursor) {
                    for element in step.filter_group(group, root) {
                        if seen.insert(element as *const Element) {
                            next.push(Cursor::Node(element));
                        }
                    }
                }
            }
            current = next;
        }

        current
            .into_iter()
            .filter_map(|cursor| match cursor {
                Cursor::Node(element) => Some(element),
                Cursor::Document(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Cursor<'a> {
    /// The virtual document node whose only child is the root element.
    Document(&'a Element),
    Node(&'a Element),
}

impl Step {
    /// Candidate elements, grouped by parent so positional predicates
    /// count siblings.
    fn candidate_groups<'a>(&self, cursor: Cursor<'a>) -> Vec<Vec<&'a Element>> {
        match (self.axis, cursor) {
            (Axis::SelfNode, Cursor::Node(element)) => vec![vec![element]],
            (Axis::SelfNode, Cursor::Document(_)) => Vec::new(),
            (Axis::Child, Cursor::Node(element)) => vec![element.children.iter().collect()],
            (Axis::Child, Cursor::Document(root)) => vec![vec![root]],
            (Axis::Descendant, Cursor::Node(element)) => element
                .self_and_descendants()
                .into_iter()
                .map(|parent| parent.children.iter().collect())
                .collect(),
            (Axis::Descendant, Cursor::Document(root)) => {
                let mut groups = vec![vec![root]];
                groups.extend(
                    root.self_and_descendants()
                        .into_iter()
                        .map(|parent| parent.children.iter().collect::<Vec<_>>()),
                );
                groups
            }
        }
    }

    fn filter_group<'a>(&self, group: Vec<&'a Element>, root: &'a Element) -> Vec<&'a Element> {
        let mut selected = group
            .into_iter()
            .filter(|element| match &self.test {
                NodeTest::Any => true,
                NodeTest::Name(name) => element.name == *name,
            })
            .collect::<Vec<_>>();

        for predicate in &self.predicates {
            selected = match predicate {
                Predicate::Position(position) => selected
                    .get(position - 1)
                    .map(|element| vec![*element])
                    .unwrap_or_default(),
                Predicate::Expr(expr) => selected
                    .into_iter()
                    .filter(|element| expr.evaluate(element, root))
                    .collect(),
            };
        }
        selected
    }
}

impl Expr {
    fn evaluate(&self, context: &Element, root: &Element) -> bool {
        match self {
            Self::Or(parts) => parts.iter().any(|part| part.evaluate(context, root)),
            Self::And(parts) => parts.iter().all(|part| part.evaluate(context, root)),
            Self::Not(inner) => !inner.evaluate(context, root),
            Self::Exists(operand) => operand.truthy(context, root),
            Self::Compare(left, op, right) => {
                let numeric = op.is_relational() || left.is_number() || right.is_number();
                let left_values = left.values(context, root);
                let right_values = right.values(context, root);
                left_values.iter().any(|left| {
                    right_values
                        .iter()
                        .any(|right| compare_values(*op, left, right, numeric))
                })
            }
        }
    }
}

impl Operand {
    fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    fn truthy(&self, context: &Element, root: &Element) -> bool {
        match self {
            Self::Literal(value) => !value.is_empty(),
            Self::Number(value) => *value != 0.0 && !value.is_nan(),
            Self::Nodes { .. } => !self.values(context, root).is_empty(),
            Self::LowerCase(inner) => inner.truthy(context, root),
        }
    }

    /// String values of the operand; node-sets yield one value per node.
    fn values(&self, context: &Element, root: &Element) -> Vec<String> {
        match self {
            Self::Literal(value) => vec![value.clone()],
            Self::Number(value) => vec![value.to_string()],
            Self::Nodes { path, attribute } => {
                let nodes = if path.steps.is_empty() && path.start == PathStart::Context {
                    vec![context]
                } else {
                    path.select_within(context, root)
                };
                match attribute {
                    Some(name) => nodes
                        .into_iter()
                        .filter_map(|node| node.attribute(name).map(str::to_string))
                        .collect(),
                    None => nodes.into_iter().map(Element::text_content).collect(),
                }
            }
            Self::LowerCase(inner) => inner
                .values(context, root)
                .into_iter()
                .map(|value| value.to_lowercase())
                .collect(),
        }
    }
}

fn compare_values(op: CompareOp, left: &str, right: &str, numeric: bool) -> bool {
    if numeric {
        return match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
            (Ok(left), Ok(right)) => op.apply_numbers(left, right),
            _ => op == CompareOp::NotEq,
        };
    }
    match op {
        CompareOp::Eq => left == right,
        CompareOp::NotEq => left != right,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct PathParser {
    tokens: Vec<PathToken>,
    index: usize,
}

impl PathParser {
    /// Parses `('/' | '//')? step (('/' | '//') step)*`. With
    /// `allow_attribute` the path may end in an `@name` step, returned
    /// separately.
    fn parse_path(&mut self, allow_attribute: bool) -> Result<(PathExpr, Option<String>)> {
        let mut start = PathStart::Context;
        let mut axis = Axis::Child;
        if self.consume(&PathTokenKind::Slash) {
            start = PathStart::Root;
        } else if self.consume(&PathTokenKind::DoubleSlash) {
            start = PathStart::Root;
            axis = Axis::Descendant;
        }

        let mut steps = Vec::new();
        let mut attribute = None;
        loop {
            if self.peek_kind() == Some(&PathTokenKind::At) {
                if !allow_attribute {
                    return Err(self.error("attribute steps are only allowed inside predicates"));
                }
                self.index += 1;
                attribute = Some(self.expect_name()?);
                break;
            }
            steps.push(self.parse_step(axis)?);
            if self.consume(&PathTokenKind::Slash) {
                axis = Axis::Child;
            } else if self.consume(&PathTokenKind::DoubleSlash) {
                axis = Axis::Descendant;
            } else {
                break;
            }
        }

        Ok((PathExpr { start, steps }, attribute))
    }

    fn parse_step(&mut self, axis: Axis) -> Result<Step> {
        let token = self
            .next()
            .ok_or_else(|| SearchError::Pattern("expected a step but reached end".to_string()))?;
        let (axis, test) = match token.kind {
            PathTokenKind::Dot => (Axis::SelfNode, NodeTest::Any),
            PathTokenKind::Star => (axis, NodeTest::Any),
            PathTokenKind::Name(name) => {
                if self.peek_kind() == Some(&PathTokenKind::LParen) {
                    return Err(SearchError::Pattern(format!(
                        "unsupported function {name}() near byte {}",
                        token.position
                    )));
                }
                (axis, NodeTest::Name(name))
            }
            PathTokenKind::DotDot => {
                return Err(SearchError::Pattern(format!(
                    "parent steps are not supported (byte {})",
                    token.position
                )))
            }
            _ => {
                return Err(SearchError::Pattern(format!(
                    "expected a step near byte {}",
                    token.position
                )))
            }
        };

        let mut predicates = Vec::new();
        while self.consume(&PathTokenKind::LBracket) {
            predicates.push(self.parse_predicate()?);
            self.expect(&PathTokenKind::RBracket, "']'")?;
        }

        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_predicate(&mut self) -> Result<Predicate> {
        if let (Some(PathTokenKind::Number(value)), Some(PathTokenKind::RBracket)) =
            (self.peek_kind(), self.peek_kind_at(1))
        {
            let value = *value;
            if value < 1.0 || value.fract() != 0.0 {
                return Err(self.error("positional predicates must be positive integers"));
            }
            self.index += 1;
            return Ok(Predicate::Position(value as usize));
        }
        Ok(Predicate::Expr(self.parse_or()?))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut parts = vec![self.parse_and()?];
        while self.consume_keyword("or") {
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expr::Or(parts)
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut parts = vec![self.parse_unary()?];
        while self.consume_keyword("and") {
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expr::And(parts)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek_is_function("not") {
            self.index += 2;
            let inner = self.parse_or()?;
            self.expect(&PathTokenKind::RParen, "')'")?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.consume(&PathTokenKind::LParen) {
            let inner = self.parse_or()?;
            self.expect(&PathTokenKind::RParen, "')'")?;
            return Ok(inner);
        }

        let left = self.parse_operand()?;
        if let Some(PathTokenKind::Compare(op)) = self.peek_kind() {
            let op = *op;
            self.index += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(left, op, right));
        }
        Ok(Expr::Exists(left))
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        let kind = self
            .peek_kind()
            .cloned()
            .ok_or_else(|| SearchError::Pattern("expected an operand but reached end".to_string()))?;
        match kind {
            PathTokenKind::Literal(value) => {
                self.index += 1;
                Ok(Operand::Literal(value))
            }
            PathTokenKind::Number(value) => {
                self.index += 1;
                Ok(Operand::Number(value))
            }
            PathTokenKind::Name(_) if self.peek_is_function("lower-case") => {
                self.index += 2;
                let inner = self.parse_operand()?;
                self.expect(&PathTokenKind::RParen, "')'")?;
                Ok(Operand::LowerCase(Box::new(inner)))
            }
            PathTokenKind::At
            | PathTokenKind::Name(_)
            | PathTokenKind::Star
            | PathTokenKind::Dot
            | PathTokenKind::Slash
            | PathTokenKind::DoubleSlash => {
                let (path, attribute) = self.parse_path(true)?;
                Ok(Operand::Nodes { path, attribute })
            }
            _ => Err(self.error("expected an operand")),
        }
    }

    fn peek(&self) -> Option<&PathToken> {
        self.tokens.get(self.index)
    }

    fn peek_kind(&self) -> Option<&PathTokenKind> {
        self.peek_kind_at(0)
    }

    fn peek_kind_at(&self, offset: usize) -> Option<&PathTokenKind> {
        self.tokens.get(self.index + offset).map(|token| &token.kind)
    }

    fn peek_is_function(&self, name: &str) -> bool {
        matches!(self.peek_kind(), Some(PathTokenKind::Name(found)) if found == name)
            && self.peek_kind_at(1) == Some(&PathTokenKind::LParen)
    }

    fn next(&mut self) -> Option<PathToken> {
        let token = self.tokens.get(self.index).cloned()?;
        self.index += 1;
        Some(token)
    }

    fn consume(&mut self, kind: &PathTokenKind) -> bool {
        self.peek_kind() == Some(kind) && {
            self.index += 1;
            true
        }
    }

    fn consume_keyword(&mut self, keyword: &str) -> bool {
        matches!(self.peek_kind(), Some(PathTokenKind::Name(found)) if found == keyword) && {
            self.index += 1;
            true
        }
    }

    fn expect(&mut self, kind: &PathTokenKind, label: &str) -> Result<()> {
        if self.consume(kind) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {label}")))
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        match self.next() {
            Some(PathToken {
                kind: PathTokenKind::Name(name),
                ..
            }) => Ok(name),
            Some(token) => Err(SearchError::Pattern(format!(
                "expected an attribute name near byte {}",
                token.position
            ))),
            None => Err(SearchError::Pattern(
                "expected an attribute name but reached end".to_string(),
            )),
        }
    }

    fn error(&self, message: &str) -> SearchError {
        match self.peek() {
            Some(token) => SearchError::Pattern(format!("{message} near byte {}", token.position)),
            None => SearchError::Pattern(format!("{message} at end of expression")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PathToken {
    kind: PathTokenKind,
    position: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum PathTokenKind {
    Slash,
    DoubleSlash,
    LBracket,
    RBracket,
    LParen,
    RParen,
    At,
    Star,
    Dot,
    DotDot,
    Compare(CompareOp),
    Name(String),
    Literal(String),
    Number(f64),
}

fn tokenize_path_input(input: &str) -> Result<Vec<PathToken>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut cursor = 0usize;

    while cursor < input.len() {
        let ch = input[cursor..].chars().next().unwrap_or(' ');
        if ch.is_whitespace() {
            cursor += ch.len_utf8();
            continue;
        }

        let position = cursor;
        let next = bytes.get(cursor + 1).copied();
        let (kind, width) = match ch {
            '/' if next == Some(b'/') => (PathTokenKind::DoubleSlash, 2),
            '/' => (PathTokenKind::Slash, 1),
            '[' => (PathTokenKind::LBracket, 1),
            ']' => (PathTokenKind::RBracket, 1),
            '(' => (PathTokenKind::LParen, 1),
            ')' => (PathTokenKind::RParen, 1),
            '@' => (PathTokenKind::At, 1),
            '*' => (PathTokenKind::Star, 1),
            '=' => (PathTokenKind::Compare(CompareOp::Eq), 1),
            '!' if next == Some(b'=') => (PathTokenKind::Compare(CompareOp::NotEq), 2),
            '<' if next == Some(b'=') => (PathTokenKind::Compare(CompareOp::Le), 2),
            '<' => (PathTokenKind::Compare(CompareOp::Lt), 1),
            '>' if next == Some(b'=') => (PathTokenKind::Compare(CompareOp::Ge), 2),
            '>' => (PathTokenKind::Compare(CompareOp::Gt), 1),
            '.' if next == Some(b'.') => (PathTokenKind::DotDot, 2),
            '.' if next.is_some_and(|byte| byte.is_ascii_digit()) => {
                let (value, end) = consume_number(input, cursor)?;
                (PathTokenKind::Number(value), end - cursor)
            }
            '.' => (PathTokenKind::Dot, 1),
            '"' | '\'' => {
                let (literal, end) = consume_literal(input, cursor, ch)?;
                (PathTokenKind::Literal(literal), end - cursor)
            }
            _ if ch.is_ascii_digit() => {
                let (value, end) = consume_number(input, cursor)?;
                (PathTokenKind::Number(value), end - cursor)
            }
            _ if ch.is_alphabetic() || ch == '_' => {
                let end = consume_name(input, cursor);
                (PathTokenKind::Name(input[cursor..end].to_string()), end - cursor)
            }
            _ => {
                return Err(SearchError::Pattern(format!(
                    "unexpected character {ch:?} at byte {position}"
                )))
            }
        };
        tokens.push(PathToken { kind, position });
        cursor += width;
    }

    Ok(tokens)
}

fn consume_name(input: &str, start: usize) -> usize {
    let mut end = start;
    for ch in input[start..].chars() {
        if ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':') {
            end += ch.len_utf8();
        } else {
            break;
        }
    }
    end
}

fn consume_number(input: &str, start: usize) -> Result<(f64, usize)> {
    let mut end = start;
    for ch in input[start..].chars() {
        if ch.is_ascii_digit() || ch == '.' {
            end += 1;
        } else {
            break;
        }
    }
    let value = input[start..end].parse::<f64>().map_err(|error| {
        SearchError::Pattern(format!("invalid number at byte {start}: {error}"))
    })?;
    Ok((value, end))
}

fn consume_literal(input: &str, start: usize, quote: char) -> Result<(String, usize)> {
    let body_start = start + quote.len_utf8();
    match input[body_start..].find(quote) {
        Some(offset) => Ok((
            input[body_start..body_start + offset].to_string(),
            body_start + offset + quote.len_utf8(),
        )),
        None => Err(SearchError::Pattern(format!(
            "missing closing quote near byte {start}"
        ))),
    }
}
