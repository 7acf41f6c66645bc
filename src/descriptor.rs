//! Parsing of `(NAME=VALUE)` connect-descriptor text into a navigable tree
//!
//! A descriptor is the structure used by the wire protocol to store address
//! information, e.g.
//!
//! ```text
//! CID = (ADDRESS = (PROTOCOL = TCP)(HOST = XYZ)(PORT = 1521))
//! ```
//!
//! The grammar, briefly: `Pair -> ( name = value )` where `value` is an atom
//! or a list of pairs. A comma-separated literal list `(x = (a, b, c))` is
//! tagged distinctly from a nested pair list so it re-serializes correctly.

use std::fmt;

use crate::error::{Error, Result};

/// How a list-valued pair was written in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// `(Name = (Name = Value)...)`
    Regular,
    /// `(Name = (Value, Value, Value))`
    CommaSep,
}

#[derive(Debug, Clone)]
enum NvValue {
    Atom(String),
    List {
        children: Vec<NvPair>,
        kind: ListKind,
    },
}

/// One name-value pair; the value is an atom or a list of child pairs.
///
/// Names compare case-insensitively everywhere; serialization uppercases
/// them. Built once per connect attempt and treated as immutable afterwards
/// (the one exception is connection-id insertion before send).
#[derive(Debug, Clone)]
pub struct NvPair {
    pub name: String,
    value: NvValue,
}

impl NvPair {
    fn new_atom(name: String, atom: String) -> Result<Self> {
        if contains_comment(&atom) {
            return Err(Error::MalformedDescriptor);
        }
        Ok(Self {
            name,
            value: NvValue::Atom(atom),
        })
    }

    fn new_list(name: String) -> Self {
        Self {
            name,
            value: NvValue::List {
                children: Vec::new(),
                kind: ListKind::Regular,
            },
        }
    }

    /// The atom value, if this pair holds one
    pub fn atom(&self) -> Option<&str> {
        match &self.value {
            NvValue::Atom(s) => Some(s),
            NvValue::List { .. } => None,
        }
    }

    /// Child pairs; empty for an atom-valued pair
    pub fn children(&self) -> &[NvPair] {
        match &self.value {
            NvValue::Atom(_) => &[],
            NvValue::List { children, .. } => children,
        }
    }

    pub fn list_kind(&self) -> Option<ListKind> {
        match &self.value {
            NvValue::Atom(_) => None,
            NvValue::List { kind, .. } => Some(*kind),
        }
    }

    /// Append a child, converting an atom-valued pair into a list
    pub fn add_child(&mut self, child: NvPair) {
        match &mut self.value {
            NvValue::List { children, .. } => children.push(child),
            NvValue::Atom(_) => {
                self.value = NvValue::List {
                    children: vec![child],
                    kind: ListKind::Regular,
                };
            }
        }
    }

    /// Remove the child at `pos`, if present
    pub fn remove_child(&mut self, pos: usize) {
        if let NvValue::List { children, .. } = &mut self.value {
            if pos < children.len() {
                children.remove(pos);
            }
        }
    }

    /// Direct child whose name matches `name`, ignoring case
    pub fn find(&self, name: &str) -> Option<&NvPair> {
        self.children()
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Depth-first search through this pair and all descendants
    pub fn find_recurse(&self, name: &str) -> Option<&NvPair> {
        if self.name.eq_ignore_ascii_case(name) {
            return Some(self);
        }
        self.children()
            .iter()
            .find_map(|c| c.find_recurse(name))
    }

    /// Like [`find_recurse`](Self::find_recurse) but yielding a mutable pair
    pub fn find_recurse_mut(&mut self, name: &str) -> Option<&mut NvPair> {
        if self.name.eq_ignore_ascii_case(name) {
            return Some(self);
        }
        match &mut self.value {
            NvValue::Atom(_) => None,
            NvValue::List { children, .. } => children
                .iter_mut()
                .find_map(|c| c.find_recurse_mut(name)),
        }
    }

    /// Value at the given path of names, e.g.
    /// `["DESCRIPTION", "CONNECT_DATA", "SERVICE_NAME"]`
    pub fn find_value(&self, path: &[&str]) -> Option<String> {
        let first = path.first()?;
        if !self.name.eq_ignore_ascii_case(first) {
            return None;
        }
        let mut current = self;
        for name in &path[1..] {
            current = current.find(name)?;
        }
        match &current.value {
            NvValue::Atom(s) => Some(s.clone()),
            NvValue::List { children, .. } => {
                if children.is_empty() {
                    None
                } else {
                    Some(current.value_to_string())
                }
            }
        }
    }

    /// The value rendered without the enclosing `(NAME=...)`
    pub fn value_to_string(&self) -> String {
        match &self.value {
            NvValue::Atom(s) => s.clone(),
            NvValue::List { children, kind } => match kind {
                ListKind::Regular => children.iter().map(|c| c.to_string()).collect(),
                ListKind::CommaSep => children
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            },
        }
    }
}

impl fmt::Display for NvPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}=", self.name.to_uppercase())?;
        match &self.value {
            NvValue::Atom(s) => f.write_str(s)?,
            NvValue::List { children, kind } => match kind {
                ListKind::Regular => {
                    for child in children {
                        write!(f, "{child}")?;
                    }
                }
                ListKind::CommaSep => {
                    write!(f, " (")?;
                    for (i, child) in children.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        f.write_str(&child.name)?;
                    }
                    write!(f, ")")?;
                }
            },
        }
        write!(f, ")")
    }
}

/// An unescaped `#` starts a comment and is not legal inside an atom.
fn contains_comment(s: &str) -> bool {
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'#' && (i == 0 || bytes[i - 1] != b'\\') {
            return true;
        }
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Equal,
    Literal,
    Eos,
}

/// Token stream over descriptor text; literals may be quoted (quote
/// excluded from the value) and may contain backslash-escaped characters.
struct Tokens {
    kinds: Vec<Token>,
    values: Vec<String>,
    pos: usize,
}

impl Tokens {
    fn parse(text: &str) -> Self {
        let input: Vec<char> = text.chars().collect();
        let len = input.len();
        let mut kinds = Vec::new();
        let mut values = Vec::new();
        let mut push = |kind: Token, value: String| {
            kinds.push(kind);
            values.push(value);
        };
        let mut eql_seen = false;
        let mut pos = 0;

        while pos < len {
            while pos < len && input[pos].is_whitespace() {
                pos += 1;
            }
            if pos >= len {
                break;
            }
            match input[pos] {
                '(' => {
                    eql_seen = false;
                    push(Token::LParen, "(".into());
                    pos += 1;
                }
                ')' => {
                    eql_seen = false;
                    push(Token::RParen, ")".into());
                    pos += 1;
                }
                ',' => {
                    eql_seen = false;
                    push(Token::Comma, ",".into());
                    pos += 1;
                }
                '=' => {
                    eql_seen = true;
                    push(Token::Equal, "=".into());
                    pos += 1;
                }
                _ => {
                    let mut quote_char = None;
                    if input[pos] == '\'' || input[pos] == '"' {
                        quote_char = Some(input[pos]);
                        pos += 1;
                    }
                    let start = pos;
                    let mut end = None;
                    while pos < len {
                        // a backslash escape carries the following character
                        // into the literal verbatim
                        if input[pos] == '\\' {
                            pos += 2;
                            continue;
                        }
                        if let Some(q) = quote_char {
                            if input[pos] == q {
                                end = Some(pos);
                                pos += 1;
                                break;
                            }
                        } else if input[pos] == '('
                            || input[pos] == ')'
                            || (input[pos] == ',' && !eql_seen)
                            || (input[pos] == '=' && !eql_seen)
                        {
                            // terminate without consuming the metacharacter
                            end = Some(pos);
                            break;
                        }
                        pos += 1;
                    }
                    let end = end.unwrap_or(pos.min(len));
                    let literal: String = input[start..end.min(len)].iter().collect();
                    push(Token::Literal, literal.trim().to_string());
                }
            }
        }
        push(Token::Eos, "%".into());
        Self {
            kinds,
            values,
            pos: 0,
        }
    }

    fn peek(&self) -> Result<Token> {
        self.kinds
            .get(self.pos)
            .copied()
            .ok_or(Error::MalformedDescriptor)
    }

    fn eat(&mut self) {
        if self.pos < self.kinds.len() {
            self.pos += 1;
        }
    }

    fn pop(&mut self) -> Result<Token> {
        let t = self.peek()?;
        self.pos += 1;
        Ok(t)
    }

    fn pop_literal(&mut self) -> Result<String> {
        let v = self
            .values
            .get(self.pos)
            .cloned()
            .ok_or(Error::MalformedDescriptor)?;
        self.pos += 1;
        Ok(v)
    }
}

/// Parse descriptor text into its tree form
pub fn parse(text: &str) -> Result<NvPair> {
    let mut tokens = Tokens::parse(text);
    read_top_level(&mut tokens)
}

fn read_top_level(t: &mut Tokens) -> Result<NvPair> {
    if t.pop()? != Token::LParen {
        return Err(Error::MalformedDescriptor);
    }
    let mut name = read_literal(t)?;
    // an alias entry may carry comma'ed names: (alias1,alias2=...)
    if t.peek()? == Token::Comma {
        loop {
            match t.peek()? {
                Token::Literal | Token::Comma => name.push_str(&t.pop_literal()?),
                _ => break,
            }
        }
    }
    read_rhs(name, t)
}

fn read_pair(t: &mut Tokens) -> Result<NvPair> {
    let tk = t.pop()?;
    if tk != Token::LParen && tk != Token::Comma {
        return Err(Error::MalformedDescriptor);
    }
    let name = read_literal(t)?;
    read_rhs(name, t)
}

fn read_rhs(name: String, t: &mut Tokens) -> Result<NvPair> {
    let pair = match t.peek()? {
        Token::Equal => {
            t.eat();
            if t.peek()? == Token::Literal {
                let atom = read_literal(t)?;
                NvPair::new_atom(name, atom)?
            } else {
                let mut parent = NvPair::new_list(name);
                read_list(t, &mut parent)?;
                parent
            }
        }
        // bare value inside a comma list: "(x=(v1, v2))"
        Token::Comma | Token::RParen => NvPair::new_atom(name.clone(), name)?,
        _ => return Err(Error::MalformedDescriptor),
    };

    match t.peek()? {
        Token::RParen => t.eat(),
        Token::Comma => {}
        _ => return Err(Error::MalformedDescriptor),
    }
    Ok(pair)
}

fn read_literal(t: &mut Tokens) -> Result<String> {
    if t.peek()? != Token::Literal {
        return Err(Error::MalformedDescriptor);
    }
    t.pop_literal()
}

fn read_list(t: &mut Tokens, parent: &mut NvPair) -> Result<()> {
    let tk = t.peek()?;
    if tk != Token::LParen && tk != Token::Comma {
        return Ok(());
    }
    let child = read_pair(t)?;
    let comma_sep = tk == Token::Comma || child.atom() == Some(child.name.as_str());
    parent.add_child(child);
    if comma_sep {
        if let NvValue::List { kind, .. } = &mut parent.value {
            *kind = ListKind::CommaSep;
        }
    }
    read_list(t, parent)
}

/// Mutate the CONNECT_DATA list of a descriptor, inserting `(CONNECTION_ID=..)`
pub(crate) fn insert_connection_id(root: &mut NvPair, connection_id: &str) -> Result<()> {
    let cdata = root
        .find_recurse_mut("CONNECT_DATA")
        .ok_or(Error::MalformedDescriptor)?;
    let child = parse(&format!("(CONNECTION_ID={connection_id})"))?;
    cdata.add_child(child);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_descriptor() {
        let text = "(DESCRIPTION=(ADDRESS=(PROTOCOL=tcp)(HOST=db1)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=orcl)))";
        let root = parse(text).unwrap();
        assert_eq!(root.name, "DESCRIPTION");
        assert_eq!(
            root.find_value(&["DESCRIPTION", "CONNECT_DATA", "SERVICE_NAME"]),
            Some("orcl".to_string())
        );
        assert_eq!(
            root.find_recurse("host").and_then(|p| p.atom()),
            Some("db1")
        );
    }

    #[test]
    fn roundtrips_semantic_content() {
        let text = "(description=(address=(protocol=tcp)(host=db1)(port=1521))(connect_data=(service_name=orcl)))";
        let root = parse(text).unwrap();
        let serialized = root.to_string();
        // names uppercased, structure preserved
        assert_eq!(
            serialized,
            "(DESCRIPTION=(ADDRESS=(PROTOCOL=tcp)(HOST=db1)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=orcl)))"
        );
        let reparsed = parse(&serialized).unwrap();
        assert_eq!(
            reparsed.find_value(&["DESCRIPTION", "ADDRESS", "HOST"]),
            Some("db1".to_string())
        );
    }

    #[test]
    fn quoted_literals_exclude_quotes() {
        let root = parse("(SECURITY=(SSL_SERVER_CERT_DN=\"CN=server, O=Example\"))").unwrap();
        assert_eq!(
            root.find_value(&["SECURITY", "SSL_SERVER_CERT_DN"]),
            Some("CN=server, O=Example".to_string())
        );
    }

    #[test]
    fn comma_list_is_tagged() {
        let root = parse("(FOO=(a, b, c))").unwrap();
        assert_eq!(root.list_kind(), Some(ListKind::CommaSep));
        assert_eq!(root.value_to_string(), "a, b, c");
        assert_eq!(root.to_string(), "(FOO= (a, b, c))");
    }

    #[test]
    fn unbalanced_parens_fail() {
        assert!(matches!(
            parse("(DESCRIPTION=(ADDRESS=(HOST=x))"),
            Err(Error::MalformedDescriptor)
        ));
        assert!(matches!(parse("DESCRIPTION"), Err(Error::MalformedDescriptor)));
    }

    #[test]
    fn missing_equal_fails() {
        assert!(matches!(
            parse("(DESCRIPTION(HOST=x))"),
            Err(Error::MalformedDescriptor)
        ));
    }

    #[test]
    fn unescaped_comment_char_fails() {
        assert!(matches!(
            parse("(HOST=my#host)"),
            Err(Error::MalformedDescriptor)
        ));
        // escaped is fine
        assert!(parse("(HOST=my\\#host)").is_ok());
    }

    #[test]
    fn connection_id_insertion() {
        let mut root =
            parse("(DESCRIPTION=(ADDRESS=(HOST=h))(CONNECT_DATA=(SERVICE_NAME=svc)))").unwrap();
        insert_connection_id(&mut root, "abc123").unwrap();
        assert_eq!(
            root.find_value(&["DESCRIPTION", "CONNECT_DATA", "CONNECTION_ID"]),
            Some("abc123".to_string())
        );
    }
}
