//! Tokenizer and recursive-descent parser for query text.

use super::Predicate;
use crate::schema::{AUTHOR_ALIAS, BOUT_TITLE, TEXT};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Text(String),
    Variable(String),
    Atom(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((at, c)) = chars.next() {
        match c {
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            c if c.is_whitespace() => {}
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                loop {
                    match chars.next() {
                        None => return Err(format!("unterminated string at {at}")),
                        Some((_, '\\')) => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => return Err(format!("unterminated string at {at}")),
                        },
                        Some((_, c)) if c == quote => break,
                        Some((_, c)) => value.push(c),
                    }
                }
                tokens.push(Token::Text(value));
            }
            _ => {
                let mut atom = String::from(c);
                while let Some((_, next)) = chars.peek() {
                    if next.is_whitespace() || *next == '(' || *next == ')' {
                        break;
                    }
                    atom.push(*next);
                    chars.next();
                }
                match atom.strip_prefix('$') {
                    Some("") => return Err(format!("empty variable at {at}")),
                    Some(name) => tokens.push(Token::Variable(name.to_string())),
                    None => tokens.push(Token::Atom(atom)),
                }
            }
        }
    }
    Ok(tokens)
}

/// Argument of a function call.
#[derive(Debug)]
enum Arg {
    Term(Predicate),
    Text(String),
    Variable(String),
}

impl Arg {
    fn describe(&self) -> &'static str {
        match self {
            Arg::Term(_) => "a term",
            Arg::Text(_) => "a string",
            Arg::Variable(_) => "a variable",
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    at: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.at).cloned();
        self.at += 1;
        token
    }

    fn term(&mut self) -> Result<Predicate, String> {
        let name = match self.next() {
            Some(Token::Atom(name)) => name,
            Some(other) => return Err(format!("function name expected, found {other:?}")),
            None => return Err("function name expected at the end of query".into()),
        };
        let mut args = Vec::new();
        loop {
            match self.next() {
                Some(Token::Close) => break,
                Some(Token::Open) => args.push(Arg::Term(self.term()?)),
                Some(Token::Text(text)) | Some(Token::Atom(text)) => args.push(Arg::Text(text)),
                Some(Token::Variable(name)) => args.push(Arg::Variable(name)),
                None => return Err(format!("closing bracket missing after '{name}'")),
            }
        }
        build(&name, args)
    }
}

fn terms(name: &str, args: Vec<Arg>) -> Result<Vec<Predicate>, String> {
    args.into_iter()
        .map(|arg| match arg {
            Arg::Term(term) => Ok(term),
            other => Err(format!("'{name}' expects terms, found {}", other.describe())),
        })
        .collect()
}

fn arity(name: &str, args: &[Arg], expected: usize) -> Result<(), String> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(format!(
            "'{name}' expects {expected} argument(s), found {}",
            args.len()
        ))
    }
}

fn text(name: &str, arg: Arg) -> Result<String, String> {
    match arg {
        Arg::Text(text) => Ok(text),
        other => Err(format!("'{name}' expects a string, found {}", other.describe())),
    }
}

fn variable(name: &str, arg: Arg) -> Result<String, String> {
    match arg {
        Arg::Variable(attribute) => Ok(attribute),
        other => Err(format!("'{name}' expects a variable, found {}", other.describe())),
    }
}

fn number(name: &str, arg: Arg) -> Result<u64, String> {
    let raw = text(name, arg)?;
    raw.parse()
        .map_err(|_| format!("'{name}' expects a non-negative number, found '{raw}'"))
}

fn comparison(name: &str, args: Vec<Arg>) -> Result<(String, String), String> {
    arity(name, &args, 2)?;
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(attribute), Some(value)) => Ok((variable(name, attribute)?, text(name, value)?)),
        _ => Err(format!("'{name}' expects a variable and a value")),
    }
}

fn single(name: &str, args: Vec<Arg>) -> Result<Arg, String> {
    arity(name, &args, 1)?;
    args.into_iter()
        .next()
        .ok_or_else(|| format!("'{name}' expects one argument"))
}

fn build(name: &str, args: Vec<Arg>) -> Result<Predicate, String> {
    let predicate = match name {
        "and" => Predicate::And(terms(name, args)?),
        "or" => Predicate::Or(terms(name, args)?),
        "not" => {
            let mut inner = terms(name, args)?;
            if inner.len() != 1 {
                return Err(format!("'not' expects one term, found {}", inner.len()));
            }
            Predicate::Not(Box::new(inner.remove(0)))
        }
        "equal" => {
            let (attribute, value) = comparison(name, args)?;
            Predicate::Equal { attribute, value }
        }
        "greater-than" => {
            let (attribute, value) = comparison(name, args)?;
            Predicate::GreaterThan { attribute, value }
        }
        "less-than" => {
            let (attribute, value) = comparison(name, args)?;
            Predicate::LessThan { attribute, value }
        }
        "matches" => {
            let mut args = args.into_iter();
            let text = match args.next() {
                Some(arg) => text(name, arg)?,
                None => return Err("'matches' expects a string".into()),
            };
            let attribute = match args.next() {
                Some(arg) => variable(name, arg)?,
                None => TEXT.to_string(),
            };
            if args.next().is_some() {
                return Err("'matches' expects at most 2 arguments".into());
            }
            Predicate::Matches { text, attribute }
        }
        "talks-with" => Predicate::TalksWith(text(name, single(name, args)?)?),
        "seen-by" => Predicate::SeenBy(text(name, single(name, args)?)?),
        "ns" => Predicate::Ns(text(name, single(name, args)?)?),
        "limit" => Predicate::Limit(number(name, single(name, args)?)?),
        "from" => Predicate::From(number(name, single(name, args)?)?),
        "pos" => Predicate::Pos(number(name, single(name, args)?)?),
        "unique" => Predicate::Unique(variable(name, single(name, args)?)?),
        other => return Err(format!("unknown function '{other}'")),
    };
    Ok(predicate)
}

/// Full-text search over the fields a reader sees.
fn search(text: &str) -> Predicate {
    Predicate::Or(
        [TEXT, BOUT_TITLE, AUTHOR_ALIAS]
            .into_iter()
            .map(|attribute| Predicate::Matches {
                text: text.to_string(),
                attribute: attribute.to_string(),
            })
            .collect(),
    )
}

pub(super) fn parse(text: &str) -> Result<Predicate, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Predicate::And(Vec::new()));
    }
    if !trimmed.starts_with('(') {
        return Ok(search(trimmed));
    }
    let mut parser = Parser {
        tokens: tokenize(trimmed)?,
        at: 0,
    };
    if parser.next() != Some(Token::Open) {
        return Err("query must start with '('".into());
    }
    let predicate = parser.term()?;
    match parser.next() {
        None => Ok(predicate),
        Some(extra) => Err(format!("unexpected {extra:?} after the end of query")),
    }
}
