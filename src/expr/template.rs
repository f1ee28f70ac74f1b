//! Compiled text templates for event and group expressions.
//!
//! The language is a small subset of Go-style text templates:
//!
//! - `{{ .Identity.Subject }}` prints a field, `{{ . }}` prints the current value
//! - `{{ "literal" }}` prints a string literal
//! - `{{ if .X }}..{{ else }}..{{ end }}` and `{{ with .X }}..{{ else }}..{{ end }}`
//! - `{{/* comment */}}` and the `{{-` / `-}}` whitespace trim markers
//!
//! Field names are checked against the request schema when the template is
//! compiled, so a typo is a configuration error rather than a request-time
//! failure.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::context::{Identity, Request};

/// Errors raised while compiling or executing a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unclosed action starting at offset {0}")]
    UnclosedAction(usize),

    #[error("unexpected {{{{{0}}}}}")]
    Unexpected(String),

    #[error("missing {{{{end}}}} for {{{{{0}}}}}")]
    MissingEnd(String),

    #[error("bad pipeline \"{0}\"")]
    BadPipeline(String),

    #[error("can't evaluate field {field} in type {kind}")]
    UnknownField { field: String, kind: ValueKind },

    #[error("can't print value of type {0}")]
    Unprintable(ValueKind),

    /// Runtime only: a field was accessed through an absent identity.
    #[error("nil identity evaluating field {0}")]
    NilField(String),
}

/// Static type of a value in the request schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Request,
    Identity,
    Header,
    String,
    Bool,
}

impl ValueKind {
    fn field(self, name: &str) -> Option<ValueKind> {
        match self {
            ValueKind::Request => match name {
                "Identity" => Some(ValueKind::Identity),
                "Subject" | "Tenant" | "Method" | "Path" => Some(ValueKind::String),
                "Header" => Some(ValueKind::Header),
                _ => None,
            },
            ValueKind::Identity => match name {
                "Subject" | "Tenant" | "Plan" => Some(ValueKind::String),
                "IsDevice" | "IsUser" => Some(ValueKind::Bool),
                _ => None,
            },
            ValueKind::Header => Some(ValueKind::String),
            ValueKind::String | ValueKind::Bool => None,
        }
    }

    fn printable(self) -> bool {
        matches!(self, ValueKind::String | ValueKind::Bool)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Request => "Request",
            ValueKind::Identity => "Identity",
            ValueKind::Header => "Header",
            ValueKind::String => "string",
            ValueKind::Bool => "bool",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum Pipeline {
    Dot,
    Field(Vec<String>),
    Literal(String),
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Print(Pipeline),
    If {
        cond: Pipeline,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    With {
        value: Pipeline,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// A template compiled once and executed against many requests.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    nodes: Vec<Node>,
    constant: Option<String>,
}

impl Template {
    /// Compile a template, checking every field reference.
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let items = lex(source)?;
        let mut parser = Parser {
            items: items.into_iter(),
        };
        let (nodes, end) = parser.parse_list(ValueKind::Request)?;
        match end {
            Terminator::Eof => {}
            Terminator::Else => return Err(TemplateError::Unexpected("else".into())),
            Terminator::End => return Err(TemplateError::Unexpected("end".into())),
        }

        let constant = nodes
            .iter()
            .map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Option<String>>();

        Ok(Self {
            source: source.to_string(),
            nodes,
            constant,
        })
    }

    /// The template text as written in configuration.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The output of a template without actions, which is the same for
    /// every request.
    pub fn constant(&self) -> Option<&str> {
        self.constant.as_deref()
    }

    /// Execute the template against a request.
    pub fn execute(&self, request: &Request) -> Result<String, TemplateError> {
        if let Some(constant) = &self.constant {
            return Ok(constant.clone());
        }
        let mut out = String::new();
        render(&self.nodes, Value::Request(request), &mut out)?;
        Ok(out)
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Template::compile(s)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

enum Item {
    Text(String),
    Action(String),
}

fn lex(source: &str) -> Result<Vec<Item>, TemplateError> {
    let mut items = Vec::new();
    let mut rest = source;
    let mut offset = 0;
    let mut trim_next = false;

    while let Some(start) = rest.find("{{") {
        let mut text = &rest[..start];
        if trim_next {
            text = text.trim_start();
        }

        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(TemplateError::UnclosedAction(offset + start))?;
        let mut body = &after[..end];

        if let Some(b) = body
            .strip_prefix('-')
            .filter(|b| b.starts_with(char::is_whitespace))
        {
            body = b;
            text = text.trim_end();
        }
        trim_next = false;
        if let Some(b) = body
            .strip_suffix('-')
            .filter(|b| b.ends_with(char::is_whitespace))
        {
            body = b;
            trim_next = true;
        }

        if !text.is_empty() {
            items.push(Item::Text(text.to_string()));
        }
        items.push(Item::Action(body.trim().to_string()));

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    let tail = if trim_next { rest.trim_start() } else { rest };
    if !tail.is_empty() {
        items.push(Item::Text(tail.to_string()));
    }
    Ok(items)
}

enum Terminator {
    Eof,
    Else,
    End,
}

struct Parser {
    items: std::vec::IntoIter<Item>,
}

impl Parser {
    fn parse_list(&mut self, dot: ValueKind) -> Result<(Vec<Node>, Terminator), TemplateError> {
        let mut nodes = Vec::new();
        while let Some(item) = self.items.next() {
            let body = match item {
                Item::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Item::Action(body) => body,
            };

            if body.starts_with("/*") && body.ends_with("*/") {
                continue;
            }
            match body.as_str() {
                "end" => return Ok((nodes, Terminator::End)),
                "else" => return Ok((nodes, Terminator::Else)),
                _ => {}
            }

            if let Some(arg) = keyword_arg(&body, "if") {
                let (cond, _) = parse_pipeline(arg, dot)?;
                let (then, otherwise) = self.parse_branches("if", dot, dot)?;
                nodes.push(Node::If {
                    cond,
                    then,
                    otherwise,
                });
            } else if let Some(arg) = keyword_arg(&body, "with") {
                let (value, kind) = parse_pipeline(arg, dot)?;
                let (then, otherwise) = self.parse_branches("with", kind, dot)?;
                nodes.push(Node::With {
                    value,
                    then,
                    otherwise,
                });
            } else {
                let (pipeline, kind) = parse_pipeline(&body, dot)?;
                if !kind.printable() {
                    return Err(TemplateError::Unprintable(kind));
                }
                nodes.push(Node::Print(pipeline));
            }
        }
        Ok((nodes, Terminator::Eof))
    }

    fn parse_branches(
        &mut self,
        keyword: &str,
        then_dot: ValueKind,
        else_dot: ValueKind,
    ) -> Result<(Vec<Node>, Vec<Node>), TemplateError> {
        let (then, end) = self.parse_list(then_dot)?;
        match end {
            Terminator::End => Ok((then, Vec::new())),
            Terminator::Eof => Err(TemplateError::MissingEnd(keyword.to_string())),
            Terminator::Else => {
                let (otherwise, end) = self.parse_list(else_dot)?;
                match end {
                    Terminator::End => Ok((then, otherwise)),
                    Terminator::Eof => Err(TemplateError::MissingEnd(keyword.to_string())),
                    Terminator::Else => Err(TemplateError::Unexpected("else".into())),
                }
            }
        }
    }
}

/// Split `if .X` into `.X`; `None` when `body` is not that keyword.
fn keyword_arg<'a>(body: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = body.strip_prefix(keyword)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn parse_pipeline(text: &str, dot: ValueKind) -> Result<(Pipeline, ValueKind), TemplateError> {
    let text = text.trim();
    if text == "." {
        return Ok((Pipeline::Dot, dot));
    }

    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        let literal = unquote(&text[1..text.len() - 1])
            .ok_or_else(|| TemplateError::BadPipeline(text.to_string()))?;
        return Ok((Pipeline::Literal(literal), ValueKind::String));
    }

    let path = text
        .strip_prefix('.')
        .ok_or_else(|| TemplateError::BadPipeline(text.to_string()))?;
    let mut kind = dot;
    let mut names = Vec::new();
    for name in path.split('.') {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(TemplateError::BadPipeline(text.to_string()));
        }
        kind = kind.field(name).ok_or_else(|| TemplateError::UnknownField {
            field: name.to_string(),
            kind,
        })?;
        names.push(name.to_string());
    }
    Ok((Pipeline::Field(names), kind))
}

fn unquote(inner: &str) -> Option<String> {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                'n' => out.push('\n'),
                't' => out.push('\t'),
                _ => return None,
            },
            '"' => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

#[derive(Clone, Copy)]
enum Value<'a> {
    Nil,
    Str(&'a str),
    Bool(bool),
    Request(&'a Request),
    Identity(&'a Identity),
    Header(&'a Request),
}

impl<'a> Value<'a> {
    fn truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::Request(_) | Value::Identity(_) | Value::Header(_) => true,
        }
    }

    fn field(self, name: &str) -> Result<Value<'a>, TemplateError> {
        let value = match self {
            Value::Nil => return Err(TemplateError::NilField(name.to_string())),
            Value::Request(req) => match name {
                "Identity" => req.identity().map_or(Value::Nil, Value::Identity),
                "Subject" => Value::Str(req.identity().map_or("", |id| id.subject.as_str())),
                "Tenant" => Value::Str(
                    req.identity()
                        .and_then(|id| id.tenant.as_deref())
                        .unwrap_or(""),
                ),
                "Method" => Value::Str(req.method()),
                "Path" => Value::Str(req.path()),
                "Header" => Value::Header(req),
                _ => return Err(unknown(name, ValueKind::Request)),
            },
            Value::Identity(id) => match name {
                "Subject" => Value::Str(&id.subject),
                "Tenant" => Value::Str(id.tenant.as_deref().unwrap_or("")),
                "Plan" => Value::Str(id.plan.as_deref().unwrap_or("")),
                "IsDevice" => Value::Bool(id.is_device),
                "IsUser" => Value::Bool(id.is_user),
                _ => return Err(unknown(name, ValueKind::Identity)),
            },
            Value::Header(req) => Value::Str(req.header(name).unwrap_or("")),
            Value::Str(_) => return Err(unknown(name, ValueKind::String)),
            Value::Bool(_) => return Err(unknown(name, ValueKind::Bool)),
        };
        Ok(value)
    }
}

fn unknown(field: &str, kind: ValueKind) -> TemplateError {
    TemplateError::UnknownField {
        field: field.to_string(),
        kind,
    }
}

fn eval<'a>(pipeline: &'a Pipeline, dot: Value<'a>) -> Result<Value<'a>, TemplateError> {
    match pipeline {
        Pipeline::Dot => Ok(dot),
        Pipeline::Literal(s) => Ok(Value::Str(s)),
        Pipeline::Field(names) => names.iter().try_fold(dot, |value, name| value.field(name)),
    }
}

fn render<'a>(nodes: &'a [Node], dot: Value<'a>, out: &mut String) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Print(pipeline) => match eval(pipeline, dot)? {
                Value::Str(s) => out.push_str(s),
                Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),
                Value::Nil => {}
                Value::Request(_) => return Err(TemplateError::Unprintable(ValueKind::Request)),
                Value::Identity(_) => return Err(TemplateError::Unprintable(ValueKind::Identity)),
                Value::Header(_) => return Err(TemplateError::Unprintable(ValueKind::Header)),
            },
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                if eval(cond, dot)?.truthy() {
                    render(then, dot, out)?;
                } else {
                    render(otherwise, dot, out)?;
                }
            }
            Node::With {
                value,
                then,
                otherwise,
            } => {
                let value = eval(value, dot)?;
                if value.truthy() {
                    render(then, value, out)?;
                } else {
                    render(otherwise, dot, out)?;
                }
            }
        }
    }
    Ok(())
}
