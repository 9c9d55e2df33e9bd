//! Modelfile build and parse.
//!
//! Rendering always emits directives in the order FROM, PARAMETER, TEMPLATE,
//! SYSTEM, ADAPTER, LICENSE, MESSAGE. Text containing a newline or starting
//! or ending with a quote is wrapped in a `"""` block, other text in double
//! quotes. Values containing `"""` cannot be written.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};
use tracing::debug;

use crate::api::request::CreateRequest;
use crate::api::types::{Message, Role};
use crate::error::{Error, Result};
use crate::utils::calculate_sha256;

const BLOCK_QUOTE: &str = "\"\"\"";

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParameterValue {
    /// Unquoted values are tried as bool, then integer, then float.
    fn coerce(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("true") {
            return ParameterValue::Bool(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return ParameterValue::Bool(false);
        }
        if let Ok(n) = raw.parse::<i64>() {
            return ParameterValue::Int(n);
        }
        if looks_numeric(raw) {
            if let Ok(x) = raw.parse::<f64>() {
                return ParameterValue::Float(x);
            }
        }
        ParameterValue::Text(raw.to_string())
    }

    fn to_json(&self) -> Value {
        match self {
            ParameterValue::Bool(b) => Value::Bool(*b),
            ParameterValue::Int(n) => Value::from(*n),
            ParameterValue::Float(x) => Value::from(*x),
            ParameterValue::Text(s) => Value::String(s.clone()),
        }
    }
}

fn looks_numeric(raw: &str) -> bool {
    raw.bytes().any(|b| b.is_ascii_digit())
        && raw
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(b) => write!(f, "{}", b),
            ParameterValue::Int(n) => write!(f, "{}", n),
            // Debug keeps the fractional part, so 1.0 does not come back as 1
            ParameterValue::Float(x) => write!(f, "{:?}", x),
            ParameterValue::Text(s) => f.write_str(&quote(s)),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Int(value.into())
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelfileMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Modelfile {
    pub from: Option<String>,
    /// In file order. Keys such as `stop` may repeat.
    pub parameters: Vec<(String, ParameterValue)>,
    pub template: Option<String>,
    pub system: Option<String>,
    pub adapters: Vec<String>,
    pub license: Option<String>,
    pub messages: Vec<ModelfileMessage>,
}

impl Modelfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_model(model: impl Into<String>) -> Self {
        Self {
            from: Some(model.into()),
            ..Default::default()
        }
    }

    /// Builds on a local GGUF or safetensors file.
    pub fn from_weights(path: impl AsRef<Path>) -> Self {
        Self::from_model(path.as_ref().to_string_lossy())
    }

    /// Replaces every value of `name`.
    pub fn set_parameter(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        let name = name.into();
        self.parameters.retain(|(existing, _)| *existing != name);
        self.parameters.push((name, value.into()));
        self
    }

    pub fn add_parameter(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }

    pub fn set_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn set_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn set_license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    pub fn add_adapter(mut self, path: impl AsRef<Path>) -> Self {
        self.adapters.push(path.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn add_message(mut self, role: Role, content: impl Into<String>) -> Self {
        self.messages.push(ModelfileMessage {
            role,
            content: content.into(),
        });
        self
    }

    pub fn render(&self) -> Result<String> {
        let from = self
            .from
            .as_deref()
            .ok_or_else(|| Error::Modelfile("a FROM instruction is required".to_string()))?;
        check_bare("FROM", from)?;

        let mut lines = vec![format!("FROM {}", from)];
        for (name, value) in &self.parameters {
            check_parameter(name, value)?;
            lines.push(format!("PARAMETER {} {}", name, value));
        }
        if let Some(template) = &self.template {
            lines.push(format!("TEMPLATE {}", quote_checked("TEMPLATE", template)?));
        }
        if let Some(system) = &self.system {
            lines.push(format!("SYSTEM {}", quote_checked("SYSTEM", system)?));
        }
        for adapter in &self.adapters {
            check_bare("ADAPTER", adapter)?;
            lines.push(format!("ADAPTER {}", adapter));
        }
        if let Some(license) = &self.license {
            lines.push(format!("LICENSE {}", quote_checked("LICENSE", license)?));
        }
        for message in &self.messages {
            lines.push(format!(
                "MESSAGE {} {}",
                message.role,
                quote_checked("MESSAGE", &message.content)?
            ));
        }
        Ok(lines.join("\n"))
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.render()?)?;
        Ok(())
    }

    /// Converts the document into a create request for `model`. Adapter
    /// files are hashed; their blobs must be uploaded separately.
    pub fn to_create_request(&self, model: impl Into<String>) -> Result<CreateRequest> {
        let from = self
            .from
            .clone()
            .ok_or_else(|| Error::Modelfile("a FROM instruction is required".to_string()))?;

        let mut request = CreateRequest::new(model).from_model(from);
        request.template = self.template.clone();
        request.system = self.system.clone();
        request.license = self.license.iter().cloned().collect();
        request.parameters = self.parameter_map();
        request.messages = self
            .messages
            .iter()
            .map(|m| Message::new(m.role, m.content.clone()))
            .collect();

        for adapter in &self.adapters {
            let path = PathBuf::from(adapter);
            let digest = calculate_sha256(&path)?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| adapter.clone());
            request.adapters.insert(name, digest);
        }
        Ok(request)
    }

    /// Repeated keys become arrays.
    fn parameter_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for (name, value) in &self.parameters {
            let value = value.to_json();
            match map.get_mut(name) {
                Some(Value::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    map.insert(name.clone(), value);
                }
            }
        }
        map
    }
}

impl FromStr for Modelfile {
    type Err = Error;

    fn from_str(content: &str) -> Result<Self> {
        parse_modelfile(content)
    }
}

/// Text that would read back as a block delimiter goes in a block too.
fn quote(text: &str) -> String {
    if text.contains('\n') || text.starts_with('"') || text.ends_with('"') {
        format!("{}\n{}\n{}", BLOCK_QUOTE, text, BLOCK_QUOTE)
    } else {
        format!("\"{}\"", text)
    }
}

fn quote_checked(directive: &str, text: &str) -> Result<String> {
    if text.contains(BLOCK_QUOTE) {
        return Err(Error::Modelfile(format!(
            "{} value cannot contain {}",
            directive, BLOCK_QUOTE
        )));
    }
    Ok(quote(text))
}

/// Unquoted values are written as-is and must survive a trim.
fn check_bare(directive: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Modelfile(format!("{} value is empty", directive)));
    }
    if value.trim() != value || value.contains(['\n', '\r']) {
        return Err(Error::Modelfile(format!(
            "{} value '{}' has surrounding whitespace or a line break",
            directive,
            value.escape_debug()
        )));
    }
    Ok(())
}

fn check_parameter(name: &str, value: &ParameterValue) -> Result<()> {
    check_bare("PARAMETER", name)?;
    if name.contains(char::is_whitespace) {
        return Err(Error::Modelfile(format!("parameter name '{}' contains whitespace", name)));
    }
    match value {
        ParameterValue::Float(x) if !x.is_finite() => Err(Error::Modelfile(format!(
            "parameter {} is not a finite number: {}",
            name, x
        ))),
        ParameterValue::Text(text) => quote_checked("PARAMETER", text).map(|_| ()),
        _ => Ok(()),
    }
}

fn split_command(line: &str) -> (&str, &str) {
    let mut parts = line.splitn(2, |c: char| c.is_whitespace());
    let name = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();
    (name, args)
}

fn strip_quotes(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// A directive value, either inline or spanning a `"""` block.
enum RawValue {
    Inline(String),
    Block(String),
}

/// Reads the value starting at `args`, pulling further lines from `rest`
/// while inside a block.
fn read_value<'a, I>(args: &str, rest: &mut I, line_no: usize) -> Result<RawValue>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let Some(start) = args.find(BLOCK_QUOTE) else {
        return Ok(RawValue::Inline(args.trim().to_string()));
    };

    let opener = &args[start + BLOCK_QUOTE.len()..];
    if let Some(end) = opener.find(BLOCK_QUOTE) {
        return Ok(RawValue::Block(opener[..end].to_string()));
    }

    let mut collected = Vec::new();
    if !opener.is_empty() {
        collected.push(opener.to_string());
    }
    for (_, line) in rest.by_ref() {
        if let Some(end) = line.find(BLOCK_QUOTE) {
            if end > 0 {
                collected.push(line[..end].to_string());
            }
            return Ok(RawValue::Block(collected.join("\n")));
        }
        collected.push(line.to_string());
    }
    Err(Error::Modelfile(format!(
        "unterminated {} block starting on line {}",
        BLOCK_QUOTE, line_no
    )))
}

fn parse_role(raw: &str, line_no: usize) -> Result<Role> {
    match raw.to_lowercase().as_str() {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        other => Err(Error::Modelfile(format!(
            "unknown message role '{}' on line {}",
            other, line_no
        ))),
    }
}

fn text_of(value: RawValue) -> String {
    match value {
        RawValue::Inline(s) => strip_quotes(&s).to_string(),
        RawValue::Block(s) => s,
    }
}

pub fn parse_modelfile(content: &str) -> Result<Modelfile> {
    let mut modelfile = Modelfile::default();
    // Block bodies keep any carriage returns; directive lines are trimmed.
    let mut lines = content.split('\n').enumerate().map(|(i, l)| (i + 1, l));

    while let Some((line_no, line)) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (name, args) = split_command(trimmed);
        if args.is_empty() {
            debug!("Skipping directive without arguments on line {}: {}", line_no, name);
            continue;
        }

        match name.to_uppercase().as_str() {
            "FROM" => {
                let from = text_of(read_value(args, &mut lines, line_no)?);
                if let Some(previous) = modelfile.from.replace(from) {
                    debug!("FROM on line {} replaces earlier base {}", line_no, previous);
                }
            }
            "PARAMETER" => {
                let (key, raw) = split_command(args);
                let value = match read_value(raw, &mut lines, line_no)? {
                    RawValue::Block(text) => ParameterValue::Text(text),
                    RawValue::Inline(text) if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') => {
                        ParameterValue::Text(strip_quotes(&text).to_string())
                    }
                    RawValue::Inline(text) => ParameterValue::coerce(&text),
                };
                modelfile.parameters.push((key.to_string(), value));
            }
            "TEMPLATE" => modelfile.template = Some(text_of(read_value(args, &mut lines, line_no)?)),
            "SYSTEM" => modelfile.system = Some(text_of(read_value(args, &mut lines, line_no)?)),
            "ADAPTER" => modelfile
                .adapters
                .push(text_of(read_value(args, &mut lines, line_no)?)),
            "LICENSE" => modelfile.license = Some(text_of(read_value(args, &mut lines, line_no)?)),
            "MESSAGE" => {
                let (role, raw) = split_command(args);
                let role = parse_role(role, line_no)?;
                let content = text_of(read_value(raw, &mut lines, line_no)?);
                modelfile.messages.push(ModelfileMessage { role, content });
            }
            other => debug!("Ignoring unknown directive on line {}: {}", line_no, other),
        }
    }

    if modelfile.from.is_none() {
        return Err(Error::Modelfile(
            "Modelfile must contain a FROM instruction".to_string(),
        ));
    }
    Ok(modelfile)
}

pub fn load_modelfile(path: impl AsRef<Path>) -> Result<Modelfile> {
    parse_modelfile(&std::fs::read_to_string(path)?)
}
