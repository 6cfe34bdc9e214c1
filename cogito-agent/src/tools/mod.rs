use crate::clients::ToolDefinition;
use futures::Future;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ToolError {
    fn from(error: std::io::Error) -> Self {
        ToolError::IoError(error.to_string())
    }
}

/// Declared tool schema: name, description and JSON-Schema-shaped parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

/// A concrete tool. Implementations own their side-effect discipline and must
/// be safe for concurrent invocation.
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    fn invoke(&self, arguments: Value) -> ToolFuture;
}

/// Checks `arguments` against a tool's declared parameter schema: required
/// keys must be present and primitive types must match. Unknown keys pass
/// through untouched.
pub fn validate_arguments(spec: &ToolSpec, arguments: &Value) -> Result<(), ToolError> {
    let Some(args) = arguments.as_object() else {
        return Err(ToolError::InvalidArguments(
            "arguments must be a JSON object".to_string(),
        ));
    };

    let properties = spec
        .parameters
        .get("properties")
        .and_then(Value::as_object);

    if let Some(required) = spec.parameters.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(key) {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required argument '{key}'"
                )));
            }
        }
    }

    if let Some(properties) = properties {
        for (key, value) in args {
            let Some(expected) = properties.get(key).and_then(|p| p.get("type")).and_then(Value::as_str)
            else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(ToolError::InvalidArguments(format!(
                    "argument '{key}' must be of type {expected}"
                )));
            }
        }
    }

    Ok(())
}

/// Read-mostly registry shared by all chains. Registration happens at
/// startup; lookups afterwards take `&self` and are safe concurrently.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.spec().name;
        if self.tools.contains_key(&name) {
            tracing::warn!(tool = %name, "replacing already registered tool");
        }
        self.tools.insert(name, tool);
    }

    pub fn resolve(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas in the shape the reasoning backend expects.
    pub fn definitions_for_model(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| {
                let spec = tool.spec();
                ToolDefinition {
                    name: spec.name,
                    description: spec.description,
                    parameters: spec.parameters,
                }
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }
}

/// Evaluates arithmetic expressions without shelling out: `+ - * / % ^`,
/// parentheses, unary minus, `sqrt`/`abs`/`floor`/`ceil`, constants `pi`
/// and `e`.
pub struct CalculatorTool;

impl Tool for CalculatorTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "calculator".to_string(),
            description: "Evaluate a mathematical expression".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "Expression to evaluate, e.g. '12*12' or 'sqrt(2)'"
                    }
                },
                "required": ["expression"]
            }),
        }
    }

    fn invoke(&self, arguments: Value) -> ToolFuture {
        Box::pin(async move {
            let expression = arguments
                .get("expression")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ToolError::InvalidArguments("missing 'expression' argument".to_string())
                })?;

            let value = eval_expression(expression)?;
            let rendered = if value.fract() == 0.0 && value.abs() < 1e15 {
                format!("{}", value as i64)
            } else {
                format!("{value}")
            };

            Ok(serde_json::json!({
                "expression": expression,
                "result": rendered
            }))
        })
    }
}

fn eval_expression(input: &str) -> Result<f64, ToolError> {
    let mut parser = ExprParser {
        chars: input.chars().collect(),
        pos: 0,
    };
    let value = parser.parse_sum()?;
    parser.skip_whitespace();
    if parser.pos != parser.chars.len() {
        return Err(ToolError::ExecutionFailed(format!(
            "unexpected input at position {}",
            parser.pos
        )));
    }
    if !value.is_finite() {
        return Err(ToolError::ExecutionFailed(
            "expression did not evaluate to a finite number".to_string(),
        ));
    }
    Ok(value)
}

struct ExprParser {
    chars: Vec<char>,
    pos: usize,
}

impl ExprParser {
    fn parse_sum(&mut self) -> Result<f64, ToolError> {
        let mut value = self.parse_product()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    value += self.parse_product()?;
                }
                Some('-') => {
                    self.pos += 1;
                    value -= self.parse_product()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn parse_product(&mut self) -> Result<f64, ToolError> {
        let mut value = self.parse_power()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    value *= self.parse_power()?;
                }
                Some('/') => {
                    self.pos += 1;
                    let divisor = self.parse_power()?;
                    if divisor == 0.0 {
                        return Err(ToolError::ExecutionFailed("division by zero".to_string()));
                    }
                    value /= divisor;
                }
                Some('%') => {
                    self.pos += 1;
                    let divisor = self.parse_power()?;
                    if divisor == 0.0 {
                        return Err(ToolError::ExecutionFailed("modulo by zero".to_string()));
                    }
                    value %= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    fn parse_power(&mut self) -> Result<f64, ToolError> {
        let base = self.parse_unary()?;
        self.skip_whitespace();
        if self.peek() == Some('^') {
            self.pos += 1;
            // Right-associative.
            let exponent = self.parse_power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<f64, ToolError> {
        self.skip_whitespace();
        if self.peek() == Some('-') {
            self.pos += 1;
            return Ok(-self.parse_unary()?);
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<f64, ToolError> {
        self.skip_whitespace();
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.parse_sum()?;
                self.skip_whitespace();
                if self.peek() != Some(')') {
                    return Err(ToolError::ExecutionFailed(
                        "unbalanced parentheses".to_string(),
                    ));
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() => self.parse_name(),
            _ => Err(ToolError::ExecutionFailed(format!(
                "unexpected character at position {}",
                self.pos
            ))),
        }
    }

    fn parse_number(&mut self) -> Result<f64, ToolError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse()
            .map_err(|_| ToolError::ExecutionFailed(format!("invalid number '{text}'")))
    }

    fn parse_name(&mut self) -> Result<f64, ToolError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();

        match name.as_str() {
            "pi" => return Ok(std::f64::consts::PI),
            "e" => return Ok(std::f64::consts::E),
            _ => {}
        }

        self.skip_whitespace();
        if self.peek() != Some('(') {
            return Err(ToolError::ExecutionFailed(format!(
                "unknown identifier '{name}'"
            )));
        }
        self.pos += 1;
        let arg = self.parse_sum()?;
        self.skip_whitespace();
        if self.peek() != Some(')') {
            return Err(ToolError::ExecutionFailed(
                "unbalanced parentheses".to_string(),
            ));
        }
        self.pos += 1;

        match name.as_str() {
            "sqrt" => {
                if arg < 0.0 {
                    return Err(ToolError::ExecutionFailed(
                        "sqrt of negative number".to_string(),
                    ));
                }
                Ok(arg.sqrt())
            }
            "abs" => Ok(arg.abs()),
            "floor" => Ok(arg.floor()),
            "ceil" => Ok(arg.ceil()),
            _ => Err(ToolError::ExecutionFailed(format!(
                "unknown function '{name}'"
            ))),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }
}

/// Reads a file relative to the configured working directory.
pub struct FileReadTool {
    base_path: PathBuf,
}

impl FileReadTool {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

impl Tool for FileReadTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read the contents of a text file".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the working directory"
                    }
                },
                "required": ["path"]
            }),
        }
    }

    fn invoke(&self, arguments: Value) -> ToolFuture {
        let base_path = self.base_path.clone();
        Box::pin(async move {
            let path = arguments
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidArguments("missing 'path' argument".to_string()))?;

            let full_path = base_path.join(path);
            let content = tokio::fs::read_to_string(&full_path).await?;

            Ok(serde_json::json!({
                "path": path,
                "content": content
            }))
        })
    }
}

/// Runs a shell command in the configured working directory. Output and exit
/// status are returned verbatim; sandboxing is the caller's concern.
pub struct RunCommandTool {
    base_path: PathBuf,
}

impl RunCommandTool {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

impl Tool for RunCommandTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_command".to_string(),
            description: "Run a shell command and capture its output".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Command to run with sh -c"
                    }
                },
                "required": ["command"]
            }),
        }
    }

    fn invoke(&self, arguments: Value) -> ToolFuture {
        let base_path = self.base_path.clone();
        Box::pin(async move {
            let command = arguments
                .get("command")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ToolError::InvalidArguments("missing 'command' argument".to_string())
                })?;

            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&base_path)
                .output()
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

            Ok(serde_json::json!({
                "command": command,
                "exit_code": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr)
            }))
        })
    }
}

pub fn default_tools(base_path: PathBuf) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(CalculatorTool));
    registry.register(Box::new(FileReadTool::new(base_path.clone())));
    registry.register(Box::new(RunCommandTool::new(base_path)));
    registry
}
