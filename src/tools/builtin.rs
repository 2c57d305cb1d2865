//! Built-in tools available without any external server.

use crate::clock::{Clock as _, SharedClock};
use crate::tools::registry::{Tool, ToolFailure};
use schemars::JsonSchema;
use serde::Deserialize;

fn schema_of<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| {
        serde_json::json!({"type": "object"})
    })
}

/// Reports the current UTC time.
pub struct CurrentTimeTool {
    clock: SharedClock,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CurrentTimeArgs {
    /// Optional strftime-style format; defaults to RFC 3339.
    format: Option<String>,
}

impl CurrentTimeTool {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }
}

impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC."
    }

    fn parameters(&self) -> serde_json::Value {
        schema_of::<CurrentTimeArgs>()
    }

    async fn call(&self, args: serde_json::Value) -> std::result::Result<String, ToolFailure> {
        let args: CurrentTimeArgs = serde_json::from_value(args)
            .map_err(|error| ToolFailure::new(format!("invalid arguments: {error}")))?;
        let now = self.clock.now();
        Ok(match args.format {
            Some(format) => now.format(&format).to_string(),
            None => now.to_rfc3339(),
        })
    }
}

/// Evaluates basic arithmetic expressions.
pub struct CalculatorTool;

#[derive(Debug, Deserialize, JsonSchema)]
struct CalculatorArgs {
    /// Arithmetic expression using + - * / and parentheses.
    expression: String,
}

impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression with + - * / and parentheses."
    }

    fn parameters(&self) -> serde_json::Value {
        schema_of::<CalculatorArgs>()
    }

    async fn call(&self, args: serde_json::Value) -> std::result::Result<String, ToolFailure> {
        let args: CalculatorArgs = serde_json::from_value(args)
            .map_err(|error| ToolFailure::new(format!("invalid arguments: {error}")))?;
        let value = eval(&args.expression).map_err(ToolFailure::new)?;
        Ok(format_number(value))
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Recursive-descent evaluator over a token cursor.
fn eval(expression: &str) -> std::result::Result<f64, String> {
    let tokens: Vec<char> = expression.chars().filter(|c| !c.is_whitespace()).collect();
    let mut cursor = 0usize;
    let value = parse_sum(&tokens, &mut cursor)?;
    if cursor != tokens.len() {
        return Err(format!("unexpected input at position {cursor}"));
    }
    Ok(value)
}

fn parse_sum(tokens: &[char], cursor: &mut usize) -> std::result::Result<f64, String> {
    let mut value = parse_product(tokens, cursor)?;
    while let Some(&op) = tokens.get(*cursor) {
        match op {
            '+' => {
                *cursor += 1;
                value += parse_product(tokens, cursor)?;
            }
            '-' => {
                *cursor += 1;
                value -= parse_product(tokens, cursor)?;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_product(tokens: &[char], cursor: &mut usize) -> std::result::Result<f64, String> {
    let mut value = parse_atom(tokens, cursor)?;
    while let Some(&op) = tokens.get(*cursor) {
        match op {
            '*' => {
                *cursor += 1;
                value *= parse_atom(tokens, cursor)?;
            }
            '/' => {
                *cursor += 1;
                let divisor = parse_atom(tokens, cursor)?;
                if divisor == 0.0 {
                    return Err("division by zero".into());
                }
                value /= divisor;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_atom(tokens: &[char], cursor: &mut usize) -> std::result::Result<f64, String> {
    match tokens.get(*cursor) {
        Some('(') => {
            *cursor += 1;
            let value = parse_sum(tokens, cursor)?;
            if tokens.get(*cursor) != Some(&')') {
                return Err("missing closing parenthesis".into());
            }
            *cursor += 1;
            Ok(value)
        }
        Some('-') => {
            *cursor += 1;
            Ok(-parse_atom(tokens, cursor)?)
        }
        Some(c) if c.is_ascii_digit() || *c == '.' => {
            let start = *cursor;
            while tokens
                .get(*cursor)
                .is_some_and(|c| c.is_ascii_digit() || *c == '.')
            {
                *cursor += 1;
            }
            let literal: String = tokens[start..*cursor].iter().collect();
            literal
                .parse::<f64>()
                .map_err(|_| format!("invalid number: {literal}"))
        }
        Some(c) => Err(format!("unexpected character: {c}")),
        None => Err("unexpected end of expression".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    #[test]
    fn evaluates_precedence_and_parens() {
        assert_eq!(eval("1+2*3").expect("eval"), 7.0);
        assert_eq!(eval("(1+2)*3").expect("eval"), 9.0);
        assert_eq!(eval("10/4").expect("eval"), 2.5);
        assert_eq!(eval("-3 + 5").expect("eval"), 2.0);
    }

    #[test]
    fn rejects_bad_expressions() {
        assert!(eval("1/0").is_err());
        assert!(eval("1+").is_err());
        assert!(eval("(1+2").is_err());
        assert!(eval("two").is_err());
    }

    #[tokio::test]
    async fn calculator_tool_formats_integers() {
        let tool = CalculatorTool;
        let result = tool
            .call(serde_json::json!({"expression": "6*7"}))
            .await
            .expect("call");
        assert_eq!(result, "42");
    }

    #[tokio::test]
    async fn current_time_uses_injected_clock() {
        let at = chrono::DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("parse")
            .with_timezone(&chrono::Utc);
        let clock = ManualClock::new(at);
        let tool = CurrentTimeTool::new(Arc::new(clock.clone()) as SharedClock);

        let result = tool.call(serde_json::json!({})).await.expect("call");
        assert_eq!(result, clock.now().to_rfc3339());
    }
}
