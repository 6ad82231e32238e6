//! Instruction interpretation.
//!
//! A deliberately narrow convenience layer, not a parser: case-insensitive
//! keyword match against a small fixed set of tool verbs, with numeric
//! literals extracted positionally from the text (the first two become the
//! tool arguments). Anything else fails fast with `InstructionParse` before
//! a protocol call is made.

use regex::Regex;
use serde_json::{Value, json};
use std::sync::LazyLock;

use crate::error::{Error, Result};

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("number regex"));

/// Supported tool verbs, checked in order
const VERBS: [&str; 3] = ["add", "multiply", "divide"];

/// A resolved tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub arguments: Value,
}

/// Map an instruction to a tool call, or fail with `InstructionParse`.
pub fn interpret(instruction: &str) -> Result<ToolCall> {
    let lowered = instruction.to_lowercase();
    let numbers: Vec<f64> = NUMBER
        .find_iter(instruction)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();

    for verb in VERBS {
        if lowered.contains(verb) && numbers.len() >= 2 {
            return Ok(ToolCall {
                tool: verb.to_string(),
                arguments: json!({
                    "a": number_value(numbers[0]),
                    "b": number_value(numbers[1]),
                }),
            });
        }
    }

    Err(Error::InstructionParse(format!(
        "{instruction}. Use a form like 'add 5 and 3' or 'multiply 4 and 6'"
    )))
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}
