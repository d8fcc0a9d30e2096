//! JSON-schema driven synthesis of tool invocations.
//!
//! Tools carry an OpenAI-style `parameters` schema. The walker first
//! validates the schema against a closed type set, then produces arguments
//! by drawing typed values within the configured bounds. Every failure mode
//! is an explicit error so the response engine can distinguish "no tool
//! calls this time" from "tool synthesis failed".

use serde_json::{Map, Value};
use sim_common::config::Config;
use sim_common::{Result, SimError};

use crate::random::Rng;
use crate::tokenizer;

/// Fixed bank of words used for free-form string arguments.
const WORD_BANK: [&str; 10] = [
    "table", "window", "river", "cloud", "signal", "garden", "bottle", "mirror", "engine",
    "lantern",
];

const ALLOWED_TYPES: [&str; 7] = [
    "object", "array", "string", "number", "integer", "boolean", "null",
];

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    None,
    Auto,
    Required,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Arguments as a JSON string; its tokenization drives pacing.
    pub arguments: String,
    pub argument_tokens: usize,
}

/// Validates every tool's `parameters` schema.
pub fn validate_tools(tools: &[Tool]) -> Result<()> {
    for tool in tools {
        validate_schema(&tool.parameters)
            .map_err(|e| SimError::validation(format!("tool \"{}\": {e}", tool.name)))?;
    }
    Ok(())
}

fn validate_schema(schema: &Value) -> std::result::Result<(), String> {
    let obj = schema
        .as_object()
        .ok_or_else(|| "schema must be a JSON object".to_string())?;
    let ty = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "schema is missing a \"type\" string".to_string())?;
    if !ALLOWED_TYPES.contains(&ty) {
        return Err(format!("unsupported type \"{ty}\""));
    }
    if let Some(enum_values) = obj.get("enum") {
        if ty == "object" || ty == "array" {
            return Err(format!("\"enum\" is not allowed on type \"{ty}\""));
        }
        let values = enum_values
            .as_array()
            .ok_or_else(|| "\"enum\" must be an array".to_string())?;
        if values.is_empty() {
            return Err("\"enum\" must not be empty".to_string());
        }
        for v in values {
            if !enum_value_matches(ty, v) {
                return Err(format!("enum value {v} does not match type \"{ty}\""));
            }
        }
    }
    match ty {
        "array" => {
            let items = obj
                .get("items")
                .ok_or_else(|| "array schema requires \"items\"".to_string())?;
            validate_schema(items)?;
        }
        "object" => {
            let properties = obj
                .get("properties")
                .and_then(Value::as_object)
                .ok_or_else(|| "object schema requires \"properties\"".to_string())?;
            for (name, prop) in properties {
                validate_schema(prop).map_err(|e| format!("property \"{name}\": {e}"))?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn enum_value_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => false,
    }
}

/// Produces tool calls for a chat request. `Required` yields at least one
/// call; `Auto` may yield zero, which tells the engine to fall through to
/// the text path.
pub fn generate(
    cfg: &Config,
    rng: &Rng,
    tools: &[Tool],
    choice: ToolChoice,
) -> Result<Vec<ToolCall>> {
    if tools.is_empty() || choice == ToolChoice::None {
        return Ok(Vec::new());
    }
    validate_tools(tools)?;
    let count = match choice {
        ToolChoice::Required => rng.int_in(1..=tools.len()),
        ToolChoice::Auto => rng.int_in(0..=tools.len()),
        ToolChoice::None => 0,
    };
    let mut calls = Vec::with_capacity(count);
    for _ in 0..count {
        let tool = rng.pick(tools);
        let args = generate_arguments(cfg, rng, &tool.parameters)?;
        let arguments = serde_json::to_string(&args)?;
        let argument_tokens = tokenizer::count(&arguments);
        calls.push(ToolCall {
            id: format!("chatcmpl-tool-{}", rng.ten_digits()),
            name: tool.name.clone(),
            arguments,
            argument_tokens,
        });
    }
    Ok(calls)
}

fn generate_arguments(cfg: &Config, rng: &Rng, schema: &Value) -> Result<Value> {
    generate_object(
        cfg,
        rng,
        schema,
        cfg.tool_call_not_required_param_probability,
    )
}

fn generate_object(
    cfg: &Config,
    rng: &Rng,
    schema: &Value,
    optional_probability: u32,
) -> Result<Value> {
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| SimError::ToolSynthesis("object schema without properties".into()))?;
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let mut out = Map::new();
    for (name, prop) in properties {
        let include = required.contains(&name.as_str()) || rng.probability(optional_probability);
        if include {
            out.insert(name.clone(), generate_value(cfg, rng, prop)?);
        }
    }
    Ok(Value::Object(out))
}

fn generate_value(cfg: &Config, rng: &Rng, schema: &Value) -> Result<Value> {
    let ty = schema
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SimError::ToolSynthesis("schema is missing a type".into()))?;
    if let Some(values) = schema.get("enum").and_then(Value::as_array) {
        return Ok(rng.pick(values).clone());
    }
    match ty {
        "string" => Ok(Value::String(rng.pick(&WORD_BANK).to_string())),
        "integer" => Ok(Value::from(rng.int_in(
            cfg.min_tool_call_integer_param..=cfg.max_tool_call_integer_param,
        ))),
        "number" => Ok(Value::from(rng.float_in(
            cfg.min_tool_call_number_param,
            cfg.max_tool_call_number_param,
        ))),
        "boolean" => Ok(Value::Bool(rng.coin_flip())),
        "null" => Ok(Value::Null),
        "array" => {
            let items = schema
                .get("items")
                .ok_or_else(|| SimError::ToolSynthesis("array schema without items".into()))?;
            let schema_min = schema
                .get("minItems")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let schema_max = schema
                .get("maxItems")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(usize::MAX);
            let lo = cfg.min_tool_call_array_param_length.max(schema_min);
            let hi = cfg.max_tool_call_array_param_length.min(schema_max);
            if lo > hi {
                return Err(SimError::ToolSynthesis(format!(
                    "effective array length range is empty ({lo} > {hi})"
                )));
            }
            let len = rng.int_in(lo..=hi);
            let mut arr = Vec::with_capacity(len);
            for _ in 0..len {
                arr.push(generate_value(cfg, rng, items)?);
            }
            Ok(Value::Array(arr))
        }
        "object" => generate_object(
            cfg,
            rng,
            schema,
            cfg.object_tool_call_not_required_field_probability,
        ),
        other => Err(SimError::ToolSynthesis(format!("unsupported type \"{other}\""))),
    }
}
