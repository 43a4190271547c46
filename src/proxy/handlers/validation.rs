use serde_json::Value;

// A request rejected before any routing work happens.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub status: u16,
    pub err_type: &'static str,
    pub message: String,
}

impl ValidationError {
    fn invalid(message: &str) -> Self {
        Self {
            status: 400,
            err_type: "invalid_request_error",
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub model: String,
    pub stream: bool,
}

// Validates a /openai/v1/responses body: JSON shape, `model`, `stream`
// type, and the function_call_output context requirements.
pub fn validate_responses_request(body: &[u8]) -> Result<RequestMeta, ValidationError> {
    if body.is_empty() {
        return Err(ValidationError::invalid("Request body is empty"));
    }
    let json: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return Err(ValidationError::invalid("Failed to parse request body")),
    };

    let model = match json.get("model") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err(ValidationError::invalid("model is required")),
    };

    let stream = match json.get("stream") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(ValidationError::invalid("invalid stream field type")),
    };

    validate_function_call_output(&json)?;

    Ok(RequestMeta { model, stream })
}

// A function_call_output must be linkable to its call: via
// previous_response_id, an in-band tool call with the call_id, or an
// item_reference per call_id. Rejecting here avoids a guaranteed upstream 400.
fn validate_function_call_output(json: &Value) -> Result<(), ValidationError> {
    if !has_function_call_output(json) {
        return Ok(());
    }
    let previous_response_id = json
        .get("previous_response_id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    if !previous_response_id.is_empty() || has_tool_call_context(json) {
        return Ok(());
    }
    if has_function_call_output_missing_call_id(json) {
        return Err(ValidationError::invalid(
            "function_call_output requires call_id or previous_response_id; if relying on history, ensure store=true and reuse previous_response_id",
        ));
    }
    let call_ids = function_call_output_call_ids(json);
    if !has_item_reference_for_call_ids(json, &call_ids) {
        return Err(ValidationError::invalid(
            "function_call_output requires item_reference ids matching each call_id, or previous_response_id/tool_call context; if relying on history, ensure store=true and reuse previous_response_id",
        ));
    }
    Ok(())
}

fn input_items(json: &Value) -> impl Iterator<Item = &Value> {
    json.get("input")
        .and_then(|v| v.as_array())
        .map(|a| a.iter())
        .unwrap_or_default()
}

fn item_type(item: &Value) -> &str {
    item.get("type").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn has_function_call_output(json: &Value) -> bool {
    input_items(json).any(|item| item_type(item) == "function_call_output")
}

// An in-band tool call with a call_id is enough context for the upstream to
// resolve the output.
pub fn has_tool_call_context(json: &Value) -> bool {
    input_items(json).any(|item| {
        matches!(item_type(item), "tool_call" | "function_call")
            && item
                .get("call_id")
                .and_then(|v| v.as_str())
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false)
    })
}

pub fn has_function_call_output_missing_call_id(json: &Value) -> bool {
    input_items(json).any(|item| {
        item_type(item) == "function_call_output"
            && item
                .get("call_id")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().is_empty())
                .unwrap_or(true)
    })
}

pub fn function_call_output_call_ids(json: &Value) -> Vec<String> {
    input_items(json)
        .filter(|item| item_type(item) == "function_call_output")
        .filter_map(|item| item.get("call_id").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .collect()
}

pub fn has_item_reference_for_call_ids(json: &Value, call_ids: &[String]) -> bool {
    if call_ids.is_empty() {
        return false;
    }
    call_ids.iter().all(|call_id| {
        input_items(json).any(|item| {
            item_type(item) == "item_reference"
                && item.get("id").and_then(|v| v.as_str()) == Some(call_id.as_str())
        })
    })
}
