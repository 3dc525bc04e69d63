use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

/// Codes the caller caused; everything else is a sidecar-side failure.
fn is_caller_error(code: &str) -> bool {
    matches!(
        code,
        "bad_params" | "not_found" | "conflict" | "no_workspace" | "not_implemented"
    )
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let message = message.into();
    if is_caller_error(code) {
        tracing::debug!(request_id = id, code, %message, "request rejected");
    } else {
        tracing::warn!(request_id = id, code, %message, "request failed");
    }
    let mut error = json!({
        "code": code,
        "message": message,
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// `not_found` for a row of kind `what`, carrying its id in `details`.
pub fn not_found(id: &str, what: &str, row_id: &str) -> serde_json::Value {
    err(
        id,
        "not_found",
        format!("{} not found", what),
        Some(json!({ "id": row_id })),
    )
}
