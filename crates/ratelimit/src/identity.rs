use serde_json::Value;

/// Pick the rate-limit identity for an inbound payload: `sessionId`, then
/// `sender.id`. `None` means the traffic is unidentifiable and the caller
/// decides whether to limit it.
pub fn resolve_identity(payload: &Value) -> Option<String> {
    let non_empty = |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };
    non_empty(payload.get("sessionId"))
        .or_else(|| non_empty(payload.get("sender").and_then(|s| s.get("id"))))
}
