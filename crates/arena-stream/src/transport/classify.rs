/// What an `agent_output` payload turned out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputClass {
    /// Model text; forwarded to the agent's pacer verbatim.
    Text,
    /// Backend diagnostic log line leaked into the output channel; suppressed.
    DiagnosticLog,
}

/// Classifies an output payload.
///
/// | payload                                             | class           |
/// |-----------------------------------------------------|-----------------|
/// | not valid JSON                                      | `Text`          |
/// | JSON scalar or array                                | `Text`          |
/// | JSON object without `timestamp` or without `level`  | `Text`          |
/// | JSON object with both `timestamp` and `level`       | `DiagnosticLog` |
pub fn classify_output(content: &str) -> OutputClass {
    let trimmed = content.trim_start();
    if !trimmed.starts_with('{') {
        return OutputClass::Text;
    }
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(serde_json::Value::Object(map))
            if map.contains_key("timestamp") && map.contains_key("level") =>
        {
            OutputClass::DiagnosticLog
        }
        _ => OutputClass::Text,
    }
}
