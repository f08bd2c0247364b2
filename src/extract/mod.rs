// Extract module - recovers structured facts from proxied LLM traffic
//
// Response bodies arrive as opaque blobs: a single JSON document, a stream of
// newline-delimited JSON events, or malformed/partial data. The functions here
// recover the most recent well-formed object and the assembled completion text
// without ever failing - a blob that doesn't parse simply yields empty facts.
//
// Two streaming schemas are supported side by side:
// - Ollama-native lines: {"message": {"role": "assistant", "content": "..."}}
// - OpenAI delta lines:  {"choices": [{"delta": {"content": "..."}}]}

use serde_json::{Map, Value};

/// A decoded top-level JSON object. Blobs that decode to arrays or scalars are
/// treated as absent - the extraction pipeline only works on objects.
pub type JsonObject = Map<String, Value>;

/// Token counts recovered from a response payload.
///
/// Fields stay `None` when the payload doesn't report them; a partial count is
/// never padded with zeros. `total_tokens` is computed from the other two only
/// for the native schema, and only when both are present.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsageFacts {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

/// Decode bytes as text, replacing invalid UTF-8 sequences instead of failing.
/// Handlers call this once at the boundary so everything downstream sees text.
pub fn lossy_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Strict JSON decode of one candidate line. Returns the object only when it
/// decodes to a non-empty JSON object; anything else counts as "no data".
fn decode_object(candidate: &str) -> Option<JsonObject> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(object)) if !object.is_empty() => Some(object),
        _ => None,
    }
}

/// If `prefix` is non-empty and occurs in the line, keep only what follows its
/// first occurrence. Used to skip event-framing prefixes in exported blobs.
fn strip_prefix<'a>(line: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return line;
    }
    match line.split_once(prefix) {
        Some((_, rest)) => rest,
        None => line,
    }
}

/// Return the last valid JSON object inside a possibly-streamed blob.
///
/// Lines are scanned in reverse order: for streamed responses the final event
/// carries the most complete aggregate state (Ollama's closing event holds the
/// eval counts), so the latest object wins. Lines that fail to decode are
/// skipped silently - this is deliberately best-effort, not a streaming
/// protocol parser. A blob without newlines is treated as a single line.
pub fn last_json_object(blob: &str, prefix: &str) -> JsonObject {
    if blob.is_empty() {
        return JsonObject::new();
    }

    let lines: Vec<&str> = blob
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    // Whole blob as the single candidate when no line survived trimming
    let lines = if lines.is_empty() { vec![blob] } else { lines };

    for line in lines.into_iter().rev() {
        if let Some(object) = decode_object(strip_prefix(line, prefix).trim()) {
            return object;
        }
    }

    JsonObject::new()
}

/// Concatenate assistant message fragments from a streamed response.
///
/// Unlike `last_json_object` this walks the lines in forward order: fragments
/// must be joined in emission order or the completion text comes out shuffled.
/// Per line, the native schema is tried first (a `message` object with role
/// "assistant"), then the OpenAI delta schema. Undecodable lines are skipped.
pub fn aggregate_completion(blob: &str, prefix: &str) -> String {
    if blob.is_empty() {
        return String::new();
    }

    let mut pieces = String::new();
    for line in blob.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let object = match decode_object(strip_prefix(line, prefix).trim()) {
            Some(object) => object,
            None => continue,
        };

        // Ollama style: {"message": {"role": "assistant", "content": "..."}}
        if let Some(message) = object.get("message") {
            if message.get("role").and_then(Value::as_str) == Some("assistant") {
                pieces.push_str(message.get("content").and_then(Value::as_str).unwrap_or(""));
                continue;
            }
        }

        // OpenAI stream style: {"choices": [{"delta": {"content": "..."}}]}
        if let Some(content) = object
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
        {
            if !content.is_empty() {
                pieces.push_str(content);
            }
        }
    }

    pieces
}

/// Read the completion text of the first choice in a structured response:
/// `choices[0].message.content`, falling back to `choices[0].text` for
/// legacy completion-shaped payloads. Missing shapes yield an empty string.
pub fn first_completion_text(payload: &JsonObject) -> String {
    let first_choice = payload.get("choices").and_then(|choices| choices.get(0));

    first_choice
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .or_else(|| {
            first_choice
                .and_then(|choice| choice.get("text"))
                .and_then(Value::as_str)
        })
        .unwrap_or("")
        .to_string()
}

/// Pull token counts out of a response payload.
///
/// The two backend dialects report usage under entirely different keys, so
/// both are tried: an OpenAI-style `usage` object is read verbatim when
/// present and non-empty; otherwise the native `prompt_eval_count` /
/// `eval_count` fields are mapped to prompt/completion counts, with the total
/// summed only when both sides exist.
pub fn usage_facts(payload: &JsonObject) -> UsageFacts {
    if let Some(usage) = payload.get("usage").and_then(Value::as_object) {
        if !usage.is_empty() {
            return UsageFacts {
                prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_i64),
                completion_tokens: usage.get("completion_tokens").and_then(Value::as_i64),
                total_tokens: usage.get("total_tokens").and_then(Value::as_i64),
            };
        }
    }

    if payload.contains_key("prompt_eval_count") || payload.contains_key("eval_count") {
        let prompt_tokens = payload.get("prompt_eval_count").and_then(Value::as_i64);
        let completion_tokens = payload.get("eval_count").and_then(Value::as_i64);
        let total_tokens = match (prompt_tokens, completion_tokens) {
            (Some(prompt), Some(completion)) => Some(prompt + completion),
            _ => None,
        };
        return UsageFacts {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        };
    }

    UsageFacts::default()
}

/// Content of the most recent message with role "user", or empty string.
pub fn last_user_message(messages: &[Value]) -> String {
    messages
        .iter()
        .rev()
        .find(|message| message.get("role").and_then(Value::as_str) == Some("user"))
        .and_then(|message| message.get("content").and_then(Value::as_str))
        .unwrap_or("")
        .to_string()
}

/// Content of every message with role "system", in original order, joined by
/// newline. Returns an empty string when there are none.
pub fn system_messages(messages: &[Value]) -> String {
    messages
        .iter()
        .filter(|message| message.get("role").and_then(Value::as_str) == Some("system"))
        .map(|message| message.get("content").and_then(Value::as_str).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_last_json_object_empty_blob() {
        assert!(last_json_object("", "").is_empty());
        assert!(last_json_object("", "stringValue:").is_empty());
    }

    #[test]
    fn test_last_json_object_single_document() {
        let parsed = last_json_object(r#"{"model": "llama3", "done": true}"#, "");
        assert_eq!(parsed.get("model").and_then(Value::as_str), Some("llama3"));
    }

    #[test]
    fn test_last_json_object_prefers_latest_line() {
        let blob = "{\"step\": 1}\n{\"step\": 2}\n{\"step\": 3}";
        let parsed = last_json_object(blob, "");
        assert_eq!(parsed.get("step").and_then(Value::as_i64), Some(3));
    }

    #[test]
    fn test_last_json_object_skips_malformed_tail() {
        // Only the last line decodes; the backward scan must still find it
        // even when earlier lines are garbage, and skip trailing garbage too.
        let blob = "not json at all\n{\"found\": true}\n{\"trunca";
        let parsed = last_json_object(blob, "");
        assert_eq!(parsed.get("found").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn test_last_json_object_strips_delimiter_prefix() {
        let blob = "event stringValue:{\"usage\": {\"prompt_tokens\": 7}}";
        let parsed = last_json_object(blob, "stringValue:");
        assert!(parsed.contains_key("usage"));
    }

    #[test]
    fn test_last_json_object_ignores_non_objects() {
        // Arrays and scalars are not usable payloads, and an empty object
        // doesn't count either - the earlier full object should win.
        let blob = "{\"kept\": 1}\n[1, 2, 3]\n42\n{}";
        let parsed = last_json_object(blob, "");
        assert_eq!(parsed.get("kept").and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn test_last_json_object_nothing_usable() {
        assert!(last_json_object("garbage\nmore garbage", "").is_empty());
        assert!(last_json_object("   \n  \n", "").is_empty());
    }

    #[test]
    fn test_aggregate_completion_empty_blob() {
        assert_eq!(aggregate_completion("", ""), "");
    }

    #[test]
    fn test_aggregate_completion_native_stream() {
        let blob = concat!(
            "{\"message\": {\"role\": \"assistant\", \"content\": \"Hel\"}}\n",
            "{\"message\": {\"role\": \"assistant\", \"content\": \"lo \"}}\n",
            "{\"message\": {\"role\": \"assistant\", \"content\": \"world\"}}\n",
            "{\"done\": true, \"prompt_eval_count\": 10, \"eval_count\": 3}",
        );
        assert_eq!(aggregate_completion(blob, ""), "Hello world");
    }

    #[test]
    fn test_aggregate_completion_delta_stream() {
        let blob = concat!(
            "{\"choices\": [{\"delta\": {\"role\": \"assistant\"}}]}\n",
            "{\"choices\": [{\"delta\": {\"content\": \"foo\"}}]}\n",
            "{\"choices\": [{\"delta\": {\"content\": \"bar\"}}]}\n",
            "{\"choices\": [{\"delta\": {}, \"finish_reason\": \"stop\"}]}",
        );
        assert_eq!(aggregate_completion(blob, ""), "foobar");
    }

    #[test]
    fn test_aggregate_completion_preserves_emission_order() {
        // Contrast with last_json_object: fragments concatenate forward.
        let blob = "{\"message\": {\"role\": \"assistant\", \"content\": \"b\"}}\n\
                    {\"message\": {\"role\": \"assistant\", \"content\": \"a\"}}";
        assert_eq!(aggregate_completion(blob, ""), "ba");
    }

    #[test]
    fn test_aggregate_completion_skips_non_assistant_messages() {
        let blob = "{\"message\": {\"role\": \"tool\", \"content\": \"ignored\"}}\n\
                    {\"message\": {\"role\": \"assistant\", \"content\": \"kept\"}}";
        assert_eq!(aggregate_completion(blob, ""), "kept");
    }

    #[test]
    fn test_aggregate_completion_assistant_without_content() {
        let blob = "{\"message\": {\"role\": \"assistant\"}}";
        assert_eq!(aggregate_completion(blob, ""), "");
    }

    #[test]
    fn test_aggregate_completion_skips_malformed_lines() {
        let blob = "oops\n{\"choices\": [{\"delta\": {\"content\": \"ok\"}}]}\n{broken";
        assert_eq!(aggregate_completion(blob, ""), "ok");
    }

    #[test]
    fn test_first_completion_text_message_content() {
        let payload = object(json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        }));
        assert_eq!(first_completion_text(&payload), "hello");
    }

    #[test]
    fn test_first_completion_text_falls_back_to_text() {
        let payload = object(json!({"choices": [{"text": "legacy completion"}]}));
        assert_eq!(first_completion_text(&payload), "legacy completion");
    }

    #[test]
    fn test_first_completion_text_missing_shape() {
        assert_eq!(first_completion_text(&JsonObject::new()), "");
        let payload = object(json!({"choices": []}));
        assert_eq!(first_completion_text(&payload), "");
    }

    #[test]
    fn test_usage_facts_openai_schema() {
        let payload = object(json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5}}));
        let usage = usage_facts(&payload);
        assert_eq!(usage.prompt_tokens, Some(10));
        assert_eq!(usage.completion_tokens, Some(5));
        // total_tokens key is absent - the total must not be fabricated here
        assert_eq!(usage.total_tokens, None);
    }

    #[test]
    fn test_usage_facts_openai_schema_with_total() {
        let payload = object(json!({
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }));
        assert_eq!(usage_facts(&payload).total_tokens, Some(15));
    }

    #[test]
    fn test_usage_facts_native_schema() {
        let payload = object(json!({"prompt_eval_count": 10, "eval_count": 5}));
        let usage = usage_facts(&payload);
        assert_eq!(usage.prompt_tokens, Some(10));
        assert_eq!(usage.completion_tokens, Some(5));
        assert_eq!(usage.total_tokens, Some(15));
    }

    #[test]
    fn test_usage_facts_native_schema_partial() {
        // Only one eval counter: no total, and nothing invented for the other
        let payload = object(json!({"eval_count": 5}));
        let usage = usage_facts(&payload);
        assert_eq!(usage.prompt_tokens, None);
        assert_eq!(usage.completion_tokens, Some(5));
        assert_eq!(usage.total_tokens, None);
    }

    #[test]
    fn test_usage_facts_absent() {
        let payload = object(json!({"model": "llama3"}));
        assert_eq!(usage_facts(&payload), UsageFacts::default());
    }

    #[test]
    fn test_usage_facts_empty_usage_object_falls_through() {
        // An empty usage object is "no data" - the native fields still apply
        let payload = object(json!({"usage": {}, "prompt_eval_count": 4, "eval_count": 2}));
        let usage = usage_facts(&payload);
        assert_eq!(usage.prompt_tokens, Some(4));
        assert_eq!(usage.total_tokens, Some(6));
    }

    #[test]
    fn test_last_user_message_picks_latest() {
        let messages = vec![
            json!({"role": "user", "content": "first"}),
            json!({"role": "assistant", "content": "reply"}),
            json!({"role": "user", "content": "second"}),
        ];
        assert_eq!(last_user_message(&messages), "second");
    }

    #[test]
    fn test_last_user_message_none_present() {
        let messages = vec![json!({"role": "system", "content": "sys"})];
        assert_eq!(last_user_message(&messages), "");
        assert_eq!(last_user_message(&[]), "");
    }

    #[test]
    fn test_system_messages_joined_in_order() {
        let messages = vec![
            json!({"role": "system", "content": "one"}),
            json!({"role": "user", "content": "hi"}),
            json!({"role": "system", "content": "two"}),
        ];
        assert_eq!(system_messages(&messages), "one\ntwo");
    }

    #[test]
    fn test_lossy_text_replaces_invalid_bytes() {
        let text = lossy_text(&[b'o', b'k', 0xFF, b'!']);
        assert!(text.starts_with("ok"));
        assert!(text.ends_with('!'));
        assert!(text.contains('\u{FFFD}'));
    }
}
