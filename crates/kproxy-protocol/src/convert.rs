use serde_json::Value;

use crate::gemini::{Content, GenerateContentRequest, GenerationConfig, Part};
use crate::openai::ChatRequest;

/// Rewrite an OpenAI-shaped chat request into Gemini's generateContent
/// dialect. `system` messages are folded into a leading `systemInstruction`;
/// assistant turns become the `model` role; multimodal and tool parts are
/// carried through opaquely.
pub fn openai_to_gemini(req: &ChatRequest) -> GenerateContentRequest {
    let mut system_parts: Vec<Part> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for message in &req.messages {
        let parts = message_parts(&message.content);
        match message.role.as_str() {
            "system" | "developer" => system_parts.extend(parts),
            "assistant" => contents.push(Content {
                role: Some("model".to_string()),
                parts,
            }),
            _ => contents.push(Content {
                role: Some("user".to_string()),
                parts,
            }),
        }
    }

    let system_instruction = (!system_parts.is_empty()).then(|| Content {
        role: None,
        parts: system_parts,
    });

    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: generation_config(req),
        extra: serde_json::Map::new(),
    }
}

fn message_parts(content: &Value) -> Vec<Part> {
    match content {
        Value::String(text) => vec![Part::text(text.clone())],
        Value::Array(items) => items
            .iter()
            .map(|item| {
                if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                    Part::text(text)
                } else if let Some(map) = item.as_object() {
                    // Not a text part: hand the structure through untouched.
                    Part {
                        text: None,
                        extra: map.clone(),
                    }
                } else {
                    Part::text(item.to_string())
                }
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![Part::text(other.to_string())],
    }
}

fn generation_config(req: &ChatRequest) -> Option<GenerationConfig> {
    let max_output_tokens = req.max_completion_tokens.or(req.max_tokens);
    let stop_sequences = req.stop.as_ref().and_then(|stop| match stop {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    });

    if req.temperature.is_none()
        && req.top_p.is_none()
        && max_output_tokens.is_none()
        && stop_sequences.is_none()
    {
        return None;
    }

    Some(GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        max_output_tokens,
        stop_sequences,
        extra: serde_json::Map::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: Value) -> ChatRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_becomes_system_instruction() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
            ],
        }));
        let out = openai_to_gemini(&req);
        let sys = out.system_instruction.unwrap();
        assert_eq!(sys.parts[0].text.as_deref(), Some("be brief"));
        assert_eq!(out.contents.len(), 2);
        assert_eq!(out.contents[0].role.as_deref(), Some("user"));
        assert_eq!(out.contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn non_text_parts_are_opaque() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "http://x/y.png"}},
            ]}],
        }));
        let out = openai_to_gemini(&req);
        let parts = &out.contents[0].parts;
        assert_eq!(parts[0].text.as_deref(), Some("look"));
        assert!(parts[1].extra.contains_key("image_url"));
    }

    #[test]
    fn generation_config_maps_sampling_fields() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [],
            "temperature": 0.2,
            "max_tokens": 64,
            "stop": ["END"],
        }));
        let cfg = openai_to_gemini(&req).generation_config.unwrap();
        assert_eq!(cfg.temperature, Some(0.2));
        assert_eq!(cfg.max_output_tokens, Some(64));
        assert_eq!(cfg.stop_sequences, Some(vec!["END".to_string()]));
    }

    #[test]
    fn no_sampling_fields_means_no_config() {
        let req = request(serde_json::json!({"model": "m", "messages": []}));
        assert!(openai_to_gemini(&req).generation_config.is_none());
    }
}
