use serde::Serialize;
use serde_json::{Map, Value};

/// Image subtypes the vision models accept in data URLs.
const IMAGE_SUBTYPES: &[&str] = &["png", "jpeg", "jpg", "gif", "webp"];

/// A question that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskRequest {
    pub prompt: String,
    pub img: Option<String>,
    pub audio: Option<String>,
    pub detail: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid ask payload ({} issue(s))", .details.len())]
pub struct ValidationError {
    pub details: Vec<FieldIssue>,
}

/// Parses and validates a raw `/api/ask` body.
pub fn validate_ask_payload(raw: &[u8]) -> Result<AskRequest, ValidationError> {
    let value: Value = serde_json::from_slice(raw).map_err(|err| ValidationError {
        details: vec![FieldIssue::new("body", format!("malformed JSON: {err}"))],
    })?;
    validate(&value)
}

pub fn validate(raw: &Value) -> Result<AskRequest, ValidationError> {
    let Some(obj) = raw.as_object() else {
        return Err(ValidationError {
            details: vec![FieldIssue::new("body", "expected a JSON object")],
        });
    };
    let mut issues = Vec::new();

    let img = optional_string(obj, "img", &mut issues);
    if let Some(img) = img.as_deref() {
        if image_media_type(img).is_none() {
            issues.push(FieldIssue::new(
                "img",
                "expected a data URL with an image media type (png, jpeg, gif, webp)",
            ));
        }
    }

    let audio = optional_string(obj, "audio", &mut issues);
    if audio.as_deref().is_some_and(|a| a.trim().is_empty()) {
        issues.push(FieldIssue::new("audio", "must not be empty"));
    }

    let detail = match obj.get("detail") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            issues.push(FieldIssue::new("detail", "expected a boolean"));
            false
        }
    };

    let prompt = match obj.get("prompt") {
        Some(Value::String(s)) => {
            // A voice question may arrive with an empty prompt; the transcript fills it.
            if s.trim().is_empty() && audio.is_none() {
                issues.push(FieldIssue::new("prompt", "must not be empty"));
            }
            s.clone()
        }
        None | Some(Value::Null) => {
            issues.push(FieldIssue::new("prompt", "is required"));
            String::new()
        }
        Some(_) => {
            issues.push(FieldIssue::new("prompt", "expected a string"));
            String::new()
        }
    };

    if !issues.is_empty() {
        return Err(ValidationError { details: issues });
    }
    Ok(AskRequest {
        prompt,
        img,
        audio,
        detail,
    })
}

fn optional_string(
    obj: &Map<String, Value>,
    field: &str,
    issues: &mut Vec<FieldIssue>,
) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            issues.push(FieldIssue::new(field, "expected a string"));
            None
        }
    }
}

/// Returns the media type embedded in an image data URL, e.g. `image/png`.
pub fn image_media_type(data_url: &str) -> Option<mime::Mime> {
    let rest = data_url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    if payload.is_empty() {
        return None;
    }
    let media_type = header.split(';').next()?;
    let parsed: mime::Mime = media_type.trim().parse().ok()?;
    if parsed.type_() != mime::IMAGE {
        return None;
    }
    let subtype = parsed.subtype().as_str().to_ascii_lowercase();
    IMAGE_SUBTYPES
        .contains(&subtype.as_str())
        .then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(err: &ValidationError) -> Vec<&str> {
        err.details.iter().map(|i| i.field.as_str()).collect()
    }

    #[test]
    fn empty_object_reports_missing_prompt() {
        let err = validate(&json!({})).unwrap_err();
        assert_eq!(fields(&err), vec!["prompt"]);
    }

    #[test]
    fn non_object_body_is_rejected() {
        let err = validate(&json!(["prompt"])).unwrap_err();
        assert_eq!(fields(&err), vec!["body"]);
        let err = validate_ask_payload(b"{not json").unwrap_err();
        assert_eq!(fields(&err), vec!["body"]);
    }

    #[test]
    fn all_type_errors_are_collected() {
        let err = validate(&json!({
            "prompt": 5,
            "img": true,
            "audio": 1,
            "detail": "yes"
        }))
        .unwrap_err();
        let mut got = fields(&err);
        got.sort();
        assert_eq!(got, vec!["audio", "detail", "img", "prompt"]);
    }

    #[test]
    fn accepts_image_data_url() {
        let req = validate(&json!({
            "prompt": "hi",
            "img": "data:image/png;base64,AAA=",
            "detail": false
        }))
        .unwrap();
        assert_eq!(req.prompt, "hi");
        assert_eq!(req.img.as_deref(), Some("data:image/png;base64,AAA="));
        assert!(!req.detail);
    }

    #[test]
    fn rejects_non_image_media_types() {
        for img in [
            "data:text/plain;base64,AAA=",
            "https://example.com/a.png",
            "data:image/png;base64,",
            "data:image/tiff;base64,AAA=",
        ] {
            let err = validate(&json!({ "prompt": "hi", "img": img })).unwrap_err();
            assert_eq!(fields(&err), vec!["img"], "{img}");
        }
    }

    #[test]
    fn blank_prompt_is_allowed_only_with_audio() {
        let err = validate(&json!({ "prompt": "   " })).unwrap_err();
        assert_eq!(fields(&err), vec!["prompt"]);

        let req = validate(&json!({ "prompt": "", "audio": "UklGRg==" })).unwrap();
        assert_eq!(req.audio.as_deref(), Some("UklGRg=="));
    }

    #[test]
    fn media_type_is_extracted() {
        let mime = image_media_type("data:image/jpeg;base64,/9j/").unwrap();
        assert_eq!(mime.essence_str(), "image/jpeg");
    }
}
