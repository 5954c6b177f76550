use serde::Deserialize;
use serde_json::Value;

use crate::error::RdaError;

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    messages: Option<Vec<Value>>,
}

pub fn parse_result(status: u16, body: &str) -> Result<Value, RdaError> {
    let envelope = serde_json::from_str::<Envelope>(body);

    if !(200..300).contains(&status) {
        if let Ok(envelope) = &envelope {
            if envelope.status == "error" {
                if let Some(messages) = &envelope.messages {
                    return Err(RdaError::Provider(join_messages(messages)));
                }
            }
        }
        return Err(RdaError::Status {
            status,
            message: body.to_string(),
        });
    }

    let envelope = envelope.map_err(|_| RdaError::Provider(body.to_string()))?;
    if envelope.status == "error" {
        return match envelope.messages {
            Some(messages) => Err(RdaError::Provider(join_messages(&messages))),
            None => Err(RdaError::Provider(body.to_string())),
        };
    }
    envelope
        .result
        .ok_or_else(|| RdaError::Provider(body.to_string()))
}

/// Best-effort status string for the poll loop. Anything that cannot be read
/// as an envelope is returned verbatim so polling keeps going.
pub fn interpret_status(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    let Some(status) = value.get("status").and_then(Value::as_str) else {
        return body.to_string();
    };
    if status != "ok" {
        return status.to_string();
    }
    value
        .get("result")
        .and_then(|result| result.get("status"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

fn join_messages(messages: &[Value]) -> String {
    messages
        .iter()
        .map(|message| match message {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn ok_envelope_yields_result() {
        let value = parse_result(200, r#"{"status":"ok","result":{"request_id":"42"}}"#).unwrap();
        assert_eq!(value["request_id"], "42");
    }

    #[test]
    fn error_envelope_joins_messages() {
        let err = parse_result(
            200,
            r#"{"status":"error","messages":["bad param","bad date"]}"#,
        )
        .unwrap_err();
        assert_matches!(err, RdaError::Provider(ref msg) if msg == "bad param bad date");
    }

    #[test]
    fn non_json_body_is_reported_verbatim() {
        let err = parse_result(200, "<html>maintenance</html>").unwrap_err();
        assert_matches!(err, RdaError::Provider(ref msg) if msg.contains("maintenance"));
    }

    #[test]
    fn status_string_falls_back_to_raw_text() {
        assert_eq!(interpret_status("Bad Gateway"), "Bad Gateway");
        assert_eq!(
            interpret_status(r#"{"status":"ok","result":{"status":"Queued for Processing"}}"#),
            "Queued for Processing"
        );
    }
}
