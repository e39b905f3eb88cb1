//! Line codec for the tagged request/reply envelopes.
//!
//! Every message is one JSON object followed by `\n`. Requests carry
//! `{"tag", "cmd", "ext"}`, replies carry `{"tag", "ext"}`. Decoding is lenient:
//! anything that is not an object with the required fields comes back as `None`
//! so readers can skip it as non-protocol output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation tag assigned to each in-flight request.
pub type Tag = u64;

/// A command sent to the child.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub tag: Tag,
    #[serde(rename = "cmd")]
    pub command: String,
    #[serde(rename = "ext", default = "empty_object")]
    pub extension: Value,
}

/// A reply written back by the child.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub tag: Tag,
    #[serde(rename = "ext")]
    pub extension: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Serialize)]
struct RequestRef<'a> {
    tag: Tag,
    cmd: &'a str,
    ext: &'a Value,
}

#[derive(Serialize)]
struct ReplyRef<'a> {
    tag: Tag,
    ext: &'a Value,
}

/// Serializes a request into a single newline-terminated line.
pub fn encode_request(
    tag: Tag,
    command: &str,
    extension: &Value,
) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(&RequestRef {
        tag,
        cmd: command,
        ext: extension,
    })?;
    line.push('\n');
    Ok(line)
}

/// Serializes a reply into a single newline-terminated line.
pub fn encode_reply(tag: Tag, extension: &Value) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(&ReplyRef {
        tag,
        ext: extension,
    })?;
    line.push('\n');
    Ok(line)
}

/// Parses one output line into a reply, or `None` when the line is not a reply.
pub fn decode_reply(line: &str) -> Option<ReplyEnvelope> {
    let mut object = parse_object(line)?;
    let tag = parse_tag(object.get("tag")?)?;
    let extension = object.remove("ext")?;
    Some(ReplyEnvelope { tag, extension })
}

/// Parses one input line into a request, or `None` when the line is not a request.
pub fn decode_request(line: &str) -> Option<RequestEnvelope> {
    let mut object = parse_object(line)?;
    let tag = parse_tag(object.get("tag")?)?;
    let command = object.get("cmd")?.as_str()?.to_string();
    let extension = object
        .remove("ext")
        .filter(|ext| !ext.is_null())
        .unwrap_or_else(empty_object);
    Some(RequestEnvelope {
        tag,
        command,
        extension,
    })
}

fn parse_object(line: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed).ok()? {
        Value::Object(object) => Some(object),
        _ => None,
    }
}

/// Tags are JSON integers only; `"12"` is noise, not tag 12.
fn parse_tag(value: &Value) -> Option<Tag> {
    value.as_u64()
}
