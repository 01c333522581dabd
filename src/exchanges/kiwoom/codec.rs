use crate::core::errors::KiwoomError;
use crate::core::kernel::WsCodec;
use crate::core::types::{AckKind, Envelope, Frame, Subscription};
use serde::{Deserialize, Deserializer};
use serde_json::value::RawValue;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use tokio_tungstenite::tungstenite::Message;

pub const TRNM_LOGIN: &str = "LOGIN";
pub const TRNM_PING: &str = "PING";
pub const TRNM_REG: &str = "REG";
pub const TRNM_REMOVE: &str = "REMOVE";
pub const TRNM_REAL: &str = "REAL";

/// Accepts `0`, `"0"` or absence
fn lenient_code<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("return_code out of range")),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(0),
        Some(Value::String(s)) => s.trim().parse().map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "unexpected return_code: {}",
            other
        ))),
    }
}

/// Accepts a group key sent as string or number
fn lenient_group<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Top level of every realtime frame; the payload stays raw until the kind is known
#[derive(Deserialize)]
struct WireFrame<'a> {
    #[serde(borrow)]
    trnm: Cow<'a, str>,
    #[serde(default, deserialize_with = "lenient_code")]
    return_code: i64,
    #[serde(default, borrow)]
    return_msg: Option<Cow<'a, str>>,
    #[serde(default, deserialize_with = "lenient_group")]
    grp_no: Option<String>,
    #[serde(default, borrow)]
    data: Option<&'a RawValue>,
}

#[derive(Deserialize)]
struct WireData {
    #[serde(rename = "type")]
    subject: String,
    #[serde(default)]
    item: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_group")]
    grp_no: Option<String>,
    #[serde(default)]
    values: HashMap<String, Value>,
}

/// Codec for the venue's `trnm`-tagged JSON frames
#[derive(Debug, Clone, Copy, Default)]
pub struct KiwoomCodec;

impl KiwoomCodec {
    /// Encode envelopes as one data frame
    pub fn encode_data(&self, envelopes: &[Envelope]) -> Result<Message, KiwoomError> {
        let data: Vec<Value> = envelopes
            .iter()
            .map(|envelope| {
                let mut entry = json!({
                    "type": envelope.subject,
                    "item": envelope.item,
                    "values": envelope.values,
                });
                if let Some(name) = &envelope.name {
                    entry["name"] = json!(name);
                }
                if let Some(group) = &envelope.group {
                    entry["grp_no"] = json!(group);
                }
                entry
            })
            .collect();

        Ok(Message::Text(
            json!({ "trnm": TRNM_REAL, "data": data }).to_string(),
        ))
    }

    fn decode_data(&self, frame: &WireFrame<'_>) -> Result<Vec<Envelope>, KiwoomError> {
        let raw = frame.data.ok_or_else(|| {
            KiwoomError::DecodeError("REAL frame without data".to_string())
        })?;
        let entries: Vec<WireData> = serde_json::from_str(raw.get()).map_err(|e| {
            KiwoomError::DecodeError(format!("Invalid REAL payload: {}", e))
        })?;

        Ok(entries
            .into_iter()
            .map(|entry| Envelope {
                subject: entry.subject,
                group: entry.grp_no.or_else(|| frame.grp_no.clone()),
                item: entry.item,
                name: entry.name,
                values: entry.values,
            })
            .collect())
    }
}

impl WsCodec for KiwoomCodec {
    fn encode_login(&self, token: &str) -> Result<Message, KiwoomError> {
        Ok(Message::Text(
            json!({ "trnm": TRNM_LOGIN, "token": token }).to_string(),
        ))
    }

    fn encode_subscription(&self, subscription: &Subscription) -> Result<Message, KiwoomError> {
        let request = json!({
            "trnm": TRNM_REG,
            "grp_no": subscription.group,
            "refresh": "1",
            "data": [{
                "item": subscription.items,
                "type": subscription.subjects,
            }],
        });
        Ok(Message::Text(request.to_string()))
    }

    fn encode_unsubscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Message, KiwoomError> {
        let request = json!({
            "trnm": TRNM_REMOVE,
            "grp_no": subscription.group,
            "refresh": "",
            "data": [{
                "item": subscription.items,
                "type": subscription.subjects,
            }],
        });
        Ok(Message::Text(request.to_string()))
    }

    fn decode_message(&self, text: &str) -> Result<Frame, KiwoomError> {
        let frame: WireFrame<'_> = serde_json::from_str(text).map_err(|e| {
            KiwoomError::DecodeError(format!("Invalid realtime frame: {}", e))
        })?;
        let return_msg = || {
            frame
                .return_msg
                .as_deref()
                .unwrap_or_default()
                .to_string()
        };

        match frame.trnm.as_ref() {
            TRNM_LOGIN => Ok(Frame::Login {
                return_code: frame.return_code,
                return_msg: return_msg(),
            }),
            TRNM_PING => Ok(Frame::Ping),
            TRNM_REG | TRNM_REMOVE => Ok(Frame::Ack {
                kind: if frame.trnm == TRNM_REG {
                    AckKind::Subscribe
                } else {
                    AckKind::Unsubscribe
                },
                return_code: frame.return_code,
                return_msg: return_msg(),
            }),
            TRNM_REAL => self.decode_data(&frame).map(Frame::Data),
            other => Ok(Frame::Other(other.to_string())),
        }
    }
}
