//! Envelope types exchanged over the chat channel.

use crate::sanitize::sanitize_map;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Commands owned by the transport and router layers.
///
/// These never reach application command handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    Ping,
    Pong,
    /// Generic receipt acknowledgement.
    Ack,
    Reconnect,
    Error,
    WsClose,
    SetUserAccessId,
}

impl SystemCommand {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Ack => "receiverMessage",
            Self::Reconnect => "Reconnect",
            Self::Error => "Error",
            Self::WsClose => "wsClose",
            Self::SetUserAccessId => "SetUserAccessId",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "receiverMessage" => Some(Self::Ack),
            "Reconnect" => Some(Self::Reconnect),
            "Error" => Some(Self::Error),
            "wsClose" => Some(Self::WsClose),
            "SetUserAccessId" => Some(Self::SetUserAccessId),
            _ => None,
        }
    }
}

/// Envelope built by callers and sent to the remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    /// Extra top-level fields, including the stamped access id.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutboundEnvelope {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            data: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn system(command: SystemCommand) -> Self {
        Self::new(command.as_str())
    }

    #[must_use]
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Strip markup and control characters from every string key and value.
    #[must_use]
    pub fn sanitized(self) -> Self {
        Self {
            cmd: crate::sanitize::sanitize_text(&self.cmd),
            data: self.data.map(sanitize_map),
            extra: sanitize_map(self.extra),
        }
    }
}

/// Envelope received from the remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub cmd: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundEnvelope {
    #[must_use]
    pub fn system_command(&self) -> Option<SystemCommand> {
        SystemCommand::parse(&self.cmd)
    }

    /// String field of `data`, if present.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    #[test]
    fn system_commands_parse_by_wire_name() {
        for cmd in [
            SystemCommand::Ping,
            SystemCommand::Pong,
            SystemCommand::Ack,
            SystemCommand::Reconnect,
            SystemCommand::Error,
            SystemCommand::WsClose,
            SystemCommand::SetUserAccessId,
        ] {
            assert_eq!(SystemCommand::parse(cmd.as_str()), Some(cmd));
        }
        assert_eq!(SystemCommand::parse("SendUserMessage"), None);
    }

    #[test]
    fn outbound_flattens_extra_fields() {
        let mut data = Map::new();
        data.insert("message".into(), json!("hello"));
        let env = OutboundEnvelope::new("SendUserMessage")
            .with_data(data)
            .with_field("requestAccessId", "abc");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"cmd": "SendUserMessage", "data": {"message": "hello"}, "requestAccessId": "abc"})
        );
    }

    #[test]
    fn outbound_without_data_omits_field() {
        let value = serde_json::to_value(OutboundEnvelope::system(SystemCommand::Ping)).unwrap();
        assert_eq!(value, json!({"cmd": "ping"}));
    }

    #[test]
    fn inbound_defaults_missing_status_fields() {
        let env: InboundEnvelope = serde_json::from_str(r#"{"cmd":"pong"}"#).unwrap();
        assert_eq!(env.status, 0);
        assert!(!env.ok);
        assert_eq!(env.system_command(), Some(SystemCommand::Pong));
    }

    #[test]
    fn inbound_reads_data_strings() {
        let env: InboundEnvelope = serde_json::from_value(json!({
            "cmd": "SetUserAccessId",
            "status": 200,
            "ok": true,
            "message": null,
            "data": {"access_id": "u-42", "count": 3}
        }))
        .unwrap();
        assert_eq!(env.data_str("access_id"), Some("u-42"));
        assert_eq!(env.data_str("count"), None);
        assert_eq!(env.data_str("missing"), None);
    }

    #[test]
    fn sanitized_strips_markup_from_data() {
        let mut data = Map::new();
        data.insert("message".into(), json!("<b>hi</b>\u{7}"));
        let env = OutboundEnvelope::new("SendUserMessage")
            .with_data(data)
            .sanitized();
        assert_eq!(env.data.unwrap()["message"], json!("hi"));
    }
}
