//! Management-plane wire types: a local datagram-socket control surface
//! distinct from the client API. Each request is a single
//! JSON object `{type, cmd, arg?}`; each reply is `{status, message?,
//! error?}`. No framing, no compression — unlike the client protocol in
//! [`crate::protocol`], a datagram is already a single self-delimited unit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persistence::{Role, User};

/// `type` routes a request to the Persistence Gateway (`user`, `job`) or the
/// Scheduler (`scheduler`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    User,
    Job,
    Scheduler,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagementRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub cmd: String,
    #[serde(default)]
    pub arg: Option<Value>,
}

/// `status` is one of `"ok"`, `"malformed-request-error"`,
/// `"invalid-argument-error"`, `"internal-error"`.
#[derive(Debug, Clone, Serialize)]
pub struct ManagementReply {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManagementReply {
    pub fn ok(message: Value) -> Self {
        ManagementReply {
            status: "ok".to_owned(),
            message: Some(message),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        ManagementReply {
            status: "ok".to_owned(),
            message: None,
            error: None,
        }
    }

    pub fn malformed() -> Self {
        ManagementReply::failure("malformed-request-error", "malformed request")
    }

    pub fn failure(status: &str, message: impl Into<String>) -> Self {
        ManagementReply {
            status: status.to_owned(),
            message: None,
            error: Some(message.into()),
        }
    }
}

/// `user list`/`user info` view. Never carries `pw_hash`/`salt` — password
/// material never leaves persistence except for verification.
#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub user_id: i64,
    pub name: String,
    pub role: Role,
    pub blocked: bool,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        UserView {
            user_id: user.user_id,
            name: user.name.clone(),
            role: user.role(),
            blocked: user.blocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_type_cmd_arg() {
        let json = r#"{"type":"scheduler","cmd":"time-limit","arg":500}"#;
        let req: ManagementRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.kind, RequestKind::Scheduler);
        assert_eq!(req.cmd, "time-limit");
        assert_eq!(req.arg, Some(Value::from(500)));
    }

    #[test]
    fn request_without_arg_defaults_to_none() {
        let json = r#"{"type":"user","cmd":"list"}"#;
        let req: ManagementRequest = serde_json::from_str(json).unwrap();
        assert!(req.arg.is_none());
    }

    #[test]
    fn ok_reply_serializes_without_error_field() {
        let reply = ManagementReply::ok(Value::from(42));
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["message"], 42);
        assert!(value.get("error").is_none());
    }
}
