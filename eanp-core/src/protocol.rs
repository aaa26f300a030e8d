//! EAnp vocabulary: command codes, result codes and failure kinds.
//!
//! Commands are sent as query messages whose type tag is a [`Command`] code.
//! The peer answers with a result message whose type tag is a [`ResultKind`].
//! A [`ResultKind::Failure`] result carries `[u32 failure kind, string text]`.
//!
//! The [`commands`] module builds the argument layout expected by the peer for
//! each command.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageError};

/// Commands understood by an EAnp peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Register the user with a key server.
    RegisterKps,
    /// Create a workspace.
    CreateKws,
    /// Export workspace credentials to a file.
    ExportKws,
    /// Import workspace credentials.
    ImportKws,
    /// Resolve recipient addresses.
    LookupRecAddr,
    /// Set the login password of a workspace.
    SetLoginPwd,
    /// Invite users to a workspace.
    InviteKws,
    /// Post a chat message.
    ChatPostMsg,
    /// Start a screen sharing session.
    VncCreateSession,
    /// Change the task a workspace is performing.
    SetKwsTask,
}

impl Command {
    /// Every command, in code order.
    pub const ALL: [Command; 10] = [
        Command::RegisterKps,
        Command::CreateKws,
        Command::ExportKws,
        Command::ImportKws,
        Command::LookupRecAddr,
        Command::SetLoginPwd,
        Command::InviteKws,
        Command::ChatPostMsg,
        Command::VncCreateSession,
        Command::SetKwsTask,
    ];

    /// Numeric type tag used on the wire.
    pub const fn code(self) -> u32 {
        match self {
            Command::RegisterKps => 1,
            Command::CreateKws => 2,
            Command::ExportKws => 3,
            Command::ImportKws => 4,
            Command::LookupRecAddr => 5,
            Command::SetLoginPwd => 6,
            Command::InviteKws => 7,
            Command::ChatPostMsg => 8,
            Command::VncCreateSession => 9,
            Command::SetKwsTask => 10,
        }
    }

    /// Look a command up by type tag.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// An empty message tagged with this command.
    pub fn message(self) -> Message {
        Message::new(self.code())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Display helper for a message tag that may or may not be a known command.
pub struct CommandName(pub u32);

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Command::from_code(self.0) {
            Some(cmd) => write!(f, "{cmd}"),
            None => write!(f, "command({})", self.0),
        }
    }
}

/// Type tag of a result message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKind {
    /// The command succeeded.
    Ok,
    /// The peer refused or failed the command.
    Failure,
    /// A result tag this side does not know; treated as success.
    Other(u32),
}

impl ResultKind {
    /// Numeric type tag used on the wire.
    pub const fn code(self) -> u32 {
        match self {
            ResultKind::Ok => 1001,
            ResultKind::Failure => 1002,
            ResultKind::Other(code) => code,
        }
    }

    /// Classify a result tag.
    pub fn from_code(code: u32) -> Self {
        match code {
            1001 => ResultKind::Ok,
            1002 => ResultKind::Failure,
            other => ResultKind::Other(other),
        }
    }

    /// An empty result message of this kind.
    pub fn message(self) -> Message {
        Message::new(self.code())
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultKind::Ok => f.write_str("OK"),
            ResultKind::Failure => f.write_str("Failure"),
            ResultKind::Other(code) => write!(f, "result({code})"),
        }
    }
}

/// Category carried by a failure result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Unspecified failure.
    Generic,
    /// The operation was cancelled on the peer.
    Cancelled,
    /// An argument was malformed or out of range.
    InvalidArgument,
    /// The caller lacks the required rights.
    PermissionDenied,
    /// The target object does not exist.
    NotFound,
    /// A dependency of the peer is unreachable.
    Unavailable,
    /// A code this side does not know, preserved as received.
    Unknown(u32),
}

impl FailureKind {
    /// Numeric code used on the wire.
    pub const fn code(self) -> u32 {
        match self {
            FailureKind::Generic => 0,
            FailureKind::Cancelled => 1,
            FailureKind::InvalidArgument => 2,
            FailureKind::PermissionDenied => 3,
            FailureKind::NotFound => 4,
            FailureKind::Unavailable => 5,
            FailureKind::Unknown(code) => code,
        }
    }

    /// Classify a failure code.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => FailureKind::Generic,
            1 => FailureKind::Cancelled,
            2 => FailureKind::InvalidArgument,
            3 => FailureKind::PermissionDenied,
            4 => FailureKind::NotFound,
            5 => FailureKind::Unavailable,
            other => FailureKind::Unknown(other),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Unknown(code) => write!(f, "Unknown({code})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Failure reported by the peer inside a [`ResultKind::Failure`] result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable explanation from the peer.
    pub message: String,
}

impl ProtocolFailure {
    /// Build a failure.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Read the failure payload out of a failure result.
    pub fn from_message(msg: &Message) -> Result<Self, MessageError> {
        Ok(Self {
            kind: FailureKind::from_code(msg.u32_at(0)?),
            message: msg.str_at(1)?.to_string(),
        })
    }

    /// Encode as a failure result message.
    pub fn to_message(&self) -> Message {
        ResultKind::Failure
            .message()
            .with(self.kind.code())
            .with(self.message.as_str())
    }
}

impl fmt::Display for ProtocolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failure type {}, message {}", self.kind, self.message)
    }
}

/// Task a workspace can be asked to perform through [`Command::SetKwsTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KwsTask {
    /// Stop all activity.
    Stop,
    /// Load the workspace without connecting.
    Spawn,
    /// Connect and work online.
    WorkOnline,
    /// Disconnect and work offline.
    WorkOffline,
    /// Remove the local copy.
    DeleteLocally,
    /// Delete the workspace on the server.
    DeleteRemotely,
}

impl KwsTask {
    /// Numeric code used on the wire.
    pub const fn code(self) -> u32 {
        match self {
            KwsTask::Stop => 0,
            KwsTask::Spawn => 1,
            KwsTask::WorkOnline => 2,
            KwsTask::WorkOffline => 3,
            KwsTask::DeleteLocally => 4,
            KwsTask::DeleteRemotely => 5,
        }
    }
}

/// A user invited through [`commands::invite_kws`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitee {
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// Key id of the invitee, 0 when unknown.
    #[serde(default)]
    pub key_id: u64,
    /// Organization name, may be empty.
    #[serde(default)]
    pub org_name: String,
    /// Pre-set password, may be empty.
    #[serde(default)]
    pub password: String,
}

/// Builders producing the argument layout of each command.
pub mod commands {
    use super::{Command, Invitee, KwsTask};
    use crate::message::Message;

    /// `RegisterKps(u32 mode, string kps, string email, string password)`.
    pub fn register_kps(mode: u32, kps: &str, email: &str, password: &str) -> Message {
        Command::RegisterKps
            .message()
            .with(mode)
            .with(kps)
            .with(email)
            .with(password)
    }

    /// `CreateKws(string name, u32 flags)`.
    pub fn create_kws(name: &str, flags: u32) -> Message {
        Command::CreateKws.message().with(name).with(flags)
    }

    /// `ExportKws(u64 kws, string path)`. Workspace 0 exports all of them.
    pub fn export_kws(kws_id: u64, path: &str) -> Message {
        Command::ExportKws.message().with(kws_id).with(path)
    }

    /// `ImportKws(string credentials)`.
    pub fn import_kws(credentials: &str) -> Message {
        Command::ImportKws.message().with(credentials)
    }

    /// `LookupRecAddr(u32 count, string address...)`.
    pub fn lookup_rec_addr(addresses: &[String]) -> Message {
        let mut msg = Command::LookupRecAddr.message();
        msg.add_u32(addresses.len() as u32);
        for address in addresses {
            msg.add_string(address.as_str());
        }
        msg
    }

    /// `SetLoginPwd(u64 kws, string password)`.
    pub fn set_login_pwd(kws_id: u64, password: &str) -> Message {
        Command::SetLoginPwd.message().with(kws_id).with(password)
    }

    /// `InviteKws(u64 kws, u32 send_mail, string text, u32 count, invitee...)`
    /// where each invitee is `(string name, string email, u64 key, string org, string pwd)`.
    pub fn invite_kws(kws_id: u64, send_mail: bool, text: &str, invitees: &[Invitee]) -> Message {
        let mut msg = Command::InviteKws.message();
        msg.add_u64(kws_id)
            .add_u32(u32::from(send_mail))
            .add_string(text)
            .add_u32(invitees.len() as u32);
        for invitee in invitees {
            msg.add_string(invitee.name.as_str())
                .add_string(invitee.email.as_str())
                .add_u64(invitee.key_id)
                .add_string(invitee.org_name.as_str())
                .add_string(invitee.password.as_str());
        }
        msg
    }

    /// `ChatPostMsg(u64 kws, u32 channel, string text)`.
    pub fn chat_post_msg(kws_id: u64, channel: u32, text: &str) -> Message {
        Command::ChatPostMsg
            .message()
            .with(kws_id)
            .with(channel)
            .with(text)
    }

    /// `VncCreateSession(u64 kws, u32 share_screen, string subject)`.
    pub fn vnc_create_session(kws_id: u64, share_screen: bool, subject: &str) -> Message {
        Command::VncCreateSession
            .message()
            .with(kws_id)
            .with(u32::from(share_screen))
            .with(subject)
    }

    /// `SetKwsTask(u64 kws, u32 task)`.
    pub fn set_kws_task(kws_id: u64, task: KwsTask) -> Message {
        Command::SetKwsTask
            .message()
            .with(kws_id)
            .with(task.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_are_unique_and_reversible() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(Command::from_code(0), None);
        assert_eq!(CommandName(4).to_string(), "ImportKws");
        assert_eq!(CommandName(77).to_string(), "command(77)");
    }

    #[test]
    fn test_result_kinds_do_not_collide_with_commands() {
        for cmd in Command::ALL {
            assert!(matches!(
                ResultKind::from_code(cmd.code()),
                ResultKind::Other(_)
            ));
        }
        assert_eq!(ResultKind::from_code(ResultKind::Ok.code()), ResultKind::Ok);
    }

    #[test]
    fn test_failure_result_layout() {
        let failure = ProtocolFailure::new(FailureKind::PermissionDenied, "no rights");
        let msg = failure.to_message();

        assert_eq!(ResultKind::from_code(msg.kind()), ResultKind::Failure);
        assert_eq!(msg.u32_at(0), Ok(3));
        assert_eq!(msg.str_at(1), Ok("no rights"));
        assert_eq!(ProtocolFailure::from_message(&msg), Ok(failure));
    }

    #[test]
    fn test_unknown_failure_kind_is_preserved() {
        let msg = ResultKind::Failure.message().with(42u32).with("odd");
        let failure = ProtocolFailure::from_message(&msg).expect("well formed");

        assert_eq!(failure.kind, FailureKind::Unknown(42));
        assert_eq!(failure.kind.code(), 42);
        assert_eq!(failure.to_string(), "failure type Unknown(42), message odd");
    }

    #[test]
    fn test_malformed_failure_is_a_message_error() {
        let msg = ResultKind::Failure.message().with("text first");
        assert!(matches!(
            ProtocolFailure::from_message(&msg),
            Err(MessageError::TypeMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn test_invite_layout() {
        let invitees = vec![Invitee {
            name: "Test 2".into(),
            email: "test2@example.com".into(),
            key_id: 0,
            org_name: String::new(),
            password: String::new(),
        }];
        let msg = commands::invite_kws(1, true, "hello", &invitees);

        assert_eq!(msg.kind(), Command::InviteKws.code());
        assert_eq!(msg.len(), 9);
        assert_eq!(msg.u32_at(3), Ok(1));
        assert_eq!(msg.str_at(5), Ok("test2@example.com"));
    }

    #[test]
    fn test_lookup_layout() {
        let msg = commands::lookup_rec_addr(&["a@example.com".to_string()]);
        assert_eq!(msg.u32_at(0), Ok(1));
        assert_eq!(msg.str_at(1), Ok("a@example.com"));
    }
}
