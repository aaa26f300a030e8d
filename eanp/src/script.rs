//! JSON command scripts.
//!
//! A script lists the commands a tester sends, in order:
//!
//! ```json
//! {
//!   "commands": [
//!     { "command": "create_kws", "name": "test EtFake" },
//!     { "command": "import_kws", "credentials_file": "test.wsl" },
//!     { "command": "set_kws_task", "kws_id": 1, "task": "work_online" }
//!   ]
//! }
//! ```
//!
//! Relative `credentials_file` paths resolve against the directory of the
//! script file when it was loaded with [`Script::load`].

use std::path::{Path, PathBuf};

use eanp_core::protocol::{Invitee, KwsTask, commands};
use eanp_core::{Element, Message};
use serde::{Deserialize, Serialize};

use crate::driver::CommandDriver;

/// Errors raised while loading or compiling a script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The script is not valid JSON or does not match the script schema.
    #[error("invalid script: {0}")]
    Parse(#[from] serde_json::Error),

    /// A file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An `import_kws` command names neither inline credentials nor a file.
    #[error("command {index}: import_kws needs `credentials` or `credentials_file`")]
    MissingCredentials {
        /// Position of the command in the script.
        index: usize,
    },

    /// An `import_kws` command names both inline credentials and a file.
    #[error("command {index}: import_kws takes `credentials` or `credentials_file`, not both")]
    AmbiguousCredentials {
        /// Position of the command in the script.
        index: usize,
    },
}

/// One scripted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ScriptCommand {
    /// Register with a key server.
    RegisterKps {
        /// Registration mode.
        mode: u32,
        /// Key server name.
        kps: String,
        /// User email.
        email: String,
        /// User password.
        password: String,
    },
    /// Create a workspace.
    CreateKws {
        /// Workspace name.
        name: String,
        /// Creation flags.
        #[serde(default)]
        flags: u32,
    },
    /// Export a workspace, or every workspace when `kws_id` is 0.
    ExportKws {
        /// Workspace id.
        #[serde(default)]
        kws_id: u64,
        /// Destination path on the peer.
        path: String,
    },
    /// Import workspace credentials, inline or from a local file.
    ImportKws {
        /// Inline credentials.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<String>,
        /// Local file holding the credentials.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials_file: Option<PathBuf>,
    },
    /// Resolve recipient addresses.
    LookupRecAddr {
        /// Addresses to resolve.
        addresses: Vec<String>,
    },
    /// Set the login password of a workspace.
    SetLoginPwd {
        /// Workspace id.
        kws_id: u64,
        /// New password.
        password: String,
    },
    /// Invite users to a workspace.
    InviteKws {
        /// Workspace id.
        kws_id: u64,
        /// Whether the peer mails the invitations.
        #[serde(default)]
        send_mail: bool,
        /// Invitation text.
        #[serde(default)]
        text: String,
        /// Invited users.
        invitees: Vec<Invitee>,
    },
    /// Post a chat message.
    ChatPostMsg {
        /// Workspace id.
        kws_id: u64,
        /// Chat channel.
        #[serde(default)]
        channel: u32,
        /// Message text.
        text: String,
    },
    /// Start a screen sharing session.
    VncCreateSession {
        /// Workspace id.
        kws_id: u64,
        /// Share the local screen rather than view the remote one.
        #[serde(default)]
        share_screen: bool,
        /// Session subject.
        subject: String,
    },
    /// Change the task of a workspace.
    SetKwsTask {
        /// Workspace id.
        kws_id: u64,
        /// Task to perform.
        task: KwsTask,
    },
    /// Any message, given by type tag and elements.
    Raw {
        /// Message type tag.
        kind: u32,
        /// Message elements, in order.
        #[serde(default)]
        elements: Vec<Element>,
    },
}

/// An ordered list of commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    /// Commands in send order.
    pub commands: Vec<ScriptCommand>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl Script {
    /// Script with the given commands.
    pub fn new(commands: Vec<ScriptCommand>) -> Self {
        Self {
            commands,
            base_dir: None,
        }
    }

    /// Parse a script from JSON text.
    pub fn from_json(json: &str) -> Result<Self, ScriptError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a script file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut script = Self::from_json(&json)?;
        script.base_dir = path.parent().map(Path::to_path_buf);
        Ok(script)
    }

    /// The script run when none is given: a workspace round trip that needs
    /// no local files.
    pub fn sample() -> Self {
        Self::new(vec![
            ScriptCommand::RegisterKps {
                mode: 1,
                kps: "deploy".to_string(),
                email: "test1@teambox.co".to_string(),
                password: "test1".to_string(),
            },
            ScriptCommand::CreateKws {
                name: "test EtFake".to_string(),
                flags: 0,
            },
            ScriptCommand::LookupRecAddr {
                addresses: vec!["test2@teambox.co".to_string()],
            },
            ScriptCommand::ChatPostMsg {
                kws_id: 1,
                channel: 0,
                text: "Hey there".to_string(),
            },
            ScriptCommand::SetKwsTask {
                kws_id: 1,
                task: KwsTask::WorkOnline,
            },
        ])
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the script has no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Build the command messages, in order.
    ///
    /// Credential files are read here, so a missing file fails the whole
    /// script before anything is sent.
    pub fn compile(&self) -> Result<Vec<Message>, ScriptError> {
        self.commands
            .iter()
            .enumerate()
            .map(|(index, command)| self.compile_one(index, command))
            .collect()
    }

    /// Compile the script and queue every command on `driver`.
    pub fn enqueue_into(&self, driver: &CommandDriver) -> Result<usize, ScriptError> {
        let messages = self.compile()?;
        let count = messages.len();
        for message in messages {
            driver.enqueue(message);
        }
        Ok(count)
    }

    fn compile_one(&self, index: usize, command: &ScriptCommand) -> Result<Message, ScriptError> {
        let message = match command {
            ScriptCommand::RegisterKps {
                mode,
                kps,
                email,
                password,
            } => commands::register_kps(*mode, kps, email, password),
            ScriptCommand::CreateKws { name, flags } => commands::create_kws(name, *flags),
            ScriptCommand::ExportKws { kws_id, path } => commands::export_kws(*kws_id, path),
            ScriptCommand::ImportKws {
                credentials,
                credentials_file,
            } => match (credentials, credentials_file) {
                (Some(inline), None) => commands::import_kws(inline),
                (None, Some(file)) => commands::import_kws(&self.read_credentials(file)?),
                (None, None) => return Err(ScriptError::MissingCredentials { index }),
                (Some(_), Some(_)) => return Err(ScriptError::AmbiguousCredentials { index }),
            },
            ScriptCommand::LookupRecAddr { addresses } => commands::lookup_rec_addr(addresses),
            ScriptCommand::SetLoginPwd { kws_id, password } => {
                commands::set_login_pwd(*kws_id, password)
            }
            ScriptCommand::InviteKws {
                kws_id,
                send_mail,
                text,
                invitees,
            } => commands::invite_kws(*kws_id, *send_mail, text, invitees),
            ScriptCommand::ChatPostMsg {
                kws_id,
                channel,
                text,
            } => commands::chat_post_msg(*kws_id, *channel, text),
            ScriptCommand::VncCreateSession {
                kws_id,
                share_screen,
                subject,
            } => commands::vnc_create_session(*kws_id, *share_screen, subject),
            ScriptCommand::SetKwsTask { kws_id, task } => commands::set_kws_task(*kws_id, *task),
            ScriptCommand::Raw { kind, elements } => {
                let mut message = Message::new(*kind);
                for element in elements {
                    message.push(element.clone());
                }
                message
            }
        };
        Ok(message)
    }

    fn read_credentials(&self, file: &Path) -> Result<String, ScriptError> {
        let path = match &self.base_dir {
            Some(dir) if file.is_relative() => dir.join(file),
            _ => file.to_path_buf(),
        };
        std::fs::read_to_string(&path).map_err(|source| ScriptError::Io { path, source })
    }
}
