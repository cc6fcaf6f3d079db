//! Scripted in-memory transport (testing only).
//!
//! `ScriptedTransport` answers commands from a list of rules and records
//! every command it receives, so executor and orchestrator behaviour can be
//! asserted without a network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use berth_stage::ExecutionTarget;

use crate::error::ConnectionError;
use crate::transport::{CommandOutput, Session, Transport};

/// How the fake answers a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Exit { code: i32, stdout: String },
    /// Sleep, then exit with `code`.
    Delayed { delay: Duration, code: i32 },
    /// Never completes.
    Hang,
    /// Terminated by a signal.
    Killed,
    /// The connection drops mid-command.
    Lost,
    /// The session task panics.
    Panic,
}

impl Reply {
    pub fn ok() -> Self {
        Self::exit(0)
    }

    pub fn exit(code: i32) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Reply::Exit {
            code: 0,
            stdout: text.into(),
        }
    }

    pub fn delayed(delay: Duration, code: i32) -> Self {
        Reply::Delayed { delay, code }
    }
}

/// How the fake answers a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    Accept,
    Refuse(String),
    Hang,
}

/// A command the fake received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub host: String,
    pub command: String,
}

#[derive(Debug)]
struct Rule {
    host: Option<String>,
    pattern: String,
    reply: Reply,
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<Rule>,
    connect: HashMap<String, ConnectBehavior>,
    log: Vec<ExecRecord>,
    opened: usize,
    closed: usize,
}

impl Script {
    fn reply_for(&self, host: &str, command: &str) -> Reply {
        self.rules
            .iter()
            .find(|r| {
                r.host.as_deref().map_or(true, |h| h == host) && command.contains(&r.pattern)
            })
            .map(|r| r.reply.clone())
            .unwrap_or_else(Reply::ok)
    }
}

/// Transport answering from rules. Unmatched commands exit 0.
///
/// Rules are matched in insertion order; a rule matches when its pattern is a
/// substring of the rendered command (and its host matches, if set).
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer commands containing `pattern` on any host.
    pub fn on(self, pattern: impl Into<String>, reply: Reply) -> Self {
        self.script().rules.push(Rule {
            host: None,
            pattern: pattern.into(),
            reply,
        });
        self
    }

    /// Answer commands containing `pattern` on `host` only.
    pub fn on_host(self, host: impl Into<String>, pattern: impl Into<String>, reply: Reply) -> Self {
        self.script().rules.push(Rule {
            host: Some(host.into()),
            pattern: pattern.into(),
            reply,
        });
        self
    }

    pub fn refuse(self, host: impl Into<String>, reason: impl Into<String>) -> Self {
        self.script()
            .connect
            .insert(host.into(), ConnectBehavior::Refuse(reason.into()));
        self
    }

    pub fn hang_connect(self, host: impl Into<String>) -> Self {
        self.script()
            .connect
            .insert(host.into(), ConnectBehavior::Hang);
        self
    }

    /// Every command received, in arrival order.
    pub fn exec_log(&self) -> Vec<ExecRecord> {
        self.script().log.clone()
    }

    /// Commands received by one host, in arrival order.
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.script()
            .log
            .iter()
            .filter(|r| r.host == host)
            .map(|r| r.command.clone())
            .collect()
    }

    /// Number of received commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.script()
            .log
            .iter()
            .filter(|r| r.command.contains(pattern))
            .count()
    }

    pub fn sessions_opened(&self) -> usize {
        self.script().opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.script().closed
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, target: &ExecutionTarget) -> Result<Box<dyn Session>, ConnectionError> {
        let host = target.host().to_string();
        let behavior = self
            .script()
            .connect
            .get(&host)
            .cloned()
            .unwrap_or(ConnectBehavior::Accept);

        match behavior {
            ConnectBehavior::Accept => {
                self.script().opened += 1;
                Ok(Box::new(ScriptedSession {
                    host,
                    script: Arc::clone(&self.script),
                    closed: false,
                }))
            }
            ConnectBehavior::Refuse(reason) => Err(ConnectionError::Failed { host, reason }),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }
}

struct ScriptedSession {
    host: String,
    script: Arc<Mutex<Script>>,
    closed: bool,
}

impl ScriptedSession {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ConnectionError> {
        let reply = {
            let mut script = self.script();
            script.log.push(ExecRecord {
                host: self.host.clone(),
                command: command.to_string(),
            });
            script.reply_for(&self.host, command)
        };

        match reply {
            Reply::Exit { code, stdout } => Ok(CommandOutput {
                exit_code: Some(code),
                stdout,
                stderr: String::new(),
            }),
            Reply::Delayed { delay, code } => {
                tokio::time::sleep(delay).await;
                Ok(CommandOutput::exited(code))
            }
            Reply::Hang => std::future::pending().await,
            Reply::Killed => Ok(CommandOutput::default()),
            Reply::Lost => Err(ConnectionError::Lost {
                host: self.host.clone(),
                reason: "connection reset by peer".to_string(),
            }),
            Reply::Panic => panic!("scripted panic on {}", self.host),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.script().closed += 1;
        }
    }
}
