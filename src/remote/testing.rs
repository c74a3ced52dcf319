//! Scripted stand-ins for SSH hosts, shared by the unit tests.

use crate::error_handling::types::RemoteError;
use crate::remote::host_key_verifier::HostKeyVerifier;
use crate::remote::remote_session::{
    ConnectionDetails, ExecStatus, OutputStream, RemoteAuth, RemoteConnector, RemoteEntry,
    RemoteSession,
};
use crate::session_management::active_session::ActiveSession;
use crate::session_management::session::{SessionKey, SessionMetadata};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn details(host: &str) -> ConnectionDetails {
    ConnectionDetails {
        host: host.to_string(),
        port: 22,
        username: "deploy".to_string(),
        auth: RemoteAuth::Password("hunter2".to_string()),
    }
}

pub fn session_key() -> SessionKey {
    SessionKey {
        user_id: uuid::Uuid::new_v4(),
        resource_id: uuid::Uuid::new_v4(),
        resource_type: "SSH".to_string(),
    }
}

/// A live session for `key` wrapping `connection`, as the registry would hand it out.
pub fn active_session(key: SessionKey, connection: Arc<FakeRemoteSession>) -> ActiveSession {
    let now = Utc::now();
    ActiveSession {
        key,
        metadata: SessionMetadata {
            session_id: uuid::Uuid::new_v4(),
            token: "token".to_string(),
            created_at: now,
            last_accessed_time: now,
            expires_at: now + chrono::Duration::minutes(5),
            hosting_instance_id: "instance-test".to_string(),
            host: connection.host().to_string(),
            port: 22,
            username: "deploy".to_string(),
        },
        connection,
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeCommand {
    pub stdout: Vec<String>,
    pub stderr: String,
    pub exit_status: i32,
    /// Never finishes on its own; only the deadline ends it.
    pub hang: bool,
}

pub struct FakeRemoteSession {
    host: String,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub command: Mutex<FakeCommand>,
    pub fail_exec: AtomicBool,
    pub fail_io: AtomicBool,
    pub connected: AtomicBool,
    pub exec_calls: AtomicUsize,
    pub io_calls: AtomicUsize,
}

impl FakeRemoteSession {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            files: Mutex::new(HashMap::new()),
            command: Mutex::new(FakeCommand::default()),
            fail_exec: AtomicBool::new(false),
            fail_io: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            exec_calls: AtomicUsize::new(0),
            io_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_file(self, path: &str, bytes: Vec<u8>) -> Self {
        self.files.lock().unwrap().insert(path.to_string(), bytes);
        self
    }

    pub fn set_command(&self, command: FakeCommand) {
        *self.command.lock().unwrap() = command;
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    fn check_io(&self) -> Result<(), RemoteError> {
        self.io_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_io.load(Ordering::SeqCst) {
            return Err(RemoteError::ChunkIo(format!("{}: connection reset", self.host)));
        }
        Ok(())
    }
}

impl RemoteSession for FakeRemoteSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn exec(
        &self,
        _command: &str,
        deadline: Instant,
        output: &mut dyn FnMut(OutputStream, &[u8]),
    ) -> Result<ExecStatus, RemoteError> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(RemoteError::RemoteExecution(format!(
                "{}: channel refused",
                self.host
            )));
        }
        let script = self.command.lock().unwrap().clone();
        for piece in &script.stdout {
            output(OutputStream::Stdout, piece.as_bytes());
        }
        if !script.stderr.is_empty() {
            output(OutputStream::Stderr, script.stderr.as_bytes());
        }
        if script.hang {
            while Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            return Ok(ExecStatus::TimedOut);
        }
        Ok(ExecStatus::Exited(script.exit_status))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.check_io()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let files = self.files.lock().unwrap();
        let mut entries: Vec<RemoteEntry> = files
            .iter()
            .filter_map(|(name, bytes)| {
                let rest = name.strip_prefix(&prefix)?;
                (!rest.contains('/')).then(|| RemoteEntry {
                    name: rest.to_string(),
                    is_dir: false,
                    size: Some(bytes.len() as u64),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn file_size(&self, path: &str) -> Result<u64, RemoteError> {
        self.check_io()?;
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|bytes| bytes.len() as u64)
            .ok_or_else(|| RemoteError::ChunkIo(format!("{}: no such file", path)))
    }

    fn get_file(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, RemoteError> {
        self.check_io()?;
        let files = self.files.lock().unwrap();
        let bytes = files
            .get(path)
            .ok_or_else(|| RemoteError::ChunkIo(format!("{}: no such file", path)))?;
        let start = (offset as usize).min(bytes.len());
        let end = (start + len as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    fn put_file(&self, local: &Path, remote_path: &str) -> Result<u64, RemoteError> {
        self.check_io()?;
        let bytes = std::fs::read(local).map_err(|e| RemoteError::ChunkIo(e.to_string()))?;
        let len = bytes.len() as u64;
        self.files
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), bytes);
        Ok(len)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Hands out `FakeRemoteSession`s and keeps them for inspection.
pub struct FakeConnector {
    pub host_key: Vec<u8>,
    pub refuse: AtomicBool,
    pub opened: Mutex<Vec<Arc<FakeRemoteSession>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            host_key: b"fake-ed25519-host-key".to_vec(),
            refuse: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn last(&self) -> Arc<FakeRemoteSession> {
        self.opened
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session was opened")
    }

    pub fn opened_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }
}

impl RemoteConnector for FakeConnector {
    fn open(
        &self,
        details: &ConnectionDetails,
        verifier: &HostKeyVerifier,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        verifier.verify(&details.host, details.port, "ssh-ed25519", &self.host_key)?;
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RemoteError::ConnectionFailed {
                host: details.host.clone(),
                reason: "connection refused".to_string(),
            });
        }
        let session = Arc::new(FakeRemoteSession::new(&details.host));
        self.opened.lock().unwrap().push(session.clone());
        Ok(session)
    }
}
