use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uplink_protocol::{
    BridgeSessionInfo, DependencySpec, Event, LogChannel, PromptDescriptor, ResponseEnvelope,
    SessionId, SessionState,
};

use crate::error::UplinkError;
use crate::gate::{PromptAnswer, ResponseGate};
use crate::logsink::LogSink;
use crate::resolver::DependencyResolver;
use crate::translator::{Classified, PromptTranslator};

/// Environment variable telling the wrapped tool where its configuration
/// lives.
pub const BASE_DIR_ENV: &str = "UPLINK_BASE_DIR";

const READ_BUF_SIZE: usize = 4096;

/// Options for launching a bridged subprocess.
#[derive(Debug, Clone)]
pub struct SessionCreateOptions {
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Binaries that must resolve before any session launches.
    pub required: Vec<DependencySpec>,
    /// Quiet period after which held, unrecognized output is surfaced as a
    /// best-effort prompt.
    pub idle_threshold: Duration,
    /// How long a cancelled subprocess gets to exit before a hard kill.
    pub kill_grace: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            idle_threshold: Duration::from_millis(1500),
            kill_grace: Duration::from_secs(3),
        }
    }
}

struct SessionEntry {
    label: Option<String>,
    exec: String,
    args: Vec<String>,
    created_at: SystemTime,
    state: SessionState,
    exit_code: Option<i32>,
    failure: Option<String>,
    gate: Arc<ResponseGate>,
    cancel: CancellationToken,
}

impl SessionEntry {
    fn to_info(&self, id: &SessionId) -> BridgeSessionInfo {
        BridgeSessionInfo {
            id: id.clone(),
            label: self.label.clone(),
            exec: self.exec.clone(),
            args: self.args.clone(),
            state: self.state,
            created_at_epoch_ms: self
                .created_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            exit_code: self.exit_code,
            failure: self.failure.clone(),
        }
    }
}

/// Owns every bridged subprocess: launch, output classification, prompt
/// mediation, cancellation, exit capture. Cheap to clone; clones share the
/// same session table.
#[derive(Clone)]
pub struct SessionManager {
    config: SessionManagerConfig,
    resolver: Arc<DependencyResolver>,
    sink: Arc<LogSink>,
    events: broadcast::Sender<Event>,
    sessions: Arc<tokio::sync::Mutex<HashMap<SessionId, SessionEntry>>>,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        resolver: Arc<DependencyResolver>,
        sink: Arc<LogSink>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            resolver,
            sink,
            events,
            sessions: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Create a session and start driving it in the background. Dependency
    /// preflight and spawn failures surface as the `Failed` state.
    pub async fn create_session(
        &self,
        options: SessionCreateOptions,
    ) -> Result<SessionId, UplinkError> {
        if options.exec.trim().is_empty() {
            return Err(UplinkError::SpawnFailed("empty exec".to_string()));
        }

        let id: SessionId = uuid::Uuid::new_v4().to_string();
        let entry = SessionEntry {
            label: options.label.clone(),
            exec: options.exec.clone(),
            args: options.args.clone(),
            created_at: SystemTime::now(),
            state: SessionState::Starting,
            exit_code: None,
            failure: None,
            gate: Arc::new(ResponseGate::new()),
            cancel: CancellationToken::new(),
        };
        self.sessions.lock().await.insert(id.clone(), entry);
        self.emit_state(&id).await;
        self.sink
            .write(&id, LogChannel::Bridge, format!("session created: {}", options.exec));
        info!(session_id = %id, exec = %options.exec, "session created");

        let manager = self.clone();
        let session_id = id.clone();
        tokio::spawn(async move {
            manager.run_session(session_id, options).await;
        });
        Ok(id)
    }

    /// The currently outstanding prompt for a session, if any.
    pub async fn awaiting(&self, id: &SessionId) -> Result<Option<PromptDescriptor>, UplinkError> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(id)
            .ok_or_else(|| UplinkError::SessionNotFound(id.clone()))?;
        Ok(entry.gate.awaiting())
    }

    /// Submit an operator answer to the outstanding prompt.
    pub async fn submit_response(
        &self,
        id: &SessionId,
        envelope: ResponseEnvelope,
    ) -> Result<(), UplinkError> {
        let gate = {
            let sessions = self.sessions.lock().await;
            let entry = sessions
                .get(id)
                .ok_or_else(|| UplinkError::SessionNotFound(id.clone()))?;
            if matches!(entry.state, SessionState::Exited | SessionState::Failed) {
                return Err(UplinkError::SessionExited(id.clone()));
            }
            Arc::clone(&entry.gate)
        };
        gate.submit(envelope)
    }

    /// Request cancellation: resolves any outstanding prompt with the
    /// sentinel and signals the subprocess. Idempotent.
    pub async fn cancel_session(&self, id: &SessionId) -> Result<(), UplinkError> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(id)
            .ok_or_else(|| UplinkError::SessionNotFound(id.clone()))?;
        entry.cancel.cancel();
        Ok(())
    }

    pub async fn session_info(&self, id: &SessionId) -> Result<BridgeSessionInfo, UplinkError> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(id)
            .ok_or_else(|| UplinkError::SessionNotFound(id.clone()))?;
        Ok(entry.to_info(id))
    }

    pub async fn list_sessions(&self) -> Vec<BridgeSessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<BridgeSessionInfo> =
            sessions.iter().map(|(id, e)| e.to_info(id)).collect();
        infos.sort_by_key(|info| info.created_at_epoch_ms);
        infos
    }

    /// Subscribe to the event stream. Session existence is checked so a
    /// client cannot silently watch a session that never was.
    pub async fn subscribe(
        &self,
        id: &SessionId,
    ) -> Result<broadcast::Receiver<Event>, UplinkError> {
        let sessions = self.sessions.lock().await;
        if !sessions.contains_key(id) {
            return Err(UplinkError::SessionNotFound(id.clone()));
        }
        Ok(self.events.subscribe())
    }

    async fn run_session(self, id: SessionId, options: SessionCreateOptions) {
        // Preflight: every required binary must resolve before launch.
        let required = self.config.required.clone();
        if let Err(err) = self.resolver.ensure_all(&required).await {
            self.fail_session(&id, format!("dependency resolution failed: {err}"))
                .await;
            return;
        }

        let mut cmd = tokio::process::Command::new(&options.exec);
        cmd.args(&options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in self.resolver.published_env() {
            cmd.env(key, value);
        }
        if let Some(dir) = &options.config_dir {
            cmd.env(BASE_DIR_ENV, dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.fail_session(&id, format!("failed to spawn {}: {err}", options.exec))
                    .await;
                return;
            }
        };

        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            self.fail_session(&id, "subprocess stdio unavailable".to_string())
                .await;
            return;
        };

        let Some((gate, cancel)) = self.session_parts(&id).await else {
            let _ = child.start_kill();
            return;
        };

        self.set_state(&id, SessionState::Running).await;
        self.sink.write(
            &id,
            LogChannel::Bridge,
            format!("session started: {} {}", options.exec, options.args.join(" ")),
        );

        let mut translator = PromptTranslator::new(self.config.idle_threshold);
        let mut deferred: VecDeque<PromptDescriptor> = VecDeque::new();
        let mut pending: Option<(u64, oneshot::Receiver<PromptAnswer>)> = None;
        let mut out_buf = [0u8; READ_BUF_SIZE];
        let mut err_buf = [0u8; READ_BUF_SIZE];
        let mut stderr_line: Vec<u8> = Vec::new();
        let mut out_seq = 0u64;
        let mut err_seq = 0u64;
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut cancelling = false;

        loop {
            // Free slot: promote the next deferred prompt.
            if pending.is_none() && !cancelling {
                if let Some(descriptor) = deferred.pop_front() {
                    self.arm_or_defer(&id, &gate, descriptor, &mut pending, &mut deferred)
                        .await;
                }
            }

            if !stdout_open && !stderr_open {
                // Streams are gone; nothing can answer an outstanding prompt
                // anymore, so resolve it with the sentinel instead of hanging.
                deferred.clear();
                pending = None;
                if let Some(prompt_id) = gate.cancel() {
                    let _ = self.events.send(Event::PromptResolved {
                        session_id: id.clone(),
                        prompt_id,
                        cancelled: true,
                    });
                }
                break;
            }

            let stall_at = if pending.is_none() && deferred.is_empty() && !cancelling {
                translator.idle_deadline()
            } else {
                None
            };

            tokio::select! {
                _ = cancel.cancelled(), if !cancelling => {
                    cancelling = true;
                    deferred.clear();
                    pending = None;
                    if let Some(prompt_id) = gate.cancel() {
                        let _ = self.events.send(Event::PromptResolved {
                            session_id: id.clone(),
                            prompt_id,
                            cancelled: true,
                        });
                    }
                    self.sink.write(&id, LogChannel::Bridge, "cancellation requested");
                    self.set_state(&id, SessionState::Exiting).await;
                    if let Err(err) = child.start_kill() {
                        warn!(session_id = %id, error = %err, "failed to signal subprocess");
                    }
                }

                (prompt_id, answer) = wait_answer(&mut pending), if pending.is_some() => {
                    pending = None;
                    match answer {
                        PromptAnswer::Value(value) => {
                            let _ = self.events.send(Event::PromptResolved {
                                session_id: id.clone(),
                                prompt_id,
                                cancelled: false,
                            });
                            self.sink.write(
                                &id,
                                LogChannel::Bridge,
                                format!("prompt {prompt_id} answered"),
                            );
                            self.set_state(&id, SessionState::Running).await;
                            if let Err(err) = write_answer(&mut stdin, &value).await {
                                warn!(session_id = %id, error = %err, "stdin write failed");
                            }
                        }
                        PromptAnswer::Cancelled => {
                            let _ = self.events.send(Event::PromptResolved {
                                session_id: id.clone(),
                                prompt_id,
                                cancelled: true,
                            });
                        }
                    }
                }

                result = stdout.read(&mut out_buf), if stdout_open => {
                    match result {
                        Ok(0) => stdout_open = false,
                        Ok(n) => {
                            out_seq += 1;
                            let _ = self.events.send(Event::Output {
                                session_id: id.clone(),
                                seq: out_seq,
                                channel: LogChannel::Stdout,
                                data: out_buf[..n].to_vec(),
                            });
                            translator.push(&out_buf[..n]);
                            self.drain_translator(
                                &id,
                                &gate,
                                &mut translator,
                                &mut pending,
                                &mut deferred,
                                cancelling,
                            )
                            .await;
                        }
                        Err(err) => {
                            debug!(session_id = %id, error = %err, "stdout read error");
                            stdout_open = false;
                        }
                    }
                }

                result = stderr.read(&mut err_buf), if stderr_open => {
                    match result {
                        Ok(0) => stderr_open = false,
                        Ok(n) => {
                            err_seq += 1;
                            let _ = self.events.send(Event::Output {
                                session_id: id.clone(),
                                seq: err_seq,
                                channel: LogChannel::Stderr,
                                data: err_buf[..n].to_vec(),
                            });
                            stderr_line.extend_from_slice(&err_buf[..n]);
                            self.flush_stderr_lines(&id, &mut stderr_line);
                        }
                        Err(err) => {
                            debug!(session_id = %id, error = %err, "stderr read error");
                            stderr_open = false;
                        }
                    }
                }

                _ = tokio::time::sleep_until(stall_at.unwrap_or_else(Instant::now)),
                    if stall_at.is_some() =>
                {
                    if let Some(descriptor) = translator.take_stalled() {
                        self.sink.write(
                            &id,
                            LogChannel::Bridge,
                            "unrecognized output stalled, surfacing free-text prompt",
                        );
                        self.arm_or_defer(&id, &gate, descriptor, &mut pending, &mut deferred)
                            .await;
                    }
                }
            }
        }

        // Flush whatever is still buffered before recording the exit.
        while let Some(classified) = translator.poll() {
            let text = match classified {
                Classified::Log(line) => line,
                Classified::Prompt(descriptor) => descriptor.text,
            };
            self.sink.write(&id, LogChannel::Stdout, text);
        }
        if let Some(tail) = translator.drain_remainder() {
            self.sink.write(&id, LogChannel::Stdout, tail);
        }
        if !stderr_line.is_empty() {
            let tail = String::from_utf8_lossy(&stderr_line).to_string();
            self.sink.write(&id, LogChannel::Stderr, tail);
        }

        if !cancelling {
            self.set_state(&id, SessionState::Exiting).await;
        }

        let status = if cancelling {
            match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(session_id = %id, "termination grace expired, killing subprocess");
                    if let Err(err) = child.kill().await {
                        warn!(session_id = %id, error = %err, "kill failed");
                    }
                    child.wait().await
                }
            }
        } else {
            child.wait().await
        };

        match status {
            Ok(status) => {
                let code = status.code();
                let failure = match code {
                    Some(0) => None,
                    Some(n) => Some(format!("process exited with code {n}")),
                    None if cancelling => Some("cancelled by request".to_string()),
                    None => Some("process terminated by signal".to_string()),
                };
                self.finish_session(&id, code, failure).await;
            }
            Err(err) => {
                self.fail_session(&id, format!("failed to collect exit status: {err}"))
                    .await;
            }
        }
    }

    async fn drain_translator(
        &self,
        id: &SessionId,
        gate: &Arc<ResponseGate>,
        translator: &mut PromptTranslator,
        pending: &mut Option<(u64, oneshot::Receiver<PromptAnswer>)>,
        deferred: &mut VecDeque<PromptDescriptor>,
        cancelling: bool,
    ) {
        while let Some(classified) = translator.poll() {
            match classified {
                Classified::Log(line) => {
                    self.sink.write(id, LogChannel::Stdout, line);
                }
                Classified::Prompt(descriptor) => {
                    if cancelling {
                        self.sink.write(id, LogChannel::Stdout, descriptor.text);
                        continue;
                    }
                    self.arm_or_defer(id, gate, descriptor, pending, deferred).await;
                }
            }
        }
    }

    async fn arm_or_defer(
        &self,
        id: &SessionId,
        gate: &Arc<ResponseGate>,
        descriptor: PromptDescriptor,
        pending: &mut Option<(u64, oneshot::Receiver<PromptAnswer>)>,
        deferred: &mut VecDeque<PromptDescriptor>,
    ) {
        if pending.is_some() {
            deferred.push_back(descriptor);
            return;
        }
        match gate.arm(descriptor.clone()) {
            Ok(rx) => {
                *pending = Some((descriptor.id, rx));
                self.set_state(id, SessionState::AwaitingResponse).await;
                self.sink.write(
                    id,
                    LogChannel::Bridge,
                    format!("prompt {} ready ({:?})", descriptor.id, descriptor.kind),
                );
                let _ = self.events.send(Event::PromptReady {
                    session_id: id.clone(),
                    descriptor,
                });
            }
            Err(err) => {
                warn!(session_id = %id, error = %err, "prompt slot busy, deferring");
                deferred.push_back(descriptor);
            }
        }
    }

    fn flush_stderr_lines(&self, id: &SessionId, buffer: &mut Vec<u8>) {
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line)
                .trim_end_matches(['\n', '\r'])
                .to_string();
            self.sink.write(id, LogChannel::Stderr, text);
        }
    }

    async fn session_parts(
        &self,
        id: &SessionId,
    ) -> Option<(Arc<ResponseGate>, CancellationToken)> {
        let sessions = self.sessions.lock().await;
        let entry = sessions.get(id)?;
        Some((Arc::clone(&entry.gate), entry.cancel.clone()))
    }

    async fn set_state(&self, id: &SessionId, state: SessionState) {
        {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(id) else {
                return;
            };
            if entry.state == state {
                return;
            }
            entry.state = state;
        }
        self.emit_state(id).await;
    }

    async fn finish_session(&self, id: &SessionId, exit_code: Option<i32>, failure: Option<String>) {
        {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(id) else {
                return;
            };
            entry.state = SessionState::Exited;
            entry.exit_code = exit_code;
            entry.failure = failure.clone();
            entry.gate.cancel();
        }
        self.emit_state(id).await;
        self.sink.write(
            id,
            LogChannel::Bridge,
            format!("session exited (code: {exit_code:?})"),
        );
        info!(session_id = %id, exit_code = ?exit_code, "session exited");
    }

    async fn fail_session(&self, id: &SessionId, failure: String) {
        {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(id) else {
                return;
            };
            entry.state = SessionState::Failed;
            entry.failure = Some(failure.clone());
            entry.gate.cancel();
        }
        self.emit_state(id).await;
        self.sink.write(id, LogChannel::Bridge, failure.clone());
        warn!(session_id = %id, failure = %failure, "session failed");
    }

    async fn emit_state(&self, id: &SessionId) {
        let sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(id) {
            let _ = self.events.send(Event::SessionState {
                session_id: id.clone(),
                state: entry.state,
                exit_code: entry.exit_code,
                failure: entry.failure.clone(),
            });
        }
    }
}

async fn wait_answer(
    pending: &mut Option<(u64, oneshot::Receiver<PromptAnswer>)>,
) -> (u64, PromptAnswer) {
    match pending {
        Some((prompt_id, rx)) => {
            let answer = (&mut *rx).await.unwrap_or(PromptAnswer::Cancelled);
            (*prompt_id, answer)
        }
        None => std::future::pending().await,
    }
}

/// Accepted values are line-oriented: the raw value plus a newline.
async fn write_answer(
    stdin: &mut tokio::process::ChildStdin,
    value: &str,
) -> std::io::Result<()> {
    stdin.write_all(value.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadConfig;
    use crate::resolver::ResolverConfig;

    fn test_manager(required: Vec<DependencySpec>) -> (Arc<SessionManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let (events, _) = broadcast::channel(256);
        let resolver = Arc::new(
            DependencyResolver::new(
                ResolverConfig {
                    bundle_dir: None,
                    managed_dir: dir.path().join("bin"),
                    platform: "x86_64-unknown-linux-gnu".to_string(),
                    download: DownloadConfig::default(),
                },
                events.clone(),
            )
            .expect("resolver"),
        );
        let sink = Arc::new(LogSink::open(dir.path().join("logs")).expect("sink"));
        let manager = Arc::new(SessionManager::new(
            SessionManagerConfig {
                required,
                idle_threshold: Duration::from_millis(200),
                kill_grace: Duration::from_secs(2),
            },
            resolver,
            sink,
            events,
        ));
        (manager, dir)
    }

    async fn wait_for_state(
        manager: &Arc<SessionManager>,
        id: &SessionId,
        state: SessionState,
    ) -> BridgeSessionInfo {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let info = manager.session_info(id).await.expect("info");
            if info.state == state {
                return info;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {state:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn spawn_failure_fails_the_session() {
        let (manager, _dir) = test_manager(Vec::new());
        let id = manager
            .create_session(SessionCreateOptions {
                exec: "/nonexistent/uplink-test-binary".to_string(),
                args: Vec::new(),
                cwd: None,
                config_dir: None,
                label: None,
            })
            .await
            .expect("create");

        let info = wait_for_state(&manager, &id, SessionState::Failed).await;
        assert!(info.failure.as_deref().unwrap_or("").contains("spawn"));
        assert_eq!(info.exit_code, None);
    }

    #[tokio::test]
    async fn dependency_preflight_failure_skips_launch() {
        let spec = DependencySpec {
            name: "missingtool".to_string(),
            required_version: None,
            platform: "x86_64-unknown-linux-gnu".to_string(),
            source_urls: Vec::new(),
            sha256: None,
        };
        let (manager, _dir) = test_manager(vec![spec]);
        let id = manager
            .create_session(SessionCreateOptions {
                exec: "true".to_string(),
                args: Vec::new(),
                cwd: None,
                config_dir: None,
                label: None,
            })
            .await
            .expect("create");

        let info = wait_for_state(&manager, &id, SessionState::Failed).await;
        assert!(
            info.failure
                .as_deref()
                .unwrap_or("")
                .contains("dependency resolution failed")
        );
    }

    #[tokio::test]
    async fn empty_exec_is_rejected_up_front() {
        let (manager, _dir) = test_manager(Vec::new());
        let err = manager
            .create_session(SessionCreateOptions {
                exec: "  ".to_string(),
                args: Vec::new(),
                cwd: None,
                config_dir: None,
                label: None,
            })
            .await
            .expect_err("must reject");
        assert!(matches!(err, UplinkError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn unknown_session_operations_error() {
        let (manager, _dir) = test_manager(Vec::new());
        let missing = "no-such-session".to_string();
        assert!(matches!(
            manager.cancel_session(&missing).await,
            Err(UplinkError::SessionNotFound(_))
        ));
        assert!(matches!(
            manager.awaiting(&missing).await,
            Err(UplinkError::SessionNotFound(_))
        ));
        assert!(matches!(
            manager.subscribe(&missing).await,
            Err(UplinkError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn natural_exit_records_code_and_state() {
        let (manager, _dir) = test_manager(Vec::new());
        let id = manager
            .create_session(SessionCreateOptions {
                exec: "sh".to_string(),
                args: vec!["-c".to_string(), "echo done; exit 3".to_string()],
                cwd: None,
                config_dir: None,
                label: Some("short".to_string()),
            })
            .await
            .expect("create");

        let info = wait_for_state(&manager, &id, SessionState::Exited).await;
        assert_eq!(info.exit_code, Some(3));
        assert!(info.failure.as_deref().unwrap_or("").contains("code 3"));

        let listed = manager.list_sessions().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].label.as_deref(), Some("short"));
    }
}
