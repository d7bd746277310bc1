//! Subprocess management and JSON IPC for the CANoe COM bridge process.
//!
//! The bridge is a Windows executable that owns the `IDispatch` pointers. On
//! Linux it is launched under WINE; on Windows it runs directly.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use canoe_com_protocol::{
    AppIdentity, Command as BridgeCommand, Entry, ObjectHandle, Request, Response, ResponseData,
    ResponseResult, Value,
};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::remote::{Connector, RemoteApplication};

const BRIDGE_EXE: &str = "canoe-com-bridge.exe";

/// Configuration for the CANoe COM bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Path to the `canoe-com-bridge.exe` Windows executable.
    /// If None, will search in common locations relative to the current binary.
    pub bridge_exe_path: Option<PathBuf>,

    /// Program used to run the bridge. Defaults to `wine` off Windows; `None` runs it directly.
    pub launcher: Option<PathBuf>,

    /// Optional WINEPREFIX to use (for isolating the WINE environment).
    pub wine_prefix: Option<PathBuf>,

    /// COM ProgID of the application object.
    pub prog_id: String,

    /// Seconds to wait for each bridge response.
    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge_exe_path: None,
            launcher: if cfg!(windows) {
                None
            } else {
                Some(PathBuf::from("wine"))
            },
            wine_prefix: None,
            prog_id: "CANoe.Application".to_string(),
            timeout_secs: 30,
        }
    }
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Opens a new bridge process per connect.
#[derive(Debug, Clone, Default)]
pub struct BridgeConnector {
    config: BridgeConfig,
}

impl BridgeConnector {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl Connector for BridgeConnector {
    fn open(&mut self) -> Result<Box<dyn RemoteApplication>, RemoteError> {
        Ok(Box::new(BridgeProcess::start(&self.config)?))
    }
}

/// A running bridge process attached to one application instance.
pub struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    responses: Receiver<std::io::Result<String>>,
    next_id: u64,
    /// Timed-out requests still owed a reply, oldest first.
    abandoned: VecDeque<u64>,
    timeout: Duration,
    identity: AppIdentity,
    released: bool,
}

impl BridgeProcess {
    /// Start the bridge process and attach to the application.
    pub fn start(config: &BridgeConfig) -> Result<Self, RemoteError> {
        let exe_path = config
            .bridge_exe_path
            .clone()
            .unwrap_or_else(find_bridge_exe);

        if !exe_path.exists() {
            return Err(RemoteError::BridgeExeNotFound(
                exe_path.display().to_string(),
            ));
        }

        let mut cmd = match &config.launcher {
            Some(launcher) => {
                let mut cmd = std::process::Command::new(launcher);
                cmd.arg(&exe_path);
                cmd
            }
            None => std::process::Command::new(&exe_path),
        };

        if let Some(prefix) = &config.wine_prefix {
            cmd.env("WINEPREFIX", prefix);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit()); // Bridge diagnostics go to our stderr

        tracing::debug!("Starting CANoe bridge: {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| match (&config.launcher, e.kind()) {
            (Some(launcher), std::io::ErrorKind::NotFound) => {
                RemoteError::LauncherNotFound(launcher.display().to_string())
            }
            _ => RemoteError::SpawnFailed(e),
        })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                return Err(RemoteError::Transport("bridge stdio not captured".into()));
            }
        };

        // Responses are read on a separate thread so each call can wait with a deadline.
        let (tx, responses) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut bridge = Self {
            child,
            stdin,
            responses,
            next_id: 1,
            abandoned: VecDeque::new(),
            timeout: config.timeout(),
            identity: AppIdentity {
                name: String::new(),
                version: String::new(),
            },
            released: false,
        };

        let init = bridge.send_command(BridgeCommand::Init {
            prog_id: config.prog_id.clone(),
        });
        match init {
            Ok(Some(ResponseData::Identity(identity))) => {
                bridge.identity = identity;
                Ok(bridge)
            }
            Ok(_) => {
                bridge.kill();
                Err(RemoteError::UnexpectedResponse)
            }
            Err(RemoteError::Remote(message)) => {
                bridge.kill();
                Err(RemoteError::Unavailable(message))
            }
            Err(err) => {
                bridge.kill();
                Err(err)
            }
        }
    }

    /// Send a command to the bridge and wait for the matching response.
    fn send_command(&mut self, command: BridgeCommand) -> Result<Option<ResponseData>, RemoteError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request { id, command };
        let json = serde_json::to_string(&request)?;

        writeln!(self.stdin, "{json}").map_err(|e| RemoteError::Transport(e.to_string()))?;
        self.stdin
            .flush()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match self.responses.recv_timeout(remaining) {
                Ok(Ok(line)) => line,
                Ok(Err(e)) => return Err(RemoteError::Transport(e.to_string())),
                Err(RecvTimeoutError::Timeout) => {
                    self.abandoned.push_back(id);
                    return Err(RemoteError::Timeout(self.timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RemoteError::Transport("bridge process exited".into()))
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let response: Response = serde_json::from_str(line)?;

            // id 0 means the bridge could not parse a request. The bridge answers
            // in order, so it belongs to the oldest request still owed a reply.
            let current = response.id == id || (response.id == 0 && self.abandoned.is_empty());
            if !current {
                self.settle_abandoned(response.id);
                tracing::debug!(
                    expected = id,
                    got = response.id,
                    "discarding response to an abandoned request"
                );
                continue;
            }

            return match response.result {
                ResponseResult::Ok { data } => Ok(data),
                ResponseResult::Error { message } => Err(RemoteError::Remote(message)),
            };
        }
    }

    fn settle_abandoned(&mut self, id: u64) {
        if id == 0 {
            self.abandoned.pop_front();
        } else if let Some(pos) = self.abandoned.iter().position(|&owed| owed == id) {
            self.abandoned.drain(..=pos);
        }
    }

    fn expect_handle(&mut self, command: BridgeCommand) -> Result<ObjectHandle, RemoteError> {
        match self.send_command(command)? {
            Some(ResponseData::Handle(handle)) => Ok(handle),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    fn expect_lookup(
        &mut self,
        command: BridgeCommand,
    ) -> Result<Option<ObjectHandle>, RemoteError> {
        match self.send_command(command)? {
            Some(ResponseData::Lookup(found)) => Ok(found),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    fn expect_entries(&mut self, command: BridgeCommand) -> Result<Vec<Entry>, RemoteError> {
        match self.send_command(command)? {
            Some(ResponseData::Entries(entries)) => Ok(entries),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    fn expect_value(&mut self, command: BridgeCommand) -> Result<Value, RemoteError> {
        match self.send_command(command)? {
            Some(ResponseData::Value(value)) => Ok(value),
            None => Ok(Value::Null),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    /// Wait for the process to exit, killing it once the timeout has passed.
    fn reap(&mut self) {
        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
        self.kill();
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl RemoteApplication for BridgeProcess {
    fn identity(&mut self) -> Result<AppIdentity, RemoteError> {
        Ok(self.identity.clone())
    }

    fn namespaces(&mut self, parent: Option<ObjectHandle>) -> Result<Vec<Entry>, RemoteError> {
        self.expect_entries(BridgeCommand::Namespaces { parent })
    }

    fn find_namespace(
        &mut self,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<Option<ObjectHandle>, RemoteError> {
        self.expect_lookup(BridgeCommand::FindNamespace {
            parent,
            name: name.to_string(),
        })
    }

    fn add_namespace(
        &mut self,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<ObjectHandle, RemoteError> {
        self.expect_handle(BridgeCommand::AddNamespace {
            parent,
            name: name.to_string(),
        })
    }

    fn variables(&mut self, namespace: ObjectHandle) -> Result<Vec<Entry>, RemoteError> {
        self.expect_entries(BridgeCommand::Variables { namespace })
    }

    fn find_variable(
        &mut self,
        namespace: ObjectHandle,
        name: &str,
    ) -> Result<Option<ObjectHandle>, RemoteError> {
        self.expect_lookup(BridgeCommand::FindVariable {
            namespace,
            name: name.to_string(),
        })
    }

    fn add_variable(
        &mut self,
        namespace: ObjectHandle,
        name: &str,
        initial: &Value,
    ) -> Result<ObjectHandle, RemoteError> {
        self.expect_handle(BridgeCommand::AddVariable {
            namespace,
            name: name.to_string(),
            initial: initial.clone(),
        })
    }

    fn get_value(&mut self, variable: ObjectHandle) -> Result<Value, RemoteError> {
        self.expect_value(BridgeCommand::GetValue { variable })
    }

    fn set_value(&mut self, variable: ObjectHandle, value: &Value) -> Result<(), RemoteError> {
        self.send_command(BridgeCommand::SetValue {
            variable,
            value: value.clone(),
        })?;
        Ok(())
    }

    fn find_procedure(&mut self, name: &str) -> Result<Option<ObjectHandle>, RemoteError> {
        self.expect_lookup(BridgeCommand::FindProcedure {
            name: name.to_string(),
        })
    }

    fn call_procedure(
        &mut self,
        procedure: ObjectHandle,
        args: &[Value],
    ) -> Result<Value, RemoteError> {
        self.expect_value(BridgeCommand::CallProcedure {
            procedure,
            args: args.to_vec(),
        })
    }

    fn measurement_running(&mut self) -> Result<bool, RemoteError> {
        match self.send_command(BridgeCommand::MeasurementRunning)? {
            Some(ResponseData::Flag(running)) => Ok(running),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    fn start_measurement(&mut self) -> Result<(), RemoteError> {
        self.send_command(BridgeCommand::StartMeasurement)?;
        Ok(())
    }

    fn stop_measurement(&mut self) -> Result<(), RemoteError> {
        self.send_command(BridgeCommand::StopMeasurement)?;
        Ok(())
    }

    fn release(&mut self) -> Result<(), RemoteError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let result = self.send_command(BridgeCommand::Release).map(|_| ());
        self.reap();
        result
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        if !self.released {
            self.kill();
        }
    }
}

/// Attempt to locate the bridge exe relative to the current executable or in common paths.
pub fn find_bridge_exe() -> PathBuf {
    // Check next to the current executable
    if let Ok(mut exe) = std::env::current_exe() {
        exe.pop();
        let candidate = exe.join(BRIDGE_EXE);
        if candidate.exists() {
            return candidate;
        }
    }

    // Check in the target directory (for development)
    for profile in ["release", "debug"] {
        let target_path = PathBuf::from(format!("target/x86_64-pc-windows-gnu/{profile}"))
            .join(BRIDGE_EXE);
        if target_path.exists() {
            return target_path;
        }
    }

    // Default: assume it's in the current directory
    PathBuf::from(BRIDGE_EXE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.prog_id, "CANoe.Application");
        assert_eq!(config.timeout(), Duration::from_secs(30));
        if cfg!(windows) {
            assert!(config.launcher.is_none());
        } else {
            assert_eq!(config.launcher, Some(PathBuf::from("wine")));
        }
    }

    #[test]
    fn test_missing_exe_is_reported() {
        let config = BridgeConfig {
            bridge_exe_path: Some(PathBuf::from("/definitely/not/here/canoe-com-bridge.exe")),
            ..BridgeConfig::default()
        };
        match BridgeProcess::start(&config) {
            Err(RemoteError::BridgeExeNotFound(path)) => assert!(path.contains("not/here")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("bridge should not start"),
        }
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: BridgeConfig = serde_json::from_str(r#"{"timeout_secs": 5}"#).unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.prog_id, "CANoe.Application");
    }

    #[cfg(unix)]
    mod fake_bridge {
        use super::*;
        use std::time::Instant;

        const INIT: &str = r#"read -r line
echo '{"id":1,"status":"ok","data":{"identity":{"name":"CANoe","version":"fake"}}}'
"#;

        /// A bridge stand-in: `sh` runs `script` after answering `Init`.
        fn start(dir: &tempfile::TempDir, script: &str, timeout_secs: u64) -> BridgeProcess {
            let path = dir.path().join("fake-bridge.sh");
            std::fs::write(&path, format!("{INIT}{script}")).unwrap();
            let config = BridgeConfig {
                bridge_exe_path: Some(path),
                launcher: Some(PathBuf::from("sh")),
                timeout_secs,
                ..BridgeConfig::default()
            };
            BridgeProcess::start(&config).unwrap()
        }

        #[test]
        fn test_init_reports_identity() {
            let dir = tempfile::tempdir().unwrap();
            let mut bridge = start(
                &dir,
                r#"read -r line
echo '{"id":2,"status":"ok"}'
"#,
                5,
            );
            assert_eq!(bridge.identity().unwrap().version, "fake");
            bridge.release().unwrap();
        }

        #[test]
        fn test_slow_reply_times_out_and_is_discarded_later() {
            let dir = tempfile::tempdir().unwrap();
            let mut bridge = start(
                &dir,
                r#"read -r line
sleep 3
echo '{"id":2,"status":"ok","data":{"flag":true}}'
read -r line
echo '{"id":3,"status":"ok","data":{"flag":false}}'
"#,
                2,
            );

            let started = Instant::now();
            let err = bridge.measurement_running().unwrap_err();
            assert!(matches!(err, RemoteError::Timeout(after) if after == Duration::from_secs(2)));
            assert!(started.elapsed() >= Duration::from_secs(2));

            // The late `true` for id 2 must not answer id 3
            assert!(!bridge.measurement_running().unwrap());
        }

        #[test]
        fn test_parse_error_reply_answers_current_request() {
            let dir = tempfile::tempdir().unwrap();
            let mut bridge = start(
                &dir,
                r#"read -r line
echo '{"id":0,"status":"error","message":"JSON parse error: trailing characters"}'
"#,
                5,
            );

            match bridge.measurement_running() {
                Err(RemoteError::Remote(message)) => assert!(message.contains("parse error")),
                other => panic!("unexpected result: {other:?}"),
            }
        }

        #[test]
        fn test_parse_error_reply_of_abandoned_request_is_discarded() {
            let dir = tempfile::tempdir().unwrap();
            let mut bridge = start(
                &dir,
                r#"read -r line
sleep 3
echo '{"id":0,"status":"error","message":"JSON parse error"}'
read -r line
echo '{"id":3,"status":"ok","data":{"flag":true}}'
"#,
                2,
            );

            assert!(matches!(
                bridge.measurement_running(),
                Err(RemoteError::Timeout(_))
            ));
            assert!(bridge.measurement_running().unwrap());
        }

        #[test]
        fn test_exited_bridge_is_a_lost_link() {
            let dir = tempfile::tempdir().unwrap();
            let mut bridge = start(&dir, "exit 0\n", 5);

            let err = bridge.measurement_running().unwrap_err();
            assert!(err.is_link_lost(), "unexpected error: {err}");
        }
    }
}
