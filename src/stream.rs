//! Command streaming from stdin
//!
//! Each input line is one request:
//! - `@method arg ...` calls a dispatch method with positional arguments,
//! - `@method {json}` calls it with named parameters,
//! - any other line is executed as G-code,
//! - blank lines and lines starting with `#` are ignored.
//!
//! Every result is printed as one JSON line on stdout.

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info};
use crate::{
    dispatch::{CommandRequest, CommandResponse, ServerContext},
    json_output, ArmError,
};

pub struct CommandStream {
    context: ServerContext,
    lines_read: u64,
}

impl CommandStream {
    pub fn new(context: ServerContext) -> Self {
        Self {
            context,
            lines_read: 0,
        }
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ServerContext {
        &mut self.context
    }

    /// Translate one input line into a request; `None` for blank and comment lines
    pub fn parse_line(&self, line: &str) -> Option<std::result::Result<CommandRequest, ArmError>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let Some(call) = line.strip_prefix('@') else {
            return Some(Ok(CommandRequest::new("gcode", json!({ "line": line }))));
        };

        let call = call.trim();
        let (method, rest) = match call.split_once(char::is_whitespace) {
            Some((method, rest)) => (method, rest.trim()),
            None => (call, ""),
        };
        if method.is_empty() {
            return Some(Err(ArmError::InvalidRequest("missing method after '@'".to_string())));
        }

        if rest.starts_with('{') {
            let request = match serde_json::from_str::<Value>(rest) {
                Ok(params @ Value::Object(_)) => Ok(CommandRequest::new(method, params)),
                Ok(_) => Err(ArmError::InvalidRequest("parameters must be a JSON object".to_string())),
                Err(e) => Err(ArmError::from(e)),
            };
            return Some(request);
        }

        let words: Vec<&str> = rest.split_whitespace().collect();
        Some(self.context.dispatcher().request_from_words(method, &words))
    }

    /// Parse and execute one line. Lines that do not parse are printed as
    /// error events and never reach the controller.
    pub async fn handle_line(&mut self, line: &str) -> Option<CommandResponse> {
        let request = self.parse_line(line)?;
        self.lines_read += 1;
        match request {
            Ok(request) => Some(self.context.handle(request).await),
            Err(e) => {
                json_output::output::error(&e.to_string(), Some(line.trim()));
                None
            }
        }
    }

    /// Main loop: read stdin until EOF or Ctrl+C
    pub async fn run(&mut self) -> Result<()> {
        info!("Command streaming active");
        info!("Lines starting with '@' are commands (try @help), anything else is G-code");
        info!("Use Ctrl+C to stop; the arm is disconnected on exit");

        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut buffer = String::new();

        let shutdown = Self::shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            buffer.clear();

            tokio::select! {
                line_result = reader.read_line(&mut buffer) => {
                    match line_result {
                        Ok(0) => {
                            info!("End of input reached after {} commands", self.lines_read);
                            break;
                        }
                        Ok(_) => {
                            if let Some(response) = self.handle_line(&buffer).await {
                                json_output::output::response(&response);
                            }
                        }
                        Err(e) => {
                            error!("Failed to read from stdin: {}", e);
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn shutdown_signal() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    /// Disconnect the arm (effector and motors off)
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down command stream");
        let response = self.context.handle(CommandRequest::new("disconnect", Value::Null)).await;
        json_output::output::response(&response);

        let stats = self.context.stats();
        json_output::output::shutdown(&format!(
            "{} commands executed, {} failed",
            stats.executed, stats.errored
        ));
        if !response.success {
            anyhow::bail!("disconnect failed: {}", response.message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArmConfig;
    use crate::controller::MotionController;
    use crate::service::ArmService;
    use crate::testing::{DeviceLog, ScriptedConnector};
    use tempfile::TempDir;

    fn stream(dir: &TempDir) -> (CommandStream, DeviceLog) {
        let mut config = ArmConfig::default();
        config.timing.settle_delay_ms = 0;
        config.timing.welcome_timeout_ms = 1;
        config.timing.home_timeout_ms = 20;
        config.timing.command_timeout_ms = 20;
        config.storage.trajectory_dir = dir.path().to_string_lossy().to_string();
        let connector = ScriptedConnector::new();
        let log = connector.log();
        let controller = MotionController::with_connector(config, Box::new(connector)).unwrap();
        let context = ServerContext::new(ArmService::from_controller(controller));
        (CommandStream::new(context), log)
    }

    #[test]
    fn test_parse_line_forms() {
        let dir = TempDir::new().unwrap();
        let (s, _log) = stream(&dir);

        assert!(s.parse_line("   ").is_none());
        assert!(s.parse_line("# comment").is_none());

        let req = s.parse_line("G1 X10 Y0 ; note").unwrap().unwrap();
        assert_eq!(req.method, "gcode");
        assert_eq!(req.params["line"], "G1 X10 Y0 ; note");

        let req = s.parse_line("@move 100 0 5 800").unwrap().unwrap();
        assert_eq!(req.params, json!({ "x": "100", "y": "0", "z": "5", "feed": "800" }));

        let req = s.parse_line("@effector {\"active\": true}").unwrap().unwrap();
        assert_eq!(req.params["active"], true);

        let req = s.parse_line("@help").unwrap().unwrap();
        assert_eq!(req.method, "help");

        assert!(s.parse_line("@").unwrap().is_err());
        assert!(s.parse_line("@status now").unwrap().is_err());
        assert!(s.parse_line("@effector {broken").unwrap().is_err());
    }

    #[tokio::test]
    async fn test_handle_line_executes_requests() {
        let dir = TempDir::new().unwrap();
        let (mut s, log) = stream(&dir);

        assert!(s.handle_line("@connect\n").await.unwrap().success);
        let moved = s.handle_line("G1 X100 Y0 Z0").await.unwrap();
        assert!(moved.success, "{}", moved.message);
        assert_eq!(moved.method, "gcode");
        assert!(log.lines().contains(&"G1 X100 Y0 Z0".to_string()));

        assert!(!s.handle_line("G1 X900").await.unwrap().success);
        assert!(s.handle_line("# nothing").await.is_none());
        assert!(s.handle_line("@nope").await.is_none());

        s.shutdown().await.unwrap();
        assert_eq!(s.context().stats().executed, 3);
        assert_eq!(s.context().stats().errored, 1);
    }
}
