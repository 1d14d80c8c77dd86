//! Command dispatch
//!
//! One table maps method names to typed handlers over the controller. The
//! stdin stream and any other front end build a [`CommandRequest`], hand it
//! to [`ServerContext::handle`] and get a [`CommandResponse`] back.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use crate::{
    controller::{MotionController, WorkMode},
    gcode::CoordinateMode,
    service::ArmService,
    transport::TelemetryFormat,
    ArmError, Result,
};

pub type Handler = fn(&mut MotionController, &Value) -> Result<Value>;

/// Method call with named parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl CommandRequest {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub method: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    /// Error kind on failure (see [`ArmError::kind`])
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub data: Option<Value>,
}

impl CommandResponse {
    fn from_result(method: &str, result: Result<Value>, elapsed: Duration) -> Self {
        let duration_ms = elapsed.as_millis() as u64;
        match result {
            Ok(data) => Self {
                method: method.to_string(),
                success: true,
                message: format!("{} completed", method),
                duration_ms,
                error_kind: None,
                data: (!data.is_null()).then_some(data),
            },
            Err(e) => Self {
                method: method.to_string(),
                success: false,
                message: e.to_string(),
                duration_ms,
                error_kind: Some(e.kind().to_string()),
                data: None,
            },
        }
    }
}

/// Description of one registered method, as listed by `help`
#[derive(Debug, Clone, Serialize)]
pub struct MethodInfo {
    pub name: &'static str,
    pub args: &'static [&'static str],
    pub help: &'static str,
}

struct Route {
    handler: Handler,
    args: &'static [&'static str],
    help: &'static str,
}

pub struct Dispatcher {
    routes: BTreeMap<&'static str, Route>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let mut d = Self { routes: BTreeMap::new() };
        d.register("connect", &[], "Open the serial link, home the arm, select absolute mode", connect);
        d.register("disconnect", &[], "Effector off, motors off, close the link", disconnect);
        d.register("status", &[], "Connection, modes, position and recording state", status);
        d.register("workspace", &[], "Reachable workspace limits", workspace);
        d.register("home", &[], "Return to the home position (G28)", home);
        d.register("move", &["x", "y", "z", "feed"], "Linear move; feed defaults to the last used rate", move_to);
        d.register("gcode", &["line"], "Execute one G-code line", gcode);
        d.register("effector", &["active"], "Switch the end effector on or off", effector);
        d.register("motors", &["enabled"], "Enable (M17) or disable (M84) the motors", motors);
        d.register("work_mode", &["mode"], "Select manual or automatic mode", work_mode);
        d.register("coordinate_mode", &["mode"], "Select absolute (G90) or relative (G91) coordinates", coordinate_mode);
        d.register("record_begin", &["name"], "Start recording a trajectory", record_begin);
        d.register("record_step", &["x", "y", "z", "feed"], "Record and execute a move", record_step);
        d.register("record_gcode", &["line"], "Record and execute a G-code line", record_gcode);
        d.register("record_end", &[], "Save the recording", record_end);
        d.register("record_clear", &[], "Drop recorded steps, keep recording", record_clear);
        d.register("record_cancel", &[], "Discard the recording", record_cancel);
        d.register("current", &[], "Steps recorded so far", current);
        d.register("trajectories", &[], "List stored trajectories", trajectories);
        d.register("delete_trajectory", &["name"], "Delete a stored trajectory", delete_trajectory);
        d.register("import", &["path", "name"], "Validate a G-code file and add it to the store", import);
        d.register("run", &["name"], "Replay a stored trajectory (automatic mode)", run);
        d.register("position", &[], "Firmware position report (M114)", position);
        d.register("firmware", &[], "Firmware identification (M115)", firmware);
        d.register("telemetry", &["format"], "Read one telemetry record (csv, json or xml)", telemetry);
        d
    }

    fn register(&mut self, name: &'static str, args: &'static [&'static str], help: &'static str, handler: Handler) {
        self.routes.insert(name, Route { handler, args, help });
    }

    pub fn handler(&self, method: &str) -> Option<Handler> {
        self.routes.get(method).map(|r| r.handler)
    }

    /// Registered methods, sorted by name
    pub fn methods(&self) -> Vec<MethodInfo> {
        self.routes
            .iter()
            .map(|(name, route)| MethodInfo {
                name: *name,
                args: route.args,
                help: route.help,
            })
            .collect()
    }

    /// Build a request from positional words. The last parameter takes the
    /// rest of the line, so `gcode G1 X10 Y0` keeps the whole G-code line.
    pub fn request_from_words(&self, method: &str, words: &[&str]) -> Result<CommandRequest> {
        if method == "help" || method == "session" {
            return Ok(CommandRequest::new(method, Value::Null));
        }
        let route = self
            .routes
            .get(method)
            .ok_or_else(|| ArmError::InvalidRequest(format!("unknown method '{}'", method)))?;

        let mut params = Map::new();
        for (i, name) in route.args.iter().enumerate() {
            let value = if i + 1 == route.args.len() {
                words.get(i..).map(|rest| rest.join(" ")).filter(|s| !s.is_empty())
            } else {
                words.get(i).map(|w| w.to_string())
            };
            if let Some(value) = value {
                params.insert(name.to_string(), Value::String(value));
            }
        }
        if route.args.is_empty() && !words.is_empty() {
            return Err(ArmError::InvalidRequest(format!("'{}' takes no arguments", method)));
        }
        Ok(CommandRequest::new(method, Value::Object(params)))
    }

    /// Run one request against `controller`
    pub fn dispatch(&self, controller: &mut MotionController, request: &CommandRequest) -> CommandResponse {
        let start = Instant::now();
        let result = match request.method.as_str() {
            "help" => serde_json::to_value(self.methods()).map_err(ArmError::from),
            method => match self.handler(method) {
                Some(handler) => {
                    debug!("Dispatching {} {}", method, request.params);
                    handler(controller, &request.params)
                }
                None => Err(ArmError::InvalidRequest(format!("unknown method '{}'", method))),
            },
        };

        if let Err(e) = &result {
            warn!("{} failed: {}", request.method, e);
        }
        CommandResponse::from_result(&request.method, result, start.elapsed())
    }
}

/// Per-session call counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub executed: u64,
    pub errored: u64,
}

/// One client session: the shared service plus its own counters
pub struct ServerContext {
    service: ArmService,
    dispatcher: Arc<Dispatcher>,
    stats: SessionStats,
}

impl ServerContext {
    pub fn new(service: ArmService) -> Self {
        Self {
            service,
            dispatcher: Arc::new(Dispatcher::new()),
            stats: SessionStats::default(),
        }
    }

    pub fn service(&self) -> &ArmService {
        &self.service
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub async fn handle(&mut self, request: CommandRequest) -> CommandResponse {
        if request.method == "session" {
            let data = serde_json::to_value(&self.stats).map_err(ArmError::from);
            return CommandResponse::from_result("session", data, Duration::ZERO);
        }

        let start = Instant::now();
        let method = request.method.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let response = match self
            .service
            .run(move |controller| Ok(dispatcher.dispatch(controller, &request)))
            .await
        {
            Ok(response) => response,
            Err(e) => CommandResponse::from_result(&method, Err(e), start.elapsed()),
        };

        if response.success {
            self.stats.executed += 1;
        } else {
            self.stats.errored += 1;
        }
        response
    }
}

fn param<'a>(params: &'a Value, key: &str) -> Option<&'a Value> {
    params.get(key).filter(|v| !v.is_null())
}

fn invalid(key: &str, expected: &str) -> ArmError {
    ArmError::InvalidRequest(format!("parameter '{}' must be {}", key, expected))
}

fn opt_f64(params: &Value, key: &str) -> Result<Option<f64>> {
    match param(params, key) {
        None => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| invalid(key, "a number")),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| invalid(key, "a number")),
        Some(_) => Err(invalid(key, "a number")),
    }
}

fn req_f64(params: &Value, key: &str) -> Result<f64> {
    opt_f64(params, key)?.ok_or_else(|| invalid(key, "a number"))
}

fn req_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    match param(params, key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        _ => Err(invalid(key, "a non-empty string")),
    }
}

fn opt_str<'a>(params: &'a Value, key: &str) -> Result<Option<&'a str>> {
    match param(params, key) {
        None => Ok(None),
        Some(_) => req_str(params, key).map(Some),
    }
}

fn req_bool(params: &Value, key: &str) -> Result<bool> {
    match param(params, key) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" | "1" => Ok(true),
            "off" | "false" | "no" | "0" => Ok(false),
            _ => Err(invalid(key, "on/off")),
        },
        _ => Err(invalid(key, "on/off")),
    }
}

fn connect(c: &mut MotionController, _: &Value) -> Result<Value> {
    c.connect()?;
    Ok(serde_json::to_value(c.status())?)
}

fn disconnect(c: &mut MotionController, _: &Value) -> Result<Value> {
    c.disconnect()?;
    Ok(json!({ "connected": false }))
}

fn status(c: &mut MotionController, _: &Value) -> Result<Value> {
    Ok(serde_json::to_value(c.status())?)
}

fn workspace(c: &mut MotionController, _: &Value) -> Result<Value> {
    Ok(serde_json::to_value(c.workspace_info())?)
}

fn home(c: &mut MotionController, _: &Value) -> Result<Value> {
    c.go_home()?;
    Ok(json!({ "position": c.position() }))
}

fn move_to(c: &mut MotionController, p: &Value) -> Result<Value> {
    let (x, y, z) = (req_f64(p, "x")?, req_f64(p, "y")?, req_f64(p, "z")?);
    let position = match opt_f64(p, "feed")? {
        Some(feed) => c.move_to(x, y, z, feed)?,
        None => c.move_to_current_feed(x, y, z)?,
    };
    Ok(json!({ "position": position }))
}

fn gcode(c: &mut MotionController, p: &Value) -> Result<Value> {
    let command = c.execute_gcode(req_str(p, "line")?)?;
    Ok(json!({ "command": command, "position": c.position() }))
}

fn effector(c: &mut MotionController, p: &Value) -> Result<Value> {
    let active = req_bool(p, "active")?;
    c.set_effector(active)?;
    Ok(json!({ "effector_active": active }))
}

fn motors(c: &mut MotionController, p: &Value) -> Result<Value> {
    let enabled = req_bool(p, "enabled")?;
    c.set_motors(enabled)?;
    Ok(json!({ "motors_enabled": enabled }))
}

fn work_mode(c: &mut MotionController, p: &Value) -> Result<Value> {
    let name = req_str(p, "mode")?;
    let mode = WorkMode::from_name(name).ok_or_else(|| invalid("mode", "manual or automatic"))?;
    c.set_work_mode(mode)?;
    Ok(json!({ "work_mode": mode }))
}

fn coordinate_mode(c: &mut MotionController, p: &Value) -> Result<Value> {
    let name = req_str(p, "mode")?;
    let mode = CoordinateMode::from_name(name).ok_or_else(|| invalid("mode", "absolute or relative"))?;
    c.set_coordinate_mode(mode)?;
    Ok(json!({ "coordinate_mode": mode }))
}

fn record_begin(c: &mut MotionController, p: &Value) -> Result<Value> {
    let name = req_str(p, "name")?;
    c.begin_recording(name)?;
    Ok(json!({ "recording": name }))
}

fn record_step(c: &mut MotionController, p: &Value) -> Result<Value> {
    let (x, y, z) = (req_f64(p, "x")?, req_f64(p, "y")?, req_f64(p, "z")?);
    let position = c.record_step(x, y, z, opt_f64(p, "feed")?.unwrap_or(0.0))?;
    let steps = c.current_trajectory().map(|t| t.len()).unwrap_or(0);
    Ok(json!({ "position": position, "steps": steps }))
}

fn record_gcode(c: &mut MotionController, p: &Value) -> Result<Value> {
    let command = c.record_raw_command(req_str(p, "line")?)?;
    let steps = c.current_trajectory().map(|t| t.len()).unwrap_or(0);
    Ok(json!({ "command": command.code, "steps": steps }))
}

fn record_end(c: &mut MotionController, _: &Value) -> Result<Value> {
    let path = c.end_recording()?;
    Ok(json!({ "path": path.display().to_string() }))
}

fn record_clear(c: &mut MotionController, _: &Value) -> Result<Value> {
    c.clear_trajectory()?;
    Ok(Value::Null)
}

fn record_cancel(c: &mut MotionController, _: &Value) -> Result<Value> {
    c.cancel_recording()?;
    Ok(Value::Null)
}

fn current(c: &mut MotionController, _: &Value) -> Result<Value> {
    Ok(match c.current_trajectory() {
        Some(t) => json!({
            "name": t.name,
            "steps": t.steps.iter().map(|s| s.code.as_str()).collect::<Vec<_>>(),
        }),
        None => Value::Null,
    })
}

fn trajectories(c: &mut MotionController, _: &Value) -> Result<Value> {
    Ok(json!({ "trajectories": c.store().list()? }))
}

fn delete_trajectory(c: &mut MotionController, p: &Value) -> Result<Value> {
    let name = req_str(p, "name")?;
    c.store().delete(name)?;
    Ok(json!({ "deleted": name }))
}

fn import(c: &mut MotionController, p: &Value) -> Result<Value> {
    let source = Path::new(req_str(p, "path")?);
    let name = match opt_str(p, "name")? {
        Some(name) => name.to_string(),
        None => source
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| invalid("name", "given when the path has no file name"))?,
    };
    let trajectory = c.store().import(source, &name, c.parser())?;
    info!("Imported '{}' with {} steps", name, trajectory.len());
    Ok(json!({ "name": name, "steps": trajectory.len() }))
}

fn run(c: &mut MotionController, p: &Value) -> Result<Value> {
    let report = c.run_stored(req_str(p, "name")?)?;
    Ok(serde_json::to_value(report)?)
}

fn position(c: &mut MotionController, _: &Value) -> Result<Value> {
    Ok(json!({ "report": c.query_position()?, "model": c.position() }))
}

fn firmware(c: &mut MotionController, _: &Value) -> Result<Value> {
    Ok(json!({ "report": c.query_firmware()? }))
}

fn telemetry(c: &mut MotionController, p: &Value) -> Result<Value> {
    let format = match opt_str(p, "format")? {
        Some(name) => TelemetryFormat::from_name(name).ok_or_else(|| invalid("format", "csv, json or xml"))?,
        None => TelemetryFormat::Csv,
    };
    Ok(json!({ "record": c.read_telemetry(format)? }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArmConfig;
    use crate::testing::{DeviceLog, ScriptedConnector};
    use tempfile::TempDir;

    fn controller(dir: &TempDir) -> (MotionController, DeviceLog) {
        let mut config = ArmConfig::default();
        config.timing.settle_delay_ms = 0;
        config.timing.welcome_timeout_ms = 1;
        config.timing.home_timeout_ms = 20;
        config.timing.command_timeout_ms = 20;
        config.timing.step_pause_ms = 0;
        config.storage.trajectory_dir = dir.path().join("store").to_string_lossy().to_string();
        let connector = ScriptedConnector::new();
        let log = connector.log();
        (MotionController::with_connector(config, Box::new(connector)).unwrap(), log)
    }

    fn call(d: &Dispatcher, c: &mut MotionController, method: &str, params: Value) -> CommandResponse {
        d.dispatch(c, &CommandRequest::new(method, params))
    }

    #[test]
    fn test_words_map_to_named_params() {
        let d = Dispatcher::new();
        let req = d.request_from_words("move", &["100", "20", "-5"]).unwrap();
        assert_eq!(req.params, json!({ "x": "100", "y": "20", "z": "-5" }));

        let req = d.request_from_words("gcode", &["G1", "X10", "Y0"]).unwrap();
        assert_eq!(req.params, json!({ "line": "G1 X10 Y0" }));

        let req = d.request_from_words("import", &["/tmp/a.gcode"]).unwrap();
        assert_eq!(req.params, json!({ "path": "/tmp/a.gcode" }));

        assert!(matches!(d.request_from_words("status", &["now"]), Err(ArmError::InvalidRequest(_))));
        assert!(matches!(d.request_from_words("fly", &[]), Err(ArmError::InvalidRequest(_))));
    }

    #[test]
    fn test_dispatch_drives_controller() {
        let dir = TempDir::new().unwrap();
        let d = Dispatcher::new();
        let (mut c, log) = controller(&dir);

        assert!(call(&d, &mut c, "connect", Value::Null).success);
        let moved = call(&d, &mut c, "move", json!({ "x": 100, "y": "0", "z": 0, "feed": 400 }));
        assert!(moved.success, "{}", moved.message);
        assert_eq!(moved.data.unwrap()["position"]["x"], 100.0);

        assert!(call(&d, &mut c, "effector", json!({ "active": "on" })).success);
        assert!(call(&d, &mut c, "gcode", json!({ "line": "G1 X120" })).success);
        assert_eq!(log.lines()[3..], ["G1 X100 Y0 Z0 F400", "M3", "G1 X120"]);
    }

    #[test]
    fn test_failures_carry_error_kind() {
        let dir = TempDir::new().unwrap();
        let d = Dispatcher::new();
        let (mut c, _log) = controller(&dir);

        let r = call(&d, &mut c, "move", json!({ "x": 100, "y": 0, "z": 0 }));
        assert!(!r.success);
        assert_eq!(r.error_kind.as_deref(), Some("illegal_state"));

        let r = call(&d, &mut c, "move", json!({ "x": "far", "y": 0, "z": 0 }));
        assert_eq!(r.error_kind.as_deref(), Some("invalid_request"));

        let r = call(&d, &mut c, "work_mode", json!({ "mode": "turbo" }));
        assert_eq!(r.error_kind.as_deref(), Some("invalid_request"));

        let r = call(&d, &mut c, "teleport", Value::Null);
        assert!(!r.success);
        assert!(r.message.contains("teleport"));

        call(&d, &mut c, "connect", Value::Null);
        let r = call(&d, &mut c, "move", json!({ "x": 300, "y": 0, "z": 0, "feed": 10 }));
        assert_eq!(r.error_kind.as_deref(), Some("out_of_workspace"));
    }

    #[test]
    fn test_record_and_run_through_dispatch() {
        let dir = TempDir::new().unwrap();
        let d = Dispatcher::new();
        let (mut c, log) = controller(&dir);
        call(&d, &mut c, "connect", Value::Null);

        assert!(call(&d, &mut c, "record_begin", json!({ "name": "demo" })).success);
        assert!(call(&d, &mut c, "record_step", json!({ "x": 100, "y": 0, "z": 0, "feed": 300 })).success);
        assert!(call(&d, &mut c, "record_gcode", json!({ "line": "M3" })).success);
        let current = call(&d, &mut c, "current", Value::Null).data.unwrap();
        assert_eq!(current["steps"], json!(["G1 X100 Y0 Z0 F300", "M3"]));
        assert!(call(&d, &mut c, "record_end", Value::Null).success);

        let listed = call(&d, &mut c, "trajectories", Value::Null).data.unwrap();
        assert_eq!(listed["trajectories"], json!(["demo"]));

        assert!(!call(&d, &mut c, "run", json!({ "name": "demo" })).success);
        call(&d, &mut c, "work_mode", json!({ "mode": "automatic" }));
        log.reset_written();
        let run = call(&d, &mut c, "run", json!({ "name": "demo" }));
        assert!(run.success, "{}", run.message);
        assert_eq!(run.data.unwrap()["executed"], 6);
        assert_eq!(log.lines(), vec!["G90", "G28", "G1 X100 Y0 Z0 F300", "M3", "M5", "G28"]);

        assert!(call(&d, &mut c, "delete_trajectory", json!({ "name": "demo" })).success);
        assert!(!call(&d, &mut c, "delete_trajectory", json!({ "name": "demo" })).success);
    }

    #[test]
    fn test_help_lists_every_method() {
        let dir = TempDir::new().unwrap();
        let d = Dispatcher::new();
        let (mut c, _log) = controller(&dir);
        let help = call(&d, &mut c, "help", Value::Null).data.unwrap();
        let names: Vec<&str> = help.as_array().unwrap().iter().filter_map(|m| m["name"].as_str()).collect();
        assert!(names.contains(&"record_begin"));
        assert!(names.contains(&"telemetry"));
        assert_eq!(names.len(), d.methods().len());
    }

    #[tokio::test]
    async fn test_server_context_counts_calls() {
        let dir = TempDir::new().unwrap();
        let (c, _log) = controller(&dir);
        let mut ctx = ServerContext::new(ArmService::from_controller(c));

        assert!(ctx.handle(CommandRequest::new("connect", Value::Null)).await.success);
        assert!(!ctx.handle(CommandRequest::new("record_end", Value::Null)).await.success);
        assert!(ctx.handle(CommandRequest::new("status", Value::Null)).await.success);

        let session = ctx.handle(CommandRequest::new("session", Value::Null)).await;
        assert_eq!(session.data.unwrap(), json!({ "executed": 2, "errored": 1 }));
        assert_eq!(ctx.stats().executed, 2);
    }
}
