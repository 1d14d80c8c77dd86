//! Arm service - shared, async-friendly handle on one controller
//!
//! Every call takes the controller lock for its whole duration and runs the
//! blocking serial exchange on the blocking thread pool, so requests from
//! concurrent sessions are strictly serialized.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use crate::{
    config::ArmConfig,
    controller::{ArmStatus, MotionController},
    Result,
};

#[derive(Clone)]
pub struct ArmService {
    controller: Arc<Mutex<MotionController>>,
}

impl ArmService {
    /// Service over the serial devices named in `config`
    pub fn new(config: ArmConfig) -> Result<Self> {
        info!("Initializing arm control service");
        Ok(Self::from_controller(MotionController::new(config)?))
    }

    pub fn from_controller(controller: MotionController) -> Self {
        Self {
            controller: Arc::new(Mutex::new(controller)),
        }
    }

    /// Shared controller handle, for callers that need direct access
    pub fn controller(&self) -> &Arc<Mutex<MotionController>> {
        &self.controller
    }

    /// Run `f` with exclusive access to the controller
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut MotionController) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut guard = Arc::clone(&self.controller).lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *guard)).await?
    }

    pub async fn connect(&self) -> Result<()> {
        self.run(|controller| controller.connect()).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.run(|controller| controller.disconnect()).await
    }

    pub async fn status(&self) -> ArmStatus {
        self.controller.lock().await.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::WorkMode;
    use crate::testing::ScriptedConnector;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> (ArmService, crate::testing::DeviceLog) {
        let mut config = ArmConfig::default();
        config.timing.settle_delay_ms = 0;
        config.timing.welcome_timeout_ms = 1;
        config.timing.home_timeout_ms = 20;
        config.timing.command_timeout_ms = 20;
        config.storage.trajectory_dir = dir.path().to_string_lossy().to_string();
        let connector = ScriptedConnector::new();
        let log = connector.log();
        let controller = MotionController::with_connector(config, Box::new(connector)).unwrap();
        (ArmService::from_controller(controller), log)
    }

    #[tokio::test]
    async fn test_connect_and_status() {
        let dir = TempDir::new().unwrap();
        let (service, _log) = service(&dir);
        assert!(!service.status().await.state.connected);

        service.connect().await.unwrap();
        let status = service.status().await;
        assert!(status.state.connected);
        assert_eq!(status.work_mode, WorkMode::Manual);

        service.disconnect().await.unwrap();
        assert!(!service.status().await.state.connected);
    }

    #[tokio::test]
    async fn test_concurrent_moves_are_serialized() {
        let dir = TempDir::new().unwrap();
        let (service, log) = service(&dir);
        service.connect().await.unwrap();
        log.reset_written();

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                let x = 100.0 + i as f64;
                service.run(move |c| c.move_to(x, 0.0, 0.0, 500.0)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // each write is one complete line; no interleaving
        let lines = log.lines();
        assert_eq!(lines.len(), 8);
        assert!(lines.iter().all(|l| l.starts_with("G1 X1") && l.ends_with("F500")));
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let dir = TempDir::new().unwrap();
        let (service, _log) = service(&dir);
        let err = service.run(|c| c.move_to(100.0, 0.0, 0.0, 1.0)).await.unwrap_err();
        assert!(matches!(err, crate::ArmError::NotConnected));
    }
}
