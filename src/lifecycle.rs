use async_trait::async_trait;
use tracing::{error, info};

/// A long-running component with explicit start and stop.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    async fn start(&mut self) -> anyhow::Result<()>;

    /// Must be safe to call on a service that never started.
    async fn stop(&mut self) -> anyhow::Result<()>;
}

/// Starts services in registration order and stops them in reverse.
#[derive(Default)]
pub struct Lifecycle {
    services: Vec<Box<dyn Service>>,
    started: usize,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Box<dyn Service>) {
        self.services.push(service);
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// On failure the already started services are stopped again before the error returns.
    pub async fn start_all(&mut self) -> anyhow::Result<()> {
        while self.started < self.services.len() {
            let svc = &mut self.services[self.started];
            let name = svc.name();
            let started = svc.start().await;
            if let Err(e) = started {
                error!(service = name, error = %e, "service failed to start");
                if let Err(stop_err) = self.stop_all().await {
                    error!(error = %stop_err, "rollback after failed start");
                }
                return Err(e.context(format!("start {name}")));
            }
            info!(service = name, "service started");
            self.started += 1;
        }
        Ok(())
    }

    /// Stops every started service even if some fail; the first failure is returned.
    pub async fn stop_all(&mut self) -> anyhow::Result<()> {
        let mut first_err: Option<anyhow::Error> = None;
        while self.started > 0 {
            self.started -= 1;
            let svc = &mut self.services[self.started];
            let name = svc.name();
            match svc.stop().await {
                Ok(()) => info!(service = name, "service stopped"),
                Err(e) => {
                    error!(service = name, error = %e, "service failed to stop");
                    first_err.get_or_insert(e.context(format!("stop {name}")));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
