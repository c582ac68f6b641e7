use std::{
    any::Any,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use log::{error, warn};
use tokio::{sync::Semaphore, task::JoinHandle};
use uuid::Uuid;

use super::{model::ApplicationStatus, port::Repository, revisions::RevisionManager};

/// Bounded pool for background reconciliations.
///
/// `submit` returns right away. The task waits for a permit, runs on its own tokio task,
/// and a supervisor turns a panic into a `failed` status on the application after
/// dropping the revision the aborted run never released.
#[derive(Clone)]
pub struct TaskRunner {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    repository: Arc<dyn Repository>,
    revisions: RevisionManager,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskRunner {
    pub fn new(max_concurrent: usize, repository: Arc<dyn Repository>, revisions: RevisionManager) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            repository,
            revisions,
        }
    }

    pub fn submit<F>(&self, app_id: Uuid, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let repository = self.repository.clone();
        let revisions = self.revisions.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = InFlight(self.in_flight.clone());
        tokio::spawn(async move {
            let _in_flight = in_flight;
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!("Worker pool closed, dropping task for application {}", app_id);
                return;
            };
            let Err(e) = tokio::spawn(task).await else {
                return;
            };
            let message = if e.is_panic() {
                format!("deployment task panicked: {}", panic_message(e.into_panic()))
            } else {
                "deployment task was cancelled".to_string()
            };
            error!("Background task for application {} aborted: {}", app_id, message);
            revisions.discard_unreleased(app_id).await;
            if let Err(e) = repository
                .set_status(app_id, ApplicationStatus::Failed, Some(message))
                .await
            {
                warn!("Can't record failure of application {}: {}", app_id, e);
            }
        })
    }

    /// Submitted tasks that have not finished yet, queued ones included.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
