use monitor_core::{
    executor::{CheckExecutor, ExecutionReport},
    models::ExecutionMessage,
    queue::WorkQueue,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, warn};

/// Pulls execution messages off the queue and runs them with bounded concurrency.
pub struct CheckWorker {
    queue: Arc<dyn WorkQueue>,
    executor: Arc<CheckExecutor>,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
}

impl CheckWorker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        executor: Arc<CheckExecutor>,
        max_concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            executor,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            poll_interval,
        }
    }

    /// Runs until `shutdown` resolves, then waits for in-flight checks.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut in_flight = JoinSet::new();

        loop {
            // Hold a permit before popping so nothing is dequeued that cannot start.
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while in_flight.try_join_next().is_some() {}

            match self.queue.dequeue().await {
                Ok(Some(message)) => {
                    let executor = self.executor.clone();
                    in_flight.spawn(async move {
                        execute(&executor, &message).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Failed to dequeue execution message");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!("Waiting for {} in-flight checks", in_flight.len());
        }
        while in_flight.join_next().await.is_some() {}
        self.executor.flush_notifications().await;
    }
}

async fn execute(executor: &CheckExecutor, message: &ExecutionMessage) {
    match executor.handle_message(message).await {
        Ok(ExecutionReport::Completed { check, applied }) => debug!(
            monitor_id = %message.monitor_id,
            outcome = %check.outcome,
            applied,
            "Check completed"
        ),
        Ok(ExecutionReport::Skipped(reason)) => debug!(
            monitor_id = %message.monitor_id,
            ?reason,
            "Execution skipped"
        ),
        Err(e) => error!(
            monitor_id = %message.monitor_id,
            error = %e,
            "Check execution abandoned"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::get};
    use chrono::Utc;
    use monitor_core::{
        escalation::{EscalationEngine, EscalationPolicy},
        executor::PersistencePolicy,
        models::{Claim, CreateMonitorRequest},
        notify::LogDispatcher,
        probe::HttpProber,
        queue::InMemoryWorkQueue,
        schedule::SchedulePolicy,
        store::{MemoryStore, MonitorStore},
    };
    use tokio::{net::TcpListener, sync::oneshot};
    use uuid::Uuid;

    async fn target() -> String {
        let router = Router::new().route("/ok", get(|| async { "ok" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}/ok")
    }

    fn executor(store: Arc<MemoryStore>) -> Arc<CheckExecutor> {
        let escalation = EscalationEngine::new(
            store.clone(),
            store.clone(),
            Arc::new(LogDispatcher),
            EscalationPolicy {
                threshold: 3,
                window_minutes: 5,
            },
        );
        Arc::new(CheckExecutor::new(
            store.clone(),
            store,
            HttpProber::new("monitor-test", 500).unwrap(),
            escalation,
            SchedulePolicy::default(),
            PersistencePolicy::default(),
        ))
    }

    async fn claimed_message(store: &MemoryStore, url: String) -> ExecutionMessage {
        let monitor = store
            .create(&CreateMonitorRequest {
                owner_id: Uuid::new_v4(),
                name: "worker-target".to_string(),
                url,
                method: "GET".to_string(),
                interval_seconds: 60,
                timeout_seconds: 5,
                enabled: true,
            })
            .await
            .unwrap();
        let token = Uuid::new_v4();
        let now = Utc::now();
        store
            .try_claim(
                monitor.id,
                monitor.version,
                &Claim {
                    token,
                    claimed_at: now,
                    next_run_at: None,
                },
            )
            .await
            .unwrap();
        ExecutionMessage {
            monitor_id: monitor.id,
            claim_token: token,
            enqueued_at: now,
        }
    }

    #[tokio::test]
    async fn drains_queue_and_records_checks() {
        let url = target().await;
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());

        let mut ids = Vec::new();
        for _ in 0..4 {
            let message = claimed_message(&store, url.clone()).await;
            ids.push(message.monitor_id);
            queue.enqueue(&message).await.unwrap();
        }
        // redelivery of the first message; one slot keeps it behind the first delivery
        let duplicate = ExecutionMessage {
            monitor_id: ids[0],
            claim_token: store.read_current(ids[0]).await.unwrap().claim_token.unwrap(),
            enqueued_at: Utc::now(),
        };
        queue.enqueue(&duplicate).await.unwrap();

        let worker = Arc::new(CheckWorker::new(
            queue.clone(),
            executor(store.clone()),
            1,
            Duration::from_millis(10),
        ));
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move {
                worker
                    .run(async {
                        let _ = stopped.await;
                    })
                    .await
            })
        };

        for _ in 0..200 {
            let mut done = 0;
            for id in &ids {
                done += store.check_count(*id).await;
            }
            if done == ids.len() && queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        stop.send(()).unwrap();
        handle.await.unwrap();

        for id in &ids {
            assert_eq!(store.check_count(*id).await, 1);
            let current = store.read_current(*id).await.unwrap();
            assert_eq!(current.claim_token, None);
            assert!(current.last_checked_at.is_some());
        }
    }

    #[tokio::test]
    async fn stops_promptly_when_idle() {
        let store = Arc::new(MemoryStore::new());
        let worker = CheckWorker::new(
            Arc::new(InMemoryWorkQueue::new()),
            executor(store),
            1,
            Duration::from_secs(60),
        );

        tokio::time::timeout(
            Duration::from_secs(2),
            worker.run(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .unwrap();
    }
}
