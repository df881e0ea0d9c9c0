//! Per-instance pools of long-lived stdio sessions.
//!
//! stdio-backed instances cannot multiplex one child across concurrent
//! requests the way HTTP keep-alive does, so the router borrows a pooled
//! child process for the duration of each call. Pool size bounds concurrent
//! borrows per instance; waiters queue up to a bounded depth and overflow
//! fails with `QueueFull` (surfaced as 503).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::ExecSpec;
use crate::connection::StdioConnection;
use crate::error::StevedoreError;
use crate::gateway::registry::{Endpoint, InstanceRecord};

#[derive(Debug, Clone)]
pub struct StdioPoolConfig {
    /// Long-lived children kept per instance.
    pub size: usize,
    /// Waiters allowed beyond the pool before overflow returns 503.
    pub queue_depth: usize,
    /// Per-call timeout on pooled sessions.
    pub call_timeout: Duration,
}

impl Default for StdioPoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            queue_depth: 8,
            call_timeout: Duration::from_secs(30),
        }
    }
}

struct InstancePool {
    instance_id: String,
    spec: ExecSpec,
    /// Sessions not currently borrowed.
    idle: Mutex<Vec<Arc<StdioConnection>>>,
    /// One permit per pool slot.
    slots: Arc<Semaphore>,
    /// Current waiters, for the overflow check.
    queued: AtomicUsize,
}

pub struct StdioPools {
    config: StdioPoolConfig,
    pools: DashMap<String, Arc<InstancePool>>,
}

impl StdioPools {
    pub fn new(config: StdioPoolConfig) -> Self {
        Self {
            config,
            pools: DashMap::new(),
        }
    }

    /// Borrow a session for one call. Spawns children lazily up to the pool
    /// size; beyond that, waits in the bounded queue.
    pub async fn acquire(&self, instance: &InstanceRecord) -> crate::Result<PooledSession> {
        let Endpoint::Stdio {
            ref program,
            ref args,
            ref env,
        } = instance.endpoint
        else {
            return Err(StevedoreError::Protocol(
                instance.instance_id.clone(),
                "stdio pool requires a stdio endpoint".to_string(),
            ));
        };

        let pool = self
            .pools
            .entry(instance.instance_id.clone())
            .or_insert_with(|| {
                Arc::new(InstancePool {
                    instance_id: instance.instance_id.clone(),
                    spec: ExecSpec {
                        program: program.clone(),
                        args: args.clone(),
                        env: env.clone(),
                    },
                    idle: Mutex::new(Vec::new()),
                    slots: Arc::new(Semaphore::new(self.config.size.max(1))),
                    queued: AtomicUsize::new(0),
                })
            })
            .clone();

        if pool.slots.available_permits() == 0
            && pool.queued.load(Ordering::SeqCst) >= self.config.queue_depth
        {
            return Err(StevedoreError::QueueFull(instance.instance_id.clone()));
        }

        pool.queued.fetch_add(1, Ordering::SeqCst);
        let permit = pool
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore never closed");
        pool.queued.fetch_sub(1, Ordering::SeqCst);

        // Reuse an idle live session or spawn a fresh child.
        let session = loop {
            let candidate = pool.idle.lock().expect("pool idle list poisoned").pop();
            match candidate {
                Some(session) if !session.is_closed() => break session,
                Some(dead) => {
                    // Dead children are discarded, not returned to callers.
                    tokio::spawn(async move { dead.close().await });
                }
                None => {
                    let session = StdioConnection::spawn(
                        pool.instance_id.clone(),
                        &pool.spec,
                        self.config.call_timeout,
                    )?;
                    break Arc::new(session);
                }
            }
        };

        Ok(PooledSession {
            session,
            pool,
            _permit: permit,
        })
    }

    /// Tear down an instance's pool (on deregistration).
    pub fn remove_instance(&self, instance_id: &str) {
        if let Some((_, pool)) = self.pools.remove(instance_id) {
            let sessions: Vec<Arc<StdioConnection>> =
                pool.idle.lock().expect("pool idle list poisoned").drain(..).collect();
            for session in sessions {
                tokio::spawn(async move { session.close().await });
            }
        }
    }
}

/// A borrowed stdio session; returns to the pool on drop.
pub struct PooledSession {
    session: Arc<StdioConnection>,
    pool: Arc<InstancePool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    /// Issue one JSON-RPC call on the borrowed child.
    pub async fn request(&self, method: &str, params: Option<Value>) -> crate::Result<Value> {
        self.session.request(method, params).await
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if !self.session.is_closed() {
            self.pool
                .idle
                .lock()
                .expect("pool idle list poisoned")
                .push(self.session.clone());
        }
        // The permit releases with the guard, admitting the next waiter.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn responder_instance(id: &str) -> InstanceRecord {
        let script = r#"while read line; do id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p'); printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"; done"#;
        InstanceRecord::stdio(
            id,
            "demo",
            "sh",
            vec!["-c".to_string(), script.to_string()],
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn test_borrow_request_and_reuse() {
        let pools = StdioPools::new(StdioPoolConfig {
            size: 1,
            queue_depth: 4,
            call_timeout: Duration::from_secs(5),
        });
        let instance = responder_instance("i-1");

        let session = pools.acquire(&instance).await.unwrap();
        let result = session.request("tools/list", None).await.unwrap();
        assert_eq!(result["ok"], true);
        drop(session);

        // The same child is reused for the next borrow.
        let again = pools.acquire(&instance).await.unwrap();
        let result = again.request("tools/list", None).await.unwrap();
        assert_eq!(result["ok"], true);
        let pool = pools.pools.get("i-1").unwrap().clone();
        drop(again);
        assert_eq!(pool.idle.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_saturated_pool_with_zero_queue_is_queue_full() {
        let pools = StdioPools::new(StdioPoolConfig {
            size: 1,
            queue_depth: 0,
            call_timeout: Duration::from_secs(5),
        });
        let instance = responder_instance("i-1");

        let held = pools.acquire(&instance).await.unwrap();
        let overflow = pools.acquire(&instance).await;
        assert!(matches!(overflow, Err(StevedoreError::QueueFull(id)) if id == "i-1"));
        drop(held);

        // With the slot free again, acquisition succeeds.
        assert!(pools.acquire(&instance).await.is_ok());
    }

    #[tokio::test]
    async fn test_queued_waiter_proceeds_when_slot_frees() {
        let pools = Arc::new(StdioPools::new(StdioPoolConfig {
            size: 1,
            queue_depth: 4,
            call_timeout: Duration::from_secs(5),
        }));
        let instance = responder_instance("i-1");

        let held = pools.acquire(&instance).await.unwrap();
        let waiter = {
            let pools = pools.clone();
            let instance = instance.clone();
            tokio::spawn(async move { pools.acquire(&instance).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished(), "waiter must queue while pool is full");
        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dead_session_not_reused() {
        let pools = StdioPools::new(StdioPoolConfig {
            size: 1,
            queue_depth: 4,
            call_timeout: Duration::from_millis(400),
        });
        // Child that answers once then exits: second borrow must respawn.
        let script = r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'"#;
        let instance = InstanceRecord::stdio(
            "i-1",
            "demo",
            "sh",
            vec!["-c".to_string(), script.to_string()],
            BTreeMap::new(),
        );

        let session = pools.acquire(&instance).await.unwrap();
        assert!(session.request("initialize", None).await.is_ok());
        drop(session);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The child exited after its single reply; the pool spawns a new one
        // and the request still succeeds.
        let session = pools.acquire(&instance).await.unwrap();
        assert!(session.request("initialize", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_instance_drops_pool() {
        let pools = StdioPools::new(StdioPoolConfig::default());
        let instance = responder_instance("i-1");
        let session = pools.acquire(&instance).await.unwrap();
        drop(session);
        pools.remove_instance("i-1");
        assert!(pools.pools.get("i-1").is_none());
    }
}
