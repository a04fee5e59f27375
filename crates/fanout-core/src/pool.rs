//! Per-batch connection pool
//!
//! A pool lives for one executor call. Pipelines check a connection out,
//! use it exclusively and check it back in; the executor drains the pool
//! when the call ends, so no session outlives the batch that opened it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use fanout_exec::{Connection, ConnectionState, ExecError, Target};

use crate::factory::ConnectionFactory;

/// Idle connections keyed by target name
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<HashMap<String, Box<dyn Connection>>>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Take the idle connection for `target`, or create a new one
    ///
    /// # Errors
    /// Returns the factory's error if no connection can be created
    pub async fn checkout(&self, target: &Target) -> Result<Box<dyn Connection>, ExecError> {
        if let Some(conn) = self.idle.lock().await.remove(&target.name) {
            debug!(target_name = %target.name, "reusing pooled connection");
            return Ok(conn);
        }
        self.factory.create(target).await
    }

    /// Return a connection for reuse
    ///
    /// Connections that are not connected are dropped. If the slot is taken
    /// by another connection to the same target, the returned one is closed.
    pub async fn checkin(&self, conn: Box<dyn Connection>) {
        if conn.state() != ConnectionState::Connected {
            return;
        }
        let name = conn.target().name.clone();
        let extra = {
            let mut idle = self.idle.lock().await;
            if idle.contains_key(&name) {
                Some(conn)
            } else {
                idle.insert(name, conn);
                None
            }
        };
        if let Some(mut conn) = extra {
            close(conn.as_mut()).await;
        }
    }

    /// Number of idle connections
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Disconnect every idle connection
    pub async fn drain(&self) {
        let conns: Vec<_> = self.idle.lock().await.drain().map(|(_, c)| c).collect();
        for mut conn in conns {
            close(conn.as_mut()).await;
        }
    }
}

/// Disconnect, logging rather than returning failures
pub(crate) async fn close(conn: &mut dyn Connection) {
    if let Err(e) = conn.disconnect().await {
        warn!(
            target_name = %conn.target().name,
            transport = conn.transport_name(),
            error = %e,
            "failed to disconnect"
        );
    }
}
