use std::sync::{Arc, Mutex};

use conveyor_database::RedisPool;
use conveyor_graceful_shutdown::ShutdownListener;
use conveyor_queues::{Error, Queue, QueueSettings};
use fxhash::FxHashMap;
use tracing::{event, Level};

/// Process-wide registry of queue handles sharing one pool and settings
/// template. Jobs hold a queue name, not a queue; anything that needs the
/// handle back resolves it here.
pub struct QueueRegistry(Arc<RegistryInner>);

struct RegistryInner {
    pool: RedisPool,
    template: QueueSettings,
    shutdown: ShutdownListener,
    /// Start the promoter and stalled-checker loops on every queue created
    /// through this registry.
    run_maintenance: bool,
    queues: Mutex<FxHashMap<String, Queue>>,
}

impl Clone for QueueRegistry {
    fn clone(&self) -> Self {
        QueueRegistry(self.0.clone())
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.names())
            .finish()
    }
}

impl QueueRegistry {
    pub fn new(
        pool: RedisPool,
        template: QueueSettings,
        shutdown: ShutdownListener,
        run_maintenance: bool,
    ) -> QueueRegistry {
        QueueRegistry(Arc::new(RegistryInner {
            pool,
            template,
            shutdown,
            run_maintenance,
            queues: Mutex::new(FxHashMap::default()),
        }))
    }

    /// Fetch the queue with this name, creating it on first use.
    pub fn get(&self, name: &str) -> Result<Queue, Error> {
        let mut queues = self.0.queues.lock().unwrap();
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }

        let queue = Queue::new(
            self.0.pool.clone(),
            name.to_string(),
            self.0.template.clone(),
        )?;
        if self.0.run_maintenance {
            queue.start_delayed_promoter(self.0.shutdown.clone());
            queue.start_stalled_checker(self.0.shutdown.clone());
        }
        queues.insert(name.to_string(), queue.clone());
        event!(Level::INFO, queue=%name, "Registered queue");
        Ok(queue)
    }

    pub fn names(&self) -> Vec<String> {
        self.0.queues.lock().unwrap().keys().cloned().collect()
    }

    /// Stop every queue's background loops and forget the handles. Redis
    /// state is untouched.
    pub fn close_all(&self) {
        let queues = {
            let mut map = self.0.queues.lock().unwrap();
            map.drain().collect::<Vec<_>>()
        };
        for (name, queue) in queues {
            queue.close();
            event!(Level::INFO, queue=%name, "Closed queue");
        }
    }
}
