//! Release workers: background tasks that finish connection releases.
//!
//! `PooledConnection::close` only flips the handle to RELEASING and queues
//! it here. A worker then closes the lease's statements, resets the
//! session and pushes the handle onto its partition's free list, so the
//! caller's return path never pays for that bookkeeping. Each partition
//! has one FIFO queue shared by `release_helper_threads` workers. With zero
//! workers no queues exist and releases finish inline.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::PoolConfig;
use crate::handle::ConnectionHandle;
use crate::pool::PoolInner;

type Queue = mpsc::UnboundedReceiver<Arc<ConnectionHandle>>;

/// One queue per partition, or none when release is synchronous.
pub(crate) fn channels(
    config: &PoolConfig,
) -> (Vec<mpsc::UnboundedSender<Arc<ConnectionHandle>>>, Vec<Queue>) {
    if config.release_helper_threads == 0 {
        return (Vec::new(), Vec::new());
    }
    (0..config.partition_count)
        .map(|_| mpsc::unbounded_channel())
        .unzip()
}

/// Spawn the workers for every partition queue.
pub(crate) fn spawn(inner: &Arc<PoolInner>, queues: Vec<Queue>) -> Vec<JoinHandle<()>> {
    let workers = inner.config.release_helper_threads;
    let mut tasks = Vec::with_capacity(queues.len() * workers);
    for (partition, queue) in queues.into_iter().enumerate() {
        let queue = Arc::new(Mutex::new(queue));
        for worker in 0..workers {
            let inner = inner.clone();
            let queue = queue.clone();
            let shutdown = inner.shutdown_signal();
            tasks.push(tokio::spawn(async move {
                run_release_worker(inner, partition, worker, queue, shutdown).await;
            }));
        }
    }
    tasks
}

async fn run_release_worker(
    inner: Arc<PoolInner>,
    partition: usize,
    worker: usize,
    queue: Arc<Mutex<Queue>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(partition, worker, "release worker starting");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                handle = queue.recv() => handle,
                _ = shutdown.changed() => None,
            }
        };
        match next {
            Some(handle) => inner.finish_release(&handle),
            None => break,
        }
    }

    // Anything still queued is finished (and, with the pool closed,
    // destroyed) rather than dropped.
    let mut queue = queue.lock().await;
    while let Ok(handle) = queue.try_recv() {
        inner.finish_release(&handle);
    }
    debug!(partition, worker, "release worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::Pool;
    use crate::driver::Credentials;
    use crate::mock::MockDriver;

    #[test]
    fn no_queues_without_workers() {
        let config = PoolConfig::new("mock:db", Credentials::default())
            .with_partitions(3, 1, 2)
            .with_release_helper_threads(0);
        let (senders, receivers) = channels(&config);
        assert!(senders.is_empty());
        assert!(receivers.is_empty());
    }

    #[test]
    fn one_queue_per_partition() {
        let config = PoolConfig::new("mock:db", Credentials::default()).with_partitions(3, 1, 2);
        let (senders, receivers) = channels(&config);
        assert_eq!(senders.len(), 3);
        assert_eq!(receivers.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_release_reaches_free_list() {
        let config = PoolConfig::new("mock:db", Credentials::default())
            .with_partitions(1, 2, 2)
            .with_release_helper_threads(2);
        let pool = Pool::new(config, Arc::new(MockDriver::new())).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        conn.close();
        for _ in 0..100 {
            if pool.total_free() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.total_free(), 2);
        assert_eq!(pool.total_leased(), 0);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_workers() {
        let config = PoolConfig::new("mock:db", Credentials::default())
            .with_partitions(2, 1, 2)
            .with_release_helper_threads(3);
        let driver = MockDriver::new();
        let pool = Pool::new(config, Arc::new(driver.clone())).await.unwrap();
        let conn = pool.acquire().await.unwrap();
        conn.close();

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .expect("shutdown should not hang");
        assert_eq!(driver.state().connections_closed(), 2);
    }
}
