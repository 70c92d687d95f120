use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::AppError;

/// Bounded off-loading of blocking work (browser drivers) from the
/// scheduler threads.
#[derive(Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    max_threads: usize,
}

impl BlockingPool {
    pub fn new(max_threads: usize) -> Result<Self, AppError> {
        if max_threads == 0 {
            return Err(AppError::ConfigError(
                "blocking pool needs at least one thread".into(),
            ));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(max_threads)),
            max_threads,
        })
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Calls currently running.
    pub fn in_use(&self) -> usize {
        self.max_threads - self.permits.available_permits()
    }

    /// Run `f` on a blocking thread once a slot is free. A panic inside `f`
    /// comes back as an error.
    pub async fn run<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Result<T, AppError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| AppError::Generic("blocking pool shut down".into()))?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });

        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                tracing::error!(error = %e, "Blocking task panicked");
                Err(AppError::Generic(format!("blocking task panicked: {e}")))
            }
            Err(e) => Err(AppError::Generic(format!("blocking task aborted: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_runs_closure_off_thread() {
        let pool = BlockingPool::new(2).unwrap();
        let value = pool.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let pool = BlockingPool::new(1).unwrap();
        let result: Result<(), _> = pool.run(|| panic!("driver crashed")).await;
        assert!(matches!(result, Err(AppError::Generic(_))));

        // The slot is released after a panic.
        assert!(pool.run(|| Ok(())).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = BlockingPool::new(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(BlockingPool::new(0).is_err());
    }
}
