use std::sync::Arc;

use crate::signal::Source;

/// Trait for waiting on signal values asynchronously
pub trait Wait<T: 'static> {
    /// Wait for the signal to match a specific value
    fn wait_value(&self, target_value: T) -> impl std::future::Future<Output = ()> + Send
    where T: PartialEq + Clone + Send + Sync;

    /// Wait for the signal to reach a value matching the given predicate
    fn wait_for<F, R>(&self, predicate: F) -> impl std::future::Future<Output = R::Output> + Send
    where
        F: Fn(&T) -> R + Send + Sync + 'static,
        R: WaitResult,
        T: Send + Sync;
}

/// Helper trait for `wait_for` to allow flexible predicate return types.
///
/// ## Semantics
/// - `result()` returns `Some(output)` to stop waiting and return `output`
/// - `result()` returns `None` to continue waiting for the next signal update
pub trait WaitResult {
    type Output;
    /// Returns Some(output) if we should stop waiting, None if we should continue
    fn result(self) -> Option<Self::Output>;
}

// Blanket impl for bool: true = stop with (), false = continue waiting
impl WaitResult for bool {
    type Output = ();
    fn result(self) -> Option<Self::Output> { if self { Some(()) } else { None } }
}

// Blanket impl for Option<T>: Some(value) = stop with value, None = continue waiting
impl<T> WaitResult for Option<T> {
    type Output = T;
    fn result(self) -> Option<Self::Output> { self }
}

// Values arrive with each notification, so no re-read is needed after the first check.
// A failed read (a terminated derivation) simply does not match.
impl<T, S> Wait<T> for S
where
    S: Source<T>,
    T: Clone + Send + Sync + 'static,
{
    fn wait_value(&self, target_value: T) -> impl std::future::Future<Output = ()> + Send
    where T: PartialEq + Clone + Send + Sync {
        self.wait_for(move |value: &T| *value == target_value)
    }

    fn wait_for<F, R>(&self, predicate: F) -> impl std::future::Future<Output = R::Output> + Send
    where
        F: Fn(&T) -> R + Send + Sync + 'static,
        R: WaitResult,
        T: Send + Sync,
    {
        // Subscribe before checking the current value so no change slips between the two
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = self.listen_value(Arc::new(move |value: T| {
            let _ = tx.send(value);
        }));
        let current = self.read().ok();

        async move {
            let _subscription = subscription;
            if let Some(result) = current.and_then(|value| predicate(&value).result()) {
                return result;
            }

            while let Some(value) = rx.recv().await {
                if let Some(result) = predicate(&value).result() {
                    return result;
                }
            }

            // The source went away without matching
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeriveCache, Mut, projection};
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_value() {
        let signal = Mut::new(0);
        let setter = signal.clone();
        tokio::spawn(async move {
            for i in 1..=5 {
                tokio::time::sleep(Duration::from_millis(1)).await;
                setter.set(i);
            }
        });
        tokio::time::timeout(Duration::from_secs(5), signal.read().wait_value(4)).await.expect("timed out");
    }

    #[test]
    fn test_wait_stays_pending_until_match() {
        use tokio_test::{assert_pending, assert_ready, task};

        let signal = Mut::new(0);
        let reader = signal.read();
        let mut waiting = task::spawn(reader.wait_value(2));
        assert_pending!(waiting.poll());

        signal.set(1);
        assert!(waiting.is_woken());
        assert_pending!(waiting.poll());

        signal.set(2);
        assert_ready!(waiting.poll());
    }

    #[tokio::test]
    async fn test_wait_for_returns_output() {
        let signal = Mut::new(10);
        // Already satisfied
        let doubled = signal.wait_for(|value: &i32| (*value >= 10).then_some(value * 2)).await;
        assert_eq!(doubled, 20);
    }

    #[tokio::test]
    async fn test_wait_on_derived() {
        let cache = DeriveCache::default();
        let signal = Mut::new(1);
        let is_big = cache.get_or_create(&signal, &projection(|value: &i32| *value > 100));

        let waiter = tokio::spawn({
            let is_big = is_big.clone();
            async move { is_big.wait_value(true).await }
        });
        tokio::task::yield_now().await;
        signal.set(50);
        signal.set(500);
        tokio::time::timeout(Duration::from_secs(5), waiter).await.expect("timed out").expect("join");
    }
}
