//! Runs the reusable queue validation suite against the in-memory work queue.

#[cfg(feature = "provider-test")]
mod tests {
    use courier::provider_validations::{run_lease_tests, run_queue_semantics_tests, QueueFactory};
    use courier::providers::in_memory::InMemoryWorkQueue;
    use courier::providers::WorkQueue;
    use std::sync::Arc;
    use std::time::Duration;

    struct InMemoryFactory;

    #[async_trait::async_trait]
    impl QueueFactory for InMemoryFactory {
        async fn create_queue(&self) -> Arc<dyn WorkQueue> {
            Arc::new(InMemoryWorkQueue::new())
        }

        fn lease_timeout(&self) -> Duration {
            Duration::from_millis(200)
        }
    }

    #[tokio::test]
    async fn test_in_memory_queue_semantics() {
        run_queue_semantics_tests(&InMemoryFactory).await;
    }

    #[tokio::test]
    async fn test_in_memory_leases() {
        run_lease_tests(&InMemoryFactory).await;
    }
}
