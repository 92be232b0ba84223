//! Connection Manager Tests
//!
//! Uses the in-process backend, whose open/close counters make the ref-counting visible.

#[cfg(test)]
mod tests {
    use crate::connection::{ConnectionManager, ExecutionContext};
    use crate::error::StoreError;
    use crate::keys::StoreKey;
    use crate::store::memory::MemoryBackend;
    use std::sync::Arc;

    fn manager() -> (MemoryBackend, ConnectionManager) {
        let backend = MemoryBackend::new();
        let manager = ConnectionManager::new(Arc::new(backend.clone()));
        (backend, manager)
    }

    // ============================================================
    // REF-COUNTING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_nested_acquire_shares_one_connection() {
        let (backend, manager) = manager();
        let context = ExecutionContext::new();

        let outer = manager.acquire(&context).await.unwrap();
        let inner = manager.acquire(&context).await.unwrap();

        assert_eq!(backend.connections_opened(), 1);
        assert_eq!(manager.holders(&context), 2);

        // Both handles see the same data through the same connection
        inner.set(&StoreKey::node("x"), b"1").await.unwrap();
        assert_eq!(outer.get(&StoreKey::node("x")).await.unwrap(), Some(b"1".to_vec()));

        manager.release(inner);
        manager.release(outer);
    }

    #[tokio::test]
    async fn test_n_acquires_n_releases_close_exactly_once() {
        let (backend, manager) = manager();
        let context = ExecutionContext::new();

        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(manager.acquire(&context).await.unwrap());
        }

        // Release all but the outermost: still open
        while handles.len() > 1 {
            manager.release(handles.pop().unwrap());
            assert_eq!(backend.connections_closed(), 0);
        }

        manager.release(handles.pop().unwrap());
        assert_eq!(backend.connections_closed(), 1);
        assert_eq!(backend.connections_opened(), 1);
        assert_eq!(manager.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_reacquire_after_full_release_opens_new_connection() {
        let (backend, manager) = manager();
        let context = ExecutionContext::new();

        drop(manager.acquire(&context).await.unwrap());
        let again = manager.acquire(&context).await.unwrap();

        assert_eq!(backend.connections_opened(), 2);
        assert!(!again.is_closed());
    }

    #[tokio::test]
    async fn test_contexts_do_not_share() {
        let (backend, manager) = manager();
        let first = ExecutionContext::new();
        let second = ExecutionContext::new();

        let a = manager.acquire(&first).await.unwrap();
        let b = manager.acquire(&second).await.unwrap();

        assert_eq!(backend.connections_opened(), 2);
        assert_ne!(a.context_id(), b.context_id());

        drop(a);
        assert_eq!(backend.connections_closed(), 1);
        assert!(!b.is_closed(), "Releasing one context must not affect another");
    }

    // ============================================================
    // CLOSED CONTEXT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_acquire_on_closed_context_fails() {
        let (_backend, manager) = manager();
        let context = ExecutionContext::new();

        let handle = manager.acquire(&context).await.unwrap();
        manager.end_context(&context);

        assert!(handle.is_closed());
        let result = manager.acquire(&context).await;
        assert!(matches!(result, Err(StoreError::ContextClosed)));

        // Dropping a handle of an ended context is harmless
        drop(handle);
    }

    #[tokio::test]
    async fn test_shutdown_all_closes_everything() {
        let (backend, manager) = manager();
        let contexts: Vec<ExecutionContext> = (0..3).map(|_| ExecutionContext::new()).collect();

        let mut handles = Vec::new();
        for context in &contexts {
            handles.push(manager.acquire(context).await.unwrap());
        }

        manager.shutdown_all();

        assert_eq!(backend.connections_closed(), 3);
        assert!(handles.iter().all(|handle| handle.is_closed()));
        assert!(matches!(
            handles[0].get(&StoreKey::node("x")).await,
            Err(StoreError::ConnectionClosed)
        ));
        assert!(matches!(
            manager.acquire(&ExecutionContext::new()).await,
            Err(StoreError::ContextClosed)
        ));

        drop(handles);
        assert_eq!(backend.connections_closed(), 3, "No double close after shutdown");
    }
}
