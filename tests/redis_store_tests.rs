
#[cfg(feature = "redis")]
mod redis_store_tests {
    use serde_json::{Map, json};
    use std::{sync::Arc, time::Duration};
    use workhorse::{JobOptions, JobStatus, RedisStore, Store, Workhorse, WorkhorseConfig};

    fn redis_url() -> String {
        std::env::var("WORKHORSE_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    /// A store plus a key namespace no other test run shares.
    async fn setup() -> (Arc<RedisStore>, String) {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let prefix = format!("workhorse-test-{}", uuid::Uuid::new_v4().simple());
        (Arc::new(store), prefix)
    }

    #[tokio::test]
    #[ignore] // Requires a Redis server
    async fn test_pop_before_claims_due_members_with_scores() {
        let (store, prefix) = setup().await;
        let key = format!("{}:scheduled", prefix);
        store.sorted_set_add(&key, "late", 300.0).await.unwrap();
        store.sorted_set_add(&key, "early", 100.0).await.unwrap();
        store.sorted_set_add(&key, "middle", 200.5).await.unwrap();

        let due = store.sorted_set_pop_before(&key, 200.5).await.unwrap();
        assert_eq!(
            due,
            vec![("early".to_string(), 100.0), ("middle".to_string(), 200.5)]
        );
        assert_eq!(store.sorted_set_len(&key).await.unwrap(), 1);
        assert!(store.sorted_set_pop_before(&key, 200.5).await.unwrap().is_empty());

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires a Redis server
    async fn test_concurrent_pop_before_claims_each_member_once() {
        let (store, prefix) = setup().await;
        let key = format!("{}:scheduled", prefix);
        for i in 0..50 {
            store
                .sorted_set_add(&key, &format!("entry-{}", i), i as f64)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.sorted_set_pop_before(&key, 1000.0).await.unwrap()
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.await.unwrap().into_iter().map(|(member, _)| member));
        }
        claimed.sort();
        let mut expected: Vec<String> = (0..50).map(|i| format!("entry-{}", i)).collect();
        expected.sort();
        assert_eq!(claimed, expected);
    }

    #[tokio::test]
    #[ignore] // Requires a Redis server
    async fn test_blocking_pop_prefers_first_key_and_times_out() {
        let (store, prefix) = setup().await;
        let high = format!("{}:queue:high", prefix);
        let low = format!("{}:queue:low", prefix);
        let keys = vec![high.clone(), low.clone()];

        store.list_push_back(&low, "b").await.unwrap();
        store.list_push_back(&high, "a").await.unwrap();
        assert_eq!(
            store
                .list_pop_front_blocking(&keys, Duration::from_millis(200))
                .await
                .unwrap(),
            Some((high.clone(), "a".to_string()))
        );
        assert_eq!(
            store
                .list_pop_front_blocking(&keys, Duration::ZERO)
                .await
                .unwrap(),
            Some((low.clone(), "b".to_string()))
        );

        let started = std::time::Instant::now();
        assert!(
            store
                .list_pop_front_blocking(&keys, Duration::from_millis(200))
                .await
                .unwrap()
                .is_none()
        );
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    #[ignore] // Requires a Redis server
    async fn test_blocking_pop_wakes_on_push() {
        let (store, prefix) = setup().await;
        let key = format!("{}:queue:default", prefix);

        let pusher = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                store.list_push_back(&key, "job-1").await.unwrap();
            })
        };

        let popped = store
            .list_pop_front_blocking(&[key.clone()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(popped, Some((key, "job-1".to_string())));
        pusher.await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires a Redis server
    async fn test_set_if_absent_writes_once() {
        let (store, prefix) = setup().await;
        let key = format!("{}:job:fixed", prefix);

        assert!(store.set_if_absent(&key, "first").await.unwrap());
        assert!(!store.set_if_absent(&key, "second").await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("first"));

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires a Redis server
    async fn test_submit_and_work_against_redis() {
        let (_, prefix) = setup().await;
        let (registry, _) = crate::test_utils::registry();
        let config = WorkhorseConfig::new()
            .with_redis_url(&redis_url())
            .with_key_prefix(&prefix);
        let workhorse = Workhorse::from_config(config, registry).await.unwrap();

        let parent = workhorse
            .submit_job("add", vec![json!(2), json!(3)], Map::new(), &JobOptions::new())
            .await
            .unwrap();
        let child = workhorse
            .submit_job(
                "add",
                vec![json!(1), json!(1)],
                Map::new(),
                &JobOptions::new().depends_on(parent.id.clone()),
            )
            .await
            .unwrap();
        assert_eq!(child.status, JobStatus::Deferred);

        let summary = workhorse.worker_loop(&["default"], true).await.unwrap();
        assert_eq!(summary.finished, 2);
        assert_eq!(workhorse.get_job(&parent.id).await.unwrap().result, Some(json!(5)));
        assert_eq!(workhorse.get_job(&child.id).await.unwrap().status, JobStatus::Finished);
    }
}
