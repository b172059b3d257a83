//! Concurrency tests for the session registry and admission path
//!
//! These tests validate the teardown guarantees under contention:
//! - Concurrent inserts with distinct handles all land
//! - A handle can be extracted only once
//! - Close racing a forced interrupt tears the session down exactly once

use std::sync::Arc;

use lanekeeper_core::{
    CloseSessionRequest, CreateSessionRequest, GraphDef, Instance, InstanceConfig, LaneConfig,
    LocalEngine, MemoryEventBus, RegistryError, ResourceMap, SessionConfig, SessionError,
    SessionRegistry,
};

fn instance(engine: Arc<LocalEngine>, lanes: usize) -> Arc<Instance> {
    let config = InstanceConfig {
        lanes: (0..lanes)
            .map(|_| LaneConfig {
                gpu: 0,
                memory: 1000,
                streams: 1,
            })
            .collect(),
        ..InstanceConfig::default()
    };
    Arc::new(Instance::new(config, engine, Arc::new(MemoryEventBus::new(1000))).unwrap())
}

fn request(memory: f64) -> CreateSessionRequest {
    CreateSessionRequest {
        graph_def: GraphDef::linear(["Const"]),
        config: SessionConfig {
            name: None,
            resource_map: ResourceMap::new().with_persistent("MEMORY:GPU", memory),
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inserts_with_distinct_handles_all_succeed() {
    let registry: Arc<SessionRegistry<usize>> = Arc::new(SessionRegistry::new());
    let mut handles = vec![];

    for i in 0..16 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            for j in 0..16 {
                registry.insert(format!("s{i}-{j}"), Arc::new(i * 16 + j)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(registry.len(), 256);
    for i in 0..16 {
        for j in 0..16 {
            assert_eq!(*registry.find(&format!("s{i}-{j}")).unwrap(), i * 16 + j);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_extract_succeeds_exactly_once() {
    let registry: Arc<SessionRegistry<u32>> = Arc::new(SessionRegistry::new());
    registry.insert("h".to_string(), Arc::new(7)).unwrap();

    let mut tasks = vec![];
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move { registry.extract("h") }));
    }

    let mut won = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => won += 1,
            Err(e) => assert_eq!(e, RegistryError::NotFound("h".to_string())),
        }
    }
    assert_eq!(won, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_share_lanes_without_overcommit() {
    let engine = Arc::new(LocalEngine::new());
    let instance = instance(engine.clone(), 2);
    let mut tasks = vec![];

    // 20 sessions of 300 bytes against 2 x 1000 bytes: at most 6 fit at once
    for _ in 0..20 {
        let instance = Arc::clone(&instance);
        tasks.push(tokio::spawn(async move {
            let handle = instance.create_session(request(300.0)).await?.session_handle;
            for lane in instance.lane_manager().lanes() {
                assert!(lane.available_memory() <= lane.total_memory());
            }
            tokio::task::yield_now().await;
            instance
                .close_session(CloseSessionRequest {
                    session_handle: handle,
                })
                .await?;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(instance.session_count(), 0);
    assert_eq!(engine.finished_contexts(), 20);
    for lane in instance.lane_manager().lanes() {
        assert_eq!(lane.available_memory(), 1000);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_racing_interrupt_tears_down_once() {
    for _ in 0..50 {
        let engine = Arc::new(LocalEngine::new());
        let instance = instance(engine.clone(), 1);
        let handle = instance
            .create_session(request(500.0))
            .await
            .unwrap()
            .session_handle;

        let closer = {
            let instance = Arc::clone(&instance);
            let handle = handle.clone();
            tokio::spawn(async move {
                instance
                    .close_session(CloseSessionRequest {
                        session_handle: handle,
                    })
                    .await
            })
        };
        let interrupter = {
            let engine = Arc::clone(&engine);
            tokio::task::spawn_blocking(move || engine.interrupt_all())
        };

        let closed = closer.await.unwrap();
        interrupter.await.unwrap();

        match closed {
            Ok(()) => {}
            Err(SessionError::NotFound(h)) => assert_eq!(h, handle),
            Err(other) => panic!("unexpected close error: {other}"),
        }
        assert_eq!(engine.finished_contexts(), 1);
        assert_eq!(engine.live_contexts(), 0);
        assert_eq!(instance.session_count(), 0);
        assert_eq!(instance.lane_manager().lanes()[0].available_memory(), 1000);
    }
}
