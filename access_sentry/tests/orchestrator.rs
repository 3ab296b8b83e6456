mod common;

use std::sync::Arc;
use std::time::Duration;

use access_sentry::orchestrator::{ControlStatus, Orchestrator, PipelineSettings, PipelineState};
use access_sentry::store::{MemoryStore, ReferenceImage, StoredIdentity};
use common::{eventually, MockBackend};

fn orchestrator(backend: MockBackend) -> Orchestrator {
    let store = Arc::new(MemoryStore::new());
    Orchestrator::new(
        Arc::new(backend),
        store.clone(),
        store,
        PipelineSettings::default(),
    )
}

#[test]
fn start_and_stop_are_idempotent() {
    let backend = MockBackend::default();
    let pipeline = orchestrator(backend.clone());
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.stop(), ControlStatus::NotRunning);

    assert_eq!(pipeline.start().unwrap(), ControlStatus::Started);
    assert_eq!(pipeline.start().unwrap(), ControlStatus::AlreadyRunning);
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert_eq!(backend.opened.count(), 1);

    assert!(pipeline.frames().wait_for(Duration::from_secs(2)).is_some());

    assert_eq!(pipeline.stop(), ControlStatus::Stopped);
    assert!(backend.released());
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.stop(), ControlStatus::NotRunning);
}

#[test]
fn end_of_stream_stops_the_pipeline() {
    let backend = MockBackend {
        frames: Some(3),
        ..Default::default()
    };
    let pipeline = orchestrator(backend.clone());
    assert_eq!(pipeline.start().unwrap(), ControlStatus::Started);

    assert!(eventually(|| pipeline.state() == PipelineState::Stopped));
    assert!(backend.released());
    assert_eq!(pipeline.frames().sequence(), 3);
    assert_eq!(pipeline.stop(), ControlStatus::NotRunning);

    // A stopped pipeline can be started again with a fresh camera.
    assert_eq!(pipeline.start().unwrap(), ControlStatus::Started);
    assert_eq!(backend.opened.count(), 2);
    pipeline.stop();
}

#[test]
fn model_failure_is_reported_by_start() {
    let pipeline = orchestrator(MockBackend {
        fail_models: true,
        ..Default::default()
    });
    let err = pipeline.start().unwrap_err();
    assert!(err.to_string().contains("model file missing"));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.stop(), ControlStatus::NotRunning);
}

#[test]
fn camera_failure_is_reported_by_start() {
    let pipeline = orchestrator(MockBackend {
        fail_capture: true,
        ..Default::default()
    });
    assert!(pipeline.start().is_err());
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(pipeline.frames().read().is_none());
}

#[test]
fn registry_is_loaded_from_the_store_on_start() {
    let backend = MockBackend {
        frames: Some(1),
        ..Default::default()
    };
    // Undecodable reference image: skipped with a warning, start still works.
    let store = Arc::new(MemoryStore::with_identities(vec![StoredIdentity {
        name: "Asha".into(),
        roll_no: "21CS01".into(),
        branch: "CSE".into(),
        images: vec![ReferenceImage {
            name: "broken.jpg".into(),
            data: vec![1, 2, 3],
        }],
        vehicle: None,
    }]));
    let pipeline = Orchestrator::new(
        Arc::new(backend),
        store.clone(),
        store,
        PipelineSettings::default(),
    );
    assert_eq!(pipeline.start().unwrap(), ControlStatus::Started);
    assert!(eventually(|| pipeline.state() == PipelineState::Stopped));
}
