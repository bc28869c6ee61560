//! Integration tests for deployment admission.

mod common;

use std::sync::Arc;

use common::TestControlPlane;
use launchpad_control::config::AdmissionConfig;
use launchpad_control::dispatch::MockScheduler;
use launchpad_control::{ControlError, DeploymentStatus, DeploymentStore, User, UserId};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_admit_one_deployment_per_project() {
    let plane = Arc::new(TestControlPlane::new());
    let alpha = plane.create_project("alpha-site").await;
    let beta = plane.create_project("beta-site").await;

    let mut requests = Vec::new();
    for i in 0..32 {
        let plane = Arc::clone(&plane);
        let project = if i % 2 == 0 { alpha.id.clone() } else { beta.id.clone() };
        requests.push(tokio::spawn(async move {
            plane.admission.request_deployment(&project, None).await
        }));
    }

    let mut admitted = Vec::new();
    let mut conflicts = 0;
    for request in requests {
        match request.await.unwrap() {
            Ok(record) => admitted.push(record),
            Err(ControlError::DeploymentInFlight { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(admitted.len(), 2);
    assert_eq!(conflicts, 30);
    assert!(admitted.iter().any(|r| r.project_id == alpha.id));
    assert!(admitted.iter().any(|r| r.project_id == beta.id));
    assert_eq!(plane.scheduler.launched().unwrap().len(), 2);
}

#[tokio::test]
async fn failed_dispatch_frees_the_project() {
    let plane = TestControlPlane::with_scheduler(MockScheduler::rejecting("no capacity"));
    let project = plane.create_project("portfolio").await;

    let err = plane
        .admission
        .request_deployment(&project.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::DispatchFailure { .. }));

    // The failed attempt does not hold the in-flight slot.
    let err = plane
        .admission
        .request_deployment(&project.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::DispatchFailure { .. }));
    assert_eq!(plane.scheduler.launched().unwrap().len(), 2);
}

#[tokio::test]
async fn enforced_ownership_limits_requests_to_the_owner() {
    let plane = TestControlPlane::with_config(
        MockScheduler::default(),
        AdmissionConfig {
            enforce_ownership: true,
        },
        4,
    );
    let owner = plane.store.upsert_user("owner@example.com").await.unwrap();
    let project = plane.create_project("portfolio").await;

    let err = plane
        .admission
        .request_deployment(&project.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Forbidden(_)));

    // An unowned project is claimed by its first authenticated deployer.
    let record = plane
        .admission
        .request_deployment(&project.id, Some(&owner))
        .await
        .unwrap();
    assert_eq!(plane.status(&record.id).await, DeploymentStatus::InProgress);

    let claimed = plane.store.get_project(&project.id).await.unwrap().unwrap();
    assert_eq!(claimed.owner_id, Some(owner.id));

    let stranger = User {
        id: UserId::generate(),
        email: "stranger@example.com".to_owned(),
    };
    let err = plane
        .admission
        .request_deployment(&project.id, Some(&stranger))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Forbidden(_)));
}
