// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batch decommissioning against simulated backends.

use assert_matches::assert_matches;
use instance_provisioner::backends::InstanceInfo;
use instance_provisioner::instance::CreateStatus;
use instance_provisioner::instance::DeregisterStatus;
use instance_provisioner::instance::DestroyStatus;
use instance_provisioner::sim::test_setup_log;
use instance_provisioner::sim::SimEnvironment;
use instance_provisioner::sim::SIM_ZONE;
use instance_provisioner::Error;
use instance_provisioner::Provisioner;
use slog::Logger;

fn provisioner(log: &Logger, sim: &SimEnvironment) -> Provisioner {
    Provisioner::new(log, sim.config(), sim.backends(), sim.prober.clone())
}

/// Provisions `count` instances and returns them as the compute plane
/// reports them.
async fn provisioned(
    provisioner: &Provisioner,
    sim: &SimEnvironment,
    count: usize,
) -> Vec<InstanceInfo> {
    let specs = (1..=count)
        .map(|i| sim.spec(&format!("WEB-{i}"), &format!("web-{i}")))
        .collect();
    let report = provisioner.create_instances(specs).await.unwrap();
    assert!(report.outcomes.iter().all(|o| o.status == CreateStatus::Created));
    sim.clear_events();
    (1..=count)
        .map(|i| sim.compute.instance(&format!("WEB-{i}")).unwrap())
        .collect()
}

#[tokio::test]
async fn test_destroy_batch_releases_everything() {
    let log = test_setup_log("test_destroy_batch_releases_everything");
    let sim = SimEnvironment::new(&log);
    let provisioner = provisioner(&log, &sim);
    let targets = provisioned(&provisioner, &sim, 3).await;

    let report = provisioner.destroy_instances(targets, false).await;
    assert!(!report.any_failed());
    let names: Vec<_> =
        report.outcomes.iter().map(|o| o.target.name.as_str()).collect();
    assert_eq!(names, ["WEB-1", "WEB-2", "WEB-3"]);
    for outcome in &report.outcomes {
        assert_eq!(outcome.status, DestroyStatus::Deleted);
        assert_eq!(outcome.deregister, Some(DeregisterStatus::Deregistered));
    }
    assert_eq!(sim.compute.instance_count(), 0);
    assert_eq!(sim.ipam.record_count(), 0);
    assert!(sim.dns.records(SIM_ZONE).is_empty());
}

#[tokio::test]
async fn test_identity_mismatch_fails_only_that_instance() {
    let log = test_setup_log("test_identity_mismatch_fails_only_that");
    let sim = SimEnvironment::new(&log);
    let provisioner = provisioner(&log, &sim);
    let mut targets = provisioned(&provisioner, &sim, 2).await;
    // The guest claims to be someone else.
    targets[0].hostname = Some(String::from("db-9"));

    let report = provisioner.destroy_instances(targets.clone(), false).await;
    assert!(report.any_failed());
    let first = &report.outcomes[0];
    assert_eq!(first.status, DestroyStatus::DeletionError);
    assert_matches!(
        first.error,
        Some(Error::DecommissionFailure { ref name, .. }) if name == "WEB-1"
    );
    assert_eq!(report.outcomes[1].status, DestroyStatus::Deleted);
    assert!(sim.compute.instance("WEB-1").is_some());
    assert!(sim.compute.instance("WEB-2").is_none());
    assert_eq!(sim.dns.records(SIM_ZONE).len(), 1);

    // Forcing it removes the instance but leaves the records it could not
    // prove were its own.
    let report =
        provisioner.destroy_instances(vec![targets.remove(0)], true).await;
    assert_eq!(report.outcomes[0].status, DestroyStatus::Deleted);
    assert_eq!(report.outcomes[0].warnings.len(), 1);
    assert_eq!(sim.compute.instance_count(), 0);
    assert_eq!(sim.ipam.record_count(), 1);
}

#[tokio::test]
async fn test_forced_destroy_tolerates_backend_outages() {
    let log = test_setup_log("test_forced_destroy_tolerates_outages");
    let sim = SimEnvironment::new(&log);
    let provisioner = provisioner(&log, &sim);
    let targets = provisioned(&provisioner, &sim, 2).await;
    sim.dns.set_import_failure(true);
    sim.ipam.set_release_failure(true);

    let report = provisioner.destroy_instances(targets.clone(), false).await;
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.status == DestroyStatus::DeletionError));
    assert_eq!(sim.compute.instance_count(), 2);

    let report = provisioner.destroy_instances(targets, true).await;
    for outcome in &report.outcomes {
        assert_eq!(outcome.status, DestroyStatus::Deleted);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.warnings.len(), 2);
    }
    assert_eq!(sim.compute.instance_count(), 0);
}
