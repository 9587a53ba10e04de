use std::collections::HashMap;
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use release_test_core::client::DesiredStateClient;
use release_test_core::config::RunnerConfig;
use release_test_core::mutator::{Mutator, PeeringSet};
use release_test_core::reachability::{Endpoint, ReachabilitySnapshot};
use release_test_core::runner::{
    RunConfig, Runner, Suite, SuiteReport, TestCase, TestStatus,
};
use release_test_core::vpc::{PeeringEntry, Subnet, Vpc, VpcMode, VpcPeering};
use release_test_core::junit;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();
}

fn baseline_vpcs() -> HashMap<String, Vpc> {
    let mut subnets = HashMap::new();
    subnets.insert(
        "subnet-01".to_string(),
        Subnet {
            cidr: "10.0.1.0/24".into(),
            vlan: 1001,
            gateway: Some("10.0.1.1".into()),
            isolated: false,
            restricted: false,
            host_bgp: false,
            dhcp: Default::default(),
        },
    );
    let mut vpcs = HashMap::new();
    for name in ["vpc-a", "vpc-b"] {
        vpcs.insert(
            name.to_string(),
            Vpc {
                name: name.to_string(),
                mode: VpcMode::L2Vni,
                subnets: subnets.clone(),
                permit: vec![],
            },
        );
    }
    vpcs
}

/// A small suite of reachability-invariant checks that exercise the
/// Topology Mutator (F) and Reachability Oracle (D) end to end without
/// requiring a live SSH-reachable lab; full suites covering the Connectivity
/// Prober and Fault Injection are driven by the CLI collaborator against a
/// booted lab.
fn invariant_suite(vpc_peering_client: DesiredStateClient<VpcPeering>) -> Suite {
    let vpcs = baseline_vpcs();

    let no_peering_client = vpc_peering_client.clone();
    let no_peering_vpcs = vpcs.clone();
    let no_peering_body = move |_cancel: CancellationToken| {
        let client = no_peering_client.clone();
        let vpcs = no_peering_vpcs.clone();
        Box::pin(async move {
            match client.list().await {
                Ok(peerings) => {
                    let groups = HashMap::new();
                    let snapshot = ReachabilitySnapshot {
                        vpcs: &vpcs,
                        vpc_peerings: &peerings,
                        externals: &HashMap::new(),
                        external_peerings: &[],
                        gateway_peerings: &[],
                        vpc_switch_groups: &groups,
                    };
                    let src = Endpoint::VpcSubnet {
                        vpc: "vpc-a".into(),
                        subnet: "subnet-01".into(),
                    };
                    let dst = Endpoint::VpcSubnet {
                        vpc: "vpc-b".into(),
                        subnet: "subnet-01".into(),
                    };
                    if snapshot.reachable(&src, &dst).reachable {
                        TestStatus::Failed(
                            release_test_core::errors::RunnerError::Other(
                                "expected vpc-a/vpc-b unreachable with no peering".into(),
                            ),
                            Vec::new(),
                        )
                    } else {
                        TestStatus::Passed(Vec::new())
                    }
                }
                Err(e) => TestStatus::Failed(
                    release_test_core::errors::RunnerError::from(e),
                    Vec::new(),
                ),
            }
        }) as release_test_core::runner::TestBodyFuture
    };

    let peered_client = vpc_peering_client.clone();
    let peered_vpcs = vpcs.clone();
    let peered_body = move |cancel: CancellationToken| {
        let client = peered_client.clone();
        let vpcs = peered_vpcs.clone();
        Box::pin(async move {
            let mutator = Mutator {
                vpc_peering_client: client.clone(),
                external_peering_client: DesiredStateClient::in_memory(vec![]),
                gateway_peering_client: DesiredStateClient::in_memory(vec![]),
                agent_client: DesiredStateClient::in_memory(vec![]),
                gateway_feature_enabled: true,
            };
            let desired = PeeringSet {
                vpc_peerings: vec![VpcPeering {
                    name: "vpc-a--vpc-b".into(),
                    permit: vec![(
                        PeeringEntry {
                            vpc: "vpc-a".into(),
                            subnets: vec![],
                        },
                        PeeringEntry {
                            vpc: "vpc-b".into(),
                            subnets: vec![],
                        },
                    )],
                    remote: None,
                }],
                external_peerings: vec![],
                gateway_peerings: vec![],
            };
            if let Err(e) = mutator
                .apply_peerings(&desired, false, &[], &cancel)
                .await
            {
                return TestStatus::Failed(
                    release_test_core::errors::RunnerError::Other(e.to_string()),
                    Vec::new(),
                );
            }

            let peerings = match client.list().await {
                Ok(p) => p,
                Err(e) => {
                    return TestStatus::Failed(
                        release_test_core::errors::RunnerError::from(e),
                        Vec::new(),
                    )
                }
            };
            let groups = HashMap::new();
            let snapshot = ReachabilitySnapshot {
                vpcs: &vpcs,
                vpc_peerings: &peerings,
                externals: &HashMap::new(),
                external_peerings: &[],
                gateway_peerings: &[],
                vpc_switch_groups: &groups,
            };
            let src = Endpoint::VpcSubnet {
                vpc: "vpc-a".into(),
                subnet: "subnet-01".into(),
            };
            let dst = Endpoint::VpcSubnet {
                vpc: "vpc-b".into(),
                subnet: "subnet-01".into(),
            };
            if !snapshot.reachable(&src, &dst).reachable {
                return TestStatus::Failed(
                    release_test_core::errors::RunnerError::Other(
                        "expected vpc-a/vpc-b reachable after peering".into(),
                    ),
                    Vec::new(),
                );
            }

            let revert_client = client.clone();
            let revert: release_test_core::runner::RevertFn = Box::new(move |_cancel| {
                let client = revert_client.clone();
                Box::pin(async move {
                    client.delete("vpc-a--vpc-b").await.map_err(Into::into)
                })
            });
            TestStatus::Passed(vec![revert])
        }) as release_test_core::runner::TestBodyFuture
    };

    Suite {
        name: "No restrictions".into(),
        test_cases: vec![
            TestCase {
                name: "unreachable without a peering".into(),
                skip_flags: release_test_core::runner::SkipFlags::empty(),
                body: Box::new(no_peering_body),
            },
            TestCase {
                name: "reachable after peering, reverts cleanly".into(),
                skip_flags: release_test_core::runner::SkipFlags::empty(),
                body: Box::new(peered_body),
            },
        ],
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match RunnerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(2);
        }
    };

    let regexes = match config.compiled_regexes() {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(2);
        }
    };

    let run_cfg = RunConfig {
        capability_missing: release_test_core::runner::SkipFlags::empty(),
        regexes,
        invert_regex: config.invert_regex,
        extended: config.extended,
        fail_fast: config.fail_fast,
        wipe_between_tests: true,
    };

    let vpc_peering_client = DesiredStateClient::<VpcPeering>::in_memory(vec![]);
    let suite = invariant_suite(vpc_peering_client);

    let runner = Runner {
        setup: Box::new(|_first, _cancel| Box::pin(async { Ok(()) })),
    };

    let cancel = CancellationToken::new();
    let report: SuiteReport = runner.run_suite(suite, &run_cfg, &cancel).await;

    info!(
        tests = report.tests(),
        failures = report.failures(),
        skipped = report.skipped(),
        "release-test run complete"
    );

    if let Some(path) = &config.results_file {
        match junit::render(std::slice::from_ref(&report)) {
            Ok(xml) => {
                if let Err(e) = std::fs::write(path, xml) {
                    error!(error = %e, path, "failed to write JUnit results file");
                    return ExitCode::from(2);
                }
            }
            Err(e) => {
                error!(error = %e, "failed to render JUnit report");
                return ExitCode::from(2);
            }
        }
    }

    if report.failures() > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
