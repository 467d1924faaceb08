use super::*;
use crate::clusters::mock::MockCluster;
use crate::crd::targets::{ClusterTrafficTarget, TrafficTargetSpec};
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use kube::api::ObjectMeta;

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn pod(name: &str, pod_labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(labels(pod_labels)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn release_pod(name: &str, release: &str, traffic_status: Option<&str>) -> Pod {
    let mut pod_labels = vec![(APP_LABEL, "reviews"), (RELEASE_LABEL, release)];
    if let Some(status) = traffic_status {
        pod_labels.push((POD_TRAFFIC_STATUS_LABEL, status));
    }
    pod(name, &pod_labels)
}

fn production_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("reviews-prod".to_string()),
            namespace: Some("default".to_string()),
            labels: Some(labels(&[(APP_LABEL, "reviews"), (LB_LABEL, LB_PRODUCTION)])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels(&[
                (APP_LABEL, "reviews"),
                (POD_TRAFFIC_STATUS_LABEL, TRAFFIC_ENABLED),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn traffic_target(name: &str, release: Option<&str>, clusters: &[(&str, u32)]) -> TrafficTarget {
    let mut target = TrafficTarget::new(
        name,
        TrafficTargetSpec {
            clusters: clusters
                .iter()
                .map(|(cluster, weight)| ClusterTrafficTarget {
                    name: cluster.to_string(),
                    weight: *weight,
                })
                .collect(),
        },
    );
    target.metadata.namespace = Some("default".to_string());
    if let Some(release) = release {
        target.metadata.labels = Some(labels(&[(RELEASE_LABEL, release)]));
    }
    target
}

fn shifter(targets: &[TrafficTarget]) -> PodLabelShifter {
    PodLabelShifter::new("reviews", "default", targets).expect("valid traffic targets")
}

mod weights {
    use super::*;

    #[test]
    fn weights_accumulate_per_cluster() {
        let targets = vec![traffic_target(
            "tt-reviews-1",
            Some("reviews-1"),
            &[("c1", 40), ("c1", 10), ("c2", 5)],
        )];

        let weights = build_cluster_release_weights(&targets).expect("weights");
        assert_eq!(weights["c1"]["reviews-1"], 50);
        assert_eq!(weights["c2"]["reviews-1"], 5);
    }

    #[test]
    fn table_is_invariant_under_input_reordering() {
        let a = traffic_target("tt-reviews-1", Some("reviews-1"), &[("c1", 90)]);
        let b = traffic_target("tt-reviews-2", Some("reviews-2"), &[("c1", 5)]);
        let c = traffic_target("tt-reviews-3", Some("reviews-3"), &[("c1", 5)]);

        let forward = build_cluster_release_weights(&[a.clone(), b.clone(), c.clone()])
            .expect("forward weights");
        let backward = build_cluster_release_weights(&[c, b, a]).expect("backward weights");

        assert_eq!(forward, backward);
    }

    #[test]
    fn missing_release_label_is_rejected() {
        let targets = vec![traffic_target("tt-reviews-1", None, &[("c1", 50)])];

        let err = build_cluster_release_weights(&targets).unwrap_err();
        match err {
            TrafficError::MissingReleaseLabel { namespace, name } => {
                assert_eq!(namespace, "default");
                assert_eq!(name, "tt-reviews-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_targets_for_one_release_are_rejected() {
        let targets = vec![
            traffic_target("tt-reviews-a", Some("reviews-1"), &[("c1", 50)]),
            traffic_target("tt-reviews-b", Some("reviews-1"), &[("c1", 50)]),
        ];

        let err = build_cluster_release_weights(&targets).unwrap_err();
        match err {
            TrafficError::DuplicateTrafficTargets {
                first,
                second,
                release,
                ..
            } => {
                // the error names both offending objects
                assert_eq!(first, "tt-reviews-a");
                assert_eq!(second, "tt-reviews-b");
                assert_eq!(release, "reviews-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

mod targets {
    use super::*;

    #[test]
    fn share_of_fleet_rounds_up_and_clamps() {
        // half of a ten pod fleet
        assert_eq!(calculate_release_pod_target(10, 50, 10, 100), 5);
        // fractional shares round up to the next pod
        assert_eq!(calculate_release_pod_target(10, 25, 10, 100), 3);
        // a release cannot lend pods it does not own
        assert_eq!(calculate_release_pod_target(2, 50, 10, 100), 2);
        // zero weight means zero pods
        assert_eq!(calculate_release_pod_target(10, 0, 10, 100), 0);
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round_half_away_from_zero(0.5), 1);
        assert_eq!(round_half_away_from_zero(1.4), 1);
        assert_eq!(round_half_away_from_zero(2.5), 3);
        assert_eq!(round_half_away_from_zero(-0.5), -1);
    }
}

mod sync {
    use super::*;

    fn ten_pod_fleet(enabled: usize) -> Vec<Pod> {
        (0..10)
            .map(|i| {
                release_pod(
                    &format!("reviews-1-pod-{i}"),
                    "reviews-1",
                    Some(if i < enabled {
                        TRAFFIC_ENABLED
                    } else {
                        TRAFFIC_DISABLED
                    }),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn shrink_patches_only_the_excess_pods() {
        // ten pods, eight serving traffic, both releases declared at 50:
        // the target for reviews-1 is five pods, so exactly three flip off
        let cluster = MockCluster::new(vec![production_service()], ten_pod_fleet(8));
        let shifter = shifter(&[
            traffic_target("tt-reviews-1", Some("reviews-1"), &[("c1", 50)]),
            traffic_target("tt-reviews-2", Some("reviews-2"), &[("c1", 50)]),
        ]);

        let (achieved, errors) = shifter
            .sync_cluster("c1", &cluster)
            .await
            .expect("sync succeeds");

        assert!(errors.is_empty());
        let patches = cluster.recorded_patches();
        assert_eq!(
            patches,
            vec![
                ("reviews-1-pod-0".to_string(), TRAFFIC_DISABLED.to_string()),
                ("reviews-1-pod-1".to_string(), TRAFFIC_DISABLED.to_string()),
                ("reviews-1-pod-2".to_string(), TRAFFIC_DISABLED.to_string()),
            ],
            "the first three enabled pods in name order are disabled"
        );
        assert_eq!(achieved["reviews-1"], 50);
    }

    #[tokio::test]
    async fn grow_patches_only_the_missing_pods() {
        let cluster = MockCluster::new(vec![production_service()], ten_pod_fleet(2));
        let shifter = shifter(&[
            traffic_target("tt-reviews-1", Some("reviews-1"), &[("c1", 50)]),
            traffic_target("tt-reviews-2", Some("reviews-2"), &[("c1", 50)]),
        ]);

        let (achieved, errors) = shifter
            .sync_cluster("c1", &cluster)
            .await
            .expect("sync succeeds");

        assert!(errors.is_empty());
        let patches = cluster.recorded_patches();
        assert_eq!(
            patches,
            vec![
                ("reviews-1-pod-2".to_string(), TRAFFIC_ENABLED.to_string()),
                ("reviews-1-pod-3".to_string(), TRAFFIC_ENABLED.to_string()),
                ("reviews-1-pod-4".to_string(), TRAFFIC_ENABLED.to_string()),
            ],
            "the first three idle pods in name order are enabled"
        );
        assert_eq!(achieved["reviews-1"], 50);
    }

    #[tokio::test]
    async fn converged_fleet_issues_zero_patches() {
        let cluster = MockCluster::new(vec![production_service()], ten_pod_fleet(5));
        let shifter = shifter(&[
            traffic_target("tt-reviews-1", Some("reviews-1"), &[("c1", 50)]),
            traffic_target("tt-reviews-2", Some("reviews-2"), &[("c1", 50)]),
        ]);

        let (achieved, errors) = shifter
            .sync_cluster("c1", &cluster)
            .await
            .expect("sync succeeds");

        assert!(errors.is_empty());
        assert!(cluster.recorded_patches().is_empty());
        assert_eq!(achieved["reviews-1"], 50);
    }

    #[tokio::test]
    async fn second_pass_reaches_a_fixed_point() {
        let cluster = MockCluster::new(vec![production_service()], ten_pod_fleet(8));
        let shifter = shifter(&[
            traffic_target("tt-reviews-1", Some("reviews-1"), &[("c1", 50)]),
            traffic_target("tt-reviews-2", Some("reviews-2"), &[("c1", 50)]),
        ]);

        shifter
            .sync_cluster("c1", &cluster)
            .await
            .expect("first pass");
        assert_eq!(cluster.recorded_patches().len(), 3);

        // the mock applied the flips, so the next pass sees a correct fleet
        let (achieved, errors) = shifter
            .sync_cluster("c1", &cluster)
            .await
            .expect("second pass");
        assert!(errors.is_empty());
        assert_eq!(cluster.recorded_patches().len(), 3, "no further patches");
        assert_eq!(achieved["reviews-1"], 50);
    }

    #[tokio::test]
    async fn pod_patch_failures_degrade_but_do_not_abort() {
        let cluster =
            MockCluster::new(vec![production_service()], ten_pod_fleet(8)).failing("reviews-1-pod-0");
        let shifter = shifter(&[
            traffic_target("tt-reviews-1", Some("reviews-1"), &[("c1", 50)]),
            traffic_target("tt-reviews-2", Some("reviews-2"), &[("c1", 50)]),
        ]);

        let (achieved, errors) = shifter
            .sync_cluster("c1", &cluster)
            .await
            .expect("sync still succeeds");

        assert_eq!(errors.len(), 1);
        match &errors[0] {
            TrafficError::ModifyingLabel { pod, cluster, .. } => {
                assert_eq!(pod, "reviews-1-pod-0");
                assert_eq!(cluster, "c1");
            }
            other => panic!("unexpected error: {other}"),
        }
        // two of the three excess pods were disabled; six still get traffic
        assert_eq!(cluster.recorded_patches().len(), 2);
        assert_eq!(achieved["reviews-1"], 60);
    }

    #[tokio::test]
    async fn zero_total_weight_leaves_the_fleet_alone() {
        let cluster = MockCluster::new(vec![production_service()], ten_pod_fleet(8));
        let shifter = shifter(&[
            traffic_target("tt-reviews-1", Some("reviews-1"), &[("c1", 0)]),
            traffic_target("tt-reviews-2", Some("reviews-2"), &[("c1", 0)]),
        ]);

        let (achieved, errors) = shifter
            .sync_cluster("c1", &cluster)
            .await
            .expect("sync succeeds");

        assert!(errors.is_empty());
        assert!(cluster.recorded_patches().is_empty());
        assert_eq!(achieved["reviews-1"], 0);
        assert_eq!(achieved["reviews-2"], 0);
    }

    #[tokio::test]
    async fn requires_exactly_one_production_service() {
        let cluster = MockCluster::new(vec![], ten_pod_fleet(5));
        let shifter = shifter(&[traffic_target(
            "tt-reviews-1",
            Some("reviews-1"),
            &[("c1", 50)],
        )]);

        let err = shifter.sync_cluster("c1", &cluster).await.unwrap_err();
        match err {
            TrafficError::WrongServiceCount { count, .. } => assert_eq!(count, 0),
            other => panic!("unexpected error: {other}"),
        }

        let cluster = MockCluster::new(
            vec![production_service(), production_service()],
            ten_pod_fleet(5),
        );
        let err = shifter.sync_cluster("c1", &cluster).await.unwrap_err();
        match err {
            TrafficError::WrongServiceCount { count, .. } => assert_eq!(count, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn service_without_selector_is_an_error() {
        let mut service = production_service();
        service.spec = Some(ServiceSpec::default());
        let cluster = MockCluster::new(vec![service], ten_pod_fleet(5));
        let shifter = shifter(&[traffic_target(
            "tt-reviews-1",
            Some("reviews-1"),
            &[("c1", 50)],
        )]);

        let err = shifter.sync_cluster("c1", &cluster).await.unwrap_err();
        assert!(matches!(err, TrafficError::ServiceMissingSelector { .. }));
    }

    #[tokio::test]
    async fn unknown_cluster_is_an_error() {
        let cluster = MockCluster::new(vec![production_service()], vec![]);
        let shifter = shifter(&[traffic_target(
            "tt-reviews-1",
            Some("reviews-1"),
            &[("c1", 50)],
        )]);

        let err = shifter.sync_cluster("c9", &cluster).await.unwrap_err();
        match err {
            TrafficError::UnknownCluster { cluster } => assert_eq!(cluster, "c9"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn pods_without_the_label_get_an_add_operation() {
        // two pods, one carrying no traffic-status label at all
        let pods = vec![
            release_pod("reviews-1-pod-0", "reviews-1", None),
            release_pod("reviews-1-pod-1", "reviews-1", None),
        ];
        let cluster = MockCluster::new(vec![production_service()], pods);
        let shifter = shifter(&[traffic_target(
            "tt-reviews-1",
            Some("reviews-1"),
            &[("c1", 100)],
        )]);

        let (achieved, errors) = shifter
            .sync_cluster("c1", &cluster)
            .await
            .expect("sync succeeds");

        assert!(errors.is_empty());
        assert_eq!(cluster.recorded_patches().len(), 2);
        assert_eq!(achieved["reviews-1"], 100);
    }

    #[test]
    fn patch_wire_format_matches_the_label_state() {
        let labelled = release_pod("reviews-1-pod-0", "reviews-1", Some(TRAFFIC_ENABLED));
        let bytes = patch_pod_traffic_status(&labelled, TRAFFIC_DISABLED).expect("encode");
        let ops: Vec<PatchOperation> = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(
            ops,
            vec![PatchOperation {
                op: "replace".to_string(),
                path: "/metadata/labels/traffic-status".to_string(),
                value: "disabled".to_string(),
            }]
        );

        let unlabelled = release_pod("reviews-1-pod-1", "reviews-1", None);
        let bytes = patch_pod_traffic_status(&unlabelled, TRAFFIC_ENABLED).expect("encode");
        let ops: Vec<PatchOperation> = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(ops[0].op, "add");
        assert_eq!(ops[0].value, "enabled");
    }
}
