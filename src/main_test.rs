use super::*;

#[test]
fn threadiness_defaults_without_env() {
    // the env var is unset in the test environment
    assert_eq!(threadiness(), 2);
}

#[test]
fn local_cluster_name_defaults_without_env() {
    assert_eq!(local_cluster_name(), "local");
}
