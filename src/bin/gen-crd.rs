use convoy::crd::release::Release;
use convoy::crd::targets::{CapacityTarget, InstallationTarget, TrafficTarget};
use kube::CustomResourceExt;

fn main() {
    // Print all four CRDs as a multi-document YAML stream for kubectl apply
    let crds = [
        serde_yaml::to_string(&Release::crd()),
        serde_yaml::to_string(&InstallationTarget::crd()),
        serde_yaml::to_string(&CapacityTarget::crd()),
        serde_yaml::to_string(&TrafficTarget::crd()),
    ];

    for crd in crds {
        let yaml = crd.expect("failed to serialize CRD to YAML");
        println!("---");
        print!("{}", yaml);
    }
}
