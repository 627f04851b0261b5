use kube::core::CustomResourceExt;
use warden_operator::crd::{
    DeepPacketInspection, Installation, IntrusionDetection, LicenseKey,
    LogStorage, ManagementCluster, ManagementClusterConnection,
};

fn main() {
    let crds = [
        Installation::crd(),
        LicenseKey::crd(),
        IntrusionDetection::crd(),
        DeepPacketInspection::crd(),
        LogStorage::crd(),
        ManagementCluster::crd(),
        ManagementClusterConnection::crd(),
    ];
    for crd in crds {
        let yaml = serde_yaml::to_string(&crd).expect("serialize CRD to YAML");
        println!("---\n{}", yaml);
    }
}
