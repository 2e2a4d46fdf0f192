//! Deterministic names of the objects the operator reads and writes.

/// StatefulSet (and headless service) name of a datacenter.
pub fn dc(cluster_name: &str, dc_name: &str) -> String {
    format!("{}-cassandra-{}", cluster_name, dc_name)
}

/// Pod name of the `ordinal`-th member of a datacenter.
pub fn dc_pod(cluster_name: &str, dc_name: &str, ordinal: i32) -> String {
    format!("{}-{}", dc(cluster_name, dc_name), ordinal)
}

/// In-cluster DNS name of a datacenter pod.
pub fn dc_pod_fqdn(cluster_name: &str, namespace: &str, dc_name: &str, ordinal: i32) -> String {
    let svc = dc(cluster_name, dc_name);
    format!("{}-{}.{}.{}.svc.cluster.local", svc, ordinal, svc, namespace)
}

/// ConfigMap holding the per-pod startup facts.
pub fn pods_config_configmap(cluster_name: &str) -> String {
    format!("{}-pods-config", cluster_name)
}

/// ConfigMap holding the last known address of every pod.
pub fn pod_ips_configmap(cluster_name: &str) -> String {
    format!("{}-pod-ips", cluster_name)
}

/// Ingress host of a region's prober. Also serves as the region identifier.
pub fn prober_ingress_host(cluster_name: &str, namespace: &str, domain: &str) -> String {
    format!("{}-{}-cassandra-prober.{}", namespace, cluster_name, domain)
}

/// Job name of the decommission of a pod.
pub fn decommission_job(pod_name: &str) -> String {
    format!("pod-decommission-{}", pod_name)
}

/// Splits `<cluster>-cassandra-<dc>-<ordinal>` into its ordinal.
pub fn pod_ordinal(pod_name: &str) -> Option<i32> {
    pod_name.rsplit_once('-')?.1.parse().ok()
}
