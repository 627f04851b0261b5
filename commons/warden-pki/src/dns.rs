/// Every name a client inside the cluster may use to reach `service`.
pub fn service_dns_names(
    service: &str,
    namespace: &str,
    cluster_domain: &str,
) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
        format!("{service}.{namespace}.svc.{cluster_domain}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_expand_to_fqdn() {
        assert_eq!(
            service_dns_names("gw", "logs", "cluster.local"),
            vec!["gw", "gw.logs", "gw.logs.svc", "gw.logs.svc.cluster.local"]
        );
    }
}
