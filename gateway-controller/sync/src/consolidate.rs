use mesh_gateway_controller_core::{
    resolved::{ResolvedHttpRoute, ResolvedHttpRule},
    routes::HttpMatch,
    RouteId,
};
use std::collections::BTreeMap;

/// Flattens a listener's HTTP routes into one synthetic route per hostname.
///
/// Every (rule, match) pair becomes its own single-match rule so that rules
/// from different routes can interleave under the precedence order. Rules
/// without matches contribute the default catch-all match.
pub fn consolidate(gateway_service: &str, routes: &[ResolvedHttpRoute]) -> Vec<ResolvedHttpRoute> {
    let mut by_hostname: BTreeMap<String, Vec<ResolvedHttpRule>> = BTreeMap::new();

    for route in routes {
        for hostname in &route.hostnames {
            let bucket = by_hostname.entry(hostname.clone()).or_default();
            for rule in &route.rules {
                if rule.matches.is_empty() {
                    bucket.push(ResolvedHttpRule {
                        matches: vec![HttpMatch::default()],
                        filters: rule.filters.clone(),
                        services: rule.services.clone(),
                    });
                    continue;
                }
                for matches in &rule.matches {
                    bucket.push(ResolvedHttpRule {
                        matches: vec![matches.clone()],
                        filters: rule.filters.clone(),
                        services: rule.services.clone(),
                    });
                }
            }
        }
    }

    by_hostname
        .into_iter()
        .map(|(hostname, mut rules)| {
            rules.sort_by(|a, b| precedence(b).cmp(&precedence(a)));
            let name = synthetic_name(gateway_service, &[hostname.clone()]);
            ResolvedHttpRoute {
                id: RouteId::new(&name),
                name,
                hostnames: vec![hostname],
                rules,
            }
        })
        .collect()
}

/// The precedence key for a single-match rule: longer paths win, then more
/// header matches, then more query-parameter matches. Hostname specificity is
/// deliberately left to the data plane.
fn precedence(rule: &ResolvedHttpRule) -> (usize, usize, usize) {
    rule.matches
        .first()
        .map(|m| (m.path_len(), m.headers.len(), m.query_params.len()))
        .unwrap_or((0, 0, 0))
}

/// `<gateway-service>-<crc32-of-sorted-hostname-list>` in hex.
fn synthetic_name(gateway_service: &str, hostnames: &[String]) -> String {
    let mut hostnames = hostnames.to_vec();
    hostnames.sort();
    let digest = crc32fast::hash(hostnames.join(",").as_bytes());
    format!("{gateway_service}-{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_gateway_controller_core::{
        resolve::ResolvedService,
        resolved::ResolvedHttpService,
        routes::{HeaderMatch, PathMatch},
    };
    use pretty_assertions::assert_eq;

    fn service(name: &str) -> ResolvedHttpService {
        ResolvedHttpService {
            service: ResolvedService {
                namespace: None,
                name: name.to_string(),
            },
            weight: 1,
            filters: vec![],
        }
    }

    fn rule(matches: Vec<HttpMatch>) -> ResolvedHttpRule {
        ResolvedHttpRule {
            matches,
            filters: vec![],
            services: vec![service("backend")],
        }
    }

    fn route(name: &str, hostnames: &[&str], rules: Vec<ResolvedHttpRule>) -> ResolvedHttpRoute {
        ResolvedHttpRoute {
            id: RouteId::new(name),
            name: name.to_string(),
            hostnames: hostnames.iter().map(ToString::to_string).collect(),
            rules,
        }
    }

    fn path_prefix(value: &str) -> HttpMatch {
        HttpMatch {
            path: Some(PathMatch::Prefix(value.to_string())),
            headers: vec![],
            query_params: vec![],
            method: None,
        }
    }

    fn header(name: &str, value: &str) -> HttpMatch {
        HttpMatch {
            path: None,
            headers: vec![HeaderMatch::Exact {
                name: name.to_string(),
                value: value.to_string(),
            }],
            query_params: vec![],
            method: None,
        }
    }

    #[test]
    fn shared_hostnames_merge_under_precedence() {
        let first = route(
            "first",
            &["example.com", "example.net"],
            vec![rule(vec![path_prefix("/"), header("version", "one")])],
        );
        let second = route(
            "second",
            &["example.com"],
            vec![rule(vec![path_prefix("/v2"), header("version", "two")])],
        );

        let consolidated = consolidate("gw", &[first, second]);
        assert_eq!(consolidated.len(), 2);

        let by_hostname: BTreeMap<&str, &ResolvedHttpRoute> = consolidated
            .iter()
            .map(|r| (r.hostnames[0].as_str(), r))
            .collect();

        let com = by_hostname["example.com"];
        let keys: Vec<_> = com
            .rules
            .iter()
            .map(|r| r.matches[0].clone())
            .collect();
        assert_eq!(
            keys,
            vec![
                path_prefix("/v2"),
                path_prefix("/"),
                header("version", "one"),
                header("version", "two"),
            ]
        );

        let net = by_hostname["example.net"];
        let keys: Vec<_> = net
            .rules
            .iter()
            .map(|r| r.matches[0].clone())
            .collect();
        assert_eq!(keys, vec![path_prefix("/"), header("version", "one")]);
    }

    #[test]
    fn matchless_rules_become_catch_alls() {
        let consolidated = consolidate(
            "gw",
            &[route("first", &["example.com"], vec![rule(vec![])])],
        );
        assert_eq!(consolidated.len(), 1);
        assert_eq!(consolidated[0].rules.len(), 1);
        assert_eq!(consolidated[0].rules[0].matches, vec![HttpMatch::default()]);
    }

    #[test]
    fn synthetic_names_are_stable_per_hostname_set() {
        let a = consolidate(
            "gw",
            &[route("first", &["example.com"], vec![rule(vec![])])],
        );
        let b = consolidate(
            "gw",
            &[route("renamed", &["example.com"], vec![rule(vec![])])],
        );
        assert_eq!(a[0].name, b[0].name);
        assert!(a[0].name.starts_with("gw-"));
    }

    #[test]
    fn header_count_breaks_path_ties_and_query_count_breaks_header_ties() {
        use mesh_gateway_controller_core::routes::QueryParamMatch;

        let one_header = header("a", "1");
        let mut two_headers = header("a", "1");
        two_headers.headers.push(HeaderMatch::Exact {
            name: "b".to_string(),
            value: "2".to_string(),
        });
        let mut header_and_query = header("a", "1");
        header_and_query.query_params.push(QueryParamMatch::Present {
            name: "debug".to_string(),
        });

        let consolidated = consolidate(
            "gw",
            &[route(
                "r",
                &["example.com"],
                vec![
                    rule(vec![one_header.clone()]),
                    rule(vec![two_headers.clone()]),
                    rule(vec![header_and_query.clone()]),
                ],
            )],
        );
        let ordered: Vec<_> = consolidated[0]
            .rules
            .iter()
            .map(|r| r.matches[0].clone())
            .collect();
        assert_eq!(ordered, vec![two_headers, header_and_query, one_header]);
    }

    #[test]
    fn the_precedence_sort_is_stable() {
        let rules = vec![
            rule(vec![header("a", "1")]),
            rule(vec![header("b", "2")]),
            rule(vec![header("c", "3")]),
        ];
        let consolidated = consolidate("gw", &[route("r", &["example.com"], rules.clone())]);
        let headers: Vec<_> = consolidated[0]
            .rules
            .iter()
            .map(|r| r.matches[0].headers[0].clone())
            .collect();
        assert_eq!(
            headers,
            vec![
                HeaderMatch::Exact { name: "a".to_string(), value: "1".to_string() },
                HeaderMatch::Exact { name: "b".to_string(), value: "2".to_string() },
                HeaderMatch::Exact { name: "c".to_string(), value: "3".to_string() },
            ]
        );
    }
}
