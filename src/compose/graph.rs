//! Dependency validation and stratified topological ordering over a
//! `ComposeConfig`'s `depends_on` edges.
//!
//! Grounded on `original_source/backend/app/plugins/docker/service.py::deploy_compose`'s
//! three-color DFS cycle check, reimplemented with Kahn's algorithm so the
//! result comes out as parallel-deployable layers rather than a single
//! linear order.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{DaemonError, Result};
use crate::types::ComposeConfig;

/// Validate that every `depends_on` entry names a real service and that no
/// cycle exists among them. Container names must also be unique — since
/// they double as the docker-native container name within a deployment.
pub fn validate(config: &ComposeConfig) -> Result<()> {
    if config.services.is_empty() {
        return Err(DaemonError::validation("services", "compose config has no services"));
    }

    let mut seen_names = HashSet::new();
    for (service, svc_config) in &config.services {
        if !seen_names.insert(svc_config.name.clone()) {
            return Err(DaemonError::validation(
                "services",
                format!("container name '{}' is used by more than one service", svc_config.name),
            ));
        }
        for dep in &svc_config.depends_on {
            if !config.services.contains_key(dep) {
                return Err(DaemonError::validation(
                    "depends_on",
                    format!("service '{service}' depends on unknown service '{dep}'"),
                ));
            }
            if dep == service {
                return Err(DaemonError::validation(
                    "depends_on",
                    format!("service '{service}' cannot depend on itself"),
                ));
            }
        }
    }

    detect_cycle(config)?;
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

fn detect_cycle(config: &ComposeConfig) -> Result<()> {
    let mut colors: HashMap<&str, Color> = config.services.keys().map(|k| (k.as_str(), Color::White)).collect();

    for start in config.services.keys() {
        if colors[start.as_str()] == Color::White {
            visit(config, start, &mut colors)?;
        }
    }
    Ok(())
}

fn visit<'a>(config: &'a ComposeConfig, node: &'a str, colors: &mut HashMap<&'a str, Color>) -> Result<()> {
    colors.insert(node, Color::Gray);
    for dep in &config.services[node].depends_on {
        match colors.get(dep.as_str()) {
            Some(Color::White) => visit(config, dep.as_str(), colors)?,
            Some(Color::Gray) => {
                return Err(DaemonError::validation(
                    "depends_on",
                    format!("dependency cycle detected involving service '{node}'"),
                ));
            }
            _ => {}
        }
    }
    colors.insert(node, Color::Black);
    Ok(())
}

/// Compute a deploy order as layers: every service in a layer depends only
/// on services in earlier layers, so a layer's services can all be created
/// concurrently. Classic Kahn's algorithm, peeling off all zero-indegree
/// nodes at once instead of one at a time.
pub fn stratify(config: &ComposeConfig) -> Result<Vec<Vec<String>>> {
    validate(config)?;

    let mut indegree: HashMap<&str, usize> = config.services.keys().map(|k| (k.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (service, svc_config) in &config.services {
        for dep in &svc_config.depends_on {
            *indegree.get_mut(service.as_str()).unwrap() += 1;
            dependents.entry(dep.as_str()).or_default().push(service.as_str());
        }
    }

    let mut layers = Vec::new();
    let mut frontier: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut remaining = indegree.clone();

    while !frontier.is_empty() {
        let mut layer: Vec<String> = frontier.iter().map(|s| s.to_string()).collect();
        layer.sort();
        layers.push(layer);

        let mut next_frontier = VecDeque::new();
        for node in frontier.drain(..) {
            for dependent in dependents.get(node).into_iter().flatten() {
                let deg = remaining.get_mut(dependent).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    next_frontier.push_back(*dependent);
                }
            }
        }
        frontier = next_frontier;
    }

    let scheduled: usize = layers.iter().map(|l| l.len()).sum();
    if scheduled != config.services.len() {
        return Err(DaemonError::validation(
            "depends_on",
            "dependency cycle detected during stratification",
        ));
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ComposeService;

    fn service(name: &str, depends_on: &[&str]) -> ComposeService {
        ComposeService {
            name: name.to_string(),
            image: "alpine:latest".to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn config(services: &[(&str, &[&str])]) -> ComposeConfig {
        ComposeConfig {
            version: "1".to_string(),
            services: services
                .iter()
                .map(|(name, deps)| (name.to_string(), service(name, deps)))
                .collect(),
            networks: vec![],
            volumes: vec![],
        }
    }

    #[test]
    fn rejects_empty_service_map() {
        let cfg = config(&[]);
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let cfg = config(&[("web", &["db"])]);
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_self_dependency() {
        let cfg = config(&[("web", &["web"])]);
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_duplicate_container_names() {
        let mut cfg = config(&[("web", &[]), ("web2", &[])]);
        let dup_name = cfg.services["web"].name.clone();
        cfg.services.get_mut("web2").unwrap().name = dup_name;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn detects_two_node_cycle() {
        let cfg = config(&[("a", &["b"]), ("b", &["a"])]);
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn detects_longer_cycle() {
        let cfg = config(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn accepts_diamond_dependency() {
        let cfg = config(&[("db", &[]), ("cache", &[]), ("api", &["db", "cache"]), ("web", &["api"])]);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn stratifies_linear_chain_into_separate_layers() {
        let cfg = config(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let layers = stratify(&cfg).unwrap();
        assert_eq!(layers, vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]);
    }

    #[test]
    fn stratifies_independent_services_into_one_layer() {
        let cfg = config(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let layers = stratify(&cfg).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].len(), 3);
    }

    #[test]
    fn stratifies_diamond_into_three_layers() {
        let cfg = config(&[("db", &[]), ("cache", &[]), ("api", &["db", "cache"]), ("web", &["api"])]);
        let layers = stratify(&cfg).unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].len(), 2);
        assert_eq!(layers[1], vec!["api".to_string()]);
        assert_eq!(layers[2], vec!["web".to_string()]);
    }
}
