//! The TURTLE app manifest.
//!
//! A manifest declares the containers of an app, their links, exposed
//! ports, volumes and tunable environment variables. After a successful
//! load the container list is sorted into start order (depended-upon
//! containers first); shutdown walks the list in reverse.

mod container;
mod env;
mod port;

pub use container::Container;
pub use env::EnvVar;
pub use port::PortDecl;

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// File name of the app manifest inside the source tree.
pub const MANIFEST_FILENAME: &str = "TURTLE";

/// A parsed and validated app manifest.
///
/// Unknown top-level keys are tolerated; unknown keys inside the nested
/// tables are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Manifest {
    pub name: String,
    pub maintainer: String,

    pub env: Vec<EnvVar>,
    #[serde(rename = "Container")]
    pub containers: Vec<Container>,
    #[serde(rename = "Port")]
    pub ports: Vec<PortDecl>,
}

impl Manifest {
    /// Load a manifest from a file.
    pub async fn load(path: &Path) -> Result<Manifest> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| Error::Manifest(format!("failed to read manifest '{}': {err}", path.display())))?;
        Self::parse(&raw)
    }

    /// Parse, validate and sort a manifest from its TOML text.
    pub fn parse(raw: &str) -> Result<Manifest> {
        let mut manifest: Manifest = toml::from_str(raw)
            .map_err(|err| Error::Manifest(format!("failed to parse manifest: {err}")))?;

        manifest.validate()?;
        manifest.fill_defaults();
        manifest.sort_containers()?;

        Ok(manifest)
    }

    /// Project the environment variables for one container as `NAME=value`
    /// pairs. `user_env` carries the values set via the app settings; a
    /// non-empty user value wins over the manifest default. Aliases are
    /// exported with the same value. Static container env is not included.
    pub fn env_for(&self, container_name: &str, user_env: &HashMap<String, String>) -> Vec<String> {
        let mut list = Vec::new();

        for env in &self.env {
            // Skip variables scoped to other containers.
            if !env.containers.is_empty()
                && !env.containers.iter().any(|c| c == container_name)
            {
                continue;
            }

            let value = match user_env.get(&env.name) {
                Some(v) if !v.is_empty() => v.as_str(),
                _ => env.default.as_str(),
            };

            list.push(format!("{}={}", env.name, value));
            for alias in &env.alias {
                list.push(format!("{alias}={value}"));
            }
        }

        list
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Manifest("manifest name is missing".to_string()));
        }

        for env in &self.env {
            env.validate()?;
        }
        for container in &self.containers {
            container.validate()?;
        }
        for port in &self.ports {
            port.validate()?;
        }

        Ok(())
    }

    fn fill_defaults(&mut self) {
        for container in &mut self.containers {
            container.fill_defaults();
        }
        for port in &mut self.ports {
            port.fill_defaults();
        }
    }

    /// Sort the containers into start order via topological sort over the
    /// link graph. Containers that others depend on come first.
    fn sort_containers(&mut self) -> Result<()> {
        // Every link target must exist.
        for container in &self.containers {
            for link in &container.links {
                if !self.containers.iter().any(|c| &c.name == link) {
                    return Err(Error::Manifest(format!(
                        "container '{}': linked container '{link}' does not exist",
                        container.name
                    )));
                }
            }
        }

        let order = topo_sort(&self.containers)?;

        let mut sorted = Vec::with_capacity(self.containers.len());
        for name in &order {
            if let Some(idx) = self.containers.iter().position(|c| &c.name == name) {
                sorted.push(self.containers.remove(idx));
            }
        }
        self.containers = sorted;

        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    Temporary,
    Permanent,
}

/// Three-color DFS over `name -> links`. Children are visited before their
/// parent is emitted, so depended-upon containers come first. On a cycle the
/// witness is the path slice from the re-entered node, with that node
/// repeated at the end.
fn topo_sort(containers: &[Container]) -> Result<Vec<String>> {
    let graph: HashMap<&str, &[String]> = containers
        .iter()
        .map(|c| (c.name.as_str(), c.links.as_slice()))
        .collect();

    let mut marks: HashMap<&str, Mark> = containers
        .iter()
        .map(|c| (c.name.as_str(), Mark::Unvisited))
        .collect();

    let mut order = Vec::with_capacity(containers.len());
    let mut path = Vec::new();

    // Roots are visited in declaration order so the result is stable.
    for container in containers {
        if let Some(cycle) = visit(container.name.as_str(), &graph, &mut marks, &mut order, &mut path) {
            return Err(Error::Manifest(format!(
                "container link cycle detected: [{}]",
                cycle.join(" ")
            )));
        }
    }

    Ok(order)
}

fn visit<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a [String]>,
    marks: &mut HashMap<&'a str, Mark>,
    order: &mut Vec<String>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks[node] {
        Mark::Permanent => return None,
        Mark::Temporary => {
            // Found the node again while it is still on the path: the
            // cycle is the path tail starting at the node.
            let start = path.iter().position(|n| *n == node).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        Mark::Unvisited => {}
    }

    marks.insert(node, Mark::Temporary);
    path.push(node);

    if let Some(links) = graph.get(node) {
        for link in links.iter() {
            if let Some(cycle) = visit(link.as_str(), graph, marks, order, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    marks.insert(node, Mark::Permanent);
    order.push(node.to_string());

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
Name = "blog"
Maintainer = "ops@example.org"

[[Env]]
Name = "DB_PASSWORD"
Required = true
Description = "Database password"

[[Env]]
Name = "DB_USER"
Alias = ["POSTGRES_USER"]
Default = "blog"
Containers = ["db"]

[[Container]]
Name = "web"
Image = "./web"
Links = ["db"]
Volumes = ["/var/www/uploads"]

[[Container]]
Name = "db"
Image = "postgres"
Tag = "9.4"
WaitAfterStartup = 2000
Volumes = ["/var/lib/postgresql/data:ro"]

[[Port]]
Container = "web"
Port = 80
Description = "HTTP"
"#;

    #[test]
    fn parse_sorts_and_fills_defaults() {
        let manifest = Manifest::parse(SAMPLE).unwrap();

        assert_eq!(manifest.name, "blog");
        assert_eq!(manifest.maintainer, "ops@example.org");

        // db is linked by web, so it starts first.
        let names: Vec<&str> = manifest.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["db", "web"]);

        let web = &manifest.containers[1];
        assert_eq!(web.tag, "latest");
        assert_eq!(web.network_mode, "bridge");
        assert!(web.is_local_build());

        let db = &manifest.containers[0];
        assert_eq!(db.tag, "9.4");
        assert!(!db.is_local_build());

        assert_eq!(manifest.ports[0].protocol, "tcp");
    }

    #[test]
    fn independent_containers_keep_declaration_order() {
        let raw = r#"
Name = "x"
[[Container]]
Name = "a"
Image = "a"
[[Container]]
Name = "b"
Image = "b"
[[Container]]
Name = "c"
Image = "c"
"#;
        let manifest = Manifest::parse(raw).unwrap();
        let names: Vec<&str> = manifest.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn link_cycle_is_reported_with_the_full_witness() {
        let raw = r#"
Name = "x"
[[Container]]
Name = "a"
Image = "a"
Links = ["b"]
[[Container]]
Name = "b"
Image = "b"
Links = ["a"]
"#;
        let err = Manifest::parse(raw).unwrap_err();
        assert_eq!(
            err.to_string(),
            "container link cycle detected: [a b a]"
        );
    }

    #[test]
    fn missing_link_target_is_rejected() {
        let raw = r#"
Name = "x"
[[Container]]
Name = "a"
Image = "a"
Links = ["ghost"]
"#;
        let err = Manifest::parse(raw).unwrap_err();
        assert!(err.to_string().contains("'ghost' does not exist"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        for bad in [0, -1, 65536] {
            let raw = format!(
                "Name = \"x\"\n[[Container]]\nName = \"a\"\nImage = \"a\"\n[[Port]]\nContainer = \"a\"\nPort = {bad}\n"
            );
            assert!(Manifest::parse(&raw).is_err(), "port {bad} accepted");
        }
    }

    #[test]
    fn invalid_volume_strings_are_rejected() {
        for bad in ["/data:rw", "../escape", "/a:/b"] {
            let raw = format!(
                "Name = \"x\"\n[[Container]]\nName = \"a\"\nImage = \"a\"\nVolumes = [\"{bad}\"]\n"
            );
            assert!(Manifest::parse(&raw).is_err(), "volume '{bad}' accepted");
        }
        // The trailing :ro suffix alone is fine.
        let ok = "Name = \"x\"\n[[Container]]\nName = \"a\"\nImage = \"a\"\nVolumes = [\"/data:ro\"]\n";
        assert!(Manifest::parse(ok).is_ok());
    }

    #[test]
    fn wait_after_startup_range_is_enforced() {
        let raw = "Name = \"x\"\n[[Container]]\nName = \"a\"\nImage = \"a\"\nWaitAfterStartup = 20001\n";
        assert!(Manifest::parse(raw).is_err());
        let raw = "Name = \"x\"\n[[Container]]\nName = \"a\"\nImage = \"a\"\nWaitAfterStartup = 20000\n";
        assert!(Manifest::parse(raw).is_ok());
    }

    #[test]
    fn image_with_tag_separator_is_rejected() {
        let raw = "Name = \"x\"\n[[Container]]\nName = \"a\"\nImage = \"redis:7\"\n";
        assert!(Manifest::parse(raw).is_err());
    }

    #[test]
    fn unknown_nested_keys_are_rejected_but_top_level_tolerated() {
        let raw = "Name = \"x\"\nFancy = true\n[[Container]]\nName = \"a\"\nImage = \"a\"\n";
        assert!(Manifest::parse(raw).is_ok());

        let raw = "Name = \"x\"\n[[Container]]\nName = \"a\"\nImage = \"a\"\nBogus = 1\n";
        assert!(Manifest::parse(raw).is_err());
    }

    #[test]
    fn env_projection_honors_scope_override_and_aliases() {
        let manifest = Manifest::parse(SAMPLE).unwrap();

        let mut user = HashMap::new();
        user.insert("DB_PASSWORD".to_string(), "secret".to_string());

        // db sees both variables plus the alias.
        let env = manifest.env_for("db", &user);
        assert_eq!(
            env,
            ["DB_PASSWORD=secret", "DB_USER=blog", "POSTGRES_USER=blog"]
        );

        // web does not see the db-scoped variable.
        let env = manifest.env_for("web", &user);
        assert_eq!(env, ["DB_PASSWORD=secret"]);

        // An empty user value falls back to the default.
        user.insert("DB_USER".to_string(), String::new());
        let env = manifest.env_for("db", &user);
        assert!(env.contains(&"DB_USER=blog".to_string()));
    }

    #[test]
    fn projection_does_not_mutate_the_manifest() {
        let manifest = Manifest::parse(SAMPLE).unwrap();
        let before = format!("{manifest:?}");
        let _ = manifest.env_for("db", &HashMap::new());
        let _ = manifest.containers[0].volume_binds(Path::new("/turtle/apps/blog/volumes"));
        assert_eq!(before, format!("{manifest:?}"));
    }
}
