//! The `InstanceName` type.

use std::fmt;
use std::str::FromStr;

use crate::NameError;

const PROJECTS: &str = "projects";
const LOCATIONS: &str = "locations";
const CLUSTERS: &str = "clusters";
const INSTANCES: &str = "instances";

/// A parsed, normalized instance name.
///
/// Names are lowercased on parse, so two spellings of the same instance
/// compare equal and produce the same short name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceName {
    project: String,
    location: String,
    cluster: String,
    instance: String,
}

impl InstanceName {
    /// Parses an instance name.
    pub fn parse(s: &str) -> Result<Self, NameError> {
        if s.is_empty() {
            return Err(NameError::Empty);
        }

        let normalized = s.to_lowercase();
        let path = normalized.strip_prefix('/').unwrap_or(&normalized);
        let parts: Vec<&str> = path.split('/').collect();

        let [PROJECTS, project, LOCATIONS, location, CLUSTERS, cluster, INSTANCES, instance] =
            parts.as_slice()
        else {
            return Err(NameError::InvalidFormat {
                name: s.to_string(),
            });
        };

        validate_project(s, project)?;
        validate_segment(s, "location", location)?;
        validate_segment(s, "cluster", cluster)?;
        validate_segment(s, "instance", instance)?;

        Ok(Self {
            project: project.to_string(),
            location: location.to_string(),
            cluster: cluster.to_string(),
            instance: instance.to_string(),
        })
    }

    /// Project ID, including the domain for domain-scoped projects.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Location (region) of the cluster.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Cluster ID.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Instance ID within the cluster.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The canonical resource path for this instance.
    ///
    /// Two names with the same key refer to the same instance.
    pub fn key(&self) -> String {
        format!(
            "{PROJECTS}/{}/{LOCATIONS}/{}/{CLUSTERS}/{}/{INSTANCES}/{}",
            self.project, self.location, self.cluster, self.instance
        )
    }

    /// The dotted short form `project.region.cluster.instance`.
    ///
    /// Colons in domain-scoped projects are replaced with `_` since they are
    /// not allowed in paths on every platform. The mapping is not injective:
    /// `a:b` and `a_b` share a short name, so distinct instances can collide
    /// on a socket path. Callers that derive paths must check for conflicts.
    pub fn short_name(&self) -> String {
        [
            self.project.replace(':', "_").as_str(),
            &self.location,
            &self.cluster,
            &self.instance,
        ]
        .join(".")
    }
}

fn validate_project(name: &str, project: &str) -> Result<(), NameError> {
    match project.split_once(':') {
        Some((domain, id)) => {
            if domain.is_empty() || id.is_empty() {
                return Err(NameError::EmptySegment {
                    name: name.to_string(),
                    segment: "project",
                });
            }
            check_chars(name, "project", domain, &[':'])?;
            check_chars(name, "project", id, &[':', '.'])
        }
        None => validate_segment(name, "project", project),
    }
}

fn validate_segment(name: &str, segment: &'static str, value: &str) -> Result<(), NameError> {
    if value.is_empty() {
        return Err(NameError::EmptySegment {
            name: name.to_string(),
            segment,
        });
    }
    check_chars(name, segment, value, &[':', '.'])
}

fn check_chars(
    name: &str,
    segment: &'static str,
    value: &str,
    forbidden: &[char],
) -> Result<(), NameError> {
    match value
        .chars()
        .find(|c| forbidden.contains(c) || c.is_whitespace() || c.is_control())
    {
        Some(found) => Err(NameError::InvalidCharacter {
            name: name.to_string(),
            segment,
            found,
        }),
        None => Ok(()),
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for InstanceName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for InstanceName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> serde::Deserialize<'de> for InstanceName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const INST1: &str = "/projects/proj/locations/region/clusters/clust/instances/inst1";

    #[test]
    fn test_parse_with_leading_slash() {
        let name = InstanceName::parse(INST1).unwrap();
        assert_eq!(name.project(), "proj");
        assert_eq!(name.location(), "region");
        assert_eq!(name.cluster(), "clust");
        assert_eq!(name.instance(), "inst1");
        assert_eq!(name.short_name(), "proj.region.clust.inst1");
    }

    #[test]
    fn test_parse_without_leading_slash() {
        let a = InstanceName::parse(INST1).unwrap();
        let b = InstanceName::parse(&INST1[1..]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let upper = INST1.to_uppercase();
        let name = InstanceName::parse(&upper).unwrap();
        assert_eq!(name.short_name(), "proj.region.clust.inst1");
    }

    #[test]
    fn test_domain_scoped_project() {
        let name = InstanceName::parse(
            "projects/example.com:proj/locations/region/clusters/clust/instances/inst1",
        )
        .unwrap();
        assert_eq!(name.project(), "example.com:proj");
        assert_eq!(name.short_name(), "example.com_proj.region.clust.inst1");
    }

    #[test]
    fn test_short_name_can_alias_distinct_keys() {
        let scoped: InstanceName = "projects/a:b/locations/r/clusters/c/instances/i"
            .parse()
            .unwrap();
        let plain: InstanceName = "projects/a_b/locations/r/clusters/c/instances/i"
            .parse()
            .unwrap();
        assert_ne!(scoped.key(), plain.key());
        assert_eq!(scoped.short_name(), plain.short_name());
    }

    #[test]
    fn test_display_is_canonical_key() {
        let name: InstanceName = INST1.parse().unwrap();
        assert_eq!(
            name.to_string(),
            "projects/proj/locations/region/clusters/clust/instances/inst1"
        );
    }

    #[test]
    fn test_empty() {
        assert_eq!(InstanceName::parse(""), Err(NameError::Empty));
    }

    #[test]
    fn test_legacy_colon_format_rejected() {
        let err = InstanceName::parse("proj:reg:inst").unwrap_err();
        assert!(matches!(err, NameError::InvalidFormat { .. }));
        assert_eq!(err.input(), Some("proj:reg:inst"));
    }

    #[test]
    fn test_wrong_keyword_rejected() {
        let result = InstanceName::parse("projects/p/regions/r/clusters/c/instances/i");
        assert!(matches!(result, Err(NameError::InvalidFormat { .. })));
    }

    #[test]
    fn test_trailing_segment_rejected() {
        let result = InstanceName::parse("projects/p/locations/r/clusters/c/instances/i/extra");
        assert!(matches!(result, Err(NameError::InvalidFormat { .. })));
    }

    #[test]
    fn test_empty_segment_rejected() {
        let result = InstanceName::parse("projects/p/locations//clusters/c/instances/i");
        assert!(matches!(
            result,
            Err(NameError::EmptySegment {
                segment: "location",
                ..
            })
        ));
    }

    #[test]
    fn test_dot_in_cluster_rejected() {
        let result = InstanceName::parse("projects/p/locations/r/clusters/c.x/instances/i");
        assert!(matches!(
            result,
            Err(NameError::InvalidCharacter {
                segment: "cluster",
                found: '.',
                ..
            })
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let name = InstanceName::parse(INST1).unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(
            json,
            "\"projects/proj/locations/region/clusters/clust/instances/inst1\""
        );
        let parsed: InstanceName = serde_json::from_str(&json).unwrap();
        assert_eq!(name, parsed);
    }

    #[test]
    fn test_json_rejects_invalid() {
        let result: Result<InstanceName, _> = serde_json::from_str("\"nope\"");
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn short_name_is_stable(
            project in "[a-z][a-z0-9-]{0,20}",
            location in "[a-z][a-z0-9-]{0,12}",
            cluster in "[a-z][a-z0-9-]{0,20}",
            instance in "[a-z][a-z0-9-]{0,20}",
        ) {
            let raw = format!("projects/{project}/locations/{location}/clusters/{cluster}/instances/{instance}");
            let first = InstanceName::parse(&raw).unwrap();
            let second = InstanceName::parse(&raw).unwrap();
            prop_assert_eq!(first.short_name(), second.short_name());
            prop_assert_eq!(
                first.short_name(),
                format!("{project}.{location}.{cluster}.{instance}")
            );
            let reparsed = InstanceName::parse(&first.key()).unwrap();
            prop_assert_eq!(reparsed, first);
        }
    }
}
