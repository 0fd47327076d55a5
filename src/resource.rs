use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A Cloud Spanner resource identified by a hierarchical name such as `projects/p/instances/i`.
pub trait SpannerResource {
    fn resources_id(&self) -> String;
    fn name(&self) -> &str;
    fn id(&self) -> String {
        format!("{}/{}", self.resources_id(), self.name())
    }
    fn url_path(&self) -> String {
        format!("/v1/{}", self.id())
    }
}

// Splits `projects/p/instances/i/...` into its values, checking that the collection names match `collections`.
fn parse_segments<'a>(name: &'a str, collections: &[&str]) -> Result<Vec<&'a str>, Error> {
    let segments: Vec<&str> = name.split('/').collect();
    if segments.len() != collections.len() * 2 {
        return Err(Error::Client(format!("invalid resource name: {}", name)));
    }
    segments
        .chunks(2)
        .zip(collections)
        .map(|(pair, collection)| {
            if pair[0] == *collection && !pair[1].is_empty() {
                Ok(pair[1])
            } else {
                Err(Error::Client(format!(
                    "invalid resource name: {}, expected '{}' segment",
                    name, collection
                )))
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl SpannerResource for ProjectId {
    fn name(&self) -> &str {
        &self.0
    }

    fn resources_id(&self) -> String {
        "projects".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId {
    project: ProjectId,
    name: String,
}

impl InstanceId {
    pub fn new(project: &str, name: &str) -> Self {
        Self {
            project: ProjectId::new(project),
            name: name.to_string(),
        }
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }
}

impl SpannerResource for InstanceId {
    fn name(&self) -> &str {
        &self.name
    }

    fn resources_id(&self) -> String {
        format!("{}/instances", self.project.id())
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = parse_segments(s, &["projects", "instances"])?;
        Ok(InstanceId::new(values[0], values[1]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseId(InstanceId, String);

impl DatabaseId {
    pub fn new(instance: InstanceId, name: &str) -> Self {
        Self(instance, name.to_string())
    }

    pub fn instance(&self) -> &InstanceId {
        &self.0
    }
}

impl SpannerResource for DatabaseId {
    fn name(&self) -> &str {
        &self.1
    }

    fn resources_id(&self) -> String {
        format!("{}/databases", self.0.id())
    }
}

impl FromStr for DatabaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = parse_segments(s, &["projects", "instances", "databases"])?;
        Ok(DatabaseId::new(
            InstanceId::new(values[0], values[1]),
            values[2],
        ))
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// The fully qualified name of a session, as assigned by Cloud Spanner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(DatabaseId, String);

impl SessionId {
    pub fn new(database: DatabaseId, name: &str) -> Self {
        Self(database, name.to_string())
    }

    pub fn database(&self) -> &DatabaseId {
        &self.0
    }
}

impl SpannerResource for SessionId {
    fn name(&self) -> &str {
        &self.1
    }

    fn resources_id(&self) -> String {
        format!("{}/sessions", self.0.id())
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = parse_segments(s, &["projects", "instances", "databases", "sessions"])?;
        Ok(SessionId::new(
            DatabaseId::new(InstanceId::new(values[0], values[1]), values[2]),
            values[3],
        ))
    }
}
