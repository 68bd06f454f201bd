//! Instance name parsing
//!
//! Supports formats:
//! * project:region:instance
//! * domain.com:project:region:instance (domain-scoped project)

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Fully qualified name of a database instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceName {
    project: String,
    region: String,
    name: String,
}

impl InstanceName {
    /// Build a name from its parts, validating each one
    pub fn new(
        project: impl Into<String>,
        region: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let project = project.into();
        let region = region.into();
        let name = name.into();
        let display = format!("{}:{}:{}", project, region, name);
        if project.is_empty() || region.is_empty() || name.is_empty() {
            return Err(Error::config(
                display,
                "invalid instance name: project, region and instance must be non-empty",
            ));
        }
        if region.contains(':') || name.contains(':') {
            return Err(Error::config(
                display,
                "invalid instance name: expected format PROJECT:REGION:INSTANCE",
            ));
        }
        Ok(Self {
            project,
            region,
            name,
        })
    }

    /// Parse `project:region:instance`
    pub fn parse(s: &str) -> Result<Self> {
        let invalid =
            || Error::config(s, "invalid instance name: expected format PROJECT:REGION:INSTANCE");

        // The project is everything before the last two separators, which
        // admits domain-scoped projects such as `example.com:project`.
        let mut parts = s.rsplitn(3, ':');
        let name = parts.next().ok_or_else(invalid)?;
        let region = parts.next().ok_or_else(invalid)?;
        let project = parts.next().ok_or_else(invalid)?;

        // A domain-scoped project carries exactly one extra separator
        if project.matches(':').count() > 1 || project.starts_with(':') || project.ends_with(':') {
            return Err(invalid());
        }

        Self::new(project, region, name)
    }

    /// Project ID (including the domain for domain-scoped projects)
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Region the instance lives in
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Instance name within the project
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for InstanceName {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.name)
    }
}
