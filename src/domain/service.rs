//! Service definitions
//!
//! A named component of the deployment together with the image it runs and
//! the ports it publishes on the host.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::image::ImageReference;

#[derive(Debug, Error, PartialEq)]
pub enum PortMappingError {
    #[error("invalid port mapping '{0}', expected HOST:CONTAINER")]
    Malformed(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// Published port mapping (`host:container`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    pub fn new(host: u16, container: u16) -> Self {
        Self { host, container }
    }

    /// Parse `"80:80"`; a bare `"3000"` publishes the same port on both sides
    pub fn parse(raw: &str) -> Result<Self, PortMappingError> {
        let raw = raw.trim();
        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            [single] => {
                let port = parse_port(single)?;
                Ok(Self::new(port, port))
            }
            [host, container] => Ok(Self::new(parse_port(host)?, parse_port(container)?)),
            _ => Err(PortMappingError::Malformed(raw.to_string())),
        }
    }
}

fn parse_port(raw: &str) -> Result<u16, PortMappingError> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(PortMappingError::InvalidPort(raw.to_string())),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

impl FromStr for PortMapping {
    type Err = PortMappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PortMapping {
    type Error = PortMappingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PortMapping> for String {
    fn from(value: PortMapping) -> Self {
        value.to_string()
    }
}

/// How a component's image is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build context directory, relative to the release work dir
    pub context: String,
    /// Dockerfile path relative to the work dir (docker default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
}

impl BuildSpec {
    /// Conventional layout: each component lives in `./<name>`
    pub fn for_component(name: &str) -> Self {
        Self {
            context: format!("./{}", name),
            dockerfile: None,
        }
    }
}

/// A deployable component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub image: ImageReference,
    pub ports: Vec<PortMapping>,
    pub build: BuildSpec,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, image: ImageReference, ports: Vec<PortMapping>) -> Self {
        let name = name.into();
        let build = BuildSpec::for_component(&name);
        Self {
            name,
            image,
            ports,
            build,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_mapping_parse() {
        assert_eq!(PortMapping::parse("8080:80").unwrap(), PortMapping::new(8080, 80));
        assert_eq!(PortMapping::parse("3000").unwrap(), PortMapping::new(3000, 3000));
        assert!(matches!(
            PortMapping::parse("1:2:3"),
            Err(PortMappingError::Malformed(_))
        ));
        assert!(matches!(
            PortMapping::parse("0:80"),
            Err(PortMappingError::InvalidPort(_))
        ));
        assert!(matches!(
            PortMapping::parse("http:80"),
            Err(PortMappingError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_service_default_build_context() {
        let image = ImageReference::parse("registry.example.com/app/backend").unwrap();
        let svc = ServiceDefinition::new("backend", image, vec![PortMapping::new(3000, 3000)]);
        assert_eq!(svc.build.context, "./backend");
        assert_eq!(svc.ports[0].to_string(), "3000:3000");
    }
}
