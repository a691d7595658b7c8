//! Orchestration descriptor
//!
//! The multi-service deployment definition, stored as a compose file:
//!
//! ```yaml
//! services:
//!   frontend:
//!     image: registry.gitlab.com/acme/shop/frontend:latest
//!     build: ./frontend
//!     ports:
//!       - "80:80"
//!   backend:
//!     image: registry.gitlab.com/acme/shop/backend:latest
//!     ports:
//!       - "3000:3000"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

use crate::domain::image::{ImageRefError, ImageReference};
use crate::domain::service::{BuildSpec, PortMapping, ServiceDefinition};

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read descriptor {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid descriptor YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("service '{service}' has an invalid image: {source}")]
    Image {
        service: String,
        #[source]
        source: ImageRefError,
    },

    #[error("service '{0}' declares no image")]
    MissingImage(String),

    #[error("descriptor declares no services")]
    Empty,

    #[error("service '{0}' is declared twice")]
    DuplicateService(String),

    #[error("host port {port} is published by both '{first}' and '{second}'")]
    PortConflict {
        port: u16,
        first: String,
        second: String,
    },
}

/// Compose `build:` accepts either a path or a mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ComposeBuild {
    Context(String),
    Detailed {
        context: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dockerfile: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ComposeService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    build: Option<ComposeBuild>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, ComposeService>,
}

/// Declarative deployment definition
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationDescriptor {
    services: Vec<ServiceDefinition>,
}

impl OrchestrationDescriptor {
    pub fn new(services: Vec<ServiceDefinition>) -> Result<Self, DescriptorError> {
        let descriptor = Self { services };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// `frontend` on 80:80 and `backend` on 3000:3000, both at `latest`
    pub fn standard(image_prefix: &str) -> Result<Self, DescriptorError> {
        let image = |name: &str| {
            ImageReference::latest(image_prefix, name).map_err(|source| DescriptorError::Image {
                service: name.to_string(),
                source,
            })
        };

        Self::new(vec![
            ServiceDefinition::new("frontend", image("frontend")?, vec![PortMapping::new(80, 80)]),
            ServiceDefinition::new("backend", image("backend")?, vec![PortMapping::new(3000, 3000)]),
        ])
    }

    /// Load from a compose file on disk
    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        let raw = std::fs::read_to_string(path).map_err(|source| DescriptorError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Load `path` when it exists, otherwise fall back to [`Self::standard`]
    pub fn load_or_standard(path: &Path, image_prefix: &str) -> Result<Self, DescriptorError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "No descriptor on disk, using the standard two-service layout");
            Self::standard(image_prefix)
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self, DescriptorError> {
        let file: ComposeFile = serde_yaml::from_str(raw)?;

        let mut services = Vec::with_capacity(file.services.len());
        for (name, svc) in file.services {
            let raw_image = svc
                .image
                .ok_or_else(|| DescriptorError::MissingImage(name.clone()))?;
            let image = ImageReference::parse(&raw_image).map_err(|source| DescriptorError::Image {
                service: name.clone(),
                source,
            })?;
            let build = match svc.build {
                Some(ComposeBuild::Context(context)) => BuildSpec {
                    context,
                    dockerfile: None,
                },
                Some(ComposeBuild::Detailed {
                    context,
                    dockerfile,
                }) => BuildSpec {
                    context,
                    dockerfile,
                },
                None => BuildSpec::for_component(&name),
            };
            services.push(ServiceDefinition {
                name,
                image,
                ports: svc.ports,
                build,
            });
        }

        Self::new(services)
    }

    /// Render back to compose YAML
    pub fn to_yaml(&self) -> Result<String, DescriptorError> {
        let services = self
            .services
            .iter()
            .map(|svc| {
                let build = match &svc.build.dockerfile {
                    None => ComposeBuild::Context(svc.build.context.clone()),
                    Some(dockerfile) => ComposeBuild::Detailed {
                        context: svc.build.context.clone(),
                        dockerfile: Some(dockerfile.clone()),
                    },
                };
                (
                    svc.name.clone(),
                    ComposeService {
                        image: Some(svc.image.to_string()),
                        build: Some(build),
                        ports: svc.ports.clone(),
                    },
                )
            })
            .collect();

        Ok(serde_yaml::to_string(&ComposeFile { services })?)
    }

    /// At least one service, unique names, no host port published twice
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.services.is_empty() {
            return Err(DescriptorError::Empty);
        }

        let mut owners: BTreeMap<u16, &str> = BTreeMap::new();
        let mut seen_names = HashSet::new();
        for svc in &self.services {
            if !seen_names.insert(svc.name.as_str()) {
                return Err(DescriptorError::DuplicateService(svc.name.clone()));
            }
            for port in &svc.ports {
                if let Some(first) = owners.insert(port.host, &svc.name) {
                    return Err(DescriptorError::PortConflict {
                        port: port.host,
                        first: first.to_string(),
                        second: svc.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn services(&self) -> &[ServiceDefinition] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPOSE: &str = r#"
services:
  frontend:
    image: registry.gitlab.com/acme/shop/frontend:latest
    build: ./web
    ports:
      - "80:80"
  backend:
    image: registry.gitlab.com/acme/shop/backend:latest
    build:
      context: ./api
      dockerfile: api/Dockerfile.prod
    ports:
      - "3000:3000"
"#;

    #[test]
    fn test_from_yaml() {
        let descriptor = OrchestrationDescriptor::from_yaml(COMPOSE).unwrap();
        assert_eq!(descriptor.services().len(), 2);

        let frontend = descriptor.service("frontend").unwrap();
        assert_eq!(frontend.build.context, "./web");
        assert_eq!(frontend.ports, vec![PortMapping::new(80, 80)]);

        let backend = descriptor.service("backend").unwrap();
        assert_eq!(backend.build.dockerfile.as_deref(), Some("api/Dockerfile.prod"));
        assert_eq!(
            backend.image.to_string(),
            "registry.gitlab.com/acme/shop/backend:latest"
        );
    }

    #[test]
    fn test_missing_build_defaults_to_component_dir() {
        let descriptor = OrchestrationDescriptor::from_yaml(
            "services:\n  backend:\n    image: app/backend\n    ports: [\"3000:3000\"]\n",
        )
        .unwrap();
        assert_eq!(descriptor.service("backend").unwrap().build.context, "./backend");
    }

    #[test]
    fn test_standard_descriptor() {
        let descriptor = OrchestrationDescriptor::standard("registry.example.com/acme/shop").unwrap();
        let names: Vec<&str> = descriptor.services().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["frontend", "backend"]);
        assert_eq!(descriptor.service("frontend").unwrap().ports[0].to_string(), "80:80");
        assert_eq!(descriptor.service("backend").unwrap().ports[0].to_string(), "3000:3000");
    }

    #[test]
    fn test_yaml_round_trip_keeps_services() {
        let descriptor = OrchestrationDescriptor::from_yaml(COMPOSE).unwrap();
        let rendered = descriptor.to_yaml().unwrap();
        let reparsed = OrchestrationDescriptor::from_yaml(&rendered).unwrap();
        assert_eq!(descriptor, reparsed);
    }

    #[test]
    fn test_rejects_port_conflicts_and_missing_images() {
        let conflict = "services:\n  a:\n    image: x/a\n    ports: [\"80:80\"]\n  b:\n    image: x/b\n    ports: [\"80:8080\"]\n";
        assert!(matches!(
            OrchestrationDescriptor::from_yaml(conflict),
            Err(DescriptorError::PortConflict { port: 80, .. })
        ));

        let missing = "services:\n  a:\n    ports: [\"80:80\"]\n";
        assert!(matches!(
            OrchestrationDescriptor::from_yaml(missing),
            Err(DescriptorError::MissingImage(_))
        ));

        assert!(matches!(
            OrchestrationDescriptor::from_yaml("services: {}\n"),
            Err(DescriptorError::Empty)
        ));
    }

    #[test]
    fn test_load_or_standard_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker-compose.yml");
        let descriptor = OrchestrationDescriptor::load_or_standard(&path, "app").unwrap();
        assert_eq!(descriptor.services().len(), 2);

        std::fs::write(&path, COMPOSE).unwrap();
        let descriptor = OrchestrationDescriptor::load_or_standard(&path, "app").unwrap();
        assert_eq!(descriptor.service("frontend").unwrap().build.context, "./web");
    }
}
