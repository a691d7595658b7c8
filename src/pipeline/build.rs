//! Build-and-publish job of one component
//!
//! registry login (when credentials exist), `docker build`, `docker push`.

use tracing::{error, info};

use crate::config::{RegistryConfig, RegistryCredentials};
use crate::domain::pipeline::JobState;
use crate::domain::service::ServiceDefinition;
use crate::infra::CommandSpec;

use super::context::{RunContext, StageOwner};

/// `docker login` reading the password from stdin
pub fn login_command(registry: &RegistryConfig, creds: &RegistryCredentials) -> CommandSpec {
    let mut args = vec![
        "login".to_string(),
        "-u".to_string(),
        creds.user.clone(),
        "--password-stdin".to_string(),
    ];
    if let Some(ref address) = registry.address {
        args.push(address.clone());
    }
    CommandSpec::new("docker", args).stdin(creds.password.clone())
}

pub fn build_command(service: &ServiceDefinition) -> CommandSpec {
    let dockerfile = service
        .build
        .dockerfile
        .clone()
        .unwrap_or_else(|| format!("{}/Dockerfile", service.build.context.trim_end_matches('/')));
    CommandSpec::new(
        "docker",
        [
            "build".to_string(),
            "-t".to_string(),
            service.image.to_string(),
            "-f".to_string(),
            dockerfile,
            service.build.context.clone(),
        ],
    )
}

pub fn push_command(service: &ServiceDefinition) -> CommandSpec {
    CommandSpec::new("docker", ["push".to_string(), service.image.to_string()])
}

async fn steps(ctx: &RunContext, service: &ServiceDefinition, registry: &RegistryConfig) -> Result<(), String> {
    let component = service.name.as_str();
    let owner = StageOwner::Job(component);

    match registry.credentials {
        Some(ref creds) => {
            ctx.run_stage(owner, "registry_login", login_command(registry, creds))
                .await?
        }
        None => {
            ctx.skip_stage(owner, "registry_login", "no registry credentials")
                .await
        }
    }

    ctx.run_stage(owner, "docker_build", build_command(service))
        .await?;

    ctx.set_job_state(component, JobState::Pushing).await;
    ctx.run_stage(owner, "docker_push", push_command(service))
        .await
}

/// Run the job to completion, returning whether the image was published
pub async fn execute(ctx: RunContext, service: ServiceDefinition, registry: RegistryConfig) -> bool {
    let component = service.name.as_str();

    ctx.log(format!("=== Build {} ({}) ===", component, service.image));
    ctx.set_job_state(component, JobState::Building).await;

    match steps(&ctx, &service, &registry).await {
        Ok(()) => {
            ctx.set_job_state(component, JobState::Published).await;
            ctx.log(format!("Published {}", service.image));
            info!(run_id = %ctx.run_id, component = %component, image = %service.image, "Image published");
            true
        }
        Err(reason) => {
            ctx.set_job_state(component, JobState::Failed).await;
            ctx.log_stderr(format!("Job {} failed: {}", component, reason));
            error!(run_id = %ctx.run_id, component = %component, error = %reason, "Build job failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::image::ImageReference;
    use crate::domain::service::PortMapping;

    fn service() -> ServiceDefinition {
        ServiceDefinition::new(
            "backend",
            ImageReference::parse("registry.example.com/acme/app/backend:latest").unwrap(),
            vec![PortMapping::new(3000, 3000)],
        )
    }

    #[test]
    fn test_build_command_defaults_dockerfile() {
        assert_eq!(
            build_command(&service()).command_line(),
            "docker build -t registry.example.com/acme/app/backend:latest -f ./backend/Dockerfile ./backend"
        );
    }

    #[test]
    fn test_push_command() {
        assert_eq!(
            push_command(&service()).command_line(),
            "docker push registry.example.com/acme/app/backend:latest"
        );
    }

    #[test]
    fn test_login_keeps_password_off_the_command_line() {
        let registry = RegistryConfig {
            address: Some("registry.example.com".to_string()),
            image_prefix: "registry.example.com/acme/app".to_string(),
            credentials: None,
        };
        let creds = RegistryCredentials {
            user: "ci".to_string(),
            password: "hunter2".to_string(),
        };
        let spec = login_command(&registry, &creds);
        assert_eq!(
            spec.command_line(),
            "docker login -u ci --password-stdin registry.example.com"
        );
        assert_eq!(spec.stdin.as_deref(), Some("hunter2"));
    }
}
