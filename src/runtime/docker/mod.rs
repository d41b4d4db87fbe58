//! [`ContainerRuntime`] implementation backed by the `docker` CLI.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::net::IpAddr;

use serde::Deserialize;
use tracing::debug;

use super::{
    BindMount, BuildRequest, ContainerRuntime, Label, ResourceKind, RunRequest, RuntimeError,
};
use crate::command::{CommandOutput, CommandRunner};
use crate::types::{ContainerId, ImageName};

/// Default Docker CLI binary name.
pub const DEFAULT_DOCKER_BIN: &str = "docker";

const ADDRESS_FORMAT: &str = "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}";

/// Drives the Docker daemon through its command-line client.
#[derive(Clone, Debug)]
pub struct DockerCli<R: CommandRunner> {
    bin: String,
    runner: R,
}

impl<R: CommandRunner> DockerCli<R> {
    /// Creates a client that runs `bin` through `runner`.
    #[must_use]
    pub fn new(bin: impl Into<String>, runner: R) -> Self {
        Self {
            bin: bin.into(),
            runner,
        }
    }

    /// Binary this client invokes.
    #[must_use]
    pub const fn bin(&self) -> &str {
        self.bin.as_str()
    }

    fn run(&self, operation: &str, args: Vec<OsString>) -> Result<CommandOutput, RuntimeError> {
        let output = self.runner.run(&self.bin, &args)?;
        self.check(operation, output)
    }

    fn check(&self, operation: &str, output: CommandOutput) -> Result<CommandOutput, RuntimeError> {
        if output.is_success() {
            return Ok(output);
        }
        Err(RuntimeError::CommandFailure {
            program: self.bin.clone(),
            operation: operation.to_owned(),
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }

    fn inspect(&self, id: &ContainerId, format: &str) -> Result<String, RuntimeError> {
        let output = self.run(
            "inspect",
            args(&["inspect", "--type", "container", "--format", format, id.as_str()]),
        )?;
        Ok(output.stdout.trim().to_owned())
    }
}

impl<R: CommandRunner> ContainerRuntime for DockerCli<R> {
    fn is_available(&self) -> Result<bool, RuntimeError> {
        match self.runner.run(&self.bin, &args(&["ps", "--quiet"])) {
            Ok(output) => {
                if !output.is_success() {
                    debug!(stderr = output.stderr.trim(), "runtime probe failed");
                }
                Ok(output.is_success())
            }
            Err(err) if err.is_interruption() => Err(err.into()),
            Err(err) => {
                debug!(error = %err, "runtime probe could not run");
                Ok(false)
            }
        }
    }

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let output = self.runner.run(
            &self.bin,
            &args(&["image", "inspect", "--format", "{{.Id}}", image]),
        )?;
        Ok(output.is_success())
    }

    fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.run("pull", args(&["pull", image])).map(|_| ())
    }

    fn build_image(&self, request: &BuildRequest<'_>) -> Result<(), RuntimeError> {
        let mut argv = args(&["build", "--tag", request.tag.as_str()]);
        push_labels(&mut argv, request.labels);
        argv.push(OsString::from("-"));

        let output = self
            .runner
            .run_with_stdin(&self.bin, &argv, request.buildfile)?;
        self.check("build", output).map(|_| ())
    }

    fn run_container(&self, request: &RunRequest<'_>) -> Result<ContainerId, RuntimeError> {
        let publish = match request.publish_address {
            IpAddr::V4(addr) => format!("{addr}::{}", request.container_port),
            IpAddr::V6(addr) => format!("[{addr}]::{}", request.container_port),
        };
        let mut argv = args(&[
            "run",
            "--detach",
            "--publish",
            &publish,
            "--hostname",
            request.hostname,
        ]);
        for bind in request.binds {
            argv.push(OsString::from("--volume"));
            argv.push(OsString::from(volume_spec(bind)));
        }
        push_labels(&mut argv, request.labels);
        argv.push(OsString::from(request.image.as_str()));

        let output = self.run("run", argv)?;
        Ok(ContainerId::new(output.stdout.trim()))
    }

    fn mapped_port(
        &self,
        id: &ContainerId,
        container_port: u16,
    ) -> Result<Option<u16>, RuntimeError> {
        let port_spec = format!("{container_port}/tcp");
        let output = self.run("port", args(&["port", id.as_str(), &port_spec]))?;
        parse_mapped_port(&output.stdout)
    }

    fn container_address(&self, id: &ContainerId) -> Result<Option<IpAddr>, RuntimeError> {
        let stdout = self.inspect(id, ADDRESS_FORMAT)?;
        stdout
            .split_whitespace()
            .next()
            .map(|addr| {
                addr.parse::<IpAddr>().map_err(|err| RuntimeError::Parse {
                    operation: String::from("inspect"),
                    message: format!("{addr}: {err}"),
                })
            })
            .transpose()
    }

    fn container_running(&self, id: &ContainerId) -> Result<bool, RuntimeError> {
        match self.inspect(id, "{{.State.Running}}")?.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(RuntimeError::Parse {
                operation: String::from("inspect"),
                message: format!("unexpected running state {other:?}"),
            }),
        }
    }

    fn kill_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.run("kill", args(&["kill", id.as_str()])).map(|_| ())
    }

    fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.run("rm", args(&["rm", id.as_str()])).map(|_| ())
    }

    fn remove_image(&self, image: &ImageName) -> Result<(), RuntimeError> {
        self.run("rmi", args(&["rmi", image.as_str()])).map(|_| ())
    }

    fn list_labelled(
        &self,
        kind: ResourceKind,
        label: &Label,
    ) -> Result<Vec<String>, RuntimeError> {
        let filter = format!("label={}", label.pair());
        let (operation, argv) = match kind {
            ResourceKind::Container => (
                "ps",
                args(&["ps", "--all", "--no-trunc", "--filter", &filter, "--format", "{{json .}}"]),
            ),
            ResourceKind::Image => (
                "images",
                args(&["images", "--no-trunc", "--filter", &filter, "--format", "{{json .}}"]),
            ),
        };
        let output = self.run(operation, argv)?;
        parse_listing(operation, &output.stdout)
    }

    fn force_remove(&self, kind: ResourceKind, id: &str) -> Result<(), RuntimeError> {
        let operation = match kind {
            ResourceKind::Container => "rm",
            ResourceKind::Image => "rmi",
        };
        self.run(operation, args(&[operation, "--force", id]))
            .map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct ListedResource {
    #[serde(rename = "ID")]
    id: String,
}

fn args(values: &[&str]) -> Vec<OsString> {
    values.iter().map(OsString::from).collect()
}

fn push_labels(argv: &mut Vec<OsString>, labels: &[Label]) {
    for label in labels {
        argv.push(OsString::from("--label"));
        argv.push(OsString::from(label.pair()));
    }
}

fn volume_spec(bind: &BindMount) -> String {
    format!("{}:{}:ro", bind.source, bind.destination)
}

/// Parses `docker port` output such as `127.0.0.1:49153` or `[::1]:49153`,
/// taking the first binding.
fn parse_mapped_port(stdout: &str) -> Result<Option<u16>, RuntimeError> {
    let Some(line) = stdout.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return Ok(None);
    };
    let port = line
        .rsplit_once(':')
        .map_or(line, |(_, port)| port)
        .trim();
    port.parse::<u16>()
        .map(Some)
        .map_err(|err| RuntimeError::Parse {
            operation: String::from("port"),
            message: format!("{line}: {err}"),
        })
}

fn parse_listing(operation: &str, stdout: &str) -> Result<Vec<String>, RuntimeError> {
    let mut seen = BTreeSet::new();
    let mut ids = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let resource: ListedResource =
            serde_json::from_str(line).map_err(|err| RuntimeError::Parse {
                operation: operation.to_owned(),
                message: err.to_string(),
            })?;
        if seen.insert(resource.id.clone()) {
            ids.push(resource.id);
        }
    }
    Ok(ids)
}
