//! Image synthesis: turns a base image plus ordered customisation commits
//! into a Dockerfile-equivalent build specification with an SSH bootstrap.

use crate::node::Commit;

/// Container port the SSH daemon listens on.
pub const SSH_PORT: u16 = 22;

/// Password given to `root` when no override is configured.
pub const DEFAULT_ROOT_PASSWORD: &str = "berth";

const SSHD_BINARY: &str = "/usr/sbin/sshd";
const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";
const LINE_CONTINUATION: &str = " && \\\n    ";

/// Fixed SSH bootstrap layered on top of every image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshBootstrap {
    root_password: String,
}

impl SshBootstrap {
    /// Creates a bootstrap that sets the given root password.
    #[must_use]
    pub fn new(root_password: impl Into<String>) -> Self {
        Self {
            root_password: root_password.into(),
        }
    }

    /// Password the bootstrap assigns to `root`.
    #[must_use]
    pub const fn root_password(&self) -> &str {
        self.root_password.as_str()
    }

    /// `RUN` payloads that prepare the SSH daemon, in emission order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        let credentials = format!("root:{}", self.root_password);
        let host_keys = [
            ("rsa1", "/etc/ssh/ssh_host_key"),
            ("rsa", "/etc/ssh/ssh_host_rsa_key"),
            ("dsa", "/etc/ssh/ssh_host_dsa_key"),
        ]
        .iter()
        .map(|(kind, path)| format!("/usr/bin/ssh-keygen -q -t {kind} -f {path} -C '' -N ''"))
        .collect::<Vec<_>>()
        .join(LINE_CONTINUATION);

        vec![
            host_keys,
            format!(
                "mkdir -p /var/run/sshd && echo {} | chpasswd",
                shell_escape::unix::escape(credentials.into())
            ),
            format!(
                "sed -ri 's/UsePAM yes/#UsePAM yes/g' {SSHD_CONFIG} && \
                 sed -ri 's/#UsePAM no/UsePAM no/g' {SSHD_CONFIG}"
            ),
            format!(
                "sed -ri 's/^#?PermitRootLogin .*/PermitRootLogin yes/' {SSHD_CONFIG}"
            ),
        ]
    }
}

impl Default for SshBootstrap {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_PASSWORD)
    }
}

/// Layered build directives for one node image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildSpec {
    /// Image the build starts from.
    pub base_image: String,
    /// One `RUN` payload per non-empty customisation commit, in order.
    pub layers: Vec<String>,
    /// SSH bootstrap payloads emitted after the customisation layers.
    pub bootstrap: Vec<String>,
    /// Port exposed by the image.
    pub exposed_port: u16,
    /// Foreground entrypoint argv.
    pub entrypoint: Vec<String>,
}

impl BuildSpec {
    /// Renders the specification as Dockerfile text, one directive per line.
    #[must_use]
    pub fn render(&self) -> String {
        let entrypoint = self
            .entrypoint
            .iter()
            .map(|arg| format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect::<Vec<_>>()
            .join(", ");

        let mut lines = Vec::with_capacity(self.layers.len() + self.bootstrap.len() + 3);
        lines.push(format!("FROM {}", self.base_image));
        lines.extend(
            self.layers
                .iter()
                .chain(&self.bootstrap)
                .map(|payload| format!("RUN {payload}")),
        );
        lines.push(format!("EXPOSE {}", self.exposed_port));
        lines.push(format!("ENTRYPOINT [{entrypoint}]"));

        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

/// Synthesises a build specification using the default SSH bootstrap.
#[must_use]
pub fn synthesize(base_image: &str, commits: &[Commit]) -> BuildSpec {
    synthesize_with(base_image, commits, &SshBootstrap::default())
}

/// Synthesises a build specification with an explicit SSH bootstrap.
///
/// Commits keep the order supplied; each becomes one layer whose commands are
/// chained with `&&`. Commits with no commands produce no layer.
#[must_use]
pub fn synthesize_with(
    base_image: &str,
    commits: &[Commit],
    bootstrap: &SshBootstrap,
) -> BuildSpec {
    let layers = commits
        .iter()
        .filter(|commit| !commit.commands.is_empty())
        .map(|commit| commit.commands.join(LINE_CONTINUATION))
        .collect();

    BuildSpec {
        base_image: base_image.to_owned(),
        layers,
        bootstrap: bootstrap.commands(),
        exposed_port: SSH_PORT,
        entrypoint: vec![SSHD_BINARY.to_owned(), String::from("-D")],
    }
}
