// ABOUTME: Renders the build descriptor and entrypoint script for a machine
// ABOUTME: User commands are shell-quoted and run through eval in a fixed sequence

use crate::error::Result;
use crate::types::MachineRecord;
use serde_json::json;
use std::path::Path;
use tokio::fs;

pub const DOCKERFILE: &str = "Dockerfile";
pub const ENTRYPOINT: &str = "entrypoint.sh";
pub const TUNNEL_BINARY: &str = "cloudflared";
pub const TUNNEL_SCRIPT: &str = "tunnel.sh";

/// File written by the tunnel helper with the public address of the machine
const WEBADDR_FILE: &str = "/workspace/.webaddr";

/// Outbound tunnel plus short-link registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    pub short_link_url: String,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactOptions {
    /// `None` leaves the tunnel step out of both files
    pub tunnel: Option<TunnelOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifacts {
    pub dockerfile: String,
    pub entrypoint: String,
}

impl BuildArtifacts {
    /// Write both files into the machine directory; the entrypoint is made executable.
    pub async fn write_to(&self, dir: &Path) -> Result<()> {
        fs::write(dir.join(DOCKERFILE), &self.dockerfile).await?;

        let entrypoint = dir.join(ENTRYPOINT);
        fs::write(&entrypoint, &self.entrypoint).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&entrypoint, std::fs::Permissions::from_mode(0o755)).await?;
        }

        Ok(())
    }
}

/// Quote a string as a single POSIX shell word
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn generate(record: &MachineRecord, options: &ArtifactOptions) -> BuildArtifacts {
    BuildArtifacts {
        dockerfile: render_dockerfile(record, options),
        entrypoint: render_entrypoint(record, options),
    }
}

fn render_dockerfile(record: &MachineRecord, options: &ArtifactOptions) -> String {
    let mut lines = vec![
        format!("FROM {}", record.image),
        String::new(),
        "ENV PYTHONUNBUFFERED=1 \\".to_string(),
        "    PYTHONDONTWRITEBYTECODE=1 \\".to_string(),
        "    LANG=C.UTF-8 \\".to_string(),
        "    LC_ALL=C.UTF-8 \\".to_string(),
        "    TZ=UTC \\".to_string(),
        "    DEBIAN_FRONTEND=noninteractive".to_string(),
        String::new(),
        "WORKDIR /workspace".to_string(),
        String::new(),
        "COPY files/ .".to_string(),
        format!("COPY {} /", ENTRYPOINT),
    ];

    if options.tunnel.is_some() {
        lines.push(format!("COPY {} /", TUNNEL_SCRIPT));
        lines.push(format!("COPY {} /usr/local/bin/", TUNNEL_BINARY));
        lines.push(String::new());
        lines.push(format!(
            "RUN chmod +x /usr/local/bin/{} /{}",
            TUNNEL_BINARY, TUNNEL_SCRIPT
        ));
    } else {
        lines.push(String::new());
    }

    lines.push(format!("RUN chmod +x /{}", ENTRYPOINT));
    lines.push(String::new());
    lines.push(format!("ENTRYPOINT [\"/{}\"]", ENTRYPOINT));

    let mut dockerfile = lines.join("\n");
    dockerfile.push('\n');
    dockerfile
}

fn banner(title: &str, skipped: bool) -> String {
    format!(
        r#"echo -e "\033[1m\033[34m===== {}{}... =====\033[0m\n""#,
        title,
        if skipped { " ( Skipped )" } else { "" }
    )
}

fn tunnel_lines(record: &MachineRecord, tunnel: &TunnelOptions) -> Vec<String> {
    let settings = record.effective_settings();

    // Static fields are serialized up front; the address is only known inside the container
    let fields = json!({
        "authorization": tunnel.authorization.clone().unwrap_or_default(),
        "instance_id": record.id,
        "unique_id": settings.unique_path,
    })
    .to_string();
    let head = format!("{},\"redirect_url\":\"", fields.trim_end_matches('}'));

    vec![
        format!(
            "/{} {} && rm -f /{} > /dev/null 2>&1",
            TUNNEL_SCRIPT, settings.forwarding_port, TUNNEL_SCRIPT
        ),
        format!(
            r"WEBADDR=$(head -n 1 {} 2>/dev/null | tr -d '\r\n')",
            WEBADDR_FILE
        ),
        format!(
            r#"curl -s -X POST -H "Content-Type: application/json" -d {}"$WEBADDR"'"}}' {} > /dev/null 2>&1 || true"#,
            shell_quote(&head),
            shell_quote(&format!(
                "{}/shorten",
                tunnel.short_link_url.trim_end_matches('/')
            ))
        ),
    ]
}

fn command_line(command: &str) -> Option<String> {
    let command = command.trim();
    if command.is_empty() {
        None
    } else {
        Some(format!("eval {}", shell_quote(command)))
    }
}

fn render_entrypoint(record: &MachineRecord, options: &ArtifactOptions) -> String {
    let settings = record.effective_settings();
    let mut lines = vec!["#!/bin/bash".to_string()];

    if let Some(tunnel) = &options.tunnel {
        lines.extend(tunnel_lines(record, tunnel));
    }

    let install = command_line(&settings.install_command);
    lines.push(banner("Installing Dependencies", install.is_none()));
    lines.extend(install);

    let build = command_line(&settings.build_command);
    lines.push(banner("Building Application", build.is_none()));
    lines.extend(build);

    lines.push(banner("Starting Application", false));
    lines.extend(command_line(&settings.run_command));

    // Keep the container alive after the workload exits
    lines.push("tail -f /dev/null".to_string());

    let mut script = lines.join("\n");
    script.push('\n');
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MachineSettings;
    use pretty_assertions::assert_eq;

    fn record() -> MachineRecord {
        let mut record = MachineRecord::new("web", 2, 1, "python:3.11").unwrap();
        record.settings = MachineSettings {
            install_command: "pip install -r requirements.txt".to_string(),
            build_command: String::new(),
            run_command: "python app.py --name 'demo'".to_string(),
            forwarding_port: 8080,
            unique_path: "demo-app".to_string(),
        };
        record
    }

    fn tunnel() -> ArtifactOptions {
        ArtifactOptions {
            tunnel: Some(TunnelOptions {
                short_link_url: "https://short.example/".to_string(),
                authorization: Some("token".to_string()),
            }),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_dockerfile_pins_environment_and_image() {
        let artifacts = generate(&record(), &tunnel());
        let dockerfile = &artifacts.dockerfile;

        assert!(dockerfile.starts_with("FROM python:3.11\n"));
        assert!(dockerfile.contains("TZ=UTC"));
        assert!(dockerfile.contains("LANG=C.UTF-8"));
        assert!(dockerfile.contains("WORKDIR /workspace"));
        assert!(dockerfile.contains("COPY files/ ."));
        assert!(dockerfile.contains("COPY cloudflared /usr/local/bin/"));
        assert!(dockerfile.ends_with("ENTRYPOINT [\"/entrypoint.sh\"]\n"));
    }

    #[test]
    fn test_dockerfile_without_tunnel_assets() {
        let artifacts = generate(&record(), &ArtifactOptions::default());
        assert!(!artifacts.dockerfile.contains("cloudflared"));
        assert!(!artifacts.dockerfile.contains("tunnel.sh"));
        assert!(!artifacts.entrypoint.contains("tunnel.sh"));
        assert!(!artifacts.entrypoint.contains("curl"));
    }

    #[test]
    fn test_entrypoint_sequence() {
        let script = generate(&record(), &tunnel()).entrypoint;
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "#!/bin/bash");
        assert_eq!(
            lines[1],
            "/tunnel.sh 8080 && rm -f /tunnel.sh > /dev/null 2>&1"
        );
        assert!(lines[3].starts_with("curl "));
        assert!(lines[3].contains("'https://short.example/shorten'"));
        assert!(lines[3].ends_with("|| true"));

        let position = |needle: &str| {
            lines
                .iter()
                .position(|l| l.contains(needle))
                .unwrap_or_else(|| panic!("missing {needle}"))
        };
        let install = position("eval 'pip install -r requirements.txt'");
        let build_banner = position("Building Application ( Skipped )");
        let run = position(r"eval 'python app.py --name '\''demo'\'''");
        let tail = position("tail -f /dev/null");

        assert!(position("Installing Dependencies...") < install);
        assert!(install < build_banner);
        assert!(build_banner < position("Starting Application"));
        assert!(position("Starting Application") < run);
        assert_eq!(tail, lines.len() - 1);
    }

    #[test]
    fn test_empty_commands_are_omitted() {
        let mut record = record();
        record.settings.install_command = "   ".to_string();
        record.settings.run_command = String::new();
        let script = generate(&record, &ArtifactOptions::default()).entrypoint;

        assert!(!script.contains("eval"));
        assert!(!script.lines().any(|l| l.trim().is_empty()));
        assert!(script.contains("Installing Dependencies ( Skipped )"));
    }

    #[test]
    fn test_registration_payload_is_valid_json() {
        let script = generate(&record(), &tunnel()).entrypoint;
        let curl = script.lines().find(|l| l.starts_with("curl")).unwrap();

        // Reassemble the payload the shell would build with an address substituted
        let start = curl.find("-d '").unwrap() + 4;
        let head_end = curl[start..].find('\'').unwrap() + start;
        let payload = format!("{}https://abc.trycloudflare.com\"}}", &curl[start..head_end]);

        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["authorization"], "token");
        assert_eq!(value["unique_id"], "demo-app");
        assert_eq!(value["redirect_url"], "https://abc.trycloudflare.com");
    }

    #[tokio::test]
    async fn test_write_to_marks_entrypoint_executable() {
        let tmp = tempfile::TempDir::new().unwrap();
        generate(&record(), &ArtifactOptions::default())
            .write_to(tmp.path())
            .await
            .unwrap();

        assert!(tmp.path().join(DOCKERFILE).is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(tmp.path().join(ENTRYPOINT))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
