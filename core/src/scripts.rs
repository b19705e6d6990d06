// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Enroll and remove oneliners handed to operators and bootstrap tooling.

use std::fmt::Write as _;
use std::str::FromStr;

use crate::environments::Environment;
use crate::errors::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    Enroll,
    Remove,
}

impl FromStr for ScriptAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enroll" => Ok(Self::Enroll),
            "remove" => Ok(Self::Remove),
            other => Err(CoreError::ValidationError(format!(
                "unknown script action: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPlatform {
    Linux,
    Darwin,
    Windows,
}

impl FromStr for ScriptPlatform {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" | "ubuntu" | "debian" | "centos" | "rhel" | "fedora" => Ok(Self::Linux),
            "darwin" | "macos" => Ok(Self::Darwin),
            "windows" => Ok(Self::Windows),
            other => Err(CoreError::ValidationError(format!(
                "unknown script platform: {other}"
            ))),
        }
    }
}

impl ScriptPlatform {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Linux | Self::Darwin => "sh",
            Self::Windows => "ps1",
        }
    }

    fn agent_dir(&self) -> &'static str {
        match self {
            Self::Linux => "/etc/osquery",
            Self::Darwin => "/private/var/osquery",
            Self::Windows => r"C:\Program Files\osquery",
        }
    }
}

/// Parses a quick-script file name such as `enroll.sh` or `remove.ps1`.
///
/// Shell scripts default to Linux unless `platform` says otherwise.
pub fn parse_script_name(
    name: &str,
    platform: Option<&str>,
) -> Result<(ScriptAction, ScriptPlatform), CoreError> {
    let (action, extension) = name
        .rsplit_once('.')
        .ok_or_else(|| CoreError::ValidationError(format!("invalid script name: {name}")))?;
    let action: ScriptAction = action.parse()?;

    let platform = match (extension, platform) {
        ("ps1", _) => ScriptPlatform::Windows,
        ("sh", None) => ScriptPlatform::Linux,
        ("sh", Some(p)) => match p.parse()? {
            ScriptPlatform::Windows => {
                return Err(CoreError::ValidationError(
                    "shell scripts are not available for windows".to_string(),
                ));
            }
            p => p,
        },
        (other, _) => {
            return Err(CoreError::ValidationError(format!(
                "unknown script extension: {other}"
            )));
        }
    };

    Ok((action, platform))
}

/// Renders the script text. Expiration is checked by the caller.
pub fn render(environment: &Environment, action: ScriptAction, platform: ScriptPlatform) -> String {
    match platform {
        ScriptPlatform::Linux | ScriptPlatform::Darwin => shell(environment, action, platform),
        ScriptPlatform::Windows => powershell(environment, action, platform),
    }
}

fn shell(environment: &Environment, action: ScriptAction, platform: ScriptPlatform) -> String {
    let dir = platform.agent_dir();
    let (stop, start) = match platform {
        ScriptPlatform::Darwin => (
            "launchctl unload /Library/LaunchDaemons/io.osquery.agent.plist 2>/dev/null || true",
            "launchctl load /Library/LaunchDaemons/io.osquery.agent.plist",
        ),
        _ => (
            "systemctl stop osqueryd 2>/dev/null || true",
            "systemctl enable --now osqueryd",
        ),
    };

    let mut script = String::new();
    let _ = writeln!(script, "#!/bin/sh");
    let _ = writeln!(script, "#");
    let _ = writeln!(
        script,
        "# nodewarden {} script for environment {}",
        action_name(action),
        environment.name
    );
    let _ = writeln!(script, "set -e");
    let _ = writeln!(script, "AGENT_DIR=\"{dir}\"");
    let _ = writeln!(script, "{stop}");

    match action {
        ScriptAction::Enroll => {
            let _ = writeln!(script, "mkdir -p \"$AGENT_DIR/certs\"");
            let _ = writeln!(
                script,
                "printf '%s' '{}' > \"$AGENT_DIR/osquery.secret\"",
                environment.secret
            );
            let _ = writeln!(script, "cat > \"$AGENT_DIR/osquery.flags\" <<'FLAGS'");
            let _ = writeln!(script, "{}", environment.flags.trim_end());
            let _ = writeln!(script, "FLAGS");
            if !environment.certificate.is_empty() {
                let _ = writeln!(script, "cat > \"$AGENT_DIR/certs/nodewarden.crt\" <<'CERT'");
                let _ = writeln!(script, "{}", environment.certificate.trim_end());
                let _ = writeln!(script, "CERT");
            }
            let _ = writeln!(script, "{start}");
            let _ = writeln!(
                script,
                "echo \"enrolled in {} via https://{}\"",
                environment.name, environment.hostname
            );
        }
        ScriptAction::Remove => {
            let _ = writeln!(
                script,
                "rm -f \"$AGENT_DIR/osquery.secret\" \"$AGENT_DIR/osquery.flags\" \"$AGENT_DIR/certs/nodewarden.crt\""
            );
            let _ = writeln!(script, "echo \"removed from {}\"", environment.name);
        }
    }

    script
}

fn powershell(environment: &Environment, action: ScriptAction, platform: ScriptPlatform) -> String {
    let dir = platform.agent_dir();

    let mut script = String::new();
    let _ = writeln!(
        script,
        "# nodewarden {} script for environment {}",
        action_name(action),
        environment.name
    );
    let _ = writeln!(script, "$ErrorActionPreference = \"Stop\"");
    let _ = writeln!(script, "$AgentDir = \"{dir}\"");
    let _ = writeln!(
        script,
        "Stop-Service -Name osqueryd -ErrorAction SilentlyContinue"
    );

    match action {
        ScriptAction::Enroll => {
            let _ = writeln!(
                script,
                "New-Item -ItemType Directory -Force -Path \"$AgentDir\\certs\" | Out-Null"
            );
            let _ = writeln!(
                script,
                "Set-Content -NoNewline -Path \"$AgentDir\\osquery.secret\" -Value '{}'",
                environment.secret
            );
            let _ = writeln!(script, "@'");
            let _ = writeln!(script, "{}", environment.flags.trim_end());
            let _ = writeln!(script, "'@ | Set-Content -Path \"$AgentDir\\osquery.flags\"");
            if !environment.certificate.is_empty() {
                let _ = writeln!(script, "@'");
                let _ = writeln!(script, "{}", environment.certificate.trim_end());
                let _ = writeln!(
                    script,
                    "'@ | Set-Content -Path \"$AgentDir\\certs\\nodewarden.crt\""
                );
            }
            let _ = writeln!(script, "Start-Service -Name osqueryd");
            let _ = writeln!(
                script,
                "Write-Host \"enrolled in {} via https://{}\"",
                environment.name, environment.hostname
            );
        }
        ScriptAction::Remove => {
            let _ = writeln!(
                script,
                "Remove-Item -Force -ErrorAction SilentlyContinue \"$AgentDir\\osquery.secret\", \"$AgentDir\\osquery.flags\", \"$AgentDir\\certs\\nodewarden.crt\""
            );
            let _ = writeln!(script, "Write-Host \"removed from {}\"", environment.name);
        }
    }

    script
}

fn action_name(action: ScriptAction) -> &'static str {
    match action {
        ScriptAction::Enroll => "enroll",
        ScriptAction::Remove => "remove",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environments::tests::environment;

    #[test]
    fn test_parse_script_name() {
        assert_eq!(
            parse_script_name("enroll.sh", None).unwrap(),
            (ScriptAction::Enroll, ScriptPlatform::Linux)
        );
        assert_eq!(
            parse_script_name("enroll.sh", Some("darwin")).unwrap(),
            (ScriptAction::Enroll, ScriptPlatform::Darwin)
        );
        assert_eq!(
            parse_script_name("remove.ps1", None).unwrap(),
            (ScriptAction::Remove, ScriptPlatform::Windows)
        );
        assert!(parse_script_name("enroll.sh", Some("windows")).is_err());
        assert!(parse_script_name("enroll.exe", None).is_err());
        assert!(parse_script_name("install.sh", None).is_err());
        assert!(parse_script_name("enroll", None).is_err());
    }

    #[test]
    fn test_enroll_shell_script_carries_environment() {
        let mut env = environment("env-1", "prod");
        env.certificate = "-----BEGIN CERTIFICATE-----".to_string();
        let script = render(&env, ScriptAction::Enroll, ScriptPlatform::Linux);
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("prod-enroll-secret"));
        assert!(script.contains("--host_identifier=uuid"));
        assert!(script.contains("BEGIN CERTIFICATE"));
        assert!(script.contains("systemctl enable --now osqueryd"));
    }

    #[test]
    fn test_darwin_uses_launchctl() {
        let env = environment("env-1", "prod");
        let script = render(&env, ScriptAction::Enroll, ScriptPlatform::Darwin);
        assert!(script.contains("/private/var/osquery"));
        assert!(script.contains("launchctl load"));
    }

    #[test]
    fn test_remove_powershell_script_has_no_secret() {
        let env = environment("env-1", "prod");
        let script = render(&env, ScriptAction::Remove, ScriptPlatform::Windows);
        assert!(script.contains("Remove-Item"));
        assert!(!script.contains("prod-enroll-secret"));
    }
}
