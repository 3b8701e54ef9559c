//! Parsed image references and the validated option bags (`CreateConfig`,
//! `StartConfig`, `RunConfig`, `BuildConfig`) for each command verb, plus
//! TOML config-file loading with `$VAR` interpolation and line-numbered
//! error reporting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{TransientError, TransientResult};

/// The image retrieval protocol named in an [`ImageSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vagrant,
    Http,
    File,
}

impl std::str::FromStr for Protocol {
    type Err = TransientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vagrant" => Ok(Protocol::Vagrant),
            "http" => Ok(Protocol::Http),
            "file" => Ok(Protocol::File),
            other => Err(TransientError::validation(format!(
                "unknown protocol: {other}"
            ))),
        }
    }
}

/// A parsed image reference of the form `"<name>[,<proto>=<source>][,<opt>=<val>]*"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub name: String,
    pub protocol: Protocol,
    pub source: String,
    pub options: BTreeMap<String, String>,
}

impl std::str::FromStr for ImageSpec {
    type Err = TransientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',');
        let name = parts.next().unwrap_or("");
        if name.is_empty() {
            return Err(TransientError::validation(format!(
                "invalid image spec `{s}`: name must not be empty"
            )));
        }

        let mut protocol = Protocol::Vagrant;
        let mut source = name.to_string();
        let mut options = BTreeMap::new();
        let mut seen_protocol = false;

        for part in parts {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                TransientError::validation(format!("invalid image spec option `{part}`"))
            })?;
            if !seen_protocol {
                protocol = key.parse()?;
                source = value.to_string();
                seen_protocol = true;
            } else {
                options.insert(key.to_string(), value.to_string());
            }
        }

        Ok(ImageSpec {
            name: name.to_string(),
            protocol,
            source,
            options,
        })
    }
}

/// Options persisted at `create` time — this is the `config` file written
/// into a VM's state directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CreateConfig {
    pub name: Option<String>,
    pub image: Vec<String>,
    #[serde(alias = "image-backend")]
    pub image_backend: Option<PathBuf>,
    #[serde(alias = "image-frontend")]
    pub image_frontend: Option<PathBuf>,
    #[serde(alias = "copy-in-before")]
    pub copy_in_before: Vec<String>,
    #[serde(alias = "shared-folder")]
    pub shared_folder: Vec<String>,
    #[serde(alias = "ssh-user")]
    pub ssh_user: Option<String>,
    #[serde(alias = "ssh-bin-name")]
    pub ssh_bin_name: Option<String>,
    #[serde(alias = "ssh-net-driver")]
    pub ssh_net_driver: Option<String>,
    pub qemu_args: Vec<String>,
}

/// Options that apply only to `start`/`run` and are never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StartConfig {
    #[serde(alias = "copy-in-before")]
    pub copy_in_before: Vec<String>,
    #[serde(alias = "copy-out-after")]
    pub copy_out_after: Vec<String>,
    #[serde(alias = "shared-folder")]
    pub shared_folder: Vec<String>,
    #[serde(alias = "ssh-console")]
    pub ssh_console: bool,
    #[serde(alias = "ssh-with-serial")]
    pub ssh_with_serial: bool,
    #[serde(alias = "ssh-user")]
    pub ssh_user: Option<String>,
    #[serde(alias = "ssh-bin-name")]
    pub ssh_bin_name: Option<String>,
    #[serde(alias = "ssh-timeout")]
    pub ssh_timeout: Option<u64>,
    #[serde(alias = "ssh-port")]
    pub ssh_port: Option<u16>,
    #[serde(alias = "ssh-command")]
    pub ssh_command: Option<String>,
    #[serde(alias = "ssh-net-driver")]
    pub ssh_net_driver: Option<String>,
    #[serde(alias = "shutdown-timeout")]
    pub shutdown_timeout: Option<u64>,
    #[serde(alias = "qmp-timeout")]
    pub qmp_timeout: Option<u64>,
    #[serde(alias = "copy-timeout")]
    pub copy_timeout: Option<u64>,
    #[serde(alias = "prepare-only")]
    pub prepare_only: bool,
    pub qemu_args: Vec<String>,
}

/// The composed configuration the lifecycle controller actually runs with.
/// Never persisted — see `CreateConfig` for what survives to disk.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub name: Option<String>,
    pub image: Vec<String>,
    pub image_backend: Option<PathBuf>,
    pub image_frontend: Option<PathBuf>,
    pub copy_in_before: Vec<String>,
    pub copy_out_after: Vec<String>,
    pub shared_folder: Vec<String>,
    pub ssh_console: bool,
    pub ssh_with_serial: bool,
    pub ssh_user: Option<String>,
    pub ssh_bin_name: Option<String>,
    pub ssh_timeout: Option<u64>,
    pub ssh_port: Option<u16>,
    pub ssh_command: Option<String>,
    pub ssh_net_driver: Option<String>,
    pub shutdown_timeout: Option<u64>,
    pub qmp_timeout: Option<u64>,
    pub copy_timeout: Option<u64>,
    pub prepare_only: bool,
    pub qemu_args: Vec<String>,
}

/// Compose a `CreateConfig` and a `StartConfig` into the `RunConfig` the
/// controller executes. List-valued fields concatenate (create-side
/// first); scalar fields take the start value when non-null, else the
/// create value.
pub fn compose(create: &CreateConfig, start: &StartConfig) -> RunConfig {
    RunConfig {
        name: create.name.clone(),
        image: create.image.clone(),
        image_backend: create.image_backend.clone(),
        image_frontend: create.image_frontend.clone(),
        copy_in_before: concat(&create.copy_in_before, &start.copy_in_before),
        copy_out_after: start.copy_out_after.clone(),
        shared_folder: concat(&create.shared_folder, &start.shared_folder),
        ssh_console: start.ssh_console,
        ssh_with_serial: start.ssh_with_serial,
        ssh_user: start.ssh_user.clone().or_else(|| create.ssh_user.clone()),
        ssh_bin_name: start
            .ssh_bin_name
            .clone()
            .or_else(|| create.ssh_bin_name.clone()),
        ssh_timeout: start.ssh_timeout,
        ssh_port: start.ssh_port,
        ssh_command: start.ssh_command.clone(),
        ssh_net_driver: start
            .ssh_net_driver
            .clone()
            .or_else(|| create.ssh_net_driver.clone()),
        shutdown_timeout: start.shutdown_timeout,
        qmp_timeout: start.qmp_timeout,
        copy_timeout: start.copy_timeout,
        prepare_only: start.prepare_only,
        qemu_args: concat(&create.qemu_args, &start.qemu_args),
    }
}

fn concat(a: &[String], b: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

/// Options for `image build`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuildConfig {
    pub file: Option<PathBuf>,
    #[serde(alias = "image-backend")]
    pub image_backend: Option<PathBuf>,
    #[serde(alias = "ssh-timeout")]
    pub ssh_timeout: Option<u64>,
    #[serde(alias = "qmp-timeout")]
    pub qmp_timeout: Option<u64>,
    pub local: bool,
    pub name: String,
    pub build_dir: PathBuf,
}

/// Expand `$VAR` / `${VAR}` references against the process environment.
/// Unset variables are left unexpanded, matching `os.path.expandvars`
/// semantics in the original implementation.
fn interpolate_env(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        let rest = &text[i + 1..];
        let (name, consumed) = if let Some(braced) = rest.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            (&rest[..end], end + 1)
        };

        if name.is_empty() {
            out.push('$');
            i += 1;
            continue;
        }

        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                out.push('$');
                out.push_str(&text[i + 1..i + consumed]);
            }
        }
        i += consumed;
    }
    out
}

/// Load and parse a TOML config file into `T`, interpolating `$VAR`
/// references first. On parse/validation failure, finds the 1-based line
/// number of the offending key by textual scan, matching the original
/// implementation's error reporting.
pub fn load_config_file<T: for<'de> Deserialize<'de>>(path: &Path) -> TransientResult<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| TransientError::Config {
        path: path.to_path_buf(),
        line: None,
        message: e.to_string(),
    })?;
    let interpolated = interpolate_env(&raw);

    toml::from_str(&interpolated).map_err(|e| {
        let key = extract_offending_key(&e.to_string());
        let line = key.and_then(|k| line_number_of_key(&raw, &k));
        TransientError::Config {
            path: path.to_path_buf(),
            line,
            message: e.to_string(),
        }
    })
}

/// Best-effort extraction of the field name from a `toml` deserialization
/// error message (e.g. "unknown field `foo`, expected one of ...").
fn extract_offending_key(message: &str) -> Option<String> {
    let start = message.find('`')?;
    let rest = &message[start + 1..];
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

/// Scan the raw config text for the line defining `key`, ported from
/// `_line_number_of_option_in_config_file`.
fn line_number_of_key(raw: &str, key: &str) -> Option<usize> {
    for (idx, line) in raw.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with(key)
            && trimmed[key.len()..].trim_start().starts_with('=')
        {
            return Some(idx + 1);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parse_default_protocol() {
        let spec: ImageSpec = "img".parse().unwrap();
        assert_eq!(spec.protocol, Protocol::Vagrant);
        assert_eq!(spec.source, "img");
    }

    #[test]
    fn spec_parse_vagrant_explicit() {
        let spec: ImageSpec = "img,vagrant=centos/7:2004.01".parse().unwrap();
        assert_eq!(spec.protocol, Protocol::Vagrant);
        assert_eq!(spec.source, "centos/7:2004.01");
    }

    #[test]
    fn spec_parse_http() {
        let spec: ImageSpec = "img,http=https://ex.com/a.qcow2.xz".parse().unwrap();
        assert_eq!(spec.protocol, Protocol::Http);
        assert_eq!(spec.source, "https://ex.com/a.qcow2.xz");
    }

    #[test]
    fn spec_parse_file_with_options() {
        let spec: ImageSpec = "img,file=/p,format=raw".parse().unwrap();
        assert_eq!(spec.protocol, Protocol::File);
        assert_eq!(spec.source, "/p");
        assert_eq!(spec.options.get("format").map(String::as_str), Some("raw"));
    }

    #[test]
    fn spec_parse_empty_name_errors() {
        assert!(",sometext".parse::<ImageSpec>().is_err());
    }

    #[test]
    fn spec_parse_unknown_protocol_errors() {
        let err = "img,unknownspec=x".parse::<ImageSpec>().unwrap_err();
        match err {
            TransientError::Validation { message } => {
                assert!(message.contains("unknown protocol"))
            }
            _ => panic!("expected Validation error"),
        }
    }

    #[test]
    fn run_config_composition_law() {
        let create = CreateConfig {
            shared_folder: vec!["a".into(), "b".into()],
            ssh_user: Some("alice".into()),
            ..Default::default()
        };
        let start = StartConfig {
            shared_folder: vec!["c".into()],
            ssh_user: None,
            ssh_timeout: Some(30),
            ..Default::default()
        };

        let run = compose(&create, &start);
        assert_eq!(run.shared_folder, vec!["a", "b", "c"]);
        assert_eq!(run.ssh_user.as_deref(), Some("alice"));
        assert_eq!(run.ssh_timeout, Some(30));

        let start_override = StartConfig {
            ssh_user: Some("bob".into()),
            ..Default::default()
        };
        let run2 = compose(&create, &start_override);
        assert_eq!(run2.ssh_user.as_deref(), Some("bob"));
    }

    #[test]
    fn env_interpolation() {
        std::env::set_var("TRANSIENT_TEST_VAR", "hello");
        assert_eq!(interpolate_env("$TRANSIENT_TEST_VAR/world"), "hello/world");
        assert_eq!(
            interpolate_env("${TRANSIENT_TEST_VAR}-x"),
            "hello-x"
        );
        assert_eq!(interpolate_env("$NOT_SET_XYZ"), "$NOT_SET_XYZ");
    }

    #[test]
    fn unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "name = \"vm1\"\nbogus-field = 1\n").unwrap();
        let result: TransientResult<CreateConfig> = load_config_file(&path);
        assert!(result.is_err());
    }
}
