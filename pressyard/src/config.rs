//! Configuration loading.
//!
//! A JSON file (`pressyard.json`, or whatever `PRESSYARD_CONFIG_PATH`
//! points at) is deserialized into [`dto::ConfFile`] and validated into the
//! runtime [`Conf`]. A missing file is generated with fresh random cookie
//! keys, so a bare `pressyard` starts an all-in-one instance out of the
//! box.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use rand::RngCore as _;
use tap::prelude::*;
use url::Url;

use crate::cookie::{ENCRYPT_KEY_LENGTH, SIGN_KEY_LENGTH};

const CONFIG_PATH_ENV: &str = "PRESSYARD_CONFIG_PATH";
const DEFAULT_CONFIG_FILE: &str = "pressyard.json";

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8080";
const DEFAULT_RENDERER: &str = "hugo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roles {
    pub admin: bool,
    pub git: bool,
    pub worker: bool,
}

#[derive(Debug, Clone)]
pub struct Conf {
    pub hostname: String,
    pub listen_address: SocketAddr,
    pub roles: Roles,

    pub log_file: Utf8PathBuf,
    pub log_directive: Option<String>,

    pub cookie_sign_key: Vec<u8>,
    pub cookie_encrypt_key: Vec<u8>,

    /// Shared coordination store for sessions, the queue and the lease
    /// lock. In-memory back-ends are used when absent.
    pub redis_url: Option<String>,

    /// Where the relay and the worker reach the identity service.
    pub admin_url: Url,
    /// Where the worker clones repositories from.
    pub git_server_url: Url,

    pub repository_base: Utf8PathBuf,
    pub work_dir: Utf8PathBuf,
    pub theme_repository_url: String,
    pub blog_output_url: Url,
    pub renderer: String,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let hostname = conf_file
            .hostname
            .clone()
            .unwrap_or_else(|| default_hostname().unwrap_or_else(|| "localhost".to_owned()));

        let listen_address: SocketAddr = conf_file
            .listen_address
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN_ADDRESS)
            .parse()
            .context("invalid listen address")?;

        let roles = match &conf_file.roles {
            None => Roles {
                admin: true,
                git: true,
                worker: true,
            },
            Some(roles) => {
                let mut parsed = Roles {
                    admin: false,
                    git: false,
                    worker: false,
                };

                for role in roles {
                    match role.as_str() {
                        "admin" => parsed.admin = true,
                        "git" => parsed.git = true,
                        "worker" => parsed.worker = true,
                        other => anyhow::bail!("unknown role: {other}"),
                    }
                }

                parsed
            }
        };

        let cookie_sign_key = parse_key(conf_file.cookie_sign_key.as_deref(), "signing", SIGN_KEY_LENGTH)?;
        let cookie_encrypt_key = parse_key(
            conf_file.cookie_encrypt_key.as_deref(),
            "encryption",
            ENCRYPT_KEY_LENGTH,
        )?;

        // In the all-in-one deployment the admin API and the relay live on
        // our own listener; a split deployment must name them explicitly.
        let local_base = {
            let host = match listen_address.ip().is_unspecified() {
                true => "127.0.0.1".to_owned(),
                false => listen_address.ip().to_string(),
            };

            format!("http://{host}:{}", listen_address.port())
        };

        let admin_url = match &conf_file.admin_url {
            Some(url) => Url::parse(url).context("invalid admin URL")?,
            None if roles.admin => Url::parse(&format!("{local_base}/api")).context("derived admin URL")?,
            None => anyhow::bail!("missing option: adminUrl"),
        };

        let git_server_url = match &conf_file.git_server_url {
            Some(url) => Url::parse(url).context("invalid git server URL")?,
            None if roles.git => Url::parse(&format!("{local_base}/git")).context("derived git server URL")?,
            None => anyhow::bail!("missing option: gitServerUrl"),
        };

        let repository_base = match &conf_file.repository_base {
            Some(path) => path.clone(),
            None if roles.git => anyhow::bail!("missing option: repositoryBase"),
            None => Utf8PathBuf::new(),
        };

        let work_dir = match &conf_file.work_dir {
            Some(path) => path.clone(),
            None if roles.worker => anyhow::bail!("missing option: workDir"),
            None => Utf8PathBuf::new(),
        };

        let theme_repository_url = match &conf_file.theme_repository_url {
            Some(url) => url.clone(),
            None if roles.worker => anyhow::bail!("missing option: themeRepositoryUrl"),
            None => String::new(),
        };

        let blog_output_url = match &conf_file.blog_output_url {
            Some(url) => Url::parse(url).context("invalid blog output URL")?,
            None if roles.worker => anyhow::bail!("missing option: blogOutputUrl"),
            // Scheme-checked on use; a placeholder keeps the field simple.
            None => Url::parse("file:///var/empty").expect("static URL"),
        };

        Ok(Self {
            hostname,
            listen_address,
            roles,
            log_file: conf_file
                .log_file
                .clone()
                .unwrap_or_else(|| Utf8PathBuf::from("pressyard.log")),
            log_directive: conf_file.log_directive.clone(),
            cookie_sign_key,
            cookie_encrypt_key,
            redis_url: conf_file.redis_url.clone(),
            admin_url,
            git_server_url,
            repository_base,
            work_dir,
            theme_repository_url,
            blog_output_url,
            renderer: conf_file
                .renderer
                .clone()
                .unwrap_or_else(|| DEFAULT_RENDERER.to_owned()),
        })
    }
}

fn parse_key(key: Option<&str>, usage: &str, length: usize) -> anyhow::Result<Vec<u8>> {
    let key = key.with_context(|| format!("cookie {usage} key is required"))?;

    let decoded = hex::decode(key).with_context(|| format!("cookie {usage} key is not valid hex"))?;

    anyhow::ensure!(
        decoded.len() == length,
        "invalid length for the {usage} key: expected {length} bytes, got {}",
        decoded.len()
    );

    Ok(decoded)
}

fn generate_key(length: usize) -> String {
    let mut key = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}

fn default_hostname() -> Option<String> {
    hostname::get().ok()?.into_string().ok()
}

pub fn get_conf_file_path() -> Utf8PathBuf {
    env::var(CONFIG_PATH_ENV)
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|_| Utf8PathBuf::from(DEFAULT_CONFIG_FILE))
}

pub fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let path = get_conf_file_path();

    match load_conf_file(&path)? {
        Some(conf_file) => Ok(conf_file),
        None => {
            let defaults = dto::ConfFile {
                cookie_sign_key: Some(generate_key(SIGN_KEY_LENGTH)),
                cookie_encrypt_key: Some(generate_key(ENCRYPT_KEY_LENGTH)),
                repository_base: Some(Utf8PathBuf::from("data/repositories")),
                work_dir: Some(Utf8PathBuf::from("data/work")),
                blog_output_url: Some("file:///tmp/pressyard-output".to_owned()),
                theme_repository_url: Some("https://github.com/budparr/gohugo-theme-ananke".to_owned()),
                ..Default::default()
            };

            save_conf_file(&defaults, &path).context("failed to save the default configuration")?;

            Ok(defaults)
        }
    }
}

fn load_conf_file(path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .pipe_deref(serde_json::from_str)
            .map(Some)
            .with_context(|| format!("invalid configuration file at {path}")),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error).with_context(|| format!("failed to read {path}")),
    }
}

fn save_conf_file(conf_file: &dto::ConfFile, path: &Utf8Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(conf_file).context("failed to serialize configuration")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {path}"))?;
    Ok(())
}

/// Cheap clonable handle on the loaded configuration.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<Conf>,
}

impl ConfHandle {
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new()?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration")?;

        Ok(Self { inner: Arc::new(conf) })
    }

    /// Test and embedding constructor.
    pub fn from_conf(conf: Conf) -> Self {
        Self { inner: Arc::new(conf) }
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.inner)
    }
}

pub mod dto {
    use camino::Utf8PathBuf;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ConfFile {
        /// Advertised hostname; the machine hostname when absent.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub hostname: Option<String>,
        /// `IP:PORT` to listen on.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub listen_address: Option<String>,
        /// Subset of `admin`, `git`, `worker`; all of them when absent.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub roles: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_directive: Option<String>,
        /// 64 hex-encoded bytes used to sign auth cookies.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub cookie_sign_key: Option<String>,
        /// 32 hex-encoded bytes used to encrypt auth cookies.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub cookie_encrypt_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub redis_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub admin_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub git_server_url: Option<String>,
        /// Base path where user repositories are stored.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub repository_base: Option<Utf8PathBuf>,
        /// Where the worker checks out blog sources and renders.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub work_dir: Option<Utf8PathBuf>,
        /// Git URL of the repository holding the blog theme.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub theme_repository_url: Option<String>,
        /// `file://<path>` or `s3://<bucket>`.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub blog_output_url: Option<String>,
        /// Static site generator binary.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub renderer: Option<String>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_conf_file() -> dto::ConfFile {
        dto::ConfFile {
            cookie_sign_key: Some("00".repeat(SIGN_KEY_LENGTH)),
            cookie_encrypt_key: Some("00".repeat(ENCRYPT_KEY_LENGTH)),
            repository_base: Some(Utf8PathBuf::from("/srv/repos")),
            work_dir: Some(Utf8PathBuf::from("/srv/work")),
            theme_repository_url: Some("https://example.org/theme.git".to_owned()),
            blog_output_url: Some("file:///srv/output".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn minimal_file_yields_an_all_in_one_conf() {
        let conf = Conf::from_conf_file(&minimal_conf_file()).expect("conf");

        assert!(conf.roles.admin && conf.roles.git && conf.roles.worker);
        assert_eq!(conf.listen_address.port(), 8080);
        assert_eq!(conf.admin_url.as_str(), "http://127.0.0.1:8080/api");
        assert_eq!(conf.git_server_url.as_str(), "http://127.0.0.1:8080/git");
        assert_eq!(conf.renderer, "hugo");
    }

    #[test]
    fn cookie_keys_are_validated() {
        let mut conf_file = minimal_conf_file();
        conf_file.cookie_sign_key = Some("abcd".to_owned());
        assert!(Conf::from_conf_file(&conf_file).is_err());

        let mut conf_file = minimal_conf_file();
        conf_file.cookie_sign_key = None;
        assert!(Conf::from_conf_file(&conf_file).is_err());

        let mut conf_file = minimal_conf_file();
        conf_file.cookie_encrypt_key = Some("not hex".to_owned());
        assert!(Conf::from_conf_file(&conf_file).is_err());
    }

    #[test]
    fn split_deployment_requires_explicit_urls() {
        let mut conf_file = minimal_conf_file();
        conf_file.roles = Some(vec!["worker".to_owned()]);
        assert!(Conf::from_conf_file(&conf_file).is_err());

        conf_file.admin_url = Some("http://admin.internal/api".to_owned());
        conf_file.git_server_url = Some("http://git.internal".to_owned());
        let conf = Conf::from_conf_file(&conf_file).expect("conf");

        assert!(conf.roles.worker && !conf.roles.admin && !conf.roles.git);
        assert_eq!(conf.admin_url.as_str(), "http://admin.internal/api");
    }

    #[test]
    fn git_role_requires_a_repository_base() {
        let mut conf_file = minimal_conf_file();
        conf_file.roles = Some(vec!["git".to_owned()]);
        conf_file.repository_base = None;
        conf_file.admin_url = Some("http://admin.internal/api".to_owned());

        let error = Conf::from_conf_file(&conf_file).expect_err("must fail");
        assert!(error.to_string().contains("repositoryBase"));
    }

    #[test]
    fn unknown_roles_are_rejected() {
        let mut conf_file = minimal_conf_file();
        conf_file.roles = Some(vec!["databse".to_owned()]);

        assert!(Conf::from_conf_file(&conf_file).is_err());
    }
}
