use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::cli::CliArgs;
use crate::error::{MailstashError, Result};
use crate::perms::Ownership;

/// Optional values read from the TOML config file.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<bool>,
    pub path: Option<String>,
    pub user_id: Option<u32>,
    pub group_id: Option<u32>,
    pub renderer: Option<String>,
    pub page_format: Option<String>,
    pub generate_html: Option<bool>,
    pub generate_pdf: Option<bool>,
    pub save_attachments: Option<bool>,
    pub email_from_regex: Option<String>,
    pub slug_with_subject: Option<bool>,
}

/// Fully resolved run settings. Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub tls: bool,
    pub archive_root: PathBuf,
    pub ownership: Ownership,
    pub renderer: PathBuf,
    pub page_format: String,
    pub generate_html: bool,
    pub generate_pdf: bool,
    pub save_attachments: bool,
    pub sender_filter: String,
    pub slug_with_subject: bool,
    pub dry_run: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            password: String::new(),
            port: 993,
            tls: true,
            archive_root: PathBuf::from("./data"),
            ownership: Ownership::default(),
            renderer: PathBuf::from("/usr/local/bin/wkhtmltopdf"),
            page_format: "A4".to_string(),
            generate_html: true,
            generate_pdf: true,
            save_attachments: true,
            sender_filter: ".*".to_string(),
            slug_with_subject: false,
            dry_run: false,
        }
    }
}

/// Merge defaults, file values, environment and CLI flags (in that order of
/// increasing precedence) into one `Settings`.
pub fn resolve(file: FileConfig, env: &HashMap<String, String>, args: &CliArgs) -> Result<Settings> {
    let defaults = Settings::default();
    // Empty variables count as unset.
    let var = |key: &str| env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    let host = var("IMAP_HOST")
        .map(str::to_string)
        .or(file.host)
        .unwrap_or(defaults.host);
    let user = var("IMAP_USER")
        .map(str::to_string)
        .or(file.user)
        .unwrap_or(defaults.user);
    let password = env
        .get("IMAP_PASSWORD")
        .filter(|v| !v.is_empty())
        .cloned()
        .or(file.password)
        .unwrap_or(defaults.password);
    let port = match var("IMAP_PORT") {
        Some(v) => parse_number("IMAP_PORT", v)?,
        None => file.port.unwrap_or(defaults.port),
    };
    let tls = var("IMAP_TLS")
        .map(parse_flag)
        .or(file.tls)
        .unwrap_or(defaults.tls);

    let root = args
        .target
        .clone()
        .or_else(|| var("MAIL_STORAGE_PATH").map(str::to_string))
        .or(file.path);
    let archive_root = match root {
        Some(root) => PathBuf::from(shellexpand::tilde(&root).to_string()),
        None => defaults.archive_root,
    };

    let uid = match var("USER_ID") {
        Some(v) => Some(parse_number("USER_ID", v)?),
        None => file.user_id,
    };
    let gid = match var("GROUP_ID") {
        Some(v) => Some(parse_number("GROUP_ID", v)?),
        None => file.group_id,
    };

    let renderer = var("PDF_RENDERER_PATH")
        .map(str::to_string)
        .or(file.renderer)
        .map(|p| PathBuf::from(shellexpand::tilde(&p).to_string()))
        .unwrap_or(defaults.renderer);
    let page_format = var("PDF_PAGE_FORMAT")
        .map(str::to_string)
        .or(file.page_format)
        .unwrap_or(defaults.page_format);

    let flag = |key: &str, from_file: Option<bool>, default: bool| {
        var(key).map(parse_flag).or(from_file).unwrap_or(default)
    };
    let generate_html = flag("GENERATE_HTML", file.generate_html, defaults.generate_html);
    let generate_pdf = flag("GENERATE_PDF", file.generate_pdf, defaults.generate_pdf);
    let save_attachments = flag(
        "SAVE_ATTACHMENTS",
        file.save_attachments,
        defaults.save_attachments,
    );
    let slug_with_subject = flag(
        "SLUG_WITH_SUBJECT",
        file.slug_with_subject,
        defaults.slug_with_subject,
    );

    let sender_filter = args
        .sender_filter
        .clone()
        .or_else(|| var("EMAIL_FROM_REGEX").map(str::to_string))
        .or(file.email_from_regex)
        .unwrap_or(defaults.sender_filter);

    if host.is_empty() {
        return Err(MailstashError::Config(
            "IMAP host is not set (IMAP_HOST)".to_string(),
        ));
    }
    if user.is_empty() {
        return Err(MailstashError::Config(
            "IMAP user is not set (IMAP_USER)".to_string(),
        ));
    }

    Ok(Settings {
        host,
        user,
        password,
        port,
        tls,
        archive_root,
        ownership: Ownership::new(uid, gid),
        renderer,
        page_format,
        generate_html,
        generate_pdf,
        save_attachments,
        sender_filter,
        slug_with_subject,
        dry_run: args.dry_run,
    })
}

/// Anything but `false` switches a flag on.
fn parse_flag(value: &str) -> bool {
    !value.eq_ignore_ascii_case("false")
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MailstashError::Config(format!("{key} must be a number, got {value:?}")))
}

pub fn load_file_config(explicit: Option<&PathBuf>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) => PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string()),
        None => match dirs::config_dir().map(|dir| dir.join("mailstash").join("config.toml")) {
            Some(path) if path.exists() => path,
            _ => return Ok(FileConfig::default()),
        },
    };
    let contents = fs::read_to_string(&path).map_err(|e| {
        MailstashError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    Ok(toml::from_str(&contents)?)
}

/// Read `.env`, the config file and the process environment, then resolve.
pub fn load_settings(args: &CliArgs) -> Result<Settings> {
    dotenv::dotenv().ok();
    let file = load_file_config(args.config.as_ref())?;
    let env: HashMap<String, String> = std::env::vars().collect();
    resolve(file, &env, args)
}
