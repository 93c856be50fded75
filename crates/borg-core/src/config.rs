use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Result;

use crate::types::RepoConfig;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_token: String,
    pub discord_token: String,
    pub wa_auth_dir: String,
    pub wa_disabled: bool,
    pub oauth_token: String,
    pub assistant_name: String,
    pub trigger_pattern: String,
    pub data_dir: String,
    pub container_image: String,
    pub model: String,
    pub credentials_path: String,
    pub session_max_age_hours: i64,

    // Pipeline
    pub pipeline_repo: String,
    pub pipeline_test_cmd: String,
    pub pipeline_lint_cmd: String,
    pub pipeline_admin_chat: String,
    pub release_interval_mins: u32,
    pub continuous_mode: bool,

    // Agent lifecycle
    pub collection_window_ms: u64,
    pub cooldown_ms: u64,
    pub agent_timeout_s: i64,
    pub max_concurrent_agents: u32,
    pub rate_limit_per_minute: u32,
    pub max_pipeline_agents: u32,

    // Web dashboard
    pub web_bind: String,
    pub web_port: u16,
    pub dashboard_dist_dir: String,

    // Container / sandbox
    pub container_setup: String,
    pub container_memory_mb: u64,
    /// "auto" (default), "bwrap", "docker", or "none".
    pub sandbox_backend: String,

    pub pipeline_tick_s: u64,

    // Git attribution
    pub git_author_name: String,
    pub git_author_email: String,
    /// If set, append Co-Authored-By: <value> to every pipeline commit.
    pub git_user_coauthor: String,

    pub watched_repos: Vec<RepoConfig>,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let mut v = v.trim();
            if v.len() >= 2 {
                let bytes = v.as_bytes();
                let matched_quotes = (bytes[0] == b'"' && bytes[v.len() - 1] == b'"')
                    || (bytes[0] == b'\'' && bytes[v.len() - 1] == b'\'');
                if matched_quotes {
                    v = &v[1..v.len() - 1];
                }
            }
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(bad) => {
            eprintln!("warn: env {key}: invalid value '{bad}', using default {default}");
            default
        }
        None => default,
    }
}

/// Parses `key` as `T`, falling back to `default` and printing exactly one
/// warning line when the value is present but unparseable.
fn parse_env_int<T>(key: &str, dotenv: &HashMap<String, String>, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match get(key, dotenv) {
        None => default,
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                eprintln!("warn: env {key}: invalid value '{raw}', using default {default}");
                default
            }
        },
    }
}

fn resolve_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

fn read_oauth_from_credentials(path: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let v: serde_json::Value = serde_json::from_str(&contents).ok()?;
    v.get("claudeAiOauth")
        .and_then(|o| o.get("accessToken"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .or_else(|| v.get("oauthToken").and_then(|t| t.as_str()).map(str::to_string))
}

/// Splits `path[:test_cmd[:prompt_file]]` pipe-delimited entries into repo
/// configs. The primary `pipeline_repo` is always listed first (if set,
/// deduplicated against the watched list); a missing `test_cmd` defaults to
/// `make test`.
fn parse_watched_repos(
    watched_raw: &str,
    pipeline_repo: &str,
    pipeline_test_cmd: &str,
    pipeline_lint_cmd: &str,
) -> Vec<RepoConfig> {
    const DEFAULT_TEST_CMD: &str = "make test";
    let mut repos: Vec<RepoConfig> = Vec::new();

    if !pipeline_repo.is_empty() {
        let test_cmd = if pipeline_test_cmd.is_empty() {
            DEFAULT_TEST_CMD.to_string()
        } else {
            pipeline_test_cmd.to_string()
        };
        repos.push(RepoConfig {
            path: pipeline_repo.to_string(),
            test_cmd,
            is_self: true,
            auto_merge: true,
            lint_cmd: pipeline_lint_cmd.to_string(),
        });
    }

    for entry in watched_raw.split('|') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.splitn(3, ':').collect();
        let path = parts[0].trim();
        if path.is_empty() || path == pipeline_repo {
            continue;
        }

        let mut test_cmd = parts.get(1).copied().unwrap_or("").trim().to_string();
        let auto_merge = if test_cmd.ends_with("!manual") {
            test_cmd.truncate(test_cmd.len() - "!manual".len());
            false
        } else {
            true
        };
        if test_cmd.is_empty() {
            test_cmd = DEFAULT_TEST_CMD.to_string();
        }

        repos.push(RepoConfig {
            path: path.to_string(),
            test_cmd,
            is_self: false,
            auto_merge,
            lint_cmd: String::new(),
        });
    }

    repos
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        let default_credentials = format!("{home}/.claude/.credentials.json");
        let credentials_path = resolve_tilde(&get_str("CREDENTIALS_PATH", &dotenv, &default_credentials));

        let oauth_token = get("CLAUDE_CODE_OAUTH_TOKEN", &dotenv)
            .filter(|s| !s.is_empty())
            .or_else(|| read_oauth_from_credentials(&credentials_path))
            .unwrap_or_default();

        let pipeline_repo = get_str("PIPELINE_REPO", &dotenv, "");
        let pipeline_test_cmd = get_str("PIPELINE_TEST_CMD", &dotenv, "");
        let pipeline_lint_cmd = get_str("PIPELINE_LINT_CMD", &dotenv, "");
        let watched_raw = get_str("WATCHED_REPOS", &dotenv, "");
        let watched_repos = parse_watched_repos(&watched_raw, &pipeline_repo, &pipeline_test_cmd, &pipeline_lint_cmd);

        Ok(Config {
            telegram_token: get_str("TELEGRAM_BOT_TOKEN", &dotenv, ""),
            discord_token: get_str("DISCORD_TOKEN", &dotenv, ""),
            wa_auth_dir: get_str("WA_AUTH_DIR", &dotenv, ""),
            wa_disabled: get_bool("WA_DISABLED", &dotenv, false),
            oauth_token,
            assistant_name: get_str("ASSISTANT_NAME", &dotenv, "Borg"),
            trigger_pattern: get_str("TRIGGER_PATTERN", &dotenv, "@Borg"),
            data_dir: get_str("DATA_DIR", &dotenv, "store"),
            container_image: get_str("CONTAINER_IMAGE", &dotenv, "borg-agent"),
            model: get_str("CLAUDE_MODEL", &dotenv, "claude-sonnet-4-6"),
            credentials_path,
            session_max_age_hours: parse_env_int("SESSION_MAX_AGE_HOURS", &dotenv, 24),
            pipeline_repo,
            pipeline_test_cmd,
            pipeline_lint_cmd,
            pipeline_admin_chat: get_str("PIPELINE_ADMIN_CHAT", &dotenv, ""),
            release_interval_mins: parse_env_int("RELEASE_INTERVAL_MINS", &dotenv, 180),
            continuous_mode: get_bool("CONTINUOUS_MODE", &dotenv, false),
            collection_window_ms: parse_env_int("COLLECTION_WINDOW_MS", &dotenv, 3000),
            cooldown_ms: parse_env_int("COOLDOWN_MS", &dotenv, 5000),
            agent_timeout_s: parse_env_int("AGENT_TIMEOUT_S", &dotenv, 600),
            max_concurrent_agents: parse_env_int("MAX_CONCURRENT_AGENTS", &dotenv, 4),
            rate_limit_per_minute: parse_env_int("RATE_LIMIT_PER_MINUTE", &dotenv, 5),
            max_pipeline_agents: parse_env_int("MAX_PIPELINE_AGENTS", &dotenv, 2),
            web_bind: get_str("WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: parse_env_int("WEB_PORT", &dotenv, 3131),
            dashboard_dist_dir: get_str("DASHBOARD_DIST_DIR", &dotenv, "dashboard/dist"),
            container_setup: get_str("CONTAINER_SETUP", &dotenv, ""),
            container_memory_mb: parse_env_int("CONTAINER_MEMORY_MB", &dotenv, 1024),
            sandbox_backend: get_str("SANDBOX_BACKEND", &dotenv, "auto"),
            pipeline_tick_s: parse_env_int("PIPELINE_TICK_S", &dotenv, 30),
            git_author_name: get_str("GIT_AUTHOR_NAME", &dotenv, ""),
            git_author_email: get_str("GIT_AUTHOR_EMAIL", &dotenv, ""),
            git_user_coauthor: get_str("GIT_USER_COAUTHOR", &dotenv, ""),
            watched_repos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_int_falls_back_on_bad_value() {
        let mut env = HashMap::new();
        env.insert("X".to_string(), "not-a-number".to_string());
        let v: i64 = parse_env_int("X", &env, 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn parse_env_int_parses_valid_decimal() {
        let mut env = HashMap::new();
        env.insert("X".to_string(), "99".to_string());
        let v: i64 = parse_env_int("X", &env, 42);
        assert_eq!(v, 99);
    }

    #[test]
    fn watched_repos_defaults_missing_test_cmd() {
        let repos = parse_watched_repos("/b/repo||/c/repo:", "/a/repo", "make ci", "");
        assert_eq!(repos[0].path, "/a/repo");
        assert_eq!(repos[0].test_cmd, "make ci");
        assert_eq!(repos[1].path, "/b/repo");
        assert_eq!(repos[1].test_cmd, "make test");
        assert_eq!(repos[2].path, "/c/repo");
        assert_eq!(repos[2].test_cmd, "make test");
    }

    #[test]
    fn watched_repos_dedups_primary() {
        let repos = parse_watched_repos("/a/repo:make test", "/a/repo", "make test", "");
        assert_eq!(repos.len(), 1);
    }

    #[test]
    fn dotenv_strips_matched_quotes() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_current_dir(&dir).unwrap();
        std::fs::write(".env", "FOO=\"bar baz\"\nBAZ=qux\n").unwrap();
        let map = parse_dotenv();
        assert_eq!(map.get("FOO").unwrap(), "bar baz");
        assert_eq!(map.get("BAZ").unwrap(), "qux");
    }
}
