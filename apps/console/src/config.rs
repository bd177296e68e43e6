use std::{collections::HashMap, fs, time::Duration};

use client_core::SyncConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub department: Option<String>,
    pub conversation_poll_secs: u64,
    pub reconcile_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let sync = SyncConfig::default();
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            department: None,
            conversation_poll_secs: sync.conversation_poll_interval.as_secs(),
            reconcile_secs: sync.reconcile_interval.as_secs(),
        }
    }
}

/// Reads `console.toml` from the working directory, then lets environment
/// variables override it. Missing or malformed values fall back silently.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("console.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("department") {
                settings.department = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("conversation_poll_secs") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.conversation_poll_secs = parsed;
                }
            }
            if let Some(v) = file_cfg.get("reconcile_secs") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.reconcile_secs = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Ok(v) = std::env::var("APP__DEPARTMENT") {
        settings.department = Some(v);
    }

    if let Ok(v) = std::env::var("APP__CONVERSATION_POLL_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.conversation_poll_secs = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__RECONCILE_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconcile_secs = parsed;
        }
    }

    settings
}

impl Settings {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            conversation_poll_interval: Duration::from_secs(self.conversation_poll_secs.max(1)),
            reconcile_interval: Duration::from_secs(self.reconcile_secs.max(1)),
            department: self.department.clone(),
            ..SyncConfig::default()
        }
    }
}
