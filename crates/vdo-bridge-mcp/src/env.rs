//! Environment-variable configuration
//!
//! Process-wide defaults read once at startup. Connect-time values from the
//! caller always win; env defaults fill the gaps.

use serde_json::Value;

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn var_bool(name: &str) -> Option<bool> {
    var(name).map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
}

fn var_usize(name: &str) -> Option<usize> {
    var(name).and_then(|v| v.parse().ok())
}

// ----------------------------------------------------------------------------
// HTTP Settings
// ----------------------------------------------------------------------------

/// Listener settings for the streamable-HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// `Access-Control-Allow-Origin` value; CORS headers are omitted when
    /// unset.
    pub allow_origin: Option<String>,
    /// Bearer token required on POST when set.
    pub bearer_token: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8737,
            path: "/mcp".into(),
            allow_origin: None,
            bearer_token: None,
            max_body_bytes: 1024 * 1024,
        }
    }
}

// ----------------------------------------------------------------------------
// Env Defaults
// ----------------------------------------------------------------------------

/// Defaults sourced from `VDO_BRIDGE_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvDefaults {
    pub max_message_bytes: Option<usize>,
    pub tool_profile: Option<String>,
    pub join_token_secret: Option<String>,
    pub enforce_join_token: Option<bool>,
    pub require_session_mac: Option<bool>,
    pub allow_stream_ids: Option<Vec<String>>,
    pub spool_dir: Option<String>,
    pub http: Option<HttpSettings>,
}

impl EnvDefaults {
    pub fn from_env() -> Self {
        let mut http = HttpSettings::default();
        if let Some(host) = var("VDO_BRIDGE_HTTP_HOST") {
            http.host = host;
        }
        if let Some(port) = var("VDO_BRIDGE_HTTP_PORT").and_then(|p| p.parse().ok()) {
            http.port = port;
        }
        if let Some(path) = var("VDO_BRIDGE_HTTP_PATH") {
            http.path = path;
        }
        http.allow_origin = var("VDO_BRIDGE_HTTP_ORIGIN");
        http.bearer_token = var("VDO_BRIDGE_HTTP_TOKEN");
        if let Some(max) = var_usize("VDO_BRIDGE_HTTP_MAX_BODY") {
            http.max_body_bytes = max;
        }

        Self {
            max_message_bytes: var_usize("VDO_BRIDGE_MAX_MESSAGE_BYTES"),
            tool_profile: var("VDO_BRIDGE_TOOL_PROFILE"),
            join_token_secret: var("VDO_BRIDGE_JOIN_TOKEN_SECRET"),
            enforce_join_token: var_bool("VDO_BRIDGE_ENFORCE_JOIN_TOKEN"),
            require_session_mac: var_bool("VDO_BRIDGE_REQUIRE_SESSION_MAC"),
            allow_stream_ids: var("VDO_BRIDGE_ALLOW_STREAM_IDS").map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            }),
            spool_dir: var("VDO_BRIDGE_SPOOL_DIR"),
            http: Some(http),
        }
    }

    /// Fill missing connect-tool arguments from env defaults.
    pub fn apply_connect_defaults(&self, args: &mut Value) {
        let Some(map) = args.as_object_mut() else { return };
        if let Some(secret) = &self.join_token_secret {
            map.entry("join_token_secret")
                .or_insert_with(|| Value::String(secret.clone()));
        }
        if let Some(enforce) = self.enforce_join_token {
            map.entry("enforce_join_token")
                .or_insert(Value::Bool(enforce));
        }
        if let Some(require) = self.require_session_mac {
            map.entry("require_session_mac")
                .or_insert(Value::Bool(require));
        }
        if let Some(allow) = &self.allow_stream_ids {
            map.entry("allow_peer_stream_ids").or_insert_with(|| {
                Value::Array(allow.iter().cloned().map(Value::String).collect())
            });
        }
        if let Some(spool) = &self.spool_dir {
            map.entry("spool_dir")
                .or_insert_with(|| Value::String(spool.clone()));
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_defaults_fill_gaps_only() {
        let defaults = EnvDefaults {
            join_token_secret: Some("env-secret".into()),
            require_session_mac: Some(true),
            allow_stream_ids: Some(vec!["a".into(), "b".into()]),
            ..EnvDefaults::default()
        };

        let mut args = json!({"room": "r", "stream_id": "s"});
        defaults.apply_connect_defaults(&mut args);
        assert_eq!(args["join_token_secret"], "env-secret");
        assert_eq!(args["require_session_mac"], true);
        assert_eq!(args["allow_peer_stream_ids"], json!(["a", "b"]));

        // Caller-provided values are never overwritten.
        let mut args = json!({"room": "r", "stream_id": "s", "join_token_secret": "mine"});
        defaults.apply_connect_defaults(&mut args);
        assert_eq!(args["join_token_secret"], "mine");
    }
}
