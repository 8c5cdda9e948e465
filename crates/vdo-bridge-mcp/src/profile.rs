//! Tool profiles
//!
//! A profile names the subset of bridge tools a server exposes. The tool
//! surface itself always implements the full set; the host filters
//! `tools/list` and refuses `tools/call` for anything outside the active
//! profile.

use std::collections::BTreeSet;

/// Every tool the bridge can expose, in listing order.
pub const ALL_TOOLS: &[&str] = &[
    "vdo_connect",
    "vdo_send",
    "vdo_receive",
    "vdo_status",
    "vdo_disconnect",
    "vdo_list_sessions",
    "vdo_capabilities",
    "vdo_sync_peers",
    "vdo_sync_announce",
    "vdo_file_send",
    "vdo_file_resume",
    "vdo_file_transfers",
    "vdo_file_receive",
    "vdo_file_save",
    "vdo_state_set",
    "vdo_state_get",
    "vdo_state_sync",
];

const SESSION_TOOLS: &[&str] = &[
    "vdo_connect",
    "vdo_receive",
    "vdo_status",
    "vdo_disconnect",
    "vdo_list_sessions",
    "vdo_capabilities",
    "vdo_sync_peers",
    "vdo_sync_announce",
];

// ----------------------------------------------------------------------------
// Tool Profile
// ----------------------------------------------------------------------------

/// Named tool subset.
#[derive(Debug, Clone)]
pub struct ToolProfile {
    name: String,
    tools: BTreeSet<String>,
}

impl ToolProfile {
    /// Everything.
    pub fn full() -> Self {
        Self::from_names("full", ALL_TOOLS)
    }

    /// Session management only: no messaging, file, or state tools.
    pub fn core() -> Self {
        Self::from_names("core", SESSION_TOOLS)
    }

    /// Session management plus plain messaging.
    pub fn messaging() -> Self {
        let mut tools: Vec<&str> = SESSION_TOOLS.to_vec();
        tools.push("vdo_send");
        Self::from_names("messaging", &tools)
    }

    /// Session management plus file transfer.
    pub fn files() -> Self {
        let mut tools: Vec<&str> = SESSION_TOOLS.to_vec();
        tools.extend_from_slice(&[
            "vdo_file_send",
            "vdo_file_resume",
            "vdo_file_transfers",
            "vdo_file_receive",
            "vdo_file_save",
        ]);
        Self::from_names("files", &tools)
    }

    /// Session management plus the replicated store.
    pub fn state() -> Self {
        let mut tools: Vec<&str> = SESSION_TOOLS.to_vec();
        tools.extend_from_slice(&["vdo_state_set", "vdo_state_get", "vdo_state_sync"]);
        Self::from_names("state", &tools)
    }

    /// Look a profile up by name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "full" => Some(Self::full()),
            "core" => Some(Self::core()),
            "messaging" => Some(Self::messaging()),
            "files" => Some(Self::files()),
            "state" => Some(Self::state()),
            _ => None,
        }
    }

    fn from_names(name: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }

    /// Listing order follows [`ALL_TOOLS`], not set order.
    pub fn listed_tools(&self) -> Vec<&'static str> {
        ALL_TOOLS
            .iter()
            .copied()
            .filter(|t| self.tools.contains(*t))
            .collect()
    }
}

impl Default for ToolProfile {
    fn default() -> Self {
        Self::full()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_profile_covers_everything() {
        let full = ToolProfile::full();
        for tool in ALL_TOOLS {
            assert!(full.allows(tool), "full profile missing {tool}");
        }
        assert_eq!(full.listed_tools().len(), ALL_TOOLS.len());
    }

    #[test]
    fn test_messaging_profile_excludes_files() {
        let profile = ToolProfile::messaging();
        assert!(profile.allows("vdo_send"));
        assert!(profile.allows("vdo_receive"));
        assert!(!profile.allows("vdo_file_send"));
        assert!(!profile.allows("vdo_state_set"));
    }

    #[test]
    fn test_core_profile_is_session_management_only() {
        let profile = ToolProfile::core();
        for tool in SESSION_TOOLS {
            assert!(profile.allows(tool), "core profile missing {tool}");
        }
        assert!(!profile.allows("vdo_send"));
        assert!(!profile.allows("vdo_file_send"));
        assert!(!profile.allows("vdo_state_set"));
        assert_eq!(profile.listed_tools().len(), SESSION_TOOLS.len());
    }

    #[test]
    fn test_by_name() {
        assert_eq!(ToolProfile::by_name("files").unwrap().name(), "files");
        assert_eq!(ToolProfile::by_name("core").unwrap().name(), "core");
        assert!(ToolProfile::by_name("nope").is_none());
    }

    #[test]
    fn test_listing_preserves_catalog_order() {
        let listed = ToolProfile::state().listed_tools();
        let mut last_index = 0;
        for tool in listed {
            let index = ALL_TOOLS.iter().position(|t| *t == tool).unwrap();
            assert!(index >= last_index);
            last_index = index;
        }
    }
}
