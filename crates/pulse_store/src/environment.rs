//! Environment snapshots.
//!
//! An environment is an immutable snapshot of device/software configuration
//! facts. Identity is a SHA-256 over the ordered scalar fields plus the ids
//! of the installed add-ons; the full add-on inventory is deduplicated
//! separately and joined by id, since many environments share one add-on set.
//!
//! The snapshot shape itself is versioned. Each document group (`age`,
//! `sysinfo`, `appinfo`, `addonCounts`, `activeAddons`) renders through a
//! pure function selected from a per-version table, so a new schema version
//! adds a renderer instead of growing a fallthrough switch.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::time::day_of_millis;

/// Oldest snapshot shape this engine understands.
pub const ENV_VERSION_MIN: u32 = 1;

/// Snapshot shape produced by current callers.
pub const ENV_VERSION_CURRENT: u32 = 2;

pub const GROUP_AGE: &str = "age";
pub const GROUP_SYSINFO: &str = "sysinfo";
pub const GROUP_APPINFO: &str = "appinfo";
pub const GROUP_ADDON_COUNTS: &str = "addonCounts";
pub const GROUP_ACTIVE_ADDONS: &str = "activeAddons";

/// Schema-version tag carried by every rendered group and measurement object.
pub const VERSION_TAG: &str = "_v";

/// Supplies profile-level facts for populating a snapshot. Implemented by an
/// external bootstrap cache; the engine only consumes it.
pub trait ProfileInfoProvider {
    fn blocklist_enabled(&self) -> bool;
    fn telemetry_enabled(&self) -> bool;
    /// Profile creation time, milliseconds since the epoch.
    fn profile_creation_millis(&self) -> i64;
}

/// An immutable configuration snapshot. Constructed in memory by the caller;
/// acquires a durable integer id only once registered. Any change to a
/// scalar produces a new snapshot (and a new hash), never an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Schema version of the snapshot shape itself.
    pub version: u32,

    // age
    pub profile_creation_days: i64,

    // sysinfo
    pub cpu_count: i64,
    pub memory_mb: i64,
    pub architecture: String,
    pub sys_name: String,
    pub sys_version: String,

    // appinfo
    pub vendor: String,
    pub app_name: String,
    pub app_version: String,
    pub app_build_id: String,
    pub platform_version: String,
    pub platform_build_id: String,
    pub os: String,
    pub update_channel: String,
    pub blocklist_enabled: bool,
    pub telemetry_enabled: bool,

    // appinfo, v2 additions
    pub app_locale: String,
    pub os_locale: String,
    pub accept_lang_user_set: bool,
    pub distribution: String,

    // add-on counts
    pub extension_count: i64,
    pub plugin_count: i64,
    pub theme_count: i64,

    /// Full add-on inventory: a JSON object keyed by add-on id. Stored
    /// deduplicated in its own table.
    pub addons_json: String,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            version: ENV_VERSION_CURRENT,
            profile_creation_days: 0,
            cpu_count: 0,
            memory_mb: 0,
            architecture: String::new(),
            sys_name: String::new(),
            sys_version: String::new(),
            vendor: String::new(),
            app_name: String::new(),
            app_version: String::new(),
            app_build_id: String::new(),
            platform_version: String::new(),
            platform_build_id: String::new(),
            os: String::new(),
            update_channel: String::new(),
            blocklist_enabled: false,
            telemetry_enabled: false,
            app_locale: String::new(),
            os_locale: String::new(),
            accept_lang_user_set: false,
            distribution: String::new(),
            extension_count: 0,
            plugin_count: 0,
            theme_count: 0,
            addons_json: "{}".to_string(),
        }
    }
}

impl Environment {
    /// Fill the profile-derived facts from the external provider.
    pub fn apply_profile_info(&mut self, provider: &dyn ProfileInfoProvider) {
        self.blocklist_enabled = provider.blocklist_enabled();
        self.telemetry_enabled = provider.telemetry_enabled();
        self.profile_creation_days = day_of_millis(provider.profile_creation_millis());
    }

    /// Deterministic content hash: ordered scalar fields plus the sorted
    /// add-on ids, SHA-256, hex-encoded.
    ///
    /// Fails only when a mandatory scalar is missing; callers generating a
    /// document treat that as "no document".
    pub fn content_hash(&self) -> Result<String> {
        if self.app_name.is_empty() {
            return Err(StoreError::IncompleteEnvironment { missing: "app_name" });
        }
        if self.app_version.is_empty() {
            return Err(StoreError::IncompleteEnvironment {
                missing: "app_version",
            });
        }

        let mut hasher = Sha256::new();
        let mut put = |part: &str| {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        };
        put(&self.version.to_string());
        put(&self.profile_creation_days.to_string());
        put(&self.cpu_count.to_string());
        put(&self.memory_mb.to_string());
        put(&self.architecture);
        put(&self.sys_name);
        put(&self.sys_version);
        put(&self.vendor);
        put(&self.app_name);
        put(&self.app_version);
        put(&self.app_build_id);
        put(&self.platform_version);
        put(&self.platform_build_id);
        put(&self.os);
        put(&self.update_channel);
        put(if self.blocklist_enabled { "1" } else { "0" });
        put(if self.telemetry_enabled { "1" } else { "0" });
        if self.version >= 2 {
            put(&self.app_locale);
            put(&self.os_locale);
            put(if self.accept_lang_user_set { "1" } else { "0" });
            put(&self.distribution);
        }
        put(&self.extension_count.to_string());
        put(&self.plugin_count.to_string());
        put(&self.theme_count.to_string());
        for id in self.addon_ids() {
            put(&id);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Parsed add-on inventory. Malformed persisted JSON degrades to an
    /// empty inventory, never a fatal error.
    pub fn addons(&self) -> Map<String, Value> {
        match serde_json::from_str::<Value>(&self.addons_json) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("malformed add-on inventory, treating as empty");
                Map::new()
            }
        }
    }

    /// Sorted add-on ids, the portion of the inventory that participates in
    /// the content hash.
    pub fn addon_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.addons().keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ---------------------------------------------------------------------------
// Versioned group renderers
// ---------------------------------------------------------------------------

type GroupRenderer = fn(&Environment) -> Value;

fn age_v1(env: &Environment) -> Value {
    json!({
        VERSION_TAG: 1,
        "profileCreation": env.profile_creation_days,
    })
}

fn sysinfo_v1(env: &Environment) -> Value {
    json!({
        VERSION_TAG: 1,
        "cpuCount": env.cpu_count,
        "memoryMB": env.memory_mb,
        "architecture": env.architecture,
        "name": env.sys_name,
        "version": env.sys_version,
    })
}

fn appinfo_v1(env: &Environment) -> Value {
    json!({
        VERSION_TAG: 1,
        "vendor": env.vendor,
        "name": env.app_name,
        "version": env.app_version,
        "buildId": env.app_build_id,
        "platformVersion": env.platform_version,
        "platformBuildId": env.platform_build_id,
        "os": env.os,
        "updateChannel": env.update_channel,
        "isBlocklistEnabled": env.blocklist_enabled,
        "isTelemetryEnabled": env.telemetry_enabled,
    })
}

fn appinfo_v2(env: &Environment) -> Value {
    let mut group = appinfo_v1(env);
    if let Some(map) = group.as_object_mut() {
        map.insert(VERSION_TAG.to_string(), json!(2));
        map.insert("appLocale".to_string(), json!(env.app_locale));
        map.insert("osLocale".to_string(), json!(env.os_locale));
        map.insert(
            "acceptLangIsUserSet".to_string(),
            json!(env.accept_lang_user_set),
        );
        map.insert("distribution".to_string(), json!(env.distribution));
    }
    group
}

fn addon_counts_v1(env: &Environment) -> Value {
    json!({
        VERSION_TAG: 1,
        "extensions": env.extension_count,
        "plugins": env.plugin_count,
        "themes": env.theme_count,
    })
}

fn active_addons_v1(env: &Environment) -> Value {
    let mut map = env.addons();
    map.insert(VERSION_TAG.to_string(), json!(1));
    Value::Object(map)
}

/// The `appinfo` group is the only one whose shape varies with the snapshot
/// version. Unknown versions get no renderer; the group is omitted from the
/// document rather than aborting the whole report.
fn appinfo_renderer(version: u32) -> Option<GroupRenderer> {
    match version {
        1 => Some(appinfo_v1),
        2 => Some(appinfo_v2),
        _ => None,
    }
}

/// Render every group of a snapshot as the document's environment object.
pub fn render_groups(env: &Environment) -> Map<String, Value> {
    let mut groups = Map::new();
    groups.insert(GROUP_AGE.to_string(), age_v1(env));
    groups.insert(GROUP_SYSINFO.to_string(), sysinfo_v1(env));
    match appinfo_renderer(env.version) {
        Some(render) => {
            groups.insert(GROUP_APPINFO.to_string(), render(env));
        }
        None => {
            warn!(version = env.version, "unrecognized environment schema version, omitting appinfo group");
        }
    }
    groups.insert(GROUP_ADDON_COUNTS.to_string(), addon_counts_v1(env));
    groups.insert(GROUP_ACTIVE_ADDONS.to_string(), active_addons_v1(env));
    groups
}
