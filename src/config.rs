//! Evaluator configuration: the process-wide selection toggles.
//!
//! Three tokens steer strategy dispatch and are read once, then frozen for
//! the life of the [`Evaluator`](crate::select::Evaluator):
//!
//! * `pack_serial_at_end` (scheduler parameters) — serial jobs go to the high
//!   end of the node index range.
//! * `dragonfly` (topology parameters) — use the dragonfly strategy instead
//!   of the general switch-tree strategy.
//! * `TopoOptional` (topology parameters) — only apply topology-aware
//!   selection when the job explicitly asked for switches.
//!
//! The consumable-resource flags (`CR_LLN`, `CR_Socket`,
//! `CR_ONE_TASK_PER_CORE`) ride along as [`SelectTypeFlags`]; callers copy
//! them into each evaluation context.
//!
//! Parameter strings use the scheduler's comma-separated token convention;
//! matching is a case-insensitive substring search.  A small YAML form is
//! accepted as well:
//!
//! ```yaml
//! sched_params: "pack_serial_at_end"
//! topology_param: "dragonfly,TopoOptional"
//! select_type_param: "CR_LLN,CR_Socket"
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

// ── Private YAML deserialization type ─────────────────────────────────────────

/// On-disk layout.  Kept private – callers work with [`EvalConfig`].
#[derive(Debug, Deserialize)]
struct EvalConfigFile {
    #[serde(default)]
    sched_params: String,
    #[serde(default)]
    topology_param: String,
    #[serde(default)]
    select_type_param: String,
}

// ── Public configuration types ────────────────────────────────────────────────

/// Consumable-resource selection flags (`select_type_param` tokens).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectTypeFlags {
    /// `CR_LLN` — prefer the least-loaded node within each weight tier.
    pub lln: bool,
    /// `CR_Socket` — allocation unit is a whole socket.
    pub socket_alloc: bool,
    /// `CR_ONE_TASK_PER_CORE` — one task per core, CPU counts follow cores.
    pub one_task_per_core: bool,
}

impl SelectTypeFlags {
    /// Parse from a `select_type_param` token string.
    pub fn from_param(select_type_param: &str) -> Self {
        Self {
            lln: has_token(select_type_param, "CR_LLN"),
            socket_alloc: has_token(select_type_param, "CR_Socket"),
            one_task_per_core: has_token(select_type_param, "CR_ONE_TASK_PER_CORE"),
        }
    }
}

/// Frozen process-wide evaluation toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalConfig {
    /// Serial jobs (1 CPU, 1 node) are packed at the end of the index range.
    pub pack_serial_at_end: bool,
    /// The switch fabric is a dragonfly; use the round-robin leaf strategy.
    pub have_dragonfly: bool,
    /// Topology-aware selection only when the job requested switches.
    pub topo_optional: bool,
    /// Consumable-resource flags, forwarded into evaluation contexts.
    pub select_type: SelectTypeFlags,
}

impl EvalConfig {
    /// Build the configuration from raw parameter token strings.
    pub fn from_params(
        sched_params: &str,
        topology_param: &str,
        select_type_param: &str,
    ) -> Self {
        let cfg = Self {
            pack_serial_at_end: has_token(sched_params, "pack_serial_at_end"),
            have_dragonfly: has_token(topology_param, "dragonfly"),
            topo_optional: has_token(topology_param, "TopoOptional"),
            select_type: SelectTypeFlags::from_param(select_type_param),
        };
        debug!(?cfg, "evaluator configuration resolved");
        cfg
    }

    /// Parse `path` as a YAML parameter file.
    ///
    /// Missing keys fall back to empty token strings, so a partial file is
    /// accepted gracefully.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or if the YAML is
    /// structurally invalid.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading evaluator configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let file: EvalConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        Ok(Self::from_params(
            &file.sched_params,
            &file.topology_param,
            &file.select_type_param,
        ))
    }
}

/// Case-insensitive token containment check over a comma-separated parameter
/// string.
fn has_token(params: &str, token: &str) -> bool {
    params
        .to_ascii_lowercase()
        .contains(&token.to_ascii_lowercase())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    // ── Token parsing ─────────────────────────────────────────────────────────

    #[test]
    fn empty_params_disable_everything() {
        let cfg = EvalConfig::from_params("", "", "");
        assert_eq!(cfg, EvalConfig::default());
    }

    #[test]
    fn tokens_are_case_insensitive() {
        let cfg = EvalConfig::from_params("Pack_Serial_At_End", "DRAGONFLY,topooptional", "");
        assert!(cfg.pack_serial_at_end);
        assert!(cfg.have_dragonfly);
        assert!(cfg.topo_optional);
    }

    #[test]
    fn unrelated_tokens_are_ignored() {
        let cfg = EvalConfig::from_params(
            "batch_sched_delay=3,default_queue_depth=100",
            "topology/tree",
            "CR_Core_Memory",
        );
        assert!(!cfg.pack_serial_at_end);
        assert!(!cfg.have_dragonfly);
        assert!(!cfg.topo_optional);
        assert!(!cfg.select_type.lln);
    }

    #[test]
    fn select_type_flags_parse_independently() {
        let flags = SelectTypeFlags::from_param("CR_LLN,CR_ONE_TASK_PER_CORE");
        assert!(flags.lln);
        assert!(!flags.socket_alloc);
        assert!(flags.one_task_per_core);
    }

    // ── YAML loading ──────────────────────────────────────────────────────────

    #[test]
    fn load_full_yaml() {
        let yaml = r#"
sched_params: "pack_serial_at_end,defer"
topology_param: "dragonfly"
select_type_param: "CR_Socket"
"#;
        let f = yaml_tempfile(yaml);
        let cfg = EvalConfig::load_from_file(f.path()).unwrap();
        assert!(cfg.pack_serial_at_end);
        assert!(cfg.have_dragonfly);
        assert!(!cfg.topo_optional);
        assert!(cfg.select_type.socket_alloc);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let f = yaml_tempfile("topology_param: \"TopoOptional\"\n");
        let cfg = EvalConfig::load_from_file(f.path()).unwrap();
        assert!(cfg.topo_optional);
        assert!(!cfg.pack_serial_at_end);
        assert_eq!(cfg.select_type, SelectTypeFlags::default());
    }

    #[test]
    fn missing_file_returns_error() {
        let result = EvalConfig::load_from_file(Path::new("/nonexistent/params.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_yaml_returns_error() {
        let f = yaml_tempfile("sched_params: [not: a: string:::");
        assert!(EvalConfig::load_from_file(f.path()).is_err());
    }
}
