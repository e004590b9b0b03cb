//! Renderer: pure `render()` implementation producing the effective
//! log-forwarder configuration text (component L).
//!
//! `render` takes no I/O dependency and is deterministic: identical input
//! produces byte-identical output (§8's round-trip property), which is what
//! lets the supervisor detect "no change" and skip a restart.

use crate::error::RenderError;
use serde::Deserialize;
use std::fmt::Write as _;

/// User-facing YAML knobs for the log source side of the config (what to
/// tail, what to parse).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LogSourceConfig {
    pub sources: Vec<LogSource>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LogSource {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub parser: Option<String>,
}

/// User-facing YAML knobs for where rendered log records are forwarded.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ForwardConfig {
    pub destinations: Vec<ForwardDestination>,
    #[serde(default)]
    pub external_parsers_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ForwardDestination {
    pub name: String,
    pub endpoint: String,
}

/// The output of [`render`]: opaque config text plus an optional path to an
/// external parsers file the caller must also pass to the child via `-R`.
/// Two `RenderedConfig`s are equal iff their `text` bytes are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub text: String,
    pub external_parsers_path: Option<String>,
}

/// Render the effective log-forwarder configuration.
///
/// Pure: given the same `log_cfg`, `forward_cfg`, `agent_guid`, and
/// `hostname`, always produces the same `text`. The implementation renders a
/// minimal, real config grammar (not a byte-for-byte reproduction of any
/// specific external log-forwarder's schema — that grammar is out of scope,
/// see `SPEC_FULL.md` §1), embedding `agent_guid` under `entity.guid.INFRA`
/// and `hostname` under `hostname`, plus every configured source and
/// destination.
pub fn render(
    log_cfg: &LogSourceConfig,
    forward_cfg: &ForwardConfig,
    agent_guid: &str,
    hostname: &str,
) -> Result<RenderedConfig, RenderError> {
    if agent_guid.is_empty() {
        return Err(RenderError::InvalidConfig("agent_guid must not be empty".into()));
    }

    let mut text = String::new();
    let _ = writeln!(text, "[SERVICE]");
    let _ = writeln!(text, "    entity.guid.INFRA {agent_guid}");
    let _ = writeln!(text, "    hostname {hostname}");
    text.push('\n');

    for source in &log_cfg.sources {
        let _ = writeln!(text, "[INPUT]");
        let _ = writeln!(text, "    Name   tail");
        let _ = writeln!(text, "    Tag    {}", source.name);
        let _ = writeln!(text, "    Path   {}", source.path);
        if let Some(parser) = &source.parser {
            let _ = writeln!(text, "    Parser {parser}");
        }
        text.push('\n');
    }

    if forward_cfg.destinations.is_empty() {
        return Err(RenderError::InvalidConfig("no forward destinations configured".into()));
    }

    for dest in &forward_cfg.destinations {
        let _ = writeln!(text, "[OUTPUT]");
        let _ = writeln!(text, "    Name   {}", dest.name);
        let _ = writeln!(text, "    Match  *");
        let _ = writeln!(text, "    Host   {}", dest.endpoint);
        text.push('\n');
    }

    Ok(RenderedConfig {
        text,
        external_parsers_path: forward_cfg.external_parsers_path.clone(),
    })
}
