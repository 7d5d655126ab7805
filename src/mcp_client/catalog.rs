//! Tool catalog: aggregates tool definitions across the links of a session.
//!
//! The catalog is a snapshot: `rebuild` always replaces it wholesale from the
//! links' current tool lists. Catalogs hold tens of entries, so there is no
//! incremental bookkeeping.
//!
//! Name collisions are not rejected. Both entries stay in the listing, and
//! lookups resolve to the provider registered last (links are visited in
//! provider-name order).

use std::collections::HashMap;

use super::lifecycle::{BackendLink, LinkState};
use super::types::McpToolDefinition;

/// One tool together with the provider that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub server: String,
    pub tool: McpToolDefinition,
}

/// Aggregated, provider-tagged tool list for one session.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: Vec<CatalogEntry>,
    /// `tool_name → index into entries` (last registration wins).
    by_name: HashMap<String, usize>,
}

impl ToolCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the catalog with the tools of every `Ready` link.
    pub fn rebuild<'a, I>(&mut self, links: I)
    where
        I: IntoIterator<Item = &'a BackendLink>,
    {
        let lists = links
            .into_iter()
            .filter(|link| link.state() == LinkState::Ready)
            .map(|link| (link.name().to_string(), link.tools()));
        self.rebuild_from(lists);
    }

    /// Replace the catalog from explicit `(server, tools)` pairs, in order.
    pub fn rebuild_from<I>(&mut self, lists: I)
    where
        I: IntoIterator<Item = (String, Vec<McpToolDefinition>)>,
    {
        self.entries.clear();
        self.by_name.clear();

        for (server, tools) in lists {
            for tool in tools {
                let index = self.entries.len();
                if let Some(previous) = self.by_name.insert(tool.name.clone(), index) {
                    tracing::warn!(
                        tool = %tool.name,
                        shadowed = %self.entries[previous].server,
                        winner = %server,
                        "duplicate tool name across providers; last registration wins"
                    );
                }
                self.entries.push(CatalogEntry {
                    server: server.clone(),
                    tool,
                });
            }
        }
    }

    /// Find the provider and descriptor for a tool name.
    pub fn resolve(&self, tool_name: &str) -> Option<(&str, &McpToolDefinition)> {
        self.by_name.get(tool_name).map(|&i| {
            let entry = &self.entries[i];
            (entry.server.as_str(), &entry.tool)
        })
    }

    /// Tool descriptors as relayed to clients in `tools/list`.
    pub fn tool_descriptors(&self) -> Vec<serde_json::Value> {
        self.entries
            .iter()
            .filter_map(|entry| serde_json::to_value(&entry.tool).ok())
            .collect()
    }

    /// Number of registered tools (duplicates included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.server == server_name)
            .count()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
