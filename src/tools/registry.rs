//! In-process registry for embedding and tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{ClientDescriptor, ToolClient, ToolClientRegistry, ToolDescriptor};
use crate::models::ToolCallResult;

/// Plain functions can act as tool clients when they ignore cancellation.
impl<F> ToolClient for F
where
    F: Fn(&str, &Map<String, Value>) -> anyhow::Result<Option<ToolCallResult>> + Send + Sync,
{
    fn call_tool(
        &self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Option<ToolCallResult>> {
        self(tool_name, arguments)
    }
}

struct Entry {
    descriptor: ClientDescriptor,
    client: Arc<dyn ToolClient>,
}

/// Registry over a fixed set of clients.
#[derive(Default)]
pub struct StaticRegistry {
    clients: BTreeMap<String, Entry>,
}

impl StaticRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_client(
        mut self,
        name: impl Into<String>,
        tools: Vec<ToolDescriptor>,
        client: Arc<dyn ToolClient>,
    ) -> Self {
        self.register(name, tools, client);
        self
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        tools: Vec<ToolDescriptor>,
        client: Arc<dyn ToolClient>,
    ) {
        self.clients.insert(
            name.into(),
            Entry {
                descriptor: ClientDescriptor { tools },
                client,
            },
        );
    }
}

impl ToolClientRegistry for StaticRegistry {
    fn find_client(&self, name: &str) -> Option<Arc<dyn ToolClient>> {
        self.clients.get(name).map(|entry| Arc::clone(&entry.client))
    }

    fn list_enabled_clients(&self) -> BTreeMap<String, ClientDescriptor> {
        self.clients
            .iter()
            .map(|(name, entry)| (name.clone(), entry.descriptor.clone()))
            .collect()
    }
}
